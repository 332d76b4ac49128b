#![forbid(unsafe_code)]
//! Reference-counted LRU set of numbered extents.
//!
//! A cache of `nr_elements` slots, each either free or bound to one extent
//! number. Slots are addressed by index into an arena owned by the cache;
//! callers hold indices, never references.
//!
//! # Slot lifecycle
//!
//! ```text
//!            get (miss)                changed
//!   free ───────────────> changing ───────────────> in use (refcnt > 0)
//!    ^                       ^                          │  put (refcnt == 0)
//!    │ del                   │ get (miss, evict)        v
//!    └────────────────────── lru (resident, refcnt == 0) <─┘
//! ```
//!
//! A miss takes a free slot, or evicts the least recently used unpinned
//! slot, and marks it *changing*: it is pinned and unhashed but keeps its
//! old number until [`LruCache::changed`] commits `new_number`. Only one
//! slot may be changing at a time; further misses fail until the commit.
//! A miss with nothing to evict sets the *starving* flag, which blocks every
//! `get` until some `put` releases a slot.
//!
//! Free and LRU slots are kept on two intrusive lists threaded through the
//! arena, so every transition above is O(1).

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{error, trace};

/// Extent number of a free slot.
pub const LC_FREE: u32 = u32::MAX;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Free,
    Lru,
}

#[derive(Debug, Clone, Copy)]
struct ListHead {
    head: usize,
    tail: usize,
}

impl ListHead {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
    };
}

/// One cache slot.
#[derive(Debug, Clone)]
pub struct Element<T> {
    lc_number: u32,
    refcnt: u32,
    prev: usize,
    next: usize,
    /// List the slot is linked on; `None` while pinned or changing.
    on: Option<List>,
    /// Owner payload; reset by the owner when a slot is rebound.
    pub data: T,
}

impl<T> Element<T> {
    /// Extent number currently bound (or [`LC_FREE`]).
    #[must_use]
    pub fn number(&self) -> u32 {
        self.lc_number
    }

    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LruStats {
    pub nr_elements: u32,
    /// Slots with `refcnt > 0`.
    pub used: u32,
    pub hits: u64,
    pub misses: u64,
    /// `get` calls refused because every slot was pinned.
    pub starving: u64,
    /// Misses refused because a change was pending or the cache was locked.
    pub dirty: u64,
    /// Committed slot changes.
    pub changed: u64,
}

/// Fixed-capacity LRU cache of extent numbers.
pub struct LruCache<T> {
    name: &'static str,
    elements: Vec<Element<T>>,
    /// Resident, unpinned slots; head is most recently used.
    lru: ListHead,
    /// Unbound slots; head is handed out first.
    free: ListHead,
    index: HashMap<u32, usize>,
    changing: Option<usize>,
    new_number: u32,
    starving: bool,
    locked: bool,
    stats: LruStats,
}

impl<T: Default> LruCache<T> {
    /// Create a cache of `nr_elements` free slots.
    #[must_use]
    pub fn new(name: &'static str, nr_elements: u32) -> Self {
        let n = nr_elements as usize;
        let mut lc = Self {
            name,
            elements: (0..n)
                .map(|_| Element {
                    lc_number: LC_FREE,
                    refcnt: 0,
                    prev: NIL,
                    next: NIL,
                    on: None,
                    data: T::default(),
                })
                .collect(),
            lru: ListHead::EMPTY,
            free: ListHead::EMPTY,
            index: HashMap::with_capacity(n),
            changing: None,
            new_number: LC_FREE,
            starving: false,
            locked: false,
            stats: LruStats {
                nr_elements,
                ..LruStats::default()
            },
        };
        lc.fill_free_list();
        lc
    }

    /// Drop every binding and reference; counters restart from zero.
    pub fn reset(&mut self) {
        for e in &mut self.elements {
            e.lc_number = LC_FREE;
            e.refcnt = 0;
            e.prev = NIL;
            e.next = NIL;
            e.on = None;
            e.data = T::default();
        }
        self.lru = ListHead::EMPTY;
        self.free = ListHead::EMPTY;
        self.fill_free_list();
        self.index.clear();
        self.changing = None;
        self.new_number = LC_FREE;
        self.starving = false;
        self.locked = false;
        self.stats = LruStats {
            nr_elements: self.stats.nr_elements,
            ..LruStats::default()
        };
    }
}

impl<T> LruCache<T> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn nr_elements(&self) -> u32 {
        self.stats.nr_elements
    }

    #[must_use]
    pub fn used(&self) -> u32 {
        self.stats.used
    }

    #[must_use]
    pub fn stats(&self) -> LruStats {
        self.stats
    }

    #[must_use]
    pub fn is_starving(&self) -> bool {
        self.starving
    }

    /// A slot change is pending commit.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.changing.is_some()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Index of the slot awaiting [`Self::changed`], if any.
    #[must_use]
    pub fn changing_index(&self) -> Option<usize> {
        self.changing
    }

    /// Number the changing slot will carry after commit.
    #[must_use]
    pub fn new_number(&self) -> u32 {
        self.new_number
    }

    #[must_use]
    pub fn element(&self, idx: usize) -> &Element<T> {
        &self.elements[idx]
    }

    pub fn element_mut(&mut self, idx: usize) -> &mut Element<T> {
        &mut self.elements[idx]
    }

    /// Slot index currently bound to `enr`. Never touches reference counts
    /// or LRU order.
    #[must_use]
    pub fn find_index(&self, enr: u32) -> Option<usize> {
        self.index.get(&enr).copied()
    }

    #[must_use]
    pub fn find(&self, enr: u32) -> Option<&Element<T>> {
        self.find_index(enr).map(|i| &self.elements[i])
    }

    /// `enr` is resident and pinned.
    #[must_use]
    pub fn is_used(&self, enr: u32) -> bool {
        self.find(enr).is_some_and(|e| e.refcnt > 0)
    }

    /// `enr` is the number the changing slot is about to take.
    #[must_use]
    pub fn is_pending(&self, enr: u32) -> bool {
        self.changing.is_some() && self.new_number == enr
    }

    /// Indices of slots bound (hashed) to an extent, in slot order.
    pub fn resident(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.elements.len()).filter(|&i| {
            let n = self.elements[i].lc_number;
            n != LC_FREE && self.index.get(&n) == Some(&i)
        })
    }

    // ── intrusive lists ────────────────────────────────────────────────────

    /// Link every slot on the free list, slot 0 at the head.
    fn fill_free_list(&mut self) {
        for idx in (0..self.elements.len()).rev() {
            self.link_front(List::Free, idx);
        }
    }

    fn list_mut(&mut self, list: List) -> &mut ListHead {
        match list {
            List::Free => &mut self.free,
            List::Lru => &mut self.lru,
        }
    }

    fn link_front(&mut self, list: List, idx: usize) {
        self.unlink(idx);
        let head = self.list_mut(list).head;
        let e = &mut self.elements[idx];
        e.prev = NIL;
        e.next = head;
        e.on = Some(list);
        if head == NIL {
            self.list_mut(list).tail = idx;
        } else {
            self.elements[head].prev = idx;
        }
        self.list_mut(list).head = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let (on, prev, next) = {
            let e = &self.elements[idx];
            (e.on, e.prev, e.next)
        };
        let Some(list) = on else {
            return;
        };
        if prev == NIL {
            self.list_mut(list).head = next;
        } else {
            self.elements[prev].next = next;
        }
        if next == NIL {
            self.list_mut(list).tail = prev;
        } else {
            self.elements[next].prev = prev;
        }
        let e = &mut self.elements[idx];
        e.prev = NIL;
        e.next = NIL;
        e.on = None;
    }

    fn take_free(&mut self) -> Option<usize> {
        let idx = self.free.head;
        if idx == NIL {
            return None;
        }
        self.unlink(idx);
        Some(idx)
    }

    fn take_lru_victim(&mut self) -> Option<usize> {
        let idx = self.lru.tail;
        if idx == NIL {
            return None;
        }
        self.unlink(idx);
        Some(idx)
    }

    fn pin(&mut self, idx: usize) {
        let e = &mut self.elements[idx];
        e.refcnt += 1;
        if e.refcnt == 1 {
            self.unlink(idx);
            self.stats.used += 1;
        }
    }

    /// Pin the slot for `enr`, binding a new slot on a miss.
    ///
    /// Returns `None` when the caller must wait: the cache is starving, a
    /// change is already pending, the cache is locked, or every slot is
    /// pinned. On a miss the returned slot still carries its previous
    /// number; the caller persists the change and then calls
    /// [`Self::changed`].
    pub fn get(&mut self, enr: u32) -> Option<usize> {
        if self.starving {
            self.stats.starving += 1;
            return None;
        }
        if let Some(idx) = self.find_index(enr) {
            self.stats.hits += 1;
            self.pin(idx);
            return Some(idx);
        }
        self.stats.misses += 1;

        if self.changing.is_some() || self.locked {
            self.stats.dirty += 1;
            return None;
        }

        let victim = self.take_free().or_else(|| self.take_lru_victim());
        let Some(idx) = victim else {
            self.starving = true;
            self.stats.starving += 1;
            trace!(target: "synctrack::lru", cache = self.name, enr, "lru_starving");
            return None;
        };
        let old = self.elements[idx].lc_number;
        if old != LC_FREE {
            self.index.remove(&old);
        }
        self.elements[idx].refcnt = 1;
        self.stats.used += 1;
        self.changing = Some(idx);
        self.new_number = enr;
        trace!(
            target: "synctrack::lru",
            cache = self.name,
            slot = idx,
            old,
            enr,
            "lru_slot_changing"
        );
        Some(idx)
    }

    /// Pin `enr` only if it is already resident.
    pub fn try_get(&mut self, enr: u32) -> Option<usize> {
        if self.starving {
            self.stats.starving += 1;
            return None;
        }
        let idx = self.find_index(enr)?;
        self.stats.hits += 1;
        self.pin(idx);
        Some(idx)
    }

    /// Commit the pending change of slot `idx` to `new_number`.
    pub fn changed(&mut self, idx: usize) {
        if self.changing != Some(idx) {
            error!(
                target: "synctrack::lru",
                cache = self.name,
                slot = idx,
                changing = ?self.changing,
                "lru_changed_wrong_slot"
            );
            return;
        }
        let enr = self.new_number;
        self.elements[idx].lc_number = enr;
        self.index.insert(enr, idx);
        self.changing = None;
        self.new_number = LC_FREE;
        self.stats.changed += 1;
    }

    /// Release one reference; returns the remaining count.
    pub fn put(&mut self, idx: usize) -> u32 {
        let e = &mut self.elements[idx];
        if e.refcnt == 0 {
            error!(
                target: "synctrack::lru",
                cache = self.name,
                slot = idx,
                enr = e.lc_number,
                "lru_put_unreferenced"
            );
            return 0;
        }
        e.refcnt -= 1;
        let left = e.refcnt;
        if left == 0 {
            self.link_front(List::Lru, idx);
            self.stats.used -= 1;
            self.starving = false;
        }
        left
    }

    /// Unbind an unpinned slot and return it to the free list.
    pub fn del(&mut self, idx: usize) -> bool {
        let e = &self.elements[idx];
        if e.refcnt > 0 || self.changing == Some(idx) {
            error!(
                target: "synctrack::lru",
                cache = self.name,
                slot = idx,
                refcnt = e.refcnt,
                "lru_del_pinned"
            );
            return false;
        }
        let old = e.lc_number;
        if old != LC_FREE && self.index.get(&old) == Some(&idx) {
            self.index.remove(&old);
        }
        self.link_front(List::Free, idx);
        self.elements[idx].lc_number = LC_FREE;
        true
    }

    /// Bind slot `idx` to `enr` without reference counting (log replay).
    ///
    /// Any other slot holding `enr` is freed. Binding [`LC_FREE`] frees the
    /// slot. Pinned slots are left untouched.
    pub fn set(&mut self, enr: u32, idx: usize) {
        if idx >= self.elements.len() {
            error!(target: "synctrack::lru", cache = self.name, slot = idx, "lru_set_out_of_range");
            return;
        }
        if self.elements[idx].refcnt > 0 {
            error!(target: "synctrack::lru", cache = self.name, slot = idx, "lru_set_pinned");
            return;
        }
        if enr != LC_FREE
            && let Some(other) = self.find_index(enr)
            && other != idx
        {
            self.del(other);
        }
        let old = self.elements[idx].lc_number;
        if old != LC_FREE && self.index.get(&old) == Some(&idx) {
            self.index.remove(&old);
        }
        self.elements[idx].lc_number = enr;
        if enr == LC_FREE {
            self.link_front(List::Free, idx);
        } else {
            self.index.insert(enr, idx);
            self.link_front(List::Lru, idx);
        }
    }

    /// Block slot changes for a bulk walk over resident slots. Fails while a
    /// change is pending or another holder has the lock.
    pub fn try_lock(&mut self) -> bool {
        if self.locked || self.changing.is_some() {
            return false;
        }
        self.locked = true;
        true
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }
}

impl<T> fmt::Debug for LruCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("name", &self.name)
            .field("stats", &self.stats)
            .field("changing", &self.changing)
            .field("starving", &self.starving)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for LruStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "used:{}/{} hits:{} misses:{} starving:{} dirty:{} changed:{}",
            self.used,
            self.nr_elements,
            self.hits,
            self.misses,
            self.starving,
            self.dirty,
            self.changed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn admit<T: Default>(lc: &mut LruCache<T>, enr: u32) -> usize {
        let idx = lc.get(enr).expect("slot available");
        if lc.element(idx).number() != enr {
            lc.changed(idx);
        }
        idx
    }

    #[test]
    fn miss_then_hit() {
        let mut lc: LruCache<()> = LruCache::new("t", 3);
        let idx = lc.get(10).unwrap();
        assert_eq!(lc.element(idx).number(), LC_FREE);
        assert_eq!(lc.changing_index(), Some(idx));
        assert_eq!(lc.new_number(), 10);
        assert!(lc.find(10).is_none(), "not hashed before commit");
        lc.changed(idx);
        assert_eq!(lc.find(10).unwrap().refcnt(), 1);

        assert_eq!(lc.get(10), Some(idx));
        assert_eq!(lc.element(idx).refcnt(), 2);
        assert_eq!(lc.put(idx), 1);
        assert_eq!(lc.put(idx), 0);
        let stats = lc.stats();
        assert_eq!((stats.hits, stats.misses, stats.changed, stats.used), (1, 1, 1, 0));
    }

    #[test]
    fn second_miss_waits_for_commit() {
        let mut lc: LruCache<()> = LruCache::new("t", 3);
        let a = lc.get(1).unwrap();
        assert_eq!(lc.get(2), None);
        assert_eq!(lc.get(1), None, "pending number is not findable yet");
        assert!(lc.is_pending(1));
        assert!(!lc.is_used(1));
        assert_eq!(lc.stats().dirty, 2);
        lc.changed(a);
        assert!(lc.get(2).is_some());
    }

    #[test]
    fn evicts_least_recently_used_unpinned_slot() {
        let mut lc: LruCache<()> = LruCache::new("t", 2);
        let a = admit(&mut lc, 1);
        let b = admit(&mut lc, 2);
        lc.put(a);
        lc.put(b);
        // 1 released first, so it is the LRU victim.
        let c = lc.get(3).unwrap();
        assert_eq!(c, a);
        assert_eq!(lc.element(c).number(), 1, "keeps old number until commit");
        assert!(lc.find(1).is_none(), "victim unhashed immediately");
        lc.changed(c);
        assert_eq!(lc.find(3).map(Element::number), Some(3));
        assert!(lc.find(2).is_some());
    }

    #[test]
    fn starvation_blocks_until_put() {
        let mut lc: LruCache<()> = LruCache::new("t", 2);
        let a = admit(&mut lc, 1);
        let _b = admit(&mut lc, 2);
        assert_eq!(lc.get(3), None);
        assert!(lc.is_starving());
        // Even hits are refused while starving.
        assert_eq!(lc.get(1), None);
        lc.put(a);
        assert!(!lc.is_starving());
        assert!(lc.get(3).is_some());
    }

    #[test]
    fn try_get_only_hits() {
        let mut lc: LruCache<()> = LruCache::new("t", 2);
        assert_eq!(lc.try_get(5), None);
        assert_eq!(lc.changing_index(), None);
        let a = admit(&mut lc, 5);
        lc.put(a);
        assert_eq!(lc.try_get(5), Some(a));
        assert!(lc.is_used(5));
    }

    #[test]
    fn lock_blocks_misses_but_not_hits() {
        let mut lc: LruCache<()> = LruCache::new("t", 4);
        let a = admit(&mut lc, 1);
        assert!(lc.try_lock());
        assert!(!lc.try_lock());
        assert_eq!(lc.get(2), None);
        assert_eq!(lc.get(1), Some(a));
        lc.unlock();
        assert!(lc.get(2).is_some());
        assert!(!lc.try_lock(), "pending change blocks the lock");
    }

    #[test]
    fn del_refuses_pinned_and_frees_unpinned() {
        let mut lc: LruCache<()> = LruCache::new("t", 2);
        let a = admit(&mut lc, 7);
        assert!(!lc.del(a));
        lc.put(a);
        assert!(lc.del(a));
        assert!(lc.find(7).is_none());
        assert_eq!(lc.resident().count(), 0);
    }

    #[test]
    fn set_rebinds_and_dedupes() {
        let mut lc: LruCache<()> = LruCache::new("t", 4);
        lc.set(10, 0);
        lc.set(11, 1);
        lc.set(10, 2);
        assert_eq!(lc.find_index(10), Some(2));
        assert_eq!(lc.element(0).number(), LC_FREE);
        lc.set(LC_FREE, 1);
        assert_eq!(lc.resident().collect::<Vec<_>>(), vec![2]);
        // Replayed slots are resident but unpinned: evictable.
        assert!(!lc.is_used(10));
        let idx = lc.get(99).unwrap();
        assert_ne!(idx, 2, "free slots are used before evicting");
    }

    #[test]
    fn freed_slots_are_reused_before_evicting() {
        let mut lc: LruCache<()> = LruCache::new("t", 4);
        // Replay binds slot 2 straight off the free list.
        lc.set(20, 2);
        let mut order = Vec::new();
        for enr in 0..3 {
            let idx = admit(&mut lc, enr);
            lc.put(idx);
            order.push(idx);
        }
        assert_eq!(order, vec![0, 1, 3]);

        // Deleting a middle slot hands it out next; then the LRU tail goes.
        assert!(lc.del(1));
        assert_eq!(admit(&mut lc, 7), 1);
        let victim = lc.get(8).unwrap();
        assert_eq!(lc.element(victim).number(), 20, "replayed slot is oldest");
        lc.changed(victim);
        assert_eq!(lc.find_index(8), Some(2));
    }

    #[test]
    fn put_unreferenced_is_logged_not_fatal() {
        let mut lc: LruCache<()> = LruCache::new("t", 1);
        assert_eq!(lc.put(0), 0);
        assert_eq!(lc.used(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut lc: LruCache<u32> = LruCache::new("t", 2);
        let a = admit(&mut lc, 1);
        lc.element_mut(a).data = 42;
        lc.reset();
        assert_eq!(lc.resident().count(), 0);
        assert_eq!(lc.element(a).data, 0);
        assert_eq!(lc.stats(), LruStats { nr_elements: 2, ..LruStats::default() });
    }

    #[test]
    fn stats_display() {
        let lc: LruCache<()> = LruCache::new("al", 7);
        assert_eq!(
            lc.stats().to_string(),
            "used:0/7 hits:0 misses:0 starving:0 dirty:0 changed:0"
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Get(u32),
        Put(usize),
        Commit,
        Del(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_u32..12).prop_map(Op::Get),
            (0_usize..5).prop_map(Op::Put),
            Just(Op::Commit),
            (0_usize..5).prop_map(Op::Del),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn pinned_slots_never_rebound(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let mut lc: LruCache<()> = LruCache::new("p", 5);
            // Model: pins held per slot and the number each pinned slot carries.
            let mut pins = [0_u32; 5];
            let mut bound = [LC_FREE; 5];
            for op in ops {
                match op {
                    Op::Get(enr) => {
                        if let Some(idx) = lc.get(enr) {
                            if pins[idx] > 0 {
                                prop_assert_eq!(bound[idx], enr);
                            }
                            pins[idx] += 1;
                            bound[idx] = enr;
                        }
                    }
                    Op::Put(idx) => {
                        if pins[idx] > 0 && lc.changing_index() != Some(idx) {
                            pins[idx] -= 1;
                            prop_assert_eq!(lc.put(idx), pins[idx]);
                        }
                    }
                    Op::Commit => {
                        if let Some(idx) = lc.changing_index() {
                            lc.changed(idx);
                        }
                    }
                    Op::Del(idx) => {
                        let deleted = lc.del(idx);
                        prop_assert_eq!(deleted, pins[idx] == 0 && lc.changing_index() != Some(idx));
                    }
                }
                let used = pins.iter().filter(|&&p| p > 0).count();
                prop_assert_eq!(lc.used() as usize, used);
                for (idx, &p) in pins.iter().enumerate() {
                    prop_assert_eq!(lc.element(idx).refcnt(), p);
                }
                let mut seen = std::collections::HashSet::new();
                for idx in lc.resident() {
                    prop_assert!(seen.insert(lc.element(idx).number()));
                }
            }
        }
    }
}
