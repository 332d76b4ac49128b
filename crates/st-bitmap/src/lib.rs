#![forbid(unsafe_code)]
//! Paged out-of-sync bitmap.
//!
//! One bit per 4 KiB block of the replicated device. A set bit means the
//! block is not known to be identical on both replicas. Bits live in 4 KiB
//! pages which are also the unit of on-disk I/O and of dirty tracking:
//!
//! | Mutation | Page flag raised | Written by |
//! |----------|------------------|------------|
//! | bit set | `need_writeout` | [`Bitmap::write`], [`Bitmap::write_lazy`], [`Bitmap::write_page`] |
//! | bit cleared | `lazy_writeout` | same |
//!
//! Page content is copied under the bitmap lock when a write is submitted,
//! so bits may keep changing while the copy is in flight. A page is
//! `io_locked` from submission until completion; a second writer of the
//! same page waits for the first one.
//!
//! Bits at or beyond [`Bitmap::bits`] inside the last page ("surplus") are
//! always zero and never counted.

pub mod page;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use st_block::{IoCompletion, IoEngine, IoOp, MetaLayout};
use st_error::{Result, StError};
use st_types::{
    BM_BITS_PER_PAGE, BM_PAGE_SIZE, ExtentKind, SECTOR_SHIFT, bits_for_capacity, pages_for_bits,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub use page::PageFlags;
use page::{Page, locate, word_mask};

/// Returned by the `find_next_*` scans when no bit qualifies.
pub const END: u64 = u64::MAX;

/// Outcome of [`Bitmap::test_bit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BitState {
    Clear,
    Set,
    /// The bit index equals [`Bitmap::bits`].
    OnePastEnd,
}

/// Bitmap I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BitmapStats {
    pub pages_read: u64,
    pub pages_written: u64,
    /// Pages skipped by a write because nothing changed.
    pub pages_unchanged: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

struct BmState {
    pages: Vec<Page>,
    bits: u64,
    words: u64,
    set: u64,
    capacity_sectors: u64,
    stats: BitmapStats,
}

#[expect(clippy::cast_possible_truncation)] // in-word offsets are < 64
impl BmState {
    fn word_mut(&mut self, word: u64) -> &mut u64 {
        let (p, i) = locate(word);
        &mut self.pages[p].words[i]
    }

    fn word(&self, word: u64) -> u64 {
        let (p, i) = locate(word);
        self.pages[p].words[i]
    }

    /// Zero every bit at or past `bits` in the allocated pages.
    fn clear_surplus(&mut self) {
        let pages = self.pages.len() as u64;
        let bits = self.bits;
        let Some(last) = self.pages.last_mut() else {
            return;
        };
        let used_in_last = bits - (pages - 1) * BM_BITS_PER_PAGE;
        let full_words = (used_in_last / 64) as usize;
        let tail = (used_in_last % 64) as u32;
        let mut start = full_words;
        if tail != 0 {
            last.words[full_words] &= word_mask(0, tail);
            start += 1;
        }
        for w in &mut last.words[start..] {
            *w = 0;
        }
    }

    /// Raise surplus bits in the last word so a grow-with-set can fill
    /// whole words.
    fn set_surplus(&mut self) {
        let tail = (self.bits % 64) as u32;
        if tail == 0 || self.words == 0 {
            return;
        }
        let last = self.words - 1;
        *self.word_mut(last) |= !word_mask(0, tail);
    }

    fn recount(&self) -> u64 {
        self.pages
            .iter()
            .flat_map(|p| p.words.iter())
            .map(|w| u64::from(w.count_ones()))
            .sum()
    }

    /// Set or clear the inclusive range, already clamped to `bits`.
    fn change_range(&mut self, start: u64, end: u64, set: bool) -> u64 {
        let mut changed = 0_u64;
        let mut bit = start;
        while bit <= end {
            let word = bit / 64;
            let off = (bit % 64) as u32;
            let last = end.min(word * 64 + 63);
            let mask = word_mask(off, (last - bit + 1) as u32);
            let (p, i) = locate(word);
            let page = &mut self.pages[p];
            let before = page.words[i];
            let delta = if set {
                page.words[i] |= mask;
                mask & !before
            } else {
                page.words[i] &= !mask;
                mask & before
            };
            if delta != 0 {
                changed += u64::from(delta.count_ones());
                if set {
                    page.flags.need_writeout = true;
                } else {
                    page.flags.lazy_writeout = true;
                }
            }
            bit = last + 1;
        }
        if set {
            self.set += changed;
        } else {
            self.set -= changed;
        }
        changed
    }

    fn count_range(&self, start: u64, end: u64) -> u64 {
        let mut count = 0_u64;
        let mut bit = start;
        while bit <= end {
            let word = bit / 64;
            let off = (bit % 64) as u32;
            let last = end.min(word * 64 + 63);
            let mask = word_mask(off, (last - bit + 1) as u32);
            count += u64::from((self.word(word) & mask).count_ones());
            bit = last + 1;
        }
        count
    }

    fn find_next(&self, from: u64, want_set: bool) -> u64 {
        if from >= self.bits {
            return END;
        }
        let mut word = from / 64;
        let mut mask = !0_u64 << (from % 64);
        while word < self.words {
            let raw = self.word(word);
            let candidates = (if want_set { raw } else { !raw }) & mask;
            if candidates != 0 {
                let bit = word * 64 + u64::from(candidates.trailing_zeros());
                return if bit < self.bits { bit } else { END };
            }
            mask = !0;
            word += 1;
        }
        END
    }

    /// Clamp an inclusive range to the bitmap, logging out-of-range callers.
    fn clamp(&self, op: &'static str, start: u64, end: u64) -> Option<(u64, u64)> {
        if start > end {
            return None;
        }
        if end >= self.bits {
            if start >= self.bits {
                if start > self.bits {
                    error!(
                        target: "synctrack::bitmap",
                        op, start, end, bits = self.bits,
                        "bitmap_range_out_of_bounds"
                    );
                }
                return None;
            }
            error!(
                target: "synctrack::bitmap",
                op, start, end, bits = self.bits,
                "bitmap_range_clamped"
            );
            return Some((start, self.bits - 1));
        }
        Some((start, end))
    }
}

/// The out-of-sync bitmap of one device.
pub struct Bitmap {
    state: Mutex<BmState>,
    /// Signalled when a page leaves `io_locked`.
    io_done: Condvar,
    bulk_holder: Mutex<Option<String>>,
    bulk_released: Condvar,
    engine: Arc<dyn IoEngine>,
    layout: MetaLayout,
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Bitmap")
            .field("bits", &state.bits)
            .field("set", &state.set)
            .field("pages", &state.pages.len())
            .finish_non_exhaustive()
    }
}

impl Bitmap {
    /// Empty bitmap persisted in `layout`'s bitmap region.
    #[must_use]
    pub fn new(engine: Arc<dyn IoEngine>, layout: MetaLayout) -> Self {
        Self {
            state: Mutex::new(BmState {
                pages: Vec::new(),
                bits: 0,
                words: 0,
                set: 0,
                capacity_sectors: 0,
                stats: BitmapStats::default(),
            }),
            io_done: Condvar::new(),
            bulk_holder: Mutex::new(None),
            bulk_released: Condvar::new(),
            engine,
            layout,
        }
    }

    #[must_use]
    pub fn bits(&self) -> u64 {
        self.state.lock().bits
    }

    #[must_use]
    pub fn words(&self) -> u64 {
        self.state.lock().words
    }

    #[must_use]
    pub fn pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Device capacity the bitmap was last sized for.
    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.state.lock().capacity_sectors
    }

    #[must_use]
    pub fn stats(&self) -> BitmapStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn page_flags(&self, page: usize) -> Option<PageFlags> {
        self.state.lock().pages.get(page).map(|p| p.flags)
    }

    /// Page holding bit `bit`.
    #[expect(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn page_of_bit(bit: u64) -> usize {
        (bit / BM_BITS_PER_PAGE) as usize
    }

    fn wait_io_idle<'a>(&self, mut state: MutexGuard<'a, BmState>) -> MutexGuard<'a, BmState> {
        while state.pages.iter().any(|p| p.flags.io_locked) {
            self.io_done.wait(&mut state);
        }
        state
    }

    // ── sizing ─────────────────────────────────────────────────────────────

    /// Resize to cover `capacity_sectors`.
    ///
    /// Growing fills the new range with ones when `set_new_bits`, zeros
    /// otherwise. Fails with [`StError::NoSpace`] and leaves the bitmap
    /// untouched when the on-disk region cannot hold the new bit count.
    pub fn resize(&self, capacity_sectors: u64, set_new_bits: bool) -> Result<()> {
        let bits = bits_for_capacity(capacity_sectors);
        let max = self.layout.max_bitmap_bits();
        if bits > max {
            warn!(
                target: "synctrack::bitmap",
                capacity_sectors, bits, max_bits = max,
                "bitmap_resize_no_space"
            );
            return Err(StError::NoSpace);
        }

        let mut state = self.wait_io_idle(self.state.lock());
        let old_bits = state.bits;
        let growing = bits > old_bits;
        let pages = usize::try_from(pages_for_bits(bits)).map_err(|_| {
            StError::InvalidGeometry(format!("bitmap of {bits} bits exceeds address space"))
        })?;

        if growing && set_new_bits {
            state.set_surplus();
        }
        state.pages.resize_with(pages, Page::zeroed);
        state.bits = bits;
        state.words = bits.div_ceil(64);
        state.capacity_sectors = capacity_sectors;

        if growing && set_new_bits {
            let first_new_word = old_bits.div_ceil(64);
            for word in first_new_word..state.words {
                *state.word_mut(word) = u64::MAX;
            }
            let first_page = Self::page_of_bit(old_bits);
            for page in &mut state.pages[first_page..] {
                page.flags.need_writeout = true;
            }
        }
        state.clear_surplus();

        if growing && set_new_bits {
            state.set += bits - old_bits;
        } else {
            state.set = state.recount();
        }
        info!(
            target: "synctrack::bitmap",
            old_bits,
            bits,
            pages,
            set = state.set,
            set_new_bits,
            "bitmap_resized"
        );
        Ok(())
    }

    // ── bit operations ─────────────────────────────────────────────────────

    /// Set bits `start..=end`; returns how many were previously clear.
    pub fn set_bits(&self, start: u64, end: u64) -> u64 {
        let mut state = self.state.lock();
        match state.clamp("set_bits", start, end) {
            Some((s, e)) => state.change_range(s, e, true),
            None => 0,
        }
    }

    /// Clear bits `start..=end`; returns how many were previously set.
    pub fn clear_bits(&self, start: u64, end: u64) -> u64 {
        let mut state = self.state.lock();
        match state.clamp("clear_bits", start, end) {
            Some((s, e)) => state.change_range(s, e, false),
            None => 0,
        }
    }

    /// Number of set bits in `start..=end`.
    #[must_use]
    pub fn count_bits(&self, start: u64, end: u64) -> u64 {
        let state = self.state.lock();
        match state.clamp("count_bits", start, end) {
            Some((s, e)) => state.count_range(s, e),
            None => 0,
        }
    }

    #[must_use]
    pub fn test_bit(&self, bit: u64) -> BitState {
        let state = self.state.lock();
        if bit < state.bits {
            if state.word(bit / 64) & (1 << (bit % 64)) != 0 {
                BitState::Set
            } else {
                BitState::Clear
            }
        } else if bit == state.bits {
            BitState::OnePastEnd
        } else {
            error!(
                target: "synctrack::bitmap",
                bit, bits = state.bits,
                "bitmap_test_bit_out_of_range"
            );
            BitState::Clear
        }
    }

    /// First set bit at or after `from`, or [`END`].
    #[must_use]
    pub fn find_next_set(&self, from: u64) -> u64 {
        self.state.lock().find_next(from, true)
    }

    /// First clear bit at or after `from`, or [`END`].
    #[must_use]
    pub fn find_next_zero(&self, from: u64) -> u64 {
        self.state.lock().find_next(from, false)
    }

    /// Mark every block out of sync.
    pub fn set_all(&self) {
        let mut state = self.state.lock();
        for page in &mut state.pages {
            page.words.fill(u64::MAX);
            page.flags.need_writeout = true;
        }
        state.clear_surplus();
        state.set = state.bits;
    }

    /// Mark every block in sync.
    pub fn clear_all(&self) {
        let mut state = self.state.lock();
        for page in &mut state.pages {
            page.words.fill(0);
            page.flags.lazy_writeout = true;
        }
        state.set = 0;
    }

    /// Set bits inside one extent of the given kind.
    #[must_use]
    pub fn e_weight(&self, kind: ExtentKind, enr: u32) -> u64 {
        let (start, end) = kind.bit_range(enr);
        let state = self.state.lock();
        if start >= state.bits {
            return 0;
        }
        state.count_range(start, end.min(state.bits - 1))
    }

    /// Set every bit inside extent `enr` of `kind`; returns how many changed.
    pub fn set_extent(&self, kind: ExtentKind, enr: u32) -> u64 {
        let (start, end) = kind.bit_range(enr);
        let mut state = self.state.lock();
        if start >= state.bits {
            return 0;
        }
        let end = end.min(state.bits - 1);
        state.change_range(start, end, true)
    }

    /// Total set bits.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.state.lock().set
    }

    /// Bitmap pages holding the bits of extent `enr`.
    #[must_use]
    pub fn extent_pages(&self, kind: ExtentKind, enr: u32) -> std::ops::Range<usize> {
        let (start, end) = kind.bit_range(enr);
        let bits = self.bits();
        if start >= bits {
            return 0..0;
        }
        Self::page_of_bit(start)..Self::page_of_bit(end.min(bits - 1)) + 1
    }

    // ── bulk admission ─────────────────────────────────────────────────────

    /// Claim the bitmap for a bulk operation, waiting for an earlier holder.
    pub fn lock(&self, why: &str) {
        let mut holder = self.bulk_holder.lock();
        if let Some(current) = holder.as_deref() {
            warn!(
                target: "synctrack::bitmap",
                why, holder = current,
                "bitmap_lock_contended"
            );
        }
        while holder.is_some() {
            self.bulk_released.wait(&mut holder);
        }
        *holder = Some(why.to_owned());
    }

    pub fn unlock(&self) {
        let mut holder = self.bulk_holder.lock();
        if holder.take().is_none() {
            error!(target: "synctrack::bitmap", "bitmap_unlock_not_locked");
        }
        self.bulk_released.notify_one();
    }

    /// Reason given by the current bulk holder.
    #[must_use]
    pub fn lock_holder(&self) -> Option<String> {
        self.bulk_holder.lock().clone()
    }

    // ── I/O ────────────────────────────────────────────────────────────────

    fn page_offset(&self, page: usize) -> u64 {
        self.layout.bm_page_sector(page as u64) << SECTOR_SHIFT
    }

    /// Load every page from disk. Surplus bits read as one are cleared and
    /// the set count is recomputed.
    pub fn read(&self) -> Result<()> {
        let mut state = self.wait_io_idle(self.state.lock());
        let n = state.pages.len();
        for page in &mut state.pages {
            page.flags.io_locked = true;
        }
        drop(state);

        let ops = (0..n)
            .map(|i| IoOp::Read {
                offset: self.page_offset(i),
                buf: vec![0_u8; BM_PAGE_SIZE],
            })
            .collect();
        let completions = self.engine.submit_batch(ops);

        let mut state = self.state.lock();
        let mut failed = Vec::new();
        for (i, completion) in completions.into_iter().enumerate() {
            let page = &mut state.pages[i];
            page.flags.io_locked = false;
            match completion {
                IoCompletion::Read(buf) => {
                    page.load_bytes(&buf);
                    page.flags.io_error = false;
                    page.flags.need_writeout = false;
                    page.flags.lazy_writeout = false;
                }
                other => {
                    page.flags.io_error = true;
                    failed.push((i, format!("{other:?}")));
                }
            }
        }
        state.clear_surplus();
        state.set = state.recount();
        state.stats.pages_read += (n - failed.len()) as u64;
        state.stats.read_errors += failed.len() as u64;
        let set = state.set;
        drop(state);
        self.io_done.notify_all();

        info!(target: "synctrack::bitmap", pages = n, set, failed = failed.len(), "bitmap_read");
        self.io_result("read", n, &failed)
    }

    /// Write every page with newly set bits. Pages that only had bits
    /// cleared wait for [`Self::write_lazy`].
    pub fn write(&self) -> Result<()> {
        self.write_pages("write", |_, flags| flags.need_writeout)
    }

    /// Write every page, changed or not.
    pub fn write_all(&self) -> Result<()> {
        self.write_pages("write_all", |_, _| true)
    }

    /// Write changed pages with index below `upper_page` (`0` = no limit).
    pub fn write_lazy(&self, upper_page: usize) -> Result<()> {
        self.write_pages("write_lazy", |i, flags| {
            (upper_page == 0 || i < upper_page) && !flags.unchanged()
        })
    }

    /// Write one page if it changed since its last write.
    pub fn write_page(&self, page: usize) -> Result<()> {
        self.write_pages("write_page", |i, flags| i == page && !flags.unchanged())
    }

    fn write_pages(&self, op: &'static str, select: impl Fn(usize, PageFlags) -> bool) -> Result<()> {
        let mut state = self.state.lock();
        // Wait out earlier writers of any page this call would pick.
        while state
            .pages
            .iter()
            .enumerate()
            .any(|(i, p)| p.flags.io_locked && select(i, p.flags))
        {
            self.io_done.wait(&mut state);
        }

        let mut chosen = Vec::new();
        let mut ops = Vec::new();
        let mut skipped = 0_u64;
        for i in 0..state.pages.len() {
            let page = &mut state.pages[i];
            if !select(i, page.flags) {
                let dirty = PageFlags {
                    need_writeout: true,
                    ..page.flags
                };
                // Selected by position but nothing to write.
                if page.flags.unchanged() && select(i, dirty) {
                    skipped += 1;
                }
                continue;
            }
            page.flags.io_locked = true;
            page.flags.need_writeout = false;
            page.flags.lazy_writeout = false;
            ops.push(IoOp::Write {
                offset: self.page_offset(i),
                data: page.to_bytes(),
            });
            chosen.push(i);
        }
        state.stats.pages_unchanged += skipped;
        drop(state);

        if chosen.is_empty() {
            return Ok(());
        }
        ops.push(IoOp::Sync);
        let mut completions = self.engine.submit_batch(ops);
        // A failed flush leaves every page of the batch in doubt.
        let flush_error = match completions.pop() {
            Some(IoCompletion::Sync) => None,
            other => Some(format!("flush: {other:?}")),
        };

        let mut state = self.state.lock();
        let mut failed = Vec::new();
        for (&i, completion) in chosen.iter().zip(completions) {
            let page = &mut state.pages[i];
            page.flags.io_locked = false;
            if let (IoCompletion::Write, None) = (&completion, &flush_error) {
                page.flags.io_error = false;
            } else {
                page.flags.io_error = true;
                // Keep the page dirty so the next write retries it.
                page.flags.need_writeout = true;
                let detail = match completion {
                    IoCompletion::Write => flush_error.clone().unwrap_or_default(),
                    other => format!("{other:?}"),
                };
                failed.push((i, detail));
            }
        }
        state.stats.pages_written += (chosen.len() - failed.len()) as u64;
        state.stats.write_errors += failed.len() as u64;
        drop(state);
        self.io_done.notify_all();

        debug!(
            target: "synctrack::bitmap",
            op,
            pages = chosen.len(),
            failed = failed.len(),
            "bitmap_pages_written"
        );
        self.io_result(op, chosen.len(), &failed)
    }

    fn io_result(&self, op: &'static str, total: usize, failed: &[(usize, String)]) -> Result<()> {
        let Some((first, detail)) = failed.first() else {
            return Ok(());
        };
        error!(
            target: "synctrack::bitmap",
            op,
            failed = failed.len(),
            total,
            first_page = first,
            "bitmap_io_failed"
        );
        Err(StError::MetaIo {
            sector: self.layout.bm_page_sector(*first as u64),
            detail: format!("{op}: {} of {total} pages failed ({detail})", failed.len()),
        })
    }
}
