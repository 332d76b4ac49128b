//! Resync extent tracker and sync accounting.
//!
//! A resync works through the device one 256 MiB extent at a time. Before
//! it reads or writes an extent it locks it: the extent is marked
//! `no_writes` so new application writes into it wait, then the resync
//! waits until no activity extent inside it is active and marks it
//! `locked`. Application writes already waiting raise `priority`, which
//! makes a blocking resync acquire step aside for a bounded number of
//! rounds.
//!
//! Each resident extent counts the out-of-sync bits it still holds
//! (`rs_left`) and the bits whose resync failed (`rs_failed`). When the two
//! meet the extent's bitmap pages are flushed.

use crate::Device;
use crate::config::MAX_IO_SIZE;
use crate::device::Tracking;
use crate::worker::Work;
use parking_lot::MutexGuard;
use serde::Serialize;
use st_error::{Result, StError};
use st_lru::LruStats;
use st_types::{
    AL_EXT_PER_BM_EXT, BM_BITS_PER_EXT, BM_SECT_PER_BIT, CancelToken, ConnState, ExtentKind,
    LC_FREE, bm_ext_to_al_ext, sect_to_bit, sect_to_bm_ext,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Progress samples kept for rate estimation.
pub const SYNC_MARKS: usize = 8;
/// Minimum spacing between two progress samples.
pub const SYNC_MARK_STEP: Duration = Duration::from_secs(3);

/// Per-extent resync state, stored in the resync cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BmExtent {
    /// Out-of-sync bits still in the extent.
    pub rs_left: u64,
    /// Bits whose resync failed.
    pub rs_failed: u64,
    /// Application writes into the extent must wait.
    pub no_writes: bool,
    /// No activity extent inside is active; resync I/O may proceed.
    pub locked: bool,
    /// An application write is waiting for this extent.
    pub priority: bool,
}

impl BmExtent {
    fn fresh(rs_left: u64) -> Self {
        Self {
            rs_left,
            ..Self::default()
        }
    }

    fn has_flags(&self) -> bool {
        self.no_writes || self.locked || self.priority
    }

    fn clear_flags(&mut self) {
        self.no_writes = false;
        self.locked = false;
        self.priority = false;
    }
}

/// Snapshot of one resident resync extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BmExtentInfo {
    pub enr: u32,
    pub refcnt: u32,
    #[serde(flatten)]
    pub state: BmExtent,
}

/// Resync cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncStats {
    pub lru: LruStats,
    pub resync_locked: u32,
    /// Extent a non-blocking acquire is holding for its retry.
    pub pending_retry: Option<u32>,
    pub rs_failed: u64,
}

/// Resync progress derived from the sync marks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResyncProgress {
    /// Out-of-sync bits when the resync started.
    pub total: u64,
    /// Out-of-sync bits now.
    pub left: u64,
    pub failed: u64,
    pub percent_done: f64,
    /// Bits per second over the sampled window.
    pub rate_bits_per_sec: f64,
    pub eta_secs: Option<u64>,
}

/// Ring of `(bits left, time)` samples.
#[derive(Debug, Clone)]
pub(crate) struct SyncMarks {
    left: [u64; SYNC_MARKS],
    time: [Instant; SYNC_MARKS],
    last: usize,
    total: u64,
    finished: bool,
}

impl SyncMarks {
    pub(crate) fn new(total: u64) -> Self {
        let now = Instant::now();
        Self {
            left: [total; SYNC_MARKS],
            time: [now; SYNC_MARKS],
            last: 0,
            total,
            finished: false,
        }
    }

    fn advance(&mut self, now: Instant, left: u64) -> bool {
        if now < self.time[self.last] + SYNC_MARK_STEP || self.left[self.last] == left {
            return false;
        }
        let next = (self.last + 1) % SYNC_MARKS;
        self.left[next] = left;
        self.time[next] = now;
        self.last = next;
        true
    }

    #[expect(clippy::cast_precision_loss)]
    fn progress(&self, now: Instant, left: u64, failed: u64) -> ResyncProgress {
        let total = self.total.max(left);
        let percent_done = if total == 0 {
            100.0
        } else {
            (total - left) as f64 * 100.0 / total as f64
        };
        // The oldest sample is the one after the newest.
        let oldest = (self.last + 1) % SYNC_MARKS;
        let elapsed = now.duration_since(self.time[oldest]).as_secs_f64();
        let done = self.left[oldest].saturating_sub(left);
        let rate_bits_per_sec = if elapsed > 0.0 {
            done as f64 / elapsed
        } else {
            0.0
        };
        let remaining = left.saturating_sub(failed);
        let eta_secs = if remaining == 0 {
            Some(0)
        } else if rate_bits_per_sec > 0.0 {
            #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Some((remaining as f64 / rate_bits_per_sec).ceil() as u64)
        } else {
            None
        };
        ResyncProgress {
            total,
            left,
            failed,
            percent_done,
            rate_bits_per_sec,
            eta_secs,
        }
    }
}

/// Bit range `[start, end]` of a sync accounting request, or `None` when it
/// covers no whole bit. `inward` keeps only fully covered blocks.
fn request_bits(capacity: u64, sector: u64, size: u32, inward: bool) -> Option<(u64, u64)> {
    if size == 0 || size % 512 != 0 || size > MAX_IO_SIZE {
        error!(target: "synctrack::resync", sector, size, "sync_request_nonsense");
        return None;
    }
    if sector >= capacity {
        error!(target: "synctrack::resync", sector, capacity, "sync_request_beyond_capacity");
        return None;
    }
    let esector = (sector + u64::from(size >> 9) - 1).min(capacity - 1);
    if !inward {
        return Some((sect_to_bit(sector), sect_to_bit(esector)));
    }
    if esector < BM_SECT_PER_BIT - 1 {
        return None;
    }
    let end = if esector == capacity - 1 {
        sect_to_bit(capacity - 1)
    } else {
        sect_to_bit(esector - (BM_SECT_PER_BIT - 1))
    };
    let start = sect_to_bit(sector + BM_SECT_PER_BIT - 1);
    (start <= end).then_some((start, end))
}

/// Split `[start, end]` at resync extent boundaries.
fn per_extent(start: u64, end: u64) -> impl Iterator<Item = (u32, u64, u64)> {
    let first = start / BM_BITS_PER_EXT;
    let last = end / BM_BITS_PER_EXT;
    (first..=last).map(move |ext| {
        let lo = start.max(ext * BM_BITS_PER_EXT);
        let hi = end.min((ext + 1) * BM_BITS_PER_EXT - 1);
        (u32::try_from(ext).unwrap_or(u32::MAX), lo, hi)
    })
}

impl Device {
    /// Admit resync extent `enr`: pin it and hold new application writes
    /// off. `None` when the admission limit is reached or the cache cannot
    /// bind it yet.
    fn bme_get(&self, t: &mut Tracking, enr: u32) -> Option<usize> {
        if t.resync_locked >= self.config().rs_admission_limit() {
            return None;
        }
        let Some(idx) = t.resync.get(enr) else {
            if t.resync.is_starving() {
                debug!(target: "synctrack::resync", enr, "resync_lru_starving");
            }
            return None;
        };
        if t.resync.element(idx).number() != enr {
            let weight = self.bitmap.e_weight(ExtentKind::Resync, enr);
            t.resync.element_mut(idx).data = BmExtent::fresh(weight);
            t.resync.changed(idx);
            self.al_wait.notify_all();
        }
        if t.resync.element(idx).refcnt() == 1 {
            t.resync_locked += 1;
        }
        t.resync.element_mut(idx).data.no_writes = true;
        Some(idx)
    }

    /// Drop one resync reference; clears the extent's flags when it was the
    /// last.
    fn bme_put(&self, t: &mut Tracking, idx: usize) -> u32 {
        let left = t.resync.put(idx);
        if left == 0 {
            t.resync.element_mut(idx).data.clear_flags();
            t.resync_locked = t.resync_locked.saturating_sub(1);
            self.al_wait.notify_all();
        }
        left
    }

    fn check_interrupt(&self, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() || self.stopping.is_cancelled() {
            return Err(StError::Interrupted);
        }
        if !self.disk_state().has_local_disk() {
            return Err(StError::Diskless);
        }
        Ok(())
    }

    /// Lock the resync extent holding `sector` for resync I/O, blocking
    /// until no application write is active inside it.
    ///
    /// While an application write is waiting for the extent the acquire
    /// releases it, sleeps one step and retries, up to
    /// `resync_step_aside_steps` times; after that it stops yielding.
    /// Returns [`StError::Interrupted`] when `cancel` fires.
    pub fn rs_begin_io(&self, sector: u64, cancel: &CancelToken) -> Result<()> {
        let enr = sect_to_bm_ext(sector);
        let step = self.config().resync_step();
        let mut step_aside = self.config().resync_step_aside_steps;
        let first_al = bm_ext_to_al_ext(enr);
        let mut t = self.tracking.lock();

        'retry: loop {
            let idx = loop {
                self.check_interrupt(cancel)?;
                if let Some(idx) = self.bme_get(&mut t, enr) {
                    break idx;
                }
                self.al_wait.wait_for(&mut t, step);
            };
            if t.resync.element(idx).data.locked {
                return Ok(());
            }

            for al_enr in first_al..first_al + AL_EXT_PER_BM_EXT {
                loop {
                    // A reset by rs_cancel_all drops our reference.
                    let element = t.resync.element(idx);
                    if element.number() != enr || element.refcnt() == 0 {
                        continue 'retry;
                    }
                    let interrupted = self.check_interrupt(cancel).err();
                    let yield_to_write = element.data.priority && step_aside > 0;
                    if interrupted.is_some() || yield_to_write {
                        self.bme_put(&mut t, idx);
                        if let Some(err) = interrupted {
                            return Err(err);
                        }
                        MutexGuard::unlocked(&mut t, || std::thread::sleep(step));
                        step_aside -= 1;
                        if step_aside == 0 {
                            warn!(
                                target: "synctrack::resync",
                                device = %self.name(),
                                enr,
                                stepped_aside_ms = u64::from(self.config().resync_step_aside_steps)
                                    * self.config().resync_step_ms,
                                "resync_stalled_by_application_writes"
                            );
                        }
                        continue 'retry;
                    }
                    if !t.al_extent_active(al_enr) {
                        break;
                    }
                    self.al_wait.wait_for(&mut t, step);
                }
            }
            t.resync.element_mut(idx).data.locked = true;
            debug!(target: "synctrack::resync", device = %self.name(), enr, "resync_extent_locked");
            return Ok(());
        }
    }

    /// Non-blocking [`Device::rs_begin_io`]: [`StError::TryAgain`] when the
    /// extent cannot be locked right now.
    ///
    /// A refused extent stays pinned with writes held off so the retry
    /// does not lose its place; asking for a different extent releases it.
    pub fn try_rs_begin_io(&self, sector: u64) -> Result<()> {
        let enr = sect_to_bm_ext(sector);
        let first_al = bm_ext_to_al_ext(enr);
        let mut t = self.tracking.lock();

        if t.resync_wenr != LC_FREE && t.resync_wenr != enr {
            let wenr = t.resync_wenr;
            t.resync_wenr = LC_FREE;
            if let Some(idx) = t.resync.find_index(wenr) {
                t.resync.element_mut(idx).data.no_writes = false;
                self.bme_put(&mut t, idx);
                self.al_wait.notify_all();
            } else {
                error!(target: "synctrack::resync", wenr, "resync_retry_extent_missing");
            }
        }

        let idx = if let Some(idx) = t.resync.try_get(enr) {
            let ext = t.resync.element(idx).data;
            if ext.locked {
                t.resync_wenr = LC_FREE;
                return Ok(());
            }
            if ext.no_writes {
                // Our earlier attempt already holds a reference.
                t.resync.put(idx);
            } else {
                t.resync.element_mut(idx).data.no_writes = true;
                t.resync_locked += 1;
            }
            idx
        } else {
            if t.resync_locked > t.resync.nr_elements().saturating_sub(3) {
                return Err(StError::TryAgain);
            }
            let Some(idx) = t.resync.get(enr) else {
                if t.resync.is_starving() {
                    warn!(target: "synctrack::resync", enr, "resync_lru_starving");
                }
                return Err(StError::TryAgain);
            };
            if t.resync.element(idx).number() != enr {
                let weight = self.bitmap.e_weight(ExtentKind::Resync, enr);
                t.resync.element_mut(idx).data = BmExtent::fresh(weight);
                t.resync.changed(idx);
                self.al_wait.notify_all();
            }
            t.resync.element_mut(idx).data.no_writes = true;
            t.resync_locked += 1;
            idx
        };

        let busy = (first_al..first_al + AL_EXT_PER_BM_EXT).any(|al_enr| t.al_extent_active(al_enr));
        if busy {
            t.resync_wenr = enr;
            return Err(StError::TryAgain);
        }
        t.resync.element_mut(idx).data.locked = true;
        t.resync_wenr = LC_FREE;
        Ok(())
    }

    /// Release the lock taken by [`Device::rs_begin_io`] or
    /// [`Device::try_rs_begin_io`].
    pub fn rs_complete_io(&self, sector: u64) {
        let enr = sect_to_bm_ext(sector);
        let mut t = self.tracking.lock();
        let Some(idx) = t.resync.find_index(enr) else {
            error!(target: "synctrack::resync", enr, "rs_complete_io_extent_not_found");
            return;
        };
        if t.resync.element(idx).refcnt() == 0 {
            error!(target: "synctrack::resync", enr, "rs_complete_io_refcnt_zero");
            return;
        }
        self.bme_put(&mut t, idx);
    }

    /// Forget every resync extent (resync aborted).
    pub fn rs_cancel_all(&self) {
        let mut t = self.tracking.lock();
        t.resync.reset();
        t.resync_locked = 0;
        t.resync_wenr = LC_FREE;
        drop(t);
        self.al_wait.notify_all();
    }

    /// Unbind every resync extent. [`StError::TryAgain`] while any is still
    /// referenced.
    pub fn rs_del_all(&self) -> Result<()> {
        let mut t = self.tracking.lock();
        let resident: Vec<usize> = t.resync.resident().collect();
        for idx in resident {
            let enr = t.resync.element(idx).number();
            if enr == t.resync_wenr {
                info!(
                    target: "synctrack::resync",
                    device = %self.name(),
                    enr,
                    "resync_retry_extent_dropped"
                );
                t.resync_wenr = LC_FREE;
                t.resync.element_mut(idx).data.no_writes = false;
                self.bme_put(&mut t, idx);
            }
            let refcnt = t.resync.element(idx).refcnt();
            if refcnt != 0 {
                info!(
                    target: "synctrack::resync",
                    device = %self.name(),
                    enr,
                    refcnt,
                    "rs_del_all_retry_later"
                );
                return Err(StError::TryAgain);
            }
            t.resync.del(idx);
        }
        Ok(())
    }

    /// Account `count` bits of resync extent `enr` as synced (`success`) or
    /// failed. Called with the activity-log lock held.
    fn account_extent(&self, t: &mut Tracking, enr: u32, count: u64, success: bool) {
        let Some(idx) = t.resync.get(enr) else {
            error!(
                target: "synctrack::resync",
                device = %self.name(),
                enr,
                locked = t.resync_locked,
                stats = %t.resync.stats(),
                "resync_lru_get_failed"
            );
            return;
        };
        if t.resync.element(idx).number() == enr {
            let ext = &mut t.resync.element_mut(idx).data;
            let underflow = success && count > ext.rs_left;
            if success {
                ext.rs_left = ext.rs_left.saturating_sub(count);
            } else {
                ext.rs_failed += count;
            }
            if underflow || ext.rs_left < ext.rs_failed {
                let (rs_left, rs_failed) = (ext.rs_left, ext.rs_failed);
                ext.rs_failed = ext.rs_left;
                t.resync.put(idx);
                error!(
                    target: "synctrack::resync",
                    device = %self.name(),
                    enr,
                    rs_left,
                    rs_failed,
                    count,
                    "resync_accounting_inconsistent"
                );
                self.host
                    .force_disconnect("resync accounting: rs_failed exceeds rs_left");
                return;
            }
        } else {
            let weight = self.bitmap.e_weight(ExtentKind::Resync, enr);
            let ext = &mut t.resync.element_mut(idx).data;
            if ext.has_flags() {
                warn!(target: "synctrack::resync", enr, ?ext, "resync_extent_flags_dropped");
            }
            if ext.rs_failed > 0 {
                warn!(
                    target: "synctrack::resync",
                    enr,
                    rs_failed = ext.rs_failed,
                    "resync_extent_evicted_with_failures"
                );
            }
            *ext = BmExtent::fresh(weight);
            ext.rs_failed = if success { 0 } else { count.min(weight) };
            t.resync.changed(idx);
        }
        t.resync.put(idx);

        let ext = &mut t.resync.element_mut(idx).data;
        if ext.rs_left == ext.rs_failed {
            ext.rs_failed = 0;
            if !self.queue_urgent(Work::UpdateOnDiskBitmap { enr }) {
                warn!(target: "synctrack::resync", enr, "update_on_disk_bitmap_not_queued");
            }
        }
    }

    /// Record that `[sector, sector + size)` is identical on both replicas.
    /// Only whole 4 KiB blocks inside the range are cleared.
    pub fn set_in_sync(&self, sector: u64, size: u32) {
        let Some((start, end)) = request_bits(self.bitmap.capacity_sectors(), sector, size, true)
        else {
            return;
        };
        // Clearing under the lock keeps a concurrent admission from counting
        // the same bits twice.
        let mut t = self.tracking.lock();
        let has_disk = self.disk_state().has_local_disk();
        let mut any = false;
        for (enr, lo, hi) in per_extent(start, end) {
            let count = self.bitmap.clear_bits(lo, hi);
            if count == 0 {
                continue;
            }
            any = true;
            if has_disk {
                self.account_extent(&mut t, enr, count, true);
            }
        }
        drop(t);
        if any && has_disk {
            self.advance_sync_mark();
            self.al_wait.notify_all();
        }
    }

    /// Record that `[sector, sector + size)` differs. Every touched block is
    /// set; resident resync extents grow their `rs_left`.
    pub fn set_out_of_sync(&self, sector: u64, size: u32) {
        let Some((start, end)) = request_bits(self.bitmap.capacity_sectors(), sector, size, false)
        else {
            return;
        };
        let mut t = self.tracking.lock();
        for (enr, lo, hi) in per_extent(start, end) {
            let count = self.bitmap.set_bits(lo, hi);
            if count == 0 {
                continue;
            }
            if let Some(idx) = t.resync.find_index(enr) {
                t.resync.element_mut(idx).data.rs_left += count;
            }
        }
    }

    /// Record that resync of `[sector, sector + size)` failed. The bits stay
    /// set and count toward the extent's `rs_failed`.
    pub fn rs_failed_io(&self, sector: u64, size: u32) {
        let Some((start, end)) = request_bits(self.bitmap.capacity_sectors(), sector, size, true)
        else {
            return;
        };
        let mut t = self.tracking.lock();
        let mut any = false;
        for (enr, lo, hi) in per_extent(start, end) {
            let count = self.bitmap.count_bits(lo, hi);
            if count == 0 {
                continue;
            }
            any = true;
            t.rs_failed += count;
            if self.disk_state().has_local_disk() {
                self.account_extent(&mut t, enr, count, false);
            }
        }
        drop(t);
        if any {
            self.al_wait.notify_all();
        }
    }

    /// Flush the bitmap pages of resync extent `enr`; finish the resync
    /// once every remaining bit has failed. Runs on a worker.
    pub(crate) fn update_on_disk_bitmap(&self, enr: u32) {
        if !self.disk_state().has_local_disk() {
            warn!(
                target: "synctrack::resync",
                device = %self.name(),
                enr,
                "update_on_disk_bitmap_no_disk"
            );
            return;
        }
        for page in self.bitmap.extent_pages(ExtentKind::Resync, enr) {
            if self.bitmap.write_page(page).is_err() {
                self.report_io_error("update_on_disk_bitmap", false);
                break;
            }
        }
        let failed = self.tracking.lock().rs_failed;
        if self.bitmap.total_weight() <= failed && self.host.conn_state().is_resyncing() {
            let first = {
                let mut marks = self.marks.lock();
                !std::mem::replace(&mut marks.finished, true)
            };
            if first {
                info!(
                    target: "synctrack::resync",
                    device = %self.name(),
                    failed,
                    "resync_finished"
                );
                self.host.resync_finished();
            }
        }
    }

    fn advance_sync_mark(&self) {
        let conn = self.host.conn_state();
        if matches!(conn, ConnState::PausedSyncS | ConnState::PausedSyncT) {
            return;
        }
        let left = self.bitmap.total_weight();
        self.marks.lock().advance(Instant::now(), left);
    }

    /// Reset progress accounting for a new resync over the current bitmap.
    pub fn begin_resync(&self) {
        let total = self.bitmap.total_weight();
        self.tracking.lock().rs_failed = 0;
        *self.marks.lock() = SyncMarks::new(total);
        info!(target: "synctrack::resync", device = %self.name(), total, "resync_started");
    }

    #[must_use]
    pub fn resync_progress(&self) -> ResyncProgress {
        let left = self.bitmap.total_weight();
        let failed = self.tracking.lock().rs_failed;
        self.marks.lock().progress(Instant::now(), left, failed)
    }

    /// State of resync extent `enr` if resident.
    #[must_use]
    pub fn resync_extent(&self, enr: u32) -> Option<BmExtentInfo> {
        let t = self.tracking.lock();
        t.resync.find(enr).map(|e| BmExtentInfo {
            enr,
            refcnt: e.refcnt(),
            state: e.data,
        })
    }

    #[must_use]
    pub fn resync_stats(&self) -> ResyncStats {
        let t = self.tracking.lock();
        ResyncStats {
            lru: t.resync.stats(),
            resync_locked: t.resync_locked,
            pending_retry: (t.resync_wenr != LC_FREE).then_some(t.resync_wenr),
            rs_failed: t.rs_failed,
        }
    }
}
