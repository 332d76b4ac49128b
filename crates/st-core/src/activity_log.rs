//! Activity log: the set of 4 MiB extents that may hold writes in flight.
//!
//! Before an application write is submitted its extent must be resident in
//! the activity-log cache. Binding a new extent evicts the least recently
//! used idle one, and the change is made durable as one ring transaction
//! before the write proceeds. After a crash every extent named by the
//! replayed ring is marked out of sync, which bounds the region a resync
//! must inspect to the activity log's size.
//!
//! Ordering: a transaction is on disk before [`Device::al_begin_io`]
//! returns, so bits cleared by later sync accounting can never cover a
//! write the log does not know about.

use crate::Device;
use crate::worker::{AlWrite, AlWriteOutcome, Work};
use serde::Serialize;
use st_error::{Result, StError};
use st_journal::{AlTransaction, AlUpdate, RecoveryReport};
use st_lru::LruStats;
use st_types::{DiskState, ExtentKind, LC_FREE, al_ext_to_bm_ext, sect_to_al_ext};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

/// Activity-log counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlStats {
    pub lru: LruStats,
    /// Transactions that reached (or failed to reach) the ring.
    pub transactions_written: u64,
    /// Application writes that logged a starvation warning.
    pub starve_warnings: u64,
    pub ring_slots: u32,
    pub next_pos: u32,
    pub next_tr_number: u32,
    pub active_extents: u32,
}

impl Device {
    /// Pin the activity extent holding `sector`.
    ///
    /// Blocks while the extent's resync extent is being resynced, while
    /// another slot change is being committed, and while every cache slot
    /// is pinned. When the extent must be bound to a slot the change is
    /// written to the ring first. Fails with [`StError::Diskless`] once the
    /// local disk is gone; otherwise the caller owes one
    /// [`Device::al_complete_io`].
    pub fn al_begin_io(&self, sector: u64) -> Result<()> {
        let enr = sect_to_al_ext(sector);
        let mut attempts = 0_u32;
        let mut t = self.tracking.lock();
        let idx = loop {
            if !self.disk_state().has_local_disk() || self.stopping.is_cancelled() {
                return Err(StError::Diskless);
            }
            if let Some(idx) = self.al_get(&mut t, enr) {
                break idx;
            }
            attempts += 1;
            if attempts == self.config().al_starve_warn_after {
                t.starve_warnings += 1;
                if t.act_log.is_starving() {
                    warn!(
                        target: "synctrack::al",
                        device = %self.name(),
                        enr,
                        stats = %t.act_log.stats(),
                        "al_starving"
                    );
                } else if t.act_log.is_dirty() {
                    warn!(
                        target: "synctrack::al",
                        device = %self.name(),
                        enr,
                        "al_update_slow"
                    );
                }
            }
            self.al_wait.wait_for(&mut t, self.config().resync_step());
        };

        let evicted = t.act_log.element(idx).number();
        if evicted == enr {
            return Ok(());
        }

        let mut txn = AlTransaction::new(
            t.tr_number,
            AlUpdate {
                pos: u32::try_from(idx).unwrap_or(u32::MAX),
                extent: enr,
            },
        );
        let nr_elements = t.act_log.nr_elements();
        let next_cycle = {
            let log = &t.act_log;
            txn.fill_snapshot(t.tr_cycle, nr_elements, |slot| {
                log.element(slot as usize).number()
            })
        };
        t.tr_cycle = next_cycle;
        let slot = t.tr_pos;
        drop(t);

        let (done, outcome) = crossbeam_channel::bounded(1);
        let queued = self.queue_urgent(Work::AlWrite(AlWrite {
            slot,
            txn,
            evicted,
            done,
        }));
        let outcome = if queued {
            outcome.recv().unwrap_or(AlWriteOutcome::Bypassed)
        } else {
            AlWriteOutcome::Bypassed
        };

        let mut t = self.tracking.lock();
        if outcome.advances_ring() {
            t.tr_pos = (t.tr_pos + 1) % self.ring.slots();
            t.tr_number = t.tr_number.wrapping_add(1);
            t.transactions_written += 1;
        }
        t.act_log.changed(idx);
        drop(t);
        self.al_wait.notify_all();
        debug!(
            target: "synctrack::al",
            device = %self.name(),
            enr,
            evicted,
            slot,
            ?outcome,
            "al_extent_bound"
        );
        Ok(())
    }

    fn al_get(&self, t: &mut crate::device::Tracking, enr: u32) -> Option<usize> {
        if let Some(i) = t.resync.find_index(al_ext_to_bm_ext(enr)) {
            let ext = &mut t.resync.element_mut(i).data;
            if ext.no_writes {
                if !ext.priority {
                    ext.priority = true;
                    info!(
                        target: "synctrack::al",
                        device = %self.name(),
                        enr,
                        "al_write_delayed_by_resync"
                    );
                }
                return None;
            }
        }
        t.act_log.get(enr)
    }

    /// Release the reference taken by [`Device::al_begin_io`].
    pub fn al_complete_io(&self, sector: u64) {
        let enr = sect_to_al_ext(sector);
        let mut t = self.tracking.lock();
        let Some(idx) = t.act_log.find_index(enr) else {
            error!(
                target: "synctrack::al",
                device = %self.name(),
                enr,
                "al_complete_io_inactive_extent"
            );
            return;
        };
        if t.act_log.put(idx) == 0 {
            self.release_diskless_al(&mut t);
            drop(t);
            self.al_wait.notify_all();
        }
    }

    /// Write the ring transaction for one slot change. Runs on a worker.
    pub(crate) fn write_al_transaction(&self, req: &AlWrite) -> AlWriteOutcome {
        if !self.meta_io_allowed() {
            error!(
                target: "synctrack::al",
                device = %self.name(),
                disk = %self.disk_state(),
                "al_transaction_no_disk"
            );
            return AlWriteOutcome::Bypassed;
        }

        // Without a peer the evicted extent's bits only live here.
        if req.evicted != LC_FREE && !self.host.conn_state().is_connected() {
            for page in self.bitmap.extent_pages(ExtentKind::Activity, req.evicted) {
                if self.bitmap.write_page(page).is_err() {
                    self.report_io_error("al_evict_bitmap_write", false);
                    break;
                }
            }
        }
        let disk = self.disk_state();
        if disk < DiskState::Inconsistent {
            error!(
                target: "synctrack::al",
                device = %self.name(),
                %disk,
                "al_transaction_refused"
            );
            return AlWriteOutcome::Bypassed;
        }

        match self.ring.write(&*self.engine, req.slot, &req.txn) {
            Ok(()) => AlWriteOutcome::Written,
            Err(err) => {
                error!(
                    target: "synctrack::al",
                    device = %self.name(),
                    slot = req.slot,
                    error = %err,
                    "al_transaction_write_failed"
                );
                self.report_io_error("al_write_transaction", true);
                AlWriteOutcome::Failed
            }
        }
    }

    /// Rebuild the activity-log cache from the ring.
    ///
    /// Refuses while any extent is pinned. Writing resumes at the slot after
    /// the newest valid record.
    pub fn al_read_log(&self) -> Result<RecoveryReport> {
        if !self.meta_io_allowed() {
            return Err(StError::Diskless);
        }
        let window = self.ring.recover(&*self.engine)?;
        let mut report = window.report();

        let mut t = self.tracking.lock();
        if t.act_log.used() > 0 || t.act_log.changing_index().is_some() {
            return Err(StError::Inconsistency(format!(
                "activity log read with {} extents in use",
                t.act_log.used()
            )));
        }
        t.act_log.reset();
        let nr = t.act_log.nr_elements();
        for update in window.bindings() {
            if update.pos >= nr {
                warn!(
                    target: "synctrack::al",
                    device = %self.name(),
                    pos = update.pos,
                    extent = update.extent,
                    nr,
                    "al_binding_out_of_range"
                );
                continue;
            }
            t.act_log.set(update.extent, update.pos as usize);
            report.bindings_applied += 1;
        }
        t.tr_pos = window.next_pos;
        t.tr_number = window.next_tr_number;
        t.tr_cycle = 0;
        let active = t.act_log.resident().count();
        drop(t);
        self.al_wait.notify_all();

        info!(
            target: "synctrack::al",
            device = %self.name(),
            transactions = report.transactions_replayed,
            active_extents = active,
            next_tr_number = report.next_tr_number,
            "al_log_read"
        );
        Ok(report)
    }

    /// Take the cache lock (no new bindings) and return resident extents.
    fn lock_act_log(&self) -> Vec<u32> {
        let mut t = self.tracking.lock();
        while !t.act_log.try_lock() {
            self.al_wait.wait_for(&mut t, self.config().resync_step());
        }
        t.act_log
            .resident()
            .map(|idx| t.act_log.element(idx).number())
            .collect()
    }

    fn unlock_act_log(&self) {
        self.tracking.lock().act_log.unlock();
        self.al_wait.notify_all();
    }

    /// Mark every bit of every resident activity extent out of sync.
    /// Returns how many bits changed.
    pub fn al_apply_to_bitmap(&self) -> u64 {
        let extents = self.lock_act_log();
        let added: u64 = extents
            .iter()
            .map(|&enr| self.bitmap.set_extent(ExtentKind::Activity, enr))
            .sum();
        self.unlock_act_log();
        info!(
            target: "synctrack::al",
            device = %self.name(),
            extents = extents.len(),
            added_kib = added * 4,
            "al_applied_to_bitmap"
        );
        added
    }

    /// Write the bitmap pages covering every resident activity extent.
    pub fn al_to_on_disk_bm(&self) -> Result<()> {
        let extents = self.lock_act_log();
        let pages: BTreeSet<usize> = extents
            .iter()
            .flat_map(|&enr| self.bitmap.extent_pages(ExtentKind::Activity, enr))
            .collect();
        let mut result = Ok(());
        for page in pages {
            if let Err(err) = self.bitmap.write_page(page) {
                self.report_io_error("al_to_on_disk_bm", false);
                result = Err(err);
                break;
            }
        }
        self.unlock_act_log();
        result
    }

    /// Unbind every activity extent, waiting for pinned ones to drain.
    pub fn al_shrink(&self) {
        let mut t = self.tracking.lock();
        while !t.act_log.try_lock() {
            self.al_wait.wait_for(&mut t, self.config().resync_step());
        }
        let resident: Vec<usize> = t.act_log.resident().collect();
        for idx in resident {
            while t.act_log.element(idx).refcnt() > 0 {
                self.al_wait.wait_for(&mut t, self.config().resync_step());
            }
            t.act_log.del(idx);
        }
        t.act_log.unlock();
        drop(t);
        self.al_wait.notify_all();
    }

    /// Refcount of activity extent `enr` if resident.
    #[must_use]
    pub fn al_extent_refcnt(&self, enr: u32) -> Option<u32> {
        self.tracking.lock().act_log.find(enr).map(st_lru::Element::refcnt)
    }

    /// Resident activity extents in slot order.
    #[must_use]
    pub fn al_resident_extents(&self) -> Vec<u32> {
        let t = self.tracking.lock();
        t.act_log
            .resident()
            .map(|idx| t.act_log.element(idx).number())
            .collect()
    }

    #[must_use]
    pub fn al_stats(&self) -> AlStats {
        let t = self.tracking.lock();
        AlStats {
            lru: t.act_log.stats(),
            transactions_written: t.transactions_written,
            starve_warnings: t.starve_warnings,
            ring_slots: self.ring.slots(),
            next_pos: t.tr_pos,
            next_tr_number: t.tr_number,
            active_extents: t.act_log.used(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{RecordingHost, attach_mem, small_config};
    use st_block::IoEngine;
    use st_types::{AL_EXTENT_SIZE, ConnState, SECTOR_SHIFT};
    use std::sync::Arc;

    fn al_sector(enr: u64) -> u64 {
        enr * (AL_EXTENT_SIZE >> SECTOR_SHIFT)
    }

    #[test]
    fn hit_does_not_write_a_transaction() {
        let (dev, _engine) = attach_mem(small_config(), Arc::new(RecordingHost::default()));
        dev.al_begin_io(al_sector(3)).unwrap();
        dev.al_begin_io(al_sector(3) + 8).unwrap();
        assert_eq!(dev.al_stats().transactions_written, 1);
        assert_eq!(dev.al_extent_refcnt(3), Some(2));
        dev.al_complete_io(al_sector(3));
        dev.al_complete_io(al_sector(3));
        assert_eq!(dev.al_extent_refcnt(3), Some(0));
    }

    #[test]
    fn ring_position_advances_and_wraps() {
        let config = small_config();
        let slots = config.ring_slots();
        let (dev, _engine) = attach_mem(config, Arc::new(RecordingHost::default()));
        for enr in 0..u64::from(slots) + 1 {
            dev.al_begin_io(al_sector(enr)).unwrap();
            dev.al_complete_io(al_sector(enr));
        }
        let stats = dev.al_stats();
        assert_eq!(stats.transactions_written, u64::from(slots) + 1);
        assert_eq!(stats.next_pos, 1);
        assert_eq!(stats.next_tr_number, slots + 1);
    }

    #[test]
    fn complete_on_inactive_extent_is_harmless() {
        let (dev, _engine) = attach_mem(small_config(), Arc::new(RecordingHost::default()));
        dev.al_complete_io(al_sector(42));
        assert_eq!(dev.al_stats().active_extents, 0);
    }

    #[test]
    fn apply_to_bitmap_marks_resident_extents() {
        let (dev, _engine) = attach_mem(small_config(), Arc::new(RecordingHost::default()));
        dev.bitmap().clear_all();
        dev.al_begin_io(al_sector(1)).unwrap();
        dev.al_complete_io(al_sector(1));
        assert_eq!(dev.al_apply_to_bitmap(), 1024);
        assert_eq!(dev.bitmap().count_bits(1024, 2047), 1024);
        assert_eq!(dev.al_apply_to_bitmap(), 0);
    }

    #[test]
    fn shrink_unbinds_idle_extents() {
        let (dev, _engine) = attach_mem(small_config(), Arc::new(RecordingHost::default()));
        for enr in [2, 5] {
            dev.al_begin_io(al_sector(enr)).unwrap();
            dev.al_complete_io(al_sector(enr));
        }
        assert_eq!(dev.al_resident_extents().len(), 2);
        dev.al_shrink();
        assert!(dev.al_resident_extents().is_empty());
    }

    #[test]
    fn read_log_refuses_while_extents_pinned() {
        let (dev, _engine) = attach_mem(small_config(), Arc::new(RecordingHost::default()));
        dev.al_begin_io(0).unwrap();
        assert!(matches!(
            dev.al_read_log(),
            Err(st_error::StError::Inconsistency(_))
        ));
        dev.al_complete_io(0);
        let report = dev.al_read_log().unwrap();
        assert_eq!(report.transactions_replayed, 1);
        assert_eq!(dev.al_resident_extents(), vec![0]);
    }

    #[test]
    fn eviction_flushes_bitmap_when_disconnected() {
        let host = Arc::new(RecordingHost::default());
        host.set_conn_state(ConnState::StandAlone);
        let (dev, engine) = attach_mem(small_config(), host);
        let al_extents = dev.config().al_extents;
        dev.bitmap().clear_all();
        dev.bitmap().write_lazy(0).unwrap();
        for enr in 0..u64::from(al_extents) {
            dev.al_begin_io(al_sector(enr)).unwrap();
            dev.al_complete_io(al_sector(enr));
        }
        // Dirty extent 0 (least recently used), then force its eviction.
        dev.bitmap().set_bits(0, 15);
        let writes = engine.stats().writes;
        dev.al_begin_io(al_sector(u64::from(al_extents))).unwrap();
        // One bitmap page plus one ring transaction.
        assert_eq!(engine.stats().writes, writes + 2);
        assert!(dev.bitmap().page_flags(0).unwrap().unchanged());
    }

    #[test]
    fn transaction_is_flushed_before_begin_io_returns() {
        let (dev, engine) = attach_mem(small_config(), Arc::new(RecordingHost::default()));
        let before = engine.stats();
        dev.al_begin_io(0).unwrap();
        let after = engine.stats();
        assert_eq!(after.writes - before.writes, 1);
        assert_eq!(after.syncs - before.syncs, 1);

        // A hot extent commits nothing.
        dev.al_complete_io(0);
        dev.al_begin_io(0).unwrap();
        assert_eq!(engine.stats().syncs, after.syncs);
        dev.al_complete_io(0);
    }
}
