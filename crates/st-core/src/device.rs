//! Device context: metadata placement, disk state and lifecycle.

use crate::config::DeviceConfig;
use crate::host::Host;
use crate::resync::{BmExtent, SyncMarks};
use crate::worker::{self, Work};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use st_bitmap::Bitmap;
use st_block::{IoEngine, MetaLayout};
use st_error::{Result, StError};
use st_journal::{AlRing, RecoveryReport};
use st_lru::LruCache;
use st_types::{
    AL_EXT_PER_BM_EXT, CancelToken, DiskState, IoErrorPolicy, LC_FREE, bm_ext_to_al_ext,
};
use std::ops::Deref;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// State guarded by the activity-log lock.
///
/// Both caches live under one lock: resync admission inspects the activity
/// log and application writes inspect resync extents.
pub(crate) struct Tracking {
    pub(crate) act_log: LruCache<()>,
    pub(crate) resync: LruCache<BmExtent>,
    /// Resync extents currently holding application writes off.
    pub(crate) resync_locked: u32,
    /// Extent a non-blocking resync acquire left pinned for its retry.
    pub(crate) resync_wenr: u32,
    /// Bits whose resync failed since the last resync start.
    pub(crate) rs_failed: u64,
    pub(crate) tr_pos: u32,
    pub(crate) tr_number: u32,
    pub(crate) tr_cycle: u32,
    pub(crate) transactions_written: u64,
    pub(crate) starve_warnings: u64,
}

impl Tracking {
    fn new(config: &DeviceConfig) -> Self {
        Self {
            act_log: LruCache::new("act_log", config.al_extents),
            resync: LruCache::new("resync", config.rs_extents),
            resync_locked: 0,
            resync_wenr: LC_FREE,
            rs_failed: 0,
            tr_pos: 0,
            tr_number: 0,
            tr_cycle: 0,
            transactions_written: 0,
            starve_warnings: 0,
        }
    }

    /// Activity extent `enr` is pinned, or about to be bound by a pending
    /// transaction.
    pub(crate) fn al_extent_active(&self, enr: u32) -> bool {
        self.act_log.is_used(enr) || self.act_log.is_pending(enr)
    }

    /// Forget every activity-log binding and the ring cursor. Refused while
    /// an extent is pinned or a slot change is in flight.
    pub(crate) fn drop_al_state(&mut self) -> bool {
        if self.act_log.used() > 0 || self.act_log.changing_index().is_some() {
            return false;
        }
        self.act_log.reset();
        self.tr_pos = 0;
        self.tr_number = 0;
        self.tr_cycle = 0;
        true
    }
}

/// Consistency check of the tracking state, taken under one lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Audit {
    /// `(resync extent, activity extent)` pairs where a locked resync
    /// extent overlaps an active activity extent.
    pub exclusion_violations: Vec<(u32, u32)>,
    /// Resident resync extents with `rs_failed > rs_left`.
    pub accounting_violations: Vec<u32>,
    pub resync_locked: u32,
    pub locked_extents: u32,
}

impl Audit {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.exclusion_violations.is_empty() && self.accounting_violations.is_empty()
    }
}

/// One replicated device's tracking engine.
///
/// Obtained from [`Device::attach`], which returns an [`AttachedDevice`]
/// owning the worker threads. All operations take `&self` and may be
/// called concurrently; share the device with [`AttachedDevice::device`].
pub struct Device {
    config: DeviceConfig,
    layout: MetaLayout,
    pub(crate) ring: AlRing,
    pub(crate) engine: Arc<dyn IoEngine>,
    pub(crate) bitmap: Bitmap,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) tracking: Mutex<Tracking>,
    /// Signalled on every release, commit and state change of `tracking`.
    pub(crate) al_wait: Condvar,
    disk: RwLock<DiskState>,
    pub(crate) marks: Mutex<SyncMarks>,
    urgent: Sender<Work>,
    normal: Sender<Work>,
    pub(crate) stopping: CancelToken,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.config.name)
            .field("disk", &*self.disk.read())
            .field("layout", &self.layout)
            .field("bitmap", &self.bitmap)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Initialize fresh metadata: every ring slot invalid, every bitmap bit
    /// set (nothing is known to be in sync).
    pub fn format(config: &DeviceConfig, engine: Arc<dyn IoEngine>) -> Result<()> {
        config.validate()?;
        let layout = config.layout();
        layout.validate(engine.len_bytes())?;
        let ring = AlRing::new(layout, config.ring_slots(), config.al_extents)?;
        ring.format(&*engine)?;

        let bitmap = Bitmap::new(engine, layout);
        bitmap.resize(config.capacity_sectors, true)?;
        bitmap.write_all()?;
        info!(
            target: "synctrack::device",
            device = %config.name,
            ring_slots = ring.slots(),
            bitmap_bits = bitmap.bits(),
            "device_formatted"
        );
        Ok(())
    }

    /// Attach metadata: load the bitmap, replay the activity log, mark every
    /// extent it names out of sync and start the workers.
    pub fn attach(
        config: DeviceConfig,
        engine: Arc<dyn IoEngine>,
        host: Arc<dyn Host>,
    ) -> Result<AttachedDevice> {
        config.validate()?;
        let layout = config.layout();
        layout.validate(engine.len_bytes())?;
        let ring = AlRing::new(layout, config.ring_slots(), config.al_extents)?;
        let bitmap = Bitmap::new(Arc::clone(&engine), layout);
        bitmap.resize(config.capacity_sectors, true)?;

        let (urgent, urgent_rx) = crossbeam_channel::unbounded();
        let (normal, normal_rx) = crossbeam_channel::unbounded();
        let workers = config.worker_threads;
        let device = Arc::new(Self {
            tracking: Mutex::new(Tracking::new(&config)),
            config,
            layout,
            ring,
            engine,
            bitmap,
            host,
            al_wait: Condvar::new(),
            disk: RwLock::new(DiskState::Attaching),
            marks: Mutex::new(SyncMarks::new(0)),
            urgent,
            normal,
            stopping: CancelToken::new(),
        });
        let workers = worker::spawn(&device, &urgent_rx, &normal_rx, workers)?;
        let mut attached = AttachedDevice {
            device,
            workers,
            recovery: RecoveryReport::default(),
        };
        attached.recovery = attached.device.load_metadata()?;
        Ok(attached)
    }

    fn load_metadata(&self) -> Result<RecoveryReport> {
        self.bitmap.lock("attach");
        let loaded = (|| {
            self.bitmap.read()?;
            let report = self.al_read_log()?;
            if self.al_apply_to_bitmap() > 0 {
                self.bitmap.write()?;
            }
            Ok::<_, StError>(report)
        })();
        self.bitmap.unlock();
        let report = loaded?;

        let total = self.bitmap.total_weight();
        *self.marks.lock() = SyncMarks::new(total);
        self.set_disk_state(DiskState::Consistent);
        info!(
            target: "synctrack::device",
            device = %self.config.name,
            transactions = report.transactions_replayed,
            discarded = report.records_discarded,
            out_of_sync = total,
            "device_attached"
        );
        Ok(report)
    }

    fn shutdown(&self) -> Result<()> {
        info!(target: "synctrack::device", device = %self.config.name, "device_detaching");
        self.rs_cancel_all();
        self.al_shrink();
        // With the bitmap durable and no extent active, the ring has nothing
        // left to replay.
        let flushed = if self.meta_io_allowed() {
            self.bitmap
                .write_lazy(0)
                .and_then(|()| self.ring.format(&*self.engine))
        } else {
            Ok(())
        };
        *self.disk.write() = DiskState::Diskless;
        self.stopping.cancel();
        self.al_wait.notify_all();
        flushed
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn layout(&self) -> MetaLayout {
        self.layout
    }

    #[must_use]
    pub fn ring_slots(&self) -> u32 {
        self.ring.slots()
    }

    /// The out-of-sync bitmap.
    #[must_use]
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    #[must_use]
    pub fn disk_state(&self) -> DiskState {
        *self.disk.read()
    }

    /// Host-driven disk state change (e.g. promotion to up-to-date after a
    /// completed resync).
    pub fn set_disk_state(&self, state: DiskState) {
        let old = std::mem::replace(&mut *self.disk.write(), state);
        if old != state {
            info!(
                target: "synctrack::device",
                device = %self.config.name,
                from = %old,
                to = %state,
                "disk_state_changed"
            );
            self.al_wait.notify_all();
        }
    }

    /// Metadata on the local disk may be read and written.
    pub(crate) fn meta_io_allowed(&self) -> bool {
        let disk = self.disk_state();
        disk.has_local_disk() || disk == DiskState::Attaching
    }

    /// Queue ahead of bitmap flushes. Returns `false` once the workers are
    /// gone.
    pub(crate) fn queue_urgent(&self, work: Work) -> bool {
        self.urgent.send(work).is_ok()
    }

    /// Escalate a local metadata I/O error according to the configured
    /// policy.
    ///
    /// Under `pass-on` a non-forced error only degrades the disk to
    /// inconsistent. Forced errors and the other policies fail the disk and
    /// queue the transition to diskless.
    pub fn report_io_error(&self, context: &str, force_detach: bool) {
        let policy = self.config.on_io_error;
        if policy == IoErrorPolicy::PassOn && !force_detach {
            error!(target: "synctrack::device", device = %self.config.name, context, "local_io_error");
            let mut disk = self.disk.write();
            if *disk > DiskState::Inconsistent {
                warn!(
                    target: "synctrack::device",
                    device = %self.config.name,
                    from = %*disk,
                    to = %DiskState::Inconsistent,
                    "disk_state_changed"
                );
                *disk = DiskState::Inconsistent;
            }
            return;
        }

        if policy == IoErrorPolicy::CallHelper {
            self.host.local_io_error(context);
        }
        let failed = {
            let mut disk = self.disk.write();
            if *disk > DiskState::Failed {
                *disk = DiskState::Failed;
                true
            } else {
                false
            }
        };
        if failed {
            error!(
                target: "synctrack::device",
                device = %self.config.name,
                context,
                ?policy,
                force_detach,
                "local_io_error_detaching"
            );
            if !self.queue_urgent(Work::GoDiskless) {
                self.go_diskless();
            }
            self.al_wait.notify_all();
        }
    }

    /// Finish a detach after a disk failure: drop resync and activity-log
    /// state and refuse further local metadata I/O.
    ///
    /// Extents still pinned by writes in flight keep the activity log alive
    /// until the last [`Device::al_complete_io`] drops it.
    pub(crate) fn go_diskless(&self) {
        {
            let mut disk = self.disk.write();
            if *disk != DiskState::Failed {
                return;
            }
            *disk = DiskState::Diskless;
        }
        self.rs_cancel_all();
        let dropped = self.tracking.lock().drop_al_state();
        self.al_wait.notify_all();
        warn!(
            target: "synctrack::device",
            device = %self.config.name,
            al_dropped = dropped,
            "disk_state_diskless"
        );
    }

    /// Drop the activity log of a diskless device once nothing pins it.
    pub(crate) fn release_diskless_al(&self, t: &mut Tracking) {
        if self.disk_state() == DiskState::Diskless && t.drop_al_state() {
            debug!(target: "synctrack::device", device = %self.config.name, "al_state_dropped");
        }
    }

    /// Check the cross-cache invariants under the activity-log lock.
    #[must_use]
    pub fn audit(&self) -> Audit {
        let t = self.tracking.lock();
        let mut audit = Audit {
            resync_locked: t.resync_locked,
            ..Audit::default()
        };
        for idx in t.resync.resident() {
            let element = t.resync.element(idx);
            let enr = element.number();
            let ext = &element.data;
            if ext.rs_failed > ext.rs_left {
                audit.accounting_violations.push(enr);
            }
            if !ext.locked {
                continue;
            }
            audit.locked_extents += 1;
            let first = bm_ext_to_al_ext(enr);
            for al_enr in first..first + AL_EXT_PER_BM_EXT {
                if t.al_extent_active(al_enr) {
                    audit.exclusion_violations.push((enr, al_enr));
                }
            }
        }
        audit
    }
}

/// Owner of an attached device and its worker threads.
///
/// Dereferences to [`Device`]. Dropping it stops the workers; call
/// [`AttachedDevice::detach`] first to flush metadata.
#[derive(Debug)]
pub struct AttachedDevice {
    device: Arc<Device>,
    workers: Vec<JoinHandle<()>>,
    recovery: RecoveryReport,
}

impl AttachedDevice {
    /// Shared handle for other threads.
    #[must_use]
    pub fn device(&self) -> Arc<Device> {
        Arc::clone(&self.device)
    }

    /// What the activity-log replay found at attach time.
    #[must_use]
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Clean shutdown. The next attach of this metadata replays nothing.
    pub fn detach(self) -> Result<()> {
        self.device.shutdown()
    }
}

impl Deref for AttachedDevice {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.device
    }
}

impl Drop for AttachedDevice {
    fn drop(&mut self) {
        self.device.stopping.cancel();
        self.device.al_wait.notify_all();
        for _ in &self.workers {
            // A closed channel means the workers already exited.
            let _ = self.device.normal.send(Work::Stop);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(
                    target: "synctrack::worker",
                    device = %self.device.config.name,
                    "worker_panicked"
                );
            }
        }
    }
}
