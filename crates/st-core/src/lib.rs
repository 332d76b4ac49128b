#![forbid(unsafe_code)]
//! Replication change tracking for one device.
//!
//! [`Device`] ties together the activity log (which 4 MiB extents may hold
//! writes in flight, journaled in a transaction ring), the out-of-sync
//! bitmap (one bit per 4 KiB block) and the resync extent tracker (which
//! 256 MiB extents a resync is working on). The host replication layer
//! brackets application writes with [`Device::al_begin_io`] /
//! [`Device::al_complete_io`], resync I/O with [`Device::rs_begin_io`] /
//! [`Device::rs_complete_io`], and reports outcomes through
//! [`Device::set_in_sync`], [`Device::set_out_of_sync`] and
//! [`Device::rs_failed_io`].
//!
//! # Locking
//!
//! One lock guards both caches and the resync counters. The bitmap's lock
//! is a leaf: it may be taken while the cache lock is held, never the other
//! way round. Blocking metadata writes run on worker threads or with no
//! lock held.
//!
//! # Lifecycle
//!
//! ```ignore
//! Device::format(&config, engine.clone())?;
//! let dev = Device::attach(config, engine, Arc::new(StandAloneHost))?;
//! dev.al_begin_io(sector)?;
//! // ... submit the write ...
//! dev.al_complete_io(sector);
//! dev.detach()?;
//! ```

mod activity_log;
pub mod config;
mod device;
pub mod host;
mod resync;
mod worker;

pub use activity_log::AlStats;
pub use config::{DeviceConfig, MAX_IO_SIZE};
pub use device::{AttachedDevice, Audit, Device};
pub use host::{Host, StandAloneHost};
pub use resync::{
    BmExtent, BmExtentInfo, ResyncProgress, ResyncStats, SYNC_MARK_STEP, SYNC_MARKS,
};

pub use st_bitmap::{BitState, Bitmap, BitmapStats, PageFlags};
pub use st_block::{
    FaultConfig, FaultInjectingEngine, FaultStats, IoEngine, IoEngineStats, MemIoEngine,
    MetaLayout, PreadPwriteEngine,
};
pub use st_error::{Result, StError};
pub use st_journal::RecoveryReport;
pub use st_lru::LruStats;
pub use st_types::{CancelToken, ConnState, DiskState, IoErrorPolicy};
