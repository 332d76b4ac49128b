#![forbid(unsafe_code)]
//! Metadata device access for synctrack.
//!
//! The metadata area holds two regions addressed in 512-byte sectors:
//!
//! ```text
//!  al_offset                       bm_offset
//!  ┌──────────────────────────────┬──────────────────────────────────┐
//!  │ activity-log ring            │ bitmap pages (8 sectors each)     │
//!  │ one transaction per sector   │ little-endian u64 words           │
//!  └──────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! All access goes through an [`IoEngine`]; [`read_sectors`] and
//! [`write_sectors`] are the blocking single-buffer form used for
//! activity-log transactions. Every metadata write is followed by an
//! [`IoOp::Sync`] in the same batch and counts as done only once the flush
//! completes.

pub mod fault;
pub mod io_engine;

pub use fault::{FaultConfig, FaultInjectingEngine, FaultStats};
pub use io_engine::{IoCompletion, IoEngine, IoEngineStats, IoOp, MemIoEngine, PreadPwriteEngine};

use serde::{Deserialize, Serialize};
use st_error::{Result, StError};
use st_types::{
    AL_MAX_RING_SLOTS, BM_BITS_PER_PAGE, BM_SECT_PER_PAGE, SECTOR_SHIFT, SECTOR_SIZE,
    bits_for_capacity, pages_for_bits,
};

/// Placement of the activity-log ring and the bitmap on the metadata device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaLayout {
    /// First sector of the activity-log ring.
    pub al_offset_sectors: u64,
    /// Sectors reserved for the ring (one transaction per sector).
    pub al_size_sectors: u64,
    /// First sector of the bitmap.
    pub bm_offset_sectors: u64,
    /// Sectors reserved for bitmap pages.
    pub bm_size_sectors: u64,
}

impl MetaLayout {
    /// Default layout for a device of `capacity_sectors`: a maximum-size
    /// ring at sector 0 followed by exactly enough bitmap pages.
    #[must_use]
    pub fn for_capacity(capacity_sectors: u64) -> Self {
        let al_size_sectors = u64::from(AL_MAX_RING_SLOTS);
        let pages = pages_for_bits(bits_for_capacity(capacity_sectors)).max(1);
        Self {
            al_offset_sectors: 0,
            al_size_sectors,
            bm_offset_sectors: al_size_sectors,
            bm_size_sectors: pages * BM_SECT_PER_PAGE,
        }
    }

    /// Bytes the metadata device must provide.
    #[must_use]
    pub fn required_bytes(&self) -> u64 {
        let end = (self.al_offset_sectors + self.al_size_sectors)
            .max(self.bm_offset_sectors + self.bm_size_sectors);
        end << SECTOR_SHIFT
    }

    /// Largest bit count the bitmap region can persist.
    #[must_use]
    pub fn max_bitmap_bits(&self) -> u64 {
        (self.bm_size_sectors / BM_SECT_PER_PAGE) * BM_BITS_PER_PAGE
    }

    /// Byte offset of activity-log ring slot `slot`.
    #[must_use]
    pub fn al_slot_offset(&self, slot: u32) -> u64 {
        (self.al_offset_sectors + u64::from(slot)) << SECTOR_SHIFT
    }

    /// Sector of bitmap page `page`.
    #[must_use]
    pub fn bm_page_sector(&self, page: u64) -> u64 {
        self.bm_offset_sectors + page * BM_SECT_PER_PAGE
    }

    /// Check the regions are non-empty, disjoint and fit on a device of
    /// `device_bytes` bytes.
    pub fn validate(&self, device_bytes: u64) -> Result<()> {
        if self.al_size_sectors == 0 || self.bm_size_sectors == 0 {
            return Err(StError::InvalidGeometry(format!(
                "empty metadata region: al_size={} bm_size={}",
                self.al_size_sectors, self.bm_size_sectors
            )));
        }
        if self.bm_size_sectors % BM_SECT_PER_PAGE != 0 {
            return Err(StError::InvalidGeometry(format!(
                "bitmap region of {} sectors is not page aligned",
                self.bm_size_sectors
            )));
        }
        let al_end = self.al_offset_sectors + self.al_size_sectors;
        let bm_end = self.bm_offset_sectors + self.bm_size_sectors;
        if self.al_offset_sectors < bm_end && self.bm_offset_sectors < al_end {
            return Err(StError::InvalidGeometry(
                "activity-log and bitmap regions overlap".to_owned(),
            ));
        }
        if self.required_bytes() > device_bytes {
            return Err(StError::InvalidGeometry(format!(
                "metadata layout needs {} bytes, device has {device_bytes}",
                self.required_bytes()
            )));
        }
        Ok(())
    }
}

fn meta_io_error(sector: u64, err: &StError) -> StError {
    StError::MetaIo {
        sector,
        detail: err.to_string(),
    }
}

/// Read `count` sectors starting at `sector`, blocking until complete.
pub fn read_sectors(engine: &dyn IoEngine, sector: u64, count: usize) -> Result<Vec<u8>> {
    let op = IoOp::Read {
        offset: sector << SECTOR_SHIFT,
        buf: vec![0_u8; count * SECTOR_SIZE],
    };
    match engine.submit_batch(vec![op]).pop() {
        Some(IoCompletion::Read(buf)) => Ok(buf),
        Some(IoCompletion::Error(err)) => Err(meta_io_error(sector, &err)),
        other => Err(StError::MetaIo {
            sector,
            detail: format!("unexpected completion {other:?}"),
        }),
    }
}

/// Write `data` (a whole number of sectors) at `sector` and flush, blocking
/// until both complete.
pub fn write_sectors(engine: &dyn IoEngine, sector: u64, data: Vec<u8>) -> Result<()> {
    if data.len() % SECTOR_SIZE != 0 {
        return Err(StError::Format(format!(
            "write of {} bytes is not sector aligned",
            data.len()
        )));
    }
    let op = IoOp::Write {
        offset: sector << SECTOR_SHIFT,
        data,
    };
    let mut completions = engine.submit_batch(vec![op, IoOp::Sync]).into_iter();
    match (completions.next(), completions.next()) {
        (Some(IoCompletion::Write), Some(IoCompletion::Sync)) => Ok(()),
        (Some(IoCompletion::Error(err)), _) | (_, Some(IoCompletion::Error(err))) => {
            Err(meta_io_error(sector, &err))
        }
        other => Err(StError::MetaIo {
            sector,
            detail: format!("unexpected completions {other:?}"),
        }),
    }
}
