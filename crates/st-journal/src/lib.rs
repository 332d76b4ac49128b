#![forbid(unsafe_code)]
//! Activity-log journal: transaction codec, ring I/O and replay window
//! selection.
//!
//! The journal is a ring of one-sector slots at the start of the metadata
//! area. Each activity-log slot change writes exactly one
//! [`AlTransaction`] into the next ring slot. See [`transaction`] for the
//! record format and [`replay`] for how the ring is read back.

pub mod replay;
pub mod transaction;

pub use replay::{RecoveryReport, ReplayWindow, SlotVerdict, tr_newer};
pub use transaction::{AL_UPDATES, AlTransaction, AlUpdate, DecodeError};

use st_block::{IoEngine, MetaLayout, read_sectors, write_sectors};
use st_error::{Result, StError};
use st_types::{AL_EXTENTS_PT, AL_MAX_RING_SLOTS, SECTOR_SIZE};
use tracing::{debug, warn};

/// Ring size that lets any run of consecutive transactions covering the
/// whole ring describe every one of `nr_elements` cache slots.
#[must_use]
pub fn default_ring_slots(nr_elements: u32) -> u32 {
    nr_elements.div_ceil(AL_EXTENTS_PT as u32) + 1
}

/// Placement of the transaction ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlRing {
    layout: MetaLayout,
    slots: u32,
}

impl AlRing {
    /// Validate a ring of `slots` slots inside `layout`'s activity-log
    /// region, for a cache of `nr_elements`.
    pub fn new(layout: MetaLayout, slots: u32, nr_elements: u32) -> Result<Self> {
        if slots == 0 || slots > AL_MAX_RING_SLOTS {
            return Err(StError::InvalidGeometry(format!(
                "al ring of {slots} slots (allowed 1..={AL_MAX_RING_SLOTS})"
            )));
        }
        if u64::from(slots) > layout.al_size_sectors {
            return Err(StError::InvalidGeometry(format!(
                "al ring of {slots} slots exceeds {} reserved sectors",
                layout.al_size_sectors
            )));
        }
        let wanted = default_ring_slots(nr_elements);
        if slots < wanted {
            warn!(
                target: "synctrack::al",
                slots,
                wanted,
                nr_elements,
                "al_ring_too_small_for_full_snapshot"
            );
        }
        Ok(Self { layout, slots })
    }

    #[must_use]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    #[must_use]
    pub fn slot_sector(&self, slot: u32) -> u64 {
        self.layout.al_offset_sectors + u64::from(slot)
    }

    /// Read and decode every slot in one request.
    pub fn read_all(
        &self,
        engine: &dyn IoEngine,
    ) -> Result<Vec<std::result::Result<AlTransaction, DecodeError>>> {
        let raw = read_sectors(engine, self.layout.al_offset_sectors, self.slots as usize)?;
        Ok(raw.chunks_exact(SECTOR_SIZE).map(AlTransaction::decode).collect())
    }

    /// Write `txn` into ring slot `slot`.
    pub fn write(&self, engine: &dyn IoEngine, slot: u32, txn: &AlTransaction) -> Result<()> {
        if slot >= self.slots {
            return Err(StError::InvalidGeometry(format!(
                "ring slot {slot} out of {}",
                self.slots
            )));
        }
        let sector = self.slot_sector(slot);
        write_sectors(engine, sector, txn.encode())?;
        debug!(
            target: "synctrack::al",
            slot,
            sector,
            tr_number = txn.tr_number,
            pos = txn.change().pos,
            extent = txn.change().extent,
            "al_transaction_written"
        );
        Ok(())
    }

    /// Invalidate every slot.
    pub fn format(&self, engine: &dyn IoEngine) -> Result<()> {
        write_sectors(
            engine,
            self.layout.al_offset_sectors,
            vec![0_u8; self.slots as usize * SECTOR_SIZE],
        )
    }

    /// Read the ring and select the replay window.
    pub fn recover(&self, engine: &dyn IoEngine) -> Result<ReplayWindow> {
        let slots = self.read_all(engine)?;
        for (slot, content) in (0_u32..).zip(&slots) {
            if let Err(err @ DecodeError::BadChecksum { .. }) = content {
                warn!(
                    target: "synctrack::al",
                    slot,
                    sector = self.slot_sector(slot),
                    error = %err,
                    "al_transaction_discarded"
                );
            }
        }
        Ok(ReplayWindow::select(&slots))
    }
}
