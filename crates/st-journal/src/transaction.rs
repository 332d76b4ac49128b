//! Activity-log transaction record.
//!
//! # On-disk format (one 512-byte sector, big-endian)
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic (0x83740267)
//! 4       4     tr_number
//! 8       496   updates[62] of { pos: u32, extent: u32 }
//! 504     4     xor_sum of all 62 extent fields
//! 508     4     zero padding
//! ```
//!
//! `updates[0]` is the slot change this transaction commits. `updates[1..]`
//! re-record the current binding of up to 61 other slots, cycling through
//! the cache across transactions, so any `ceil(slots / 61)` consecutive
//! transactions describe every slot. Unused entries carry
//! `pos = u32::MAX, extent = LC_FREE`.

use serde::Serialize;
use st_error::StError;
use st_types::{AL_EXTENTS_PT, AL_MAGIC, LC_FREE, SECTOR_SIZE, read_be_u32, write_be_u32};
use thiserror::Error;

/// Entries per record.
pub const AL_UPDATES: usize = AL_EXTENTS_PT + 1;

const TR_NUMBER_OFFSET: usize = 4;
const UPDATES_OFFSET: usize = 8;
const XOR_SUM_OFFSET: usize = UPDATES_OFFSET + AL_UPDATES * 8;

/// One `(slot, extent)` binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlUpdate {
    pub pos: u32,
    pub extent: u32,
}

impl AlUpdate {
    pub const PADDING: Self = Self {
        pos: u32::MAX,
        extent: LC_FREE,
    };

    #[must_use]
    pub fn is_free(self) -> bool {
        self.extent == LC_FREE
    }
}

/// A decoded (or about to be encoded) transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlTransaction {
    pub tr_number: u32,
    pub updates: [AlUpdate; AL_UPDATES],
}

/// Why a ring slot does not hold a usable transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Never written, or overwritten by something else.
    #[error("bad magic {found:#010x}")]
    BadMagic { found: u32 },
    /// Torn or corrupted record.
    #[error("xor sum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    BadChecksum { stored: u32, computed: u32 },
    #[error("record shorter than one sector ({len} bytes)")]
    Short { len: usize },
}

impl DecodeError {
    /// Attach the ring slot's sector for the runtime error type.
    #[must_use]
    pub fn at_sector(self, sector: u64) -> StError {
        StError::Corruption {
            sector,
            detail: self.to_string(),
        }
    }
}

impl AlTransaction {
    /// A transaction whose only content is the committed change.
    #[must_use]
    pub fn new(tr_number: u32, change: AlUpdate) -> Self {
        let mut updates = [AlUpdate::PADDING; AL_UPDATES];
        updates[0] = change;
        Self { tr_number, updates }
    }

    /// Fill the snapshot entries with slots `cycle..` of a cache of
    /// `nr_elements`, reading bindings through `number_of`. Returns the
    /// cycle start for the next transaction.
    #[expect(clippy::cast_possible_truncation)] // AL_EXTENTS_PT is 61
    pub fn fill_snapshot(
        &mut self,
        cycle: u32,
        nr_elements: u32,
        number_of: impl Fn(u32) -> u32,
    ) -> u32 {
        let count = (AL_EXTENTS_PT as u32).min(nr_elements.saturating_sub(cycle));
        for i in 0..AL_EXTENTS_PT as u32 {
            self.updates[i as usize + 1] = if i < count {
                AlUpdate {
                    pos: cycle + i,
                    extent: number_of(cycle + i),
                }
            } else {
                AlUpdate::PADDING
            };
        }
        let next = cycle + AL_EXTENTS_PT as u32;
        if next >= nr_elements { 0 } else { next }
    }

    /// The change committed by this transaction.
    #[must_use]
    pub fn change(&self) -> AlUpdate {
        self.updates[0]
    }

    /// XOR of every extent field, padding included.
    #[must_use]
    pub fn xor_sum(&self) -> u32 {
        self.updates.iter().fold(0, |acc, u| acc ^ u.extent)
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; SECTOR_SIZE];
        write_be_u32(&mut out, 0, AL_MAGIC);
        write_be_u32(&mut out, TR_NUMBER_OFFSET, self.tr_number);
        for (i, u) in self.updates.iter().enumerate() {
            let at = UPDATES_OFFSET + i * 8;
            write_be_u32(&mut out, at, u.pos);
            write_be_u32(&mut out, at + 4, u.extent);
        }
        write_be_u32(&mut out, XOR_SUM_OFFSET, self.xor_sum());
        out
    }

    pub fn decode(sector: &[u8]) -> Result<Self, DecodeError> {
        if sector.len() < SECTOR_SIZE {
            return Err(DecodeError::Short { len: sector.len() });
        }
        // Lengths are checked above; the reads below cannot fail.
        let field = |offset: usize| read_be_u32(sector, offset).unwrap_or_default();

        let magic = field(0);
        if magic != AL_MAGIC {
            return Err(DecodeError::BadMagic { found: magic });
        }
        let mut updates = [AlUpdate::PADDING; AL_UPDATES];
        for (i, u) in updates.iter_mut().enumerate() {
            let at = UPDATES_OFFSET + i * 8;
            *u = AlUpdate {
                pos: field(at),
                extent: field(at + 4),
            };
        }
        let txn = Self {
            tr_number: field(TR_NUMBER_OFFSET),
            updates,
        };
        let stored = field(XOR_SUM_OFFSET);
        let computed = txn.xor_sum();
        if stored != computed {
            return Err(DecodeError::BadChecksum { stored, computed });
        }
        Ok(txn)
    }
}
