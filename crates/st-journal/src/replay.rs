//! Replay window selection.
//!
//! The ring is written round-robin, one transaction per slot, with a
//! transaction number that increments (wrapping) on every write. After a
//! crash the ring holds a run of consecutive numbers ending at the newest
//! record, preceded by stale records from earlier laps, never-written
//! slots and possibly torn records.
//!
//! Selection:
//!
//! 1. Decode every slot; a slot is valid when magic and xor sum match.
//! 2. The head is the valid slot with the newest number (serial
//!    arithmetic, so `0` is newer than `u32::MAX`).
//! 3. Walk backwards from the head. A valid slot at distance `d` joins the
//!    window only if its number is `head - d`; the first valid slot that
//!    does not match ends the walk. Invalid slots are skipped and counted.
//! 4. The window is replayed oldest first; writing resumes at the slot
//!    after the head with number `head + 1`.

use crate::transaction::{AlTransaction, AlUpdate, DecodeError};
use serde::Serialize;

/// `a` is newer than `b` under wrapping comparison.
#[inline]
#[must_use]
pub fn tr_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 1 << 31
}

/// How each ring slot was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotVerdict {
    /// Part of the replay window.
    Replayed,
    /// Valid record from an earlier lap.
    Stale,
    /// No record (bad magic).
    Unwritten,
    /// Magic present but the xor sum does not match.
    Corrupt,
}

/// Counters describing one log read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub slots_scanned: u32,
    pub transactions_replayed: u32,
    /// Records with a valid magic whose checksum failed.
    pub records_discarded: u32,
    pub slots_unwritten: u32,
    pub slots_stale: u32,
    /// Non-free bindings applied to the cache.
    pub bindings_applied: u32,
    pub head_tr_number: Option<u32>,
    pub next_tr_number: u32,
    pub next_pos: u32,
}

/// The selected run of transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayWindow {
    /// `(slot, transaction)` oldest first.
    pub transactions: Vec<(u32, AlTransaction)>,
    pub verdicts: Vec<SlotVerdict>,
    pub next_pos: u32,
    pub next_tr_number: u32,
}

impl ReplayWindow {
    /// Choose the window from the decoded content of every ring slot, in
    /// slot order.
    #[must_use]
    pub fn select(slots: &[Result<AlTransaction, DecodeError>]) -> Self {
        let ring = u32::try_from(slots.len()).unwrap_or(u32::MAX);
        let mut verdicts: Vec<SlotVerdict> = slots
            .iter()
            .map(|slot| match slot {
                Ok(_) => SlotVerdict::Stale,
                Err(DecodeError::BadChecksum { .. }) => SlotVerdict::Corrupt,
                Err(_) => SlotVerdict::Unwritten,
            })
            .collect();

        let mut head: Option<(u32, u32)> = None;
        for (pos, slot) in (0_u32..).zip(slots) {
            if let Ok(txn) = slot
                && head.is_none_or(|(_, tnr)| tr_newer(txn.tr_number, tnr))
            {
                head = Some((pos, txn.tr_number));
            }
        }
        let Some((head_pos, head_tnr)) = head else {
            return Self {
                transactions: Vec::new(),
                verdicts,
                next_pos: 0,
                next_tr_number: 0,
            };
        };

        let mut newest_first = Vec::new();
        for d in 0..ring {
            let pos = (head_pos + ring - d) % ring;
            let Ok(txn) = &slots[pos as usize] else {
                continue;
            };
            if txn.tr_number != head_tnr.wrapping_sub(d) {
                break;
            }
            verdicts[pos as usize] = SlotVerdict::Replayed;
            newest_first.push((pos, txn.clone()));
        }
        newest_first.reverse();

        Self {
            transactions: newest_first,
            verdicts,
            next_pos: (head_pos + 1) % ring,
            next_tr_number: head_tnr.wrapping_add(1),
        }
    }

    /// Bindings in application order: transactions oldest first, within a
    /// transaction snapshot entries before the committed change, free
    /// entries skipped.
    pub fn bindings(&self) -> impl Iterator<Item = AlUpdate> + '_ {
        self.transactions
            .iter()
            .flat_map(|(_, txn)| txn.updates.iter().rev().copied())
            .filter(|u| !u.is_free())
    }

    #[must_use]
    pub fn report(&self) -> RecoveryReport {
        let count = |v: SlotVerdict| {
            u32::try_from(self.verdicts.iter().filter(|&&x| x == v).count()).unwrap_or(u32::MAX)
        };
        RecoveryReport {
            slots_scanned: u32::try_from(self.verdicts.len()).unwrap_or(u32::MAX),
            transactions_replayed: count(SlotVerdict::Replayed),
            records_discarded: count(SlotVerdict::Corrupt),
            slots_unwritten: count(SlotVerdict::Unwritten),
            slots_stale: count(SlotVerdict::Stale),
            bindings_applied: 0,
            head_tr_number: self.transactions.last().map(|(_, t)| t.tr_number),
            next_tr_number: self.next_tr_number,
            next_pos: self.next_pos,
        }
    }
}
