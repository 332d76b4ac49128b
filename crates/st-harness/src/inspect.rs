//! Decode the activity-log ring of a metadata image.

use anyhow::{Context, Result};
use serde::Serialize;
use st_journal::{AlRing, AlUpdate, RecoveryReport, ReplayWindow, SlotVerdict};
use std::collections::BTreeMap;
use std::path::Path;
use synctrack::{DeviceConfig, MetaLayout, PreadPwriteEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectOptions {
    pub al_offset_sectors: u64,
    pub slots: u32,
}

impl Default for InspectOptions {
    fn default() -> Self {
        Self {
            al_offset_sectors: 0,
            slots: DeviceConfig::default().ring_slots(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotReport {
    pub slot: u32,
    pub sector: u64,
    pub verdict: SlotVerdict,
    pub tr_number: Option<u32>,
    /// The slot change the record commits.
    pub change: Option<AlUpdate>,
    /// Non-free snapshot entries.
    pub snapshot_entries: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub image: String,
    pub slots: Vec<SlotReport>,
    /// Transaction numbers of the replay window, oldest first.
    pub window: Vec<u32>,
    pub recovery: RecoveryReport,
    /// Cache slot to extent after replay.
    pub bindings: BTreeMap<u32, u32>,
}

pub fn inspect_image(path: &Path, options: &InspectOptions) -> Result<InspectReport> {
    let engine = PreadPwriteEngine::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    // Only the ring is read; the bitmap fields just have to be plausible.
    let layout = MetaLayout {
        al_offset_sectors: options.al_offset_sectors,
        al_size_sectors: u64::from(options.slots),
        bm_offset_sectors: options.al_offset_sectors + u64::from(options.slots),
        bm_size_sectors: 8,
    };
    let ring = AlRing::new(layout, options.slots, 1)?;
    let decoded = ring
        .read_all(&engine)
        .with_context(|| format!("failed to read ring of {}", path.display()))?;
    let window = ReplayWindow::select(&decoded);

    let slots = (0_u32..)
        .zip(&decoded)
        .zip(&window.verdicts)
        .map(|((slot, content), &verdict)| {
            let (tr_number, change, snapshot_entries, error) = match content {
                Ok(txn) => (
                    Some(txn.tr_number),
                    Some(txn.change()),
                    txn.updates[1..].iter().filter(|u| !u.is_free()).count(),
                    None,
                ),
                Err(err) => (None, None, 0, Some(err.to_string())),
            };
            SlotReport {
                slot,
                sector: ring.slot_sector(slot),
                verdict,
                tr_number,
                change,
                snapshot_entries,
                error,
            }
        })
        .collect();

    let mut bindings = BTreeMap::new();
    let mut applied = 0_u32;
    for update in window.bindings() {
        bindings.insert(update.pos, update.extent);
        applied += 1;
    }
    let mut recovery = window.report();
    recovery.bindings_applied = applied;

    Ok(InspectReport {
        image: path.display().to_string(),
        slots,
        window: window.transactions.iter().map(|(_, t)| t.tr_number).collect(),
        recovery,
        bindings,
    })
}
