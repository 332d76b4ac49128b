//! Canned end-to-end scenarios.
//!
//! - `a`: bitmap weight bookkeeping on a 1024-bit bitmap.
//! - `b`: more distinct activity extents than cache slots, one write each.
//! - `c`: replay of a wrapped ring holding stale records from an earlier
//!   lap.

use crate::{Check, ScenarioReport};
use anyhow::{Result, bail};
use serde_json::json;
use st_journal::{AlRing, AlTransaction, AlUpdate};
use st_types::{AL_EXTENT_SIZE, AL_MIN_EXTENTS, BM_SECT_PER_BIT, SECTOR_SHIFT};
use std::str::FromStr;
use std::sync::Arc;
use synctrack::{Bitmap, Device, DeviceConfig, IoEngine, MemIoEngine, MetaLayout, StandAloneHost};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    BitmapWeight,
    AlEviction,
    RingReplay,
}

impl FromStr for Scenario {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "a" | "bitmap" => Ok(Self::BitmapWeight),
            "b" | "al" => Ok(Self::AlEviction),
            "c" | "replay" => Ok(Self::RingReplay),
            other => bail!("unknown scenario: {other} (expected a, b or c)"),
        }
    }
}

pub fn run_scenario(scenario: Scenario) -> Result<ScenarioReport> {
    let report = match scenario {
        Scenario::BitmapWeight => bitmap_weight()?,
        Scenario::AlEviction => al_eviction(&DeviceConfig {
            name: "scenario-b".to_owned(),
            capacity_sectors: 1 << 18,
            al_extents: AL_MIN_EXTENTS,
            ..DeviceConfig::default()
        })?,
        Scenario::RingReplay => ring_replay()?,
    };
    info!(
        target: "synctrack::harness",
        scenario = %report.scenario,
        passed = report.passed,
        "scenario_finished"
    );
    Ok(report)
}

fn mem_engine(layout: &MetaLayout) -> Result<Arc<MemIoEngine>> {
    Ok(Arc::new(MemIoEngine::new(usize::try_from(
        layout.required_bytes(),
    )?)))
}

pub fn bitmap_weight() -> Result<ScenarioReport> {
    let capacity = 1024 * BM_SECT_PER_BIT;
    let layout = MetaLayout::for_capacity(capacity);
    let engine: Arc<dyn IoEngine> = mem_engine(&layout)?;
    let bitmap = Bitmap::new(engine, layout);
    bitmap.resize(capacity, false)?;

    let mut checks = vec![Check::equal("bits", 1024, bitmap.bits())];
    let set = bitmap.set_bits(0, 1023);
    checks.push(Check::equal("set_bits(0, 1023) changed", 1024, set));
    checks.push(Check::equal("weight after set", 1024, bitmap.total_weight()));
    let cleared = bitmap.clear_bits(0, 511);
    checks.push(Check::equal("clear_bits(0, 511) changed", 512, cleared));
    checks.push(Check::equal("weight after clear", 512, bitmap.total_weight()));
    checks.push(Check::equal("find_next_set(0)", 512, bitmap.find_next_set(0)));

    Ok(ScenarioReport::new(
        "a",
        "bitmap weight tracks set and clear",
        checks,
        json!({ "stats": bitmap.stats() }),
    ))
}

/// Ten distinct extents through a cache of `config.al_extents` slots.
pub fn al_eviction(config: &DeviceConfig) -> Result<ScenarioReport> {
    const EXTENTS: u64 = 10;
    let al_sectors = AL_EXTENT_SIZE >> SECTOR_SHIFT;
    let engine = mem_engine(&config.layout())?;
    let engine: Arc<dyn IoEngine> = engine;
    Device::format(config, Arc::clone(&engine))?;
    let dev = Device::attach(config.clone(), engine, Arc::new(StandAloneHost))?;

    for enr in 0..EXTENTS {
        dev.al_begin_io(enr * al_sectors)?;
        dev.al_complete_io(enr * al_sectors);
    }
    let stats = dev.al_stats();
    let checks = vec![
        Check::equal("slots in use", 0, stats.lru.used),
        Check::equal("active extents", 0, stats.active_extents),
        Check::equal(
            "transactions == slot changes",
            stats.lru.changed,
            stats.transactions_written,
        ),
        Check::holds(
            "transactions <= extents",
            stats.transactions_written <= EXTENTS,
            stats.transactions_written,
        ),
    ];
    let details = json!({ "al": stats });
    dev.detach()?;

    Ok(ScenarioReport::new(
        "b",
        "more extents than activity-log slots",
        checks,
        details,
    ))
}

pub fn ring_replay() -> Result<ScenarioReport> {
    let layout = MetaLayout::for_capacity(1 << 16);
    let engine = mem_engine(&layout)?;
    let ring = AlRing::new(layout, 5, AL_MIN_EXTENTS)?;
    ring.format(&*engine)?;

    // Stale lap at slots 0 and 1, live run 5, 6, 7 at slots 2..=4.
    for slot in [0, 1] {
        let txn = AlTransaction::new(2, AlUpdate { pos: slot, extent: 100 + slot });
        ring.write(&*engine, slot, &txn)?;
    }
    for (slot, tr_number) in [(2, 5), (3, 6), (4, 7)] {
        let txn = AlTransaction::new(
            tr_number,
            AlUpdate {
                pos: slot - 2,
                extent: 10 + tr_number,
            },
        );
        ring.write(&*engine, slot, &txn)?;
    }

    let window = ring.recover(&*engine)?;
    let report = window.report();
    let numbers: Vec<u32> = window.transactions.iter().map(|(_, t)| t.tr_number).collect();
    let checks = vec![
        Check::equal("replayed transactions", vec![5, 6, 7], numbers),
        Check::equal("next transaction number", 8, window.next_tr_number),
        Check::equal("next ring position", 0, window.next_pos),
        Check::equal("stale slots", 2, report.slots_stale),
    ];

    Ok(ScenarioReport::new(
        "c",
        "replay selects the newest contiguous run",
        checks,
        json!({ "recovery": report, "verdicts": window.verdicts }),
    ))
}
