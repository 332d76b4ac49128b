//! Concurrent write/resync stress against an in-memory metadata device.
//!
//! Writer threads bracket random 4 KiB writes with `al_begin_io` /
//! `al_complete_io` and mark them out of sync; a resync driver locks
//! random resync extents and reports blocks in sync or failed; the calling
//! thread audits the cross-cache invariants until everyone is done.
//! Injected write faults make the device detach mid-run, which every
//! participant must survive.

use crate::Xorshift;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use st_types::{BM_EXT_SIZE, SECTOR_SHIFT, sect_to_bm_ext};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;
use synctrack::{
    AlStats, Audit, CancelToken, ConnState, Device, DeviceConfig, DiskState, FaultConfig,
    FaultInjectingEngine, FaultStats, Host, IoEngine, MemIoEngine, ResyncStats, StError,
};
use tracing::{info, warn};

const RS_SECTORS: u64 = BM_EXT_SIZE >> SECTOR_SHIFT;

/// Defaults:
/// - `threads`: 4
/// - `ops`: 2000 per writer
/// - `seed`: 1
/// - `fault_ppm`: 0
/// - `capacity_sectors`: 2 GiB
/// - `al_extents`: 61
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub threads: usize,
    pub ops: u64,
    pub seed: u64,
    /// Failed metadata writes per million.
    pub fault_ppm: u32,
    pub capacity_sectors: u64,
    pub al_extents: u32,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops: 2000,
            seed: 1,
            fault_ppm: 0,
            capacity_sectors: 1 << 22,
            al_extents: 61,
        }
    }
}

impl StressConfig {
    fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            name: format!("stress-{}", self.seed),
            capacity_sectors: self.capacity_sectors,
            al_extents: self.al_extents,
            rs_extents: 8,
            resync_step_aside_steps: 20,
            resync_step_ms: 1,
            ..DeviceConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub config: StressConfig,
    pub writes_completed: u64,
    /// Writes refused because the disk was gone.
    pub writes_refused: u64,
    pub resync_rounds: u64,
    pub audits: u64,
    pub exclusion_violations: u64,
    pub accounting_violations: u64,
    pub first_violation: Option<Audit>,
    pub al: AlStats,
    pub resync: ResyncStats,
    pub faults: FaultStats,
    pub final_disk: DiskState,
    pub detach_error: Option<String>,
    pub elapsed_ms: u64,
    pub passed: bool,
}

/// The stress run plays the sync target of a resync in progress.
#[derive(Debug)]
struct SyncTargetHost;

impl Host for SyncTargetHost {
    fn conn_state(&self) -> ConnState {
        ConnState::SyncTarget
    }

    fn force_disconnect(&self, reason: &str) {
        warn!(target: "synctrack::harness", reason, "stress_forced_disconnect");
    }
}

#[derive(Debug, Default)]
struct Counters {
    writes_completed: AtomicU64,
    writes_refused: AtomicU64,
    resync_rounds: AtomicU64,
}

pub fn run_stress(config: &StressConfig) -> Result<StressReport> {
    let started = Instant::now();
    let dev_config = config.device_config();
    let size = usize::try_from(dev_config.layout().required_bytes())?;
    let faulty = Arc::new(FaultInjectingEngine::new(
        MemIoEngine::new(size),
        FaultConfig {
            write_error_ppm: config.fault_ppm,
            seed: config.seed,
            ..FaultConfig::default()
        },
    ));
    let engine: Arc<dyn IoEngine> = faulty.clone();

    faulty.set_armed(false);
    Device::format(&dev_config, Arc::clone(&engine))?;
    let attached = Device::attach(dev_config, engine, Arc::new(SyncTargetHost))?;
    faulty.set_armed(true);
    attached.begin_resync();

    let dev = attached.device();
    let counters = Arc::new(Counters::default());
    let cancel = CancelToken::new();

    let writers: Vec<_> = (0_u64..)
        .take(config.threads)
        .map(|id| {
            let dev = Arc::clone(&dev);
            let counters = Arc::clone(&counters);
            let mut rng = Xorshift::new(config.seed.wrapping_add(id));
            let ops = config.ops;
            let blocks = config.capacity_sectors / 8;
            thread::spawn(move || writer(&dev, &counters, &mut rng, ops, blocks))
        })
        .collect();

    let driver = {
        let dev = Arc::clone(&dev);
        let counters = Arc::clone(&counters);
        let cancel = cancel.clone();
        let mut rng = Xorshift::new(!config.seed);
        let extents = sect_to_bm_ext(config.capacity_sectors - 1) + 1;
        thread::spawn(move || resync_driver(&dev, &counters, &cancel, &mut rng, extents))
    };

    let mut audits = 0_u64;
    let mut exclusion_violations = 0_u64;
    let mut accounting_violations = 0_u64;
    let mut first_violation = None;
    while !writers.iter().all(thread::JoinHandle::is_finished) {
        let audit = dev.audit();
        audits += 1;
        if !audit.is_clean() {
            exclusion_violations += audit.exclusion_violations.len() as u64;
            accounting_violations += audit.accounting_violations.len() as u64;
            first_violation.get_or_insert(audit);
        }
        thread::yield_now();
    }
    for handle in writers {
        if handle.join().is_err() {
            anyhow::bail!("writer thread panicked");
        }
    }
    cancel.cancel();
    if driver.join().is_err() {
        anyhow::bail!("resync driver panicked");
    }

    let final_audit = dev.audit();
    if !final_audit.is_clean() {
        exclusion_violations += final_audit.exclusion_violations.len() as u64;
        accounting_violations += final_audit.accounting_violations.len() as u64;
        first_violation.get_or_insert(final_audit);
    }
    let al = dev.al_stats();
    let resync = dev.resync_stats();
    let final_disk = dev.disk_state();
    drop(dev);
    let detach_error = attached.detach().err().map(|e| e.to_string());

    let report = StressReport {
        config: config.clone(),
        writes_completed: counters.writes_completed.load(Ordering::Relaxed),
        writes_refused: counters.writes_refused.load(Ordering::Relaxed),
        resync_rounds: counters.resync_rounds.load(Ordering::Relaxed),
        audits,
        exclusion_violations,
        accounting_violations,
        first_violation,
        al,
        resync,
        faults: faulty.fault_stats(),
        final_disk,
        detach_error,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        passed: exclusion_violations == 0 && accounting_violations == 0,
    };
    info!(
        target: "synctrack::harness",
        writes = report.writes_completed,
        refused = report.writes_refused,
        rounds = report.resync_rounds,
        audits,
        passed = report.passed,
        "stress_finished"
    );
    Ok(report)
}

fn writer(dev: &Device, counters: &Counters, rng: &mut Xorshift, ops: u64, blocks: u64) {
    for _ in 0..ops {
        let sector = rng.below(blocks) * 8;
        match dev.al_begin_io(sector) {
            Ok(()) => {}
            Err(StError::Diskless) => {
                counters.writes_refused.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(err) => {
                warn!(target: "synctrack::harness", sector, error = %err, "stress_write_failed");
                counters.writes_refused.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }
        dev.set_out_of_sync(sector, 4096);
        if rng.below(8) == 0 {
            thread::yield_now();
        }
        dev.al_complete_io(sector);
        counters.writes_completed.fetch_add(1, Ordering::Relaxed);
    }
}

fn resync_driver(
    dev: &Device,
    counters: &Counters,
    cancel: &CancelToken,
    rng: &mut Xorshift,
    extents: u32,
) {
    loop {
        let sector = rng.below(u64::from(extents)) * RS_SECTORS;
        if let Err(err) = dev.rs_begin_io(sector, cancel) {
            if !matches!(err, StError::Interrupted | StError::Diskless) {
                warn!(target: "synctrack::harness", sector, error = %err, "stress_resync_failed");
            }
            return;
        }
        // A handful of 1 MiB resync requests inside the locked extent.
        for _ in 0..4 {
            let at = sector + rng.below(RS_SECTORS / 2048) * 2048;
            if rng.below(16) == 0 {
                dev.rs_failed_io(at, 1 << 20);
            } else {
                dev.set_in_sync(at, 1 << 20);
            }
        }
        dev.rs_complete_io(sector);
        counters.resync_rounds.fetch_add(1, Ordering::Relaxed);
    }
}
