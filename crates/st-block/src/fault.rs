//! Fault injection for metadata I/O.
//!
//! [`FaultInjectingEngine`] wraps any [`IoEngine`] and turns a configurable
//! share of reads and writes into synthetic `EIO` completions. Flushes only
//! fail when forced with [`FaultInjectingEngine::fail_next_syncs`]. Decisions come
//! from a seeded xorshift generator so a failing run can be replayed exactly.

use crate::io_engine::{IoCompletion, IoEngine, IoEngineStats, IoOp};
use serde::{Deserialize, Serialize};
use st_error::StError;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Fault injection settings.
///
/// Defaults:
/// - `read_error_ppm`: 0
/// - `write_error_ppm`: 0
/// - `seed`: 0
/// - `byte_window`: `None` (whole device)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Failed reads per million read operations.
    pub read_error_ppm: u32,
    /// Failed writes per million write operations.
    pub write_error_ppm: u32,
    /// Generator seed.
    pub seed: u64,
    /// Restrict injection to `[start, end)` byte offsets.
    pub byte_window: Option<(u64, u64)>,
}

impl FaultConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.read_error_ppm > 0 || self.write_error_ppm > 0
    }
}

/// Counters of injected failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultStats {
    pub injected_reads: u64,
    pub injected_writes: u64,
    pub injected_syncs: u64,
}

/// Deterministic xorshift generator.
#[derive(Debug)]
struct DeterministicRng {
    state: AtomicU64,
}

impl DeterministicRng {
    fn new(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed ^ 0x9E37_79B9_7F4A_7C15),
        }
    }

    fn next_u64(&self) -> u64 {
        let step = |mut x: u64| {
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            x
        };
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |x| Some(step(x)))
            .unwrap_or_else(|x| x);
        step(prev).wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn hit(&self, ppm: u32) -> bool {
        ppm > 0 && self.next_u64() % 1_000_000 < u64::from(ppm)
    }
}

/// Engine wrapper that fails selected operations.
pub struct FaultInjectingEngine<E> {
    inner: E,
    config: FaultConfig,
    rng: DeterministicRng,
    armed: AtomicBool,
    fail_next_writes: AtomicU32,
    fail_next_reads: AtomicU32,
    fail_next_syncs: AtomicU32,
    injected_reads: AtomicU64,
    injected_writes: AtomicU64,
    injected_syncs: AtomicU64,
}

impl<E: IoEngine> FaultInjectingEngine<E> {
    #[must_use]
    pub fn new(inner: E, config: FaultConfig) -> Self {
        let rng = DeterministicRng::new(config.seed);
        Self {
            inner,
            config,
            rng,
            armed: AtomicBool::new(true),
            fail_next_writes: AtomicU32::new(0),
            fail_next_reads: AtomicU32::new(0),
            fail_next_syncs: AtomicU32::new(0),
            injected_reads: AtomicU64::new(0),
            injected_writes: AtomicU64::new(0),
            injected_syncs: AtomicU64::new(0),
        }
    }

    /// Enable or suspend probabilistic injection. Forced failures queued with
    /// [`Self::fail_next_writes`] fire regardless.
    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::Release);
    }

    /// Fail the next `n` write operations unconditionally.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next_writes.store(n, Ordering::Release);
    }

    /// Fail the next `n` read operations unconditionally.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_next_reads.store(n, Ordering::Release);
    }

    /// Fail the next `n` flushes unconditionally.
    pub fn fail_next_syncs(&self, n: u32) {
        self.fail_next_syncs.store(n, Ordering::Release);
    }

    #[must_use]
    pub fn fault_stats(&self) -> FaultStats {
        FaultStats {
            injected_reads: self.injected_reads.load(Ordering::Relaxed),
            injected_writes: self.injected_writes.load(Ordering::Relaxed),
            injected_syncs: self.injected_syncs.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &E {
        &self.inner
    }

    fn in_window(&self, offset: u64) -> bool {
        self.config
            .byte_window
            .is_none_or(|(start, end)| (start..end).contains(&offset))
    }

    fn take_forced(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn should_fail(&self, op: &IoOp) -> bool {
        let Some(offset) = op.offset() else {
            return Self::take_forced(&self.fail_next_syncs);
        };
        let (forced, ppm) = match op {
            IoOp::Read { .. } => (&self.fail_next_reads, self.config.read_error_ppm),
            IoOp::Write { .. } => (&self.fail_next_writes, self.config.write_error_ppm),
            IoOp::Sync => return false,
        };
        if !self.in_window(offset) {
            return false;
        }
        if Self::take_forced(forced) {
            return true;
        }
        self.armed.load(Ordering::Acquire) && self.rng.hit(ppm)
    }
}

impl<E> std::fmt::Debug for FaultInjectingEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjectingEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: IoEngine> IoEngine for FaultInjectingEngine<E> {
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion> {
        // Split into pass-through and failed slots, keeping completion order.
        let mut passthrough = Vec::with_capacity(ops.len());
        let mut verdicts = Vec::with_capacity(ops.len());
        for op in ops {
            if self.should_fail(&op) {
                let offset = op.offset().unwrap_or(0);
                let kind = match op {
                    IoOp::Read { .. } => {
                        self.injected_reads.fetch_add(1, Ordering::Relaxed);
                        "read"
                    }
                    IoOp::Write { .. } => {
                        self.injected_writes.fetch_add(1, Ordering::Relaxed);
                        "write"
                    }
                    IoOp::Sync => {
                        self.injected_syncs.fetch_add(1, Ordering::Relaxed);
                        "sync"
                    }
                };
                debug!(
                    target: "synctrack::block",
                    offset,
                    kind,
                    "fault_injected"
                );
                verdicts.push(Some(StError::Io(std::io::Error::from_raw_os_error(
                    libc::EIO,
                ))));
            } else {
                passthrough.push(op);
                verdicts.push(None);
            }
        }

        let mut completed = self.inner.submit_batch(passthrough).into_iter();
        verdicts
            .into_iter()
            .map(|verdict| match verdict {
                Some(err) => IoCompletion::Error(err),
                None => completed.next().unwrap_or_else(|| {
                    IoCompletion::Error(StError::Io(std::io::Error::other(
                        "inner engine returned too few completions",
                    )))
                }),
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "fault-injecting"
    }

    fn stats(&self) -> IoEngineStats {
        let mut stats = self.inner.stats();
        let injected = self.fault_stats();
        stats.errors +=
            injected.injected_reads + injected.injected_writes + injected.injected_syncs;
        stats
    }

    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_engine::MemIoEngine;

    fn write_op(offset: u64) -> IoOp {
        IoOp::Write {
            offset,
            data: vec![1_u8; 512],
        }
    }

    #[test]
    fn disabled_config_passes_everything_through() {
        let engine = FaultInjectingEngine::new(MemIoEngine::new(4096), FaultConfig::default());
        let done = engine.submit_batch((0..8).map(|i| write_op(i * 512)).collect());
        assert!(done.iter().all(|c| matches!(c, IoCompletion::Write)));
        assert_eq!(engine.fault_stats(), FaultStats::default());
    }

    #[test]
    fn forced_failures_keep_completion_order() {
        let engine = FaultInjectingEngine::new(MemIoEngine::new(4096), FaultConfig::default());
        engine.fail_next_writes(1);
        let done = engine.submit_batch(vec![
            IoOp::Read {
                offset: 0,
                buf: vec![0_u8; 512],
            },
            write_op(512),
            write_op(1024),
        ]);
        assert!(matches!(done[0], IoCompletion::Read(_)));
        match &done[1] {
            IoCompletion::Error(err) => assert_eq!(err.to_errno(), libc::EIO),
            other => panic!("expected injected error, got {other:?}"),
        }
        assert!(matches!(done[2], IoCompletion::Write));
        assert_eq!(engine.fault_stats().injected_writes, 1);
        assert_eq!(engine.inner().stats().writes, 1);
    }

    #[test]
    fn forced_sync_failure_leaves_writes_alone() {
        let engine = FaultInjectingEngine::new(MemIoEngine::new(4096), FaultConfig::default());
        engine.fail_next_syncs(1);
        let done = engine.submit_batch(vec![write_op(0), IoOp::Sync, IoOp::Sync]);
        assert!(matches!(done[0], IoCompletion::Write));
        assert!(done[1].is_error());
        assert!(matches!(done[2], IoCompletion::Sync));
        let stats = engine.fault_stats();
        assert_eq!(stats.injected_syncs, 1);
        assert_eq!(stats.injected_writes, 0);
        assert_eq!(engine.inner().stats().syncs, 1);
    }

    #[test]
    fn full_rate_fails_every_write_in_window() {
        let config = FaultConfig {
            write_error_ppm: 1_000_000,
            byte_window: Some((1024, 2048)),
            ..FaultConfig::default()
        };
        let engine = FaultInjectingEngine::new(MemIoEngine::new(4096), config);
        let done = engine.submit_batch(vec![write_op(0), write_op(1024), write_op(1536)]);
        assert!(matches!(done[0], IoCompletion::Write));
        assert!(done[1].is_error());
        assert!(done[2].is_error());

        engine.set_armed(false);
        let done = engine.submit_batch(vec![write_op(1024)]);
        assert!(matches!(done[0], IoCompletion::Write));
    }

    #[test]
    fn same_seed_same_decisions() {
        let config = FaultConfig {
            read_error_ppm: 300_000,
            seed: 42,
            ..FaultConfig::default()
        };
        let run = || {
            let engine = FaultInjectingEngine::new(MemIoEngine::new(64 * 512), config.clone());
            engine
                .submit_batch(
                    (0..64)
                        .map(|i| IoOp::Read {
                            offset: i * 512,
                            buf: vec![0_u8; 512],
                        })
                        .collect(),
                )
                .iter()
                .map(IoCompletion::is_error)
                .collect::<Vec<_>>()
        };
        let first = run();
        assert_eq!(first, run());
        let failures = first.iter().filter(|&&e| e).count();
        assert!(failures > 0 && failures < 64, "failures={failures}");
    }
}
