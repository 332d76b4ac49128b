#![forbid(unsafe_code)]

use parking_lot::Mutex;
use proptest::prelude::*;
use st_core::{AttachedDevice, CancelToken, ConnState, Device, DeviceConfig, Host, IoEngine};
use st_core::MemIoEngine;
use st_types::{AL_EXTENT_SIZE, BM_EXT_SIZE, SECTOR_SHIFT, Xorshift};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const AL_SECTORS: u64 = AL_EXTENT_SIZE >> SECTOR_SHIFT;
const RS_SECTORS: u64 = BM_EXT_SIZE >> SECTOR_SHIFT;
const MIB: u32 = 1 << 20;

#[derive(Debug, Default)]
struct TestHost {
    conn: Mutex<Option<ConnState>>,
    finished: AtomicU32,
    disconnects: Mutex<Vec<String>>,
}

impl TestHost {
    fn resyncing() -> Arc<Self> {
        let host = Self::default();
        *host.conn.lock() = Some(ConnState::SyncTarget);
        Arc::new(host)
    }
}

impl Host for TestHost {
    fn conn_state(&self) -> ConnState {
        self.conn.lock().unwrap_or(ConnState::StandAlone)
    }

    fn resync_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn force_disconnect(&self, reason: &str) {
        self.disconnects.lock().push(reason.to_owned());
    }
}

fn config(capacity_sectors: u64) -> DeviceConfig {
    DeviceConfig {
        name: "rs-e2e".to_owned(),
        capacity_sectors,
        al_extents: 7,
        rs_extents: 8,
        resync_step_aside_steps: 100,
        resync_step_ms: 2,
        ..DeviceConfig::default()
    }
}

fn attach(config: DeviceConfig, host: Arc<TestHost>) -> (AttachedDevice, Arc<MemIoEngine>) {
    let size = usize::try_from(config.layout().required_bytes()).unwrap();
    let engine = Arc::new(MemIoEngine::new(size));
    let dyn_engine: Arc<dyn IoEngine> = engine.clone();
    Device::format(&config, Arc::clone(&dyn_engine)).unwrap();
    let dev = Device::attach(config, dyn_engine, host).unwrap();
    (dev, engine)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn full_resync_flushes_bitmap_and_finishes_once() {
    let host = TestHost::resyncing();
    let (dev, engine) = attach(config(1 << 16), Arc::clone(&host));
    assert_eq!(dev.bitmap().total_weight(), 8192);
    dev.begin_resync();

    let cancel = CancelToken::new();
    dev.rs_begin_io(0, &cancel).unwrap();
    assert_eq!(dev.resync_extent(0).unwrap().state.rs_left, 8192);
    for sector in (0..1_u64 << 16).step_by(2048) {
        dev.set_in_sync(sector, MIB);
    }
    dev.rs_complete_io(0);

    wait_until("resync_finished", || host.finished.load(Ordering::SeqCst) == 1);
    let progress = dev.resync_progress();
    assert_eq!(progress.left, 0);
    assert!((progress.percent_done - 100.0).abs() < f64::EPSILON);
    assert_eq!(progress.eta_secs, Some(0));

    let bm = usize::try_from(dev.layout().bm_offset_sectors << SECTOR_SHIFT).unwrap();
    assert!(engine.snapshot()[bm..bm + 4096].iter().all(|&b| b == 0));

    // Further accounting does not finish it again.
    dev.set_out_of_sync(0, 4096);
    dev.set_in_sync(0, 4096);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(host.finished.load(Ordering::SeqCst), 1);
    assert!(host.disconnects.lock().is_empty());
}

#[test]
fn resync_finishes_when_only_failed_blocks_remain() {
    let host = TestHost::resyncing();
    let (dev, _engine) = attach(config(1 << 16), Arc::clone(&host));
    dev.begin_resync();

    dev.rs_begin_io(0, &CancelToken::new()).unwrap();
    dev.rs_failed_io(0, MIB);
    assert_eq!(dev.resync_extent(0).unwrap().state.rs_failed, 256);
    for sector in (2048..1_u64 << 16).step_by(2048) {
        dev.set_in_sync(sector, MIB);
    }
    dev.rs_complete_io(0);

    wait_until("resync_finished", || host.finished.load(Ordering::SeqCst) == 1);
    assert_eq!(dev.bitmap().total_weight(), 256);
    let progress = dev.resync_progress();
    assert_eq!(progress.failed, 256);
    assert_eq!(progress.eta_secs, Some(0));
    assert!(dev.audit().is_clean());
}

#[test]
fn waiting_write_makes_resync_step_aside() {
    let (dev, _engine) = attach(config(1 << 21), TestHost::resyncing());
    let shared = dev.device();

    // Keep the resync from locking until the test lets go.
    dev.al_begin_io(0).unwrap();

    let resync = {
        let dev = Arc::clone(&shared);
        thread::spawn(move || dev.rs_begin_io(0, &CancelToken::new()))
    };
    wait_until("resync admission", || {
        dev.resync_extent(0).is_some_and(|e| e.state.no_writes)
    });

    let writer = {
        let dev = Arc::clone(&shared);
        thread::spawn(move || dev.al_begin_io(AL_SECTORS))
    };
    writer.join().unwrap().unwrap();
    assert_eq!(dev.al_extent_refcnt(1), Some(1));
    assert!(!resync.is_finished());

    dev.al_complete_io(0);
    dev.al_complete_io(AL_SECTORS);
    resync.join().unwrap().unwrap();

    let audit = dev.audit();
    assert!(audit.is_clean(), "{audit:?}");
    assert_eq!(audit.locked_extents, 1);
    dev.rs_complete_io(0);
    assert_eq!(dev.resync_stats().resync_locked, 0);
}

#[test]
fn locked_resync_extent_blocks_writes_until_released() {
    let (dev, _engine) = attach(config(1 << 21), TestHost::resyncing());
    dev.rs_begin_io(RS_SECTORS, &CancelToken::new()).unwrap();

    let writer = {
        let dev = dev.device();
        thread::spawn(move || dev.al_begin_io(RS_SECTORS + 3 * AL_SECTORS))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!writer.is_finished());
    assert!(dev.resync_extent(1).unwrap().state.priority);

    dev.rs_complete_io(RS_SECTORS);
    writer.join().unwrap().unwrap();
    dev.al_complete_io(RS_SECTORS + 3 * AL_SECTORS);
    assert!(dev.audit().is_clean());
}

#[test]
fn exclusion_holds_under_concurrent_writes_and_resync() {
    let (dev, _engine) = attach(config(1 << 21), TestHost::resyncing());
    let shared = dev.device();
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..4_u64)
        .map(|id| {
            let dev = Arc::clone(&shared);
            thread::spawn(move || {
                let mut rng = Xorshift::new(id + 1);
                for _ in 0..200 {
                    let sector = rng.below(1 << 18) * 8;
                    dev.al_begin_io(sector).unwrap();
                    dev.set_out_of_sync(sector, 4096);
                    thread::yield_now();
                    dev.al_complete_io(sector);
                }
            })
        })
        .collect();

    let resync = {
        let dev = Arc::clone(&shared);
        thread::spawn(move || {
            let cancel = CancelToken::new();
            for round in 0..24_u64 {
                let sector = (round % 4) * RS_SECTORS;
                dev.rs_begin_io(sector, &cancel).unwrap();
                let audit = dev.audit();
                assert!(audit.is_clean(), "{audit:?}");
                assert!(audit.locked_extents >= 1);
                dev.set_in_sync(sector, MIB);
                dev.rs_complete_io(sector);
            }
        })
    };

    let auditor = {
        let dev = Arc::clone(&shared);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut audits = 0_u32;
            while !done.load(Ordering::SeqCst) {
                let audit = dev.audit();
                assert!(audit.is_clean(), "{audit:?}");
                audits += 1;
                thread::yield_now();
            }
            audits
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    resync.join().unwrap();
    done.store(true, Ordering::SeqCst);
    assert!(auditor.join().unwrap() > 0);

    assert_eq!(dev.al_stats().active_extents, 0);
    assert_eq!(dev.resync_stats().resync_locked, 0);
    assert!(dev.audit().is_clean());
}

#[derive(Debug, Clone, Copy)]
enum Accounting {
    InSync { block: u64, blocks: u32 },
    OutOfSync { block: u64, blocks: u32 },
    Failed { block: u64, blocks: u32 },
}

fn accounting() -> impl Strategy<Value = Accounting> {
    let range = || (0_u64..8192, 1_u32..=32);
    prop_oneof![
        range().prop_map(|(block, blocks)| Accounting::InSync { block, blocks }),
        range().prop_map(|(block, blocks)| Accounting::OutOfSync { block, blocks }),
        range().prop_map(|(block, blocks)| Accounting::Failed { block, blocks }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// No sequence of completions leaves a resident extent with more
    /// failed than remaining blocks.
    #[test]
    fn failed_never_exceeds_left(ops in proptest::collection::vec(accounting(), 1..80)) {
        let (dev, _engine) = attach(config(1 << 16), TestHost::resyncing());
        dev.begin_resync();
        dev.rs_begin_io(0, &CancelToken::new()).unwrap();
        for op in ops {
            match op {
                Accounting::InSync { block, blocks } => dev.set_in_sync(block * 8, blocks * 4096),
                Accounting::OutOfSync { block, blocks } => {
                    dev.set_out_of_sync(block * 8, blocks * 4096);
                }
                Accounting::Failed { block, blocks } => dev.rs_failed_io(block * 8, blocks * 4096),
            }
            let audit = dev.audit();
            prop_assert!(audit.accounting_violations.is_empty(), "{:?}", audit);
            let ext = dev.resync_extent(0).unwrap().state;
            prop_assert!(ext.rs_failed <= ext.rs_left);
        }
        dev.rs_complete_io(0);
    }
}
