#![forbid(unsafe_code)]

use st_core::{
    CancelToken, ConnState, Device, DeviceConfig, DiskState, FaultConfig, FaultInjectingEngine,
    Host, MemIoEngine, StError,
};
use st_types::{BM_EXT_SIZE, SECTOR_SHIFT};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const RS_SECTORS: u64 = BM_EXT_SIZE >> SECTOR_SHIFT;

#[derive(Debug)]
struct SyncTarget;

impl Host for SyncTarget {
    fn conn_state(&self) -> ConnState {
        ConnState::SyncTarget
    }
}

fn faulty(config: &DeviceConfig) -> Arc<FaultInjectingEngine<MemIoEngine>> {
    let size = usize::try_from(config.layout().required_bytes()).unwrap();
    let engine = Arc::new(FaultInjectingEngine::new(
        MemIoEngine::new(size),
        FaultConfig::default(),
    ));
    Device::format(config, engine.clone()).unwrap();
    engine
}

fn wait_for_disk(dev: &Device, want: DiskState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while dev.disk_state() != want {
        assert!(Instant::now() < deadline, "disk stuck in {}", dev.disk_state());
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn failed_bitmap_flush_degrades_but_keeps_tracking() {
    let config = DeviceConfig {
        name: "fault-flush".to_owned(),
        capacity_sectors: 1 << 16,
        al_extents: 7,
        ..DeviceConfig::default()
    };
    let engine = faulty(&config);
    let dev = Device::attach(config, engine.clone(), Arc::new(SyncTarget)).unwrap();
    dev.set_disk_state(DiskState::UpToDate);
    dev.begin_resync();

    dev.rs_begin_io(0, &CancelToken::new()).unwrap();
    engine.fail_next_writes(1);
    for sector in (0..1_u64 << 16).step_by(2048) {
        dev.set_in_sync(sector, 1 << 20);
    }
    dev.rs_complete_io(0);
    wait_for_disk(&dev, DiskState::Inconsistent);
    assert_eq!(engine.fault_stats().injected_writes, 1);

    // Still attached: activity-log transactions keep being written.
    dev.al_begin_io(0).unwrap();
    dev.al_complete_io(0);
    assert_eq!(dev.al_stats().transactions_written, 1);
    assert_eq!(dev.disk_state(), DiskState::Inconsistent);
}

#[test]
fn failed_transaction_interrupts_waiting_resync() {
    let config = DeviceConfig {
        name: "fault-resync".to_owned(),
        capacity_sectors: 1 << 21,
        al_extents: 7,
        resync_step_aside_steps: 0,
        resync_step_ms: 2,
        ..DeviceConfig::default()
    };
    let engine = faulty(&config);
    let attached = Device::attach(config, engine.clone(), Arc::new(SyncTarget)).unwrap();
    let dev = attached.device();

    // Keep resync extent 0 busy so the resync has to wait.
    dev.al_begin_io(0).unwrap();
    let resync = {
        let dev = Arc::clone(&dev);
        thread::spawn(move || dev.rs_begin_io(0, &CancelToken::new()))
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    while !dev.resync_extent(0).is_some_and(|e| e.state.no_writes) {
        assert!(Instant::now() < deadline, "resync never admitted extent 0");
        thread::sleep(Duration::from_millis(1));
    }

    // A new binding elsewhere fails its ring write and detaches the disk.
    engine.fail_next_writes(1);
    dev.al_begin_io(RS_SECTORS).unwrap();
    wait_for_disk(&dev, DiskState::Diskless);

    assert!(matches!(resync.join().unwrap(), Err(StError::Diskless)));
    assert!(matches!(dev.al_begin_io(2 * RS_SECTORS), Err(StError::Diskless)));
    assert!(matches!(
        dev.rs_begin_io(RS_SECTORS, &CancelToken::new()),
        Err(StError::Diskless)
    ));
    dev.al_complete_io(RS_SECTORS);
    assert_eq!(dev.al_resident_extents(), vec![0, 64], "pinned extents survive");
    dev.al_complete_io(0);
    assert_eq!(dev.resync_stats().resync_locked, 0);

    // The last release drops the activity log along with the ring cursor.
    assert!(dev.al_resident_extents().is_empty());
    let al = dev.al_stats();
    assert_eq!((al.next_pos, al.next_tr_number, al.active_extents), (0, 0, 0));
    drop(dev);
    attached.detach().unwrap();
}
