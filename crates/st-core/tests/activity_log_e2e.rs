#![forbid(unsafe_code)]

use proptest::prelude::*;
use st_block::{IoEngine, MemIoEngine};
use st_core::{AttachedDevice, Device, DeviceConfig, StandAloneHost};
use st_types::{AL_EXTENT_SIZE, ExtentKind, SECTOR_SHIFT};
use std::collections::BTreeSet;
use std::sync::Arc;

const AL_SECTORS: u64 = AL_EXTENT_SIZE >> SECTOR_SHIFT;

fn config(al_ring_slots: Option<u32>) -> DeviceConfig {
    DeviceConfig {
        name: "al-e2e".to_owned(),
        capacity_sectors: 1 << 18,
        al_extents: 7,
        al_ring_slots,
        rs_extents: 4,
        resync_step_ms: 2,
        ..DeviceConfig::default()
    }
}

fn attach(config: DeviceConfig, engine: &Arc<MemIoEngine>) -> AttachedDevice {
    let engine: Arc<dyn IoEngine> = engine.clone();
    Device::attach(config, engine, Arc::new(StandAloneHost)).unwrap()
}

/// Formatted device with an all-clear bitmap on disk.
fn fresh(config: &DeviceConfig) -> (AttachedDevice, Arc<MemIoEngine>) {
    let size = usize::try_from(config.layout().required_bytes()).unwrap();
    let engine = Arc::new(MemIoEngine::new(size));
    Device::format(config, engine.clone()).unwrap();
    let dev = attach(config.clone(), &engine);
    dev.bitmap().clear_all();
    dev.bitmap().write_all().unwrap();
    (dev, engine)
}

/// Drop the device without detaching and return a copy of the media.
fn crash(dev: AttachedDevice, engine: &MemIoEngine) -> Arc<MemIoEngine> {
    drop(dev);
    Arc::new(MemIoEngine::from_bytes(engine.snapshot()))
}

fn resident(dev: &Device) -> BTreeSet<u32> {
    dev.al_resident_extents().into_iter().collect()
}

#[test]
fn more_extents_than_slots_sequentially() {
    let (dev, _engine) = fresh(&config(None));
    for enr in 0..10 {
        dev.al_begin_io(enr * AL_SECTORS).unwrap();
        dev.al_complete_io(enr * AL_SECTORS);
    }
    let stats = dev.al_stats();
    assert_eq!(stats.active_extents, 0);
    assert_eq!(stats.lru.used, 0);
    assert_eq!(stats.lru.changed, 10);
    assert_eq!(stats.transactions_written, stats.lru.changed);
    assert_eq!(resident(&dev), (3..10).collect());

    // Hot extents are fast-path hits.
    for enr in 3..10 {
        dev.al_begin_io(enr * AL_SECTORS).unwrap();
        dev.al_complete_io(enr * AL_SECTORS);
    }
    assert_eq!(dev.al_stats().transactions_written, 10);
}

#[test]
fn crash_marks_hot_extents_out_of_sync() {
    let (dev, engine) = fresh(&config(None));
    for enr in [4, 9, 2, 11] {
        dev.al_begin_io(enr * AL_SECTORS).unwrap();
    }
    dev.al_complete_io(9 * AL_SECTORS);

    let media = crash(dev, &engine);
    let dev = attach(config(None), &media);
    assert!(dev.recovery().transactions_replayed > 0);
    let hot = resident(&dev);
    for enr in [4, 9, 2, 11] {
        assert!(hot.contains(&enr), "extent {enr} lost: {hot:?}");
        assert_eq!(dev.bitmap().e_weight(ExtentKind::Activity, enr), 1024);
    }
    assert_eq!(dev.bitmap().total_weight(), 4 * 1024);

    // Writing resumes after the replayed head.
    let stats = dev.al_stats();
    assert_eq!(stats.next_tr_number, 4);
}

#[test]
fn corrupted_transaction_is_skipped() {
    let config = config(Some(8));
    let (dev, engine) = fresh(&config);
    for enr in 0..4 {
        dev.al_begin_io(enr * AL_SECTORS).unwrap();
        dev.al_complete_io(enr * AL_SECTORS);
    }
    let layout = dev.layout();
    let media = crash(dev, &engine);

    // Low byte of the committed extent number in ring slot 1.
    let at = usize::try_from(layout.al_slot_offset(1)).unwrap() + 15;
    let byte = media.snapshot()[at];
    media.poke(at, &[byte ^ 0x01]);

    let dev = attach(config, &media);
    let report = dev.recovery();
    assert_eq!(report.records_discarded, 1);
    assert_eq!(report.transactions_replayed, 3);
    assert_eq!(report.next_tr_number, 4);
    // Later snapshots still name extent 1.
    assert_eq!(resident(&dev), (0..4).collect());

    dev.al_begin_io(20 * AL_SECTORS).unwrap();
    assert_eq!(dev.al_stats().next_pos, 5);
}

#[test]
fn clean_detach_leaves_nothing_to_replay() {
    let (dev, engine) = fresh(&config(None));
    for enr in 0..3 {
        dev.al_begin_io(enr * AL_SECTORS).unwrap();
        dev.al_complete_io(enr * AL_SECTORS);
    }
    dev.detach().unwrap();
    let dev = attach(config(None), &engine);
    assert_eq!(dev.recovery().transactions_replayed, 0);
    assert_eq!(dev.bitmap().total_weight(), 0);
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Write { enr: u32 },
    Hold { enr: u32 },
    Release,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0_u32..24).prop_map(|enr| Op::Write { enr }),
        (0_u32..24).prop_map(|enr| Op::Hold { enr }),
        Just(Op::Release),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every extent pinned at crash time comes back resident and fully
    /// out of sync.
    #[test]
    fn replay_covers_pinned_extents(ops in proptest::collection::vec(op(), 1..60)) {
        let (dev, engine) = fresh(&config(None));
        let mut held: Vec<u32> = Vec::new();
        for op in ops {
            match op {
                Op::Write { enr } => {
                    let sector = u64::from(enr) * AL_SECTORS;
                    dev.al_begin_io(sector).unwrap();
                    dev.al_complete_io(sector);
                }
                // Keep one slot free so the sequence cannot starve itself.
                Op::Hold { enr } if held.len() < 6 => {
                    dev.al_begin_io(u64::from(enr) * AL_SECTORS).unwrap();
                    held.push(enr);
                }
                Op::Hold { .. } | Op::Release => {
                    if let Some(enr) = held.pop() {
                        dev.al_complete_io(u64::from(enr) * AL_SECTORS);
                    }
                }
            }
        }
        let media = crash(dev, &engine);
        let dev = attach(config(None), &media);
        let hot = resident(&dev);
        for enr in held {
            prop_assert!(hot.contains(&enr), "extent {} lost: {:?}", enr, hot);
            prop_assert_eq!(dev.bitmap().e_weight(ExtentKind::Activity, enr), 1024);
        }
    }
}
