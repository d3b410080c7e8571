//! Dataset store persistence, schema upgrades and split maintenance.
use aqua_core::dataset::{
    DatasetKind, DatasetStore, FileDatasetStore, MemoryDatasetStore, SCHEMA_VERSION, SplitPolicy,
    expected_validation, insert_assigned, migrate, read_rows, rebalance,
};
use aqua_core::episode::{Co2ClosingState, EpisodeOrigin};
use aqua_core::error::DatasetError;
use aqua_traits::{SequenceRandom, SmallRandom};
use proptest::prelude::*;
use serde_json::json;

fn episode(close_time: i64) -> Co2ClosingState {
    Co2ClosingState {
        origin: EpisodeOrigin::ThisInstance,
        close_time,
        opened_seconds_ago: 120,
        ph600_at_close: 7.1,
        ph60_offsets: vec![0.01; 3],
        temperatures: vec![24.0; 3],
        daylight: vec![true; 3],
        valve_open: vec![true, true, false],
        min_ph600_offset_after_close: -0.12,
    }
}

#[test]
fn file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db").join("co2.json");
    {
        let mut s = FileDatasetStore::open(&path).unwrap();
        s.insert(&episode(10), true).unwrap();
        s.insert(&episode(20), true).unwrap();
        assert_eq!(s.mark_as_training(&[20, 99]).unwrap(), 1);
    }
    let s = FileDatasetStore::open(&path).unwrap();
    assert_eq!(s.schema_version(), SCHEMA_VERSION);
    assert_eq!(s.close_times(DatasetKind::Validation).unwrap(), vec![10]);
    assert_eq!(s.close_times(DatasetKind::Training).unwrap(), vec![20]);
    assert_eq!(s.find(DatasetKind::Any).unwrap()[0], episode(10));
}

#[test]
fn duplicate_insert_leaves_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("co2.json");
    let mut s = FileDatasetStore::open(&path).unwrap();
    s.insert(&episode(10), false).unwrap();
    let before = std::fs::read(&path).unwrap();
    assert!(matches!(
        s.insert(&episode(10), true),
        Err(DatasetError::Duplicate(10))
    ));
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

/// Blocks the atomic writer: its temp file path is taken by a directory.
fn block_writes(path: &std::path::Path) -> std::path::PathBuf {
    let tmp = path.with_extension("new");
    std::fs::create_dir(&tmp).unwrap();
    tmp
}

#[test]
fn failed_insert_is_rolled_back_and_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("co2.json");
    let mut s = FileDatasetStore::open(&path).unwrap();
    let blocker = block_writes(&path);

    assert!(matches!(
        s.insert(&episode(10), false),
        Err(DatasetError::Io { .. })
    ));
    assert_eq!(s.count(DatasetKind::Any).unwrap(), 0);

    std::fs::remove_dir(blocker).unwrap();
    s.insert(&episode(10), false).unwrap();
    let reopened = FileDatasetStore::open(&path).unwrap();
    assert_eq!(reopened.close_times(DatasetKind::Any).unwrap(), vec![10]);
}

#[test]
fn failed_promotion_keeps_validation_flags() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("co2.json");
    let mut s = FileDatasetStore::open(&path).unwrap();
    s.insert(&episode(10), true).unwrap();
    s.insert(&episode(20), true).unwrap();
    let blocker = block_writes(&path);

    assert!(s.mark_as_training(&[10, 20]).is_err());
    assert_eq!(s.count(DatasetKind::Validation).unwrap(), 2);

    std::fs::remove_dir(blocker).unwrap();
    assert_eq!(s.mark_as_training(&[10]).unwrap(), 1);
    let reopened = FileDatasetStore::open(&path).unwrap();
    assert_eq!(reopened.close_times(DatasetKind::Training).unwrap(), vec![10]);
    assert_eq!(reopened.close_times(DatasetKind::Validation).unwrap(), vec![20]);
}

#[test]
fn version_zero_document_is_upgraded_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old.json");
    let mut row = serde_json::to_value(episode(5)).unwrap();
    let legacy = json!({ "rows": [ { "closeTime": 5, "episode": row.take() } ] });
    std::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).unwrap();

    let s = FileDatasetStore::open(&path).unwrap();
    let rows = s.rows(DatasetKind::Any).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].origin, EpisodeOrigin::ThisInstance);
    assert!(!rows[0].validation);

    let on_disk: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(on_disk["schemaVersion"], json!(SCHEMA_VERSION));
    assert_eq!(read_rows(&path).unwrap(), rows);
}

#[test]
fn corrupt_document_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, b"[1, 2").unwrap();
    assert!(matches!(
        FileDatasetStore::open(&path),
        Err(DatasetError::Corrupt(_))
    ));
}

#[test]
fn upgrades_are_idempotent() {
    let mut doc = json!({
        "rows": [ { "closeTime": 1 }, { "closeTime": 2, "origin": 1, "validation": true } ]
    });
    migrate(&mut doc).unwrap();
    let once = doc.clone();
    assert_eq!(migrate(&mut doc).unwrap(), SCHEMA_VERSION);
    assert_eq!(doc, once);
    assert_eq!(doc["rows"][0]["origin"], json!(0));
    assert_eq!(doc["rows"][1]["validation"], json!(true));
}

#[test]
fn assignment_follows_the_draw() {
    let mut s = MemoryDatasetStore::new();
    let policy = SplitPolicy::default();
    let mut rng = SequenceRandom::new(vec![0.95, 0.2]);
    assert!(insert_assigned(&mut s, &episode(1), policy, &mut rng).unwrap());
    assert!(!insert_assigned(&mut s, &episode(2), policy, &mut rng).unwrap());
}

#[test]
fn rebalance_promotes_the_surplus() {
    let mut s = MemoryDatasetStore::new();
    for t in 0..40 {
        s.insert(&episode(t), true).unwrap();
    }
    let policy = SplitPolicy {
        training_fraction: 0.75,
        tolerance: 20,
    };
    // 40 validation rows, 10 expected: 30 surplus.
    let promoted = rebalance(&mut s, policy, &mut SmallRandom::seeded(3)).unwrap();
    assert_eq!(promoted, 30);
    assert_eq!(s.count(DatasetKind::Validation).unwrap(), 10);
    assert_eq!(rebalance(&mut s, policy, &mut SmallRandom::seeded(3)).unwrap(), 0);
}

proptest! {
    #[test]
    fn rebalance_keeps_validation_within_tolerance(
        flags in proptest::collection::vec(any::<bool>(), 0..200),
        fraction in 0.05f64..1.0,
        tolerance in 0usize..30,
        seed in any::<u64>(),
    ) {
        let mut s = MemoryDatasetStore::new();
        let mut rng = SmallRandom::seeded(seed);
        let policy = SplitPolicy { training_fraction: fraction, tolerance };
        let mut training_seen: Vec<i64> = Vec::new();
        for (i, validation) in flags.iter().enumerate() {
            s.insert(&episode(i as i64), *validation).unwrap();
            rebalance(&mut s, policy, &mut rng).unwrap();

            let total = s.count(DatasetKind::Any).unwrap();
            let validation = s.count(DatasetKind::Validation).unwrap();
            prop_assert!(validation <= expected_validation(total, fraction) + tolerance);

            let training = s.close_times(DatasetKind::Training).unwrap();
            for t in &training_seen {
                prop_assert!(training.contains(t));
            }
            training_seen = training;
        }
    }
}
