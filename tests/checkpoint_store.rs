use serde_json::Value;
use std::fs;
use tallyline::event_model::checkpoint::CheckpointLoadError;
use tallyline::event_model::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, OffsetCheckpoint, OffsetManager,
    PersistError,
};
use tallyline::runtime::RetryPolicy;
use tempfile::tempdir;

fn checkpoint(offset: u64, sum: i64) -> OffsetCheckpoint {
    OffsetCheckpoint {
        offset,
        sum,
        event_count: offset + 1,
        committed_at_ms: 1_000 + offset,
    }
}

#[test]
fn missing_file_means_fresh_start() {
    let dir = tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("absent.json"));
    assert!(store.load().unwrap().is_none());
}

#[test]
fn file_store_persists_atomically_and_reloads() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("cp.json");
    let mut store = FileCheckpointStore::new(&path);
    store.persist(&checkpoint(3, 6)).unwrap();
    store.persist(&checkpoint(5, 9)).unwrap();

    let reopened = FileCheckpointStore::new(&path);
    assert_eq!(reopened.load().unwrap(), Some(checkpoint(5, 9)));
    let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 1, "temp file must be renamed away: {leftovers:?}");
}

#[test]
fn tampered_checkpoint_fails_verification() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cp.json");
    FileCheckpointStore::new(&path)
        .persist(&checkpoint(8, 20))
        .unwrap();
    let mut document: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    document["checkpoint"]["sum"] = Value::from(21);
    fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();

    let err = FileCheckpointStore::new(&path)
        .load()
        .expect_err("checksum must catch the edit");
    assert!(matches!(err, CheckpointLoadError::ChecksumMismatch { .. }));
}

#[test]
fn unknown_format_version_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cp.json");
    FileCheckpointStore::new(&path)
        .persist(&checkpoint(1, 1))
        .unwrap();
    let mut document: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    document["format"] = Value::from(99);
    fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();
    let err = FileCheckpointStore::new(&path).load().expect_err("format");
    assert!(matches!(
        err,
        CheckpointLoadError::UnsupportedFormat { format: 99, .. }
    ));
}

#[test]
fn garbage_file_is_a_parse_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cp.json");
    fs::write(&path, b"{\"format\": 1").unwrap();
    let err = FileCheckpointStore::new(&path).load().expect_err("parse");
    assert!(matches!(err, CheckpointLoadError::Parse { .. }));
}

#[test]
fn manager_gates_offsets_on_durable_persist() {
    let store = MemoryCheckpointStore::with_checkpoint(checkpoint(2, 4));
    let mut manager =
        OffsetManager::open(Box::new(store.clone()), RetryPolicy::immediate(3)).unwrap();
    let gate = manager.gate();
    assert_eq!(manager.load(), Some(checkpoint(2, 4)));
    assert_eq!(gate.durable_offset(), Some(2));

    manager.persist(checkpoint(6, 10)).unwrap();
    assert_eq!(gate.durable_offset(), Some(6));
    assert_eq!(store.current(), Some(checkpoint(6, 10)));
    assert!(manager.is_durable());
}

#[test]
fn manager_retries_transient_store_failures() {
    let store = MemoryCheckpointStore::new();
    store.fail_next(2);
    let mut manager =
        OffsetManager::open(Box::new(store.clone()), RetryPolicy::immediate(3)).unwrap();
    manager.persist(checkpoint(0, 1)).unwrap();
    assert_eq!(store.history(), vec![checkpoint(0, 1)]);
}

#[test]
fn exhausted_persist_keeps_previous_durable_offset() {
    let store = MemoryCheckpointStore::new();
    let mut manager =
        OffsetManager::open(Box::new(store.clone()), RetryPolicy::immediate(2)).unwrap();
    let gate = manager.gate();
    manager.persist(checkpoint(1, 1)).unwrap();

    store.fail_next(2);
    let err = manager
        .persist(checkpoint(4, 7))
        .expect_err("budget of two attempts is spent");
    assert!(matches!(err, PersistError::Exhausted { attempts: 2, .. }));
    assert!(!manager.is_durable());
    assert_eq!(gate.durable_offset(), Some(1));
    assert_eq!(manager.durable(), Some(&checkpoint(1, 1)));

    // The next committed snapshot restores durability.
    manager.persist(checkpoint(5, 8)).unwrap();
    assert!(manager.is_durable());
    assert_eq!(gate.durable_offset(), Some(5));
}

#[test]
fn checkpoint_never_regresses() {
    let store = MemoryCheckpointStore::with_checkpoint(checkpoint(10, 3));
    let mut manager = OffsetManager::open(Box::new(store.clone()), RetryPolicy::immediate(1)).unwrap();
    let err = manager.persist(checkpoint(9, 2)).expect_err("regression");
    assert!(matches!(
        err,
        PersistError::Regression {
            durable: 10,
            attempted: 9,
        }
    ));
    manager.persist(checkpoint(10, 3)).unwrap();
    assert!(store.history().is_empty(), "same offset is already durable");
}
