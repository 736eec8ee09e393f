//! Storage container tests: named maps, background maintenance and
//! corruption reporting.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use kestrel_storage::{
    BTreeMap, BTreeStorage, BackgroundExceptionHandler, ExecutionMode, KestrelError, StorageConfig,
};

fn chunk_files(dir: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .collect()
}

#[test]
fn test_named_maps_survive_reopen() {
    let dir = tempdir().unwrap();
    let config = StorageConfig::new(dir.path())
        .execution_mode(ExecutionMode::Pooled)
        .handler_threads(2)
        .maintenance_interval_secs(0);
    {
        let storage = BTreeStorage::open(config.clone()).unwrap();
        let users: BTreeMap<i64, String> = storage.open_map("users").unwrap();
        let events: BTreeMap<String, u64> = storage.open_map("events").unwrap();
        let scratch: BTreeMap<i64, i64> = storage.open_map("scratch").unwrap();
        for id in 0..300 {
            users.put(id, format!("user-{id}")).unwrap();
            events.put(format!("event-{id:04}"), id as u64).unwrap();
            scratch.put(id, id).unwrap();
        }
        storage.remove_map("scratch").unwrap();
        assert!(scratch.is_closed());
        storage.close().unwrap();
        assert!(users.is_closed());
    }

    let storage = BTreeStorage::open(config).unwrap();
    assert_eq!(storage.map_names().unwrap(), vec!["events".to_string(), "users".to_string()]);
    let users: BTreeMap<i64, String> = storage.open_map("users").unwrap();
    let events: BTreeMap<String, u64> = storage.open_map("events").unwrap();
    assert_eq!(users.size(), 300);
    assert_eq!(users.get(&299).unwrap().as_deref(), Some("user-299"));
    assert_eq!(events.first_key().unwrap().as_deref(), Some("event-0000"));
    assert_eq!(events.ceiling_key(&"event-0150x".to_string()).unwrap().as_deref(), Some("event-0151"));
}

#[test]
fn test_maintenance_saves_in_the_background() {
    let dir = tempdir().unwrap();
    let storage = BTreeStorage::open(StorageConfig::new(dir.path()).maintenance_interval_secs(1)).unwrap();
    let map: BTreeMap<i64, i64> = storage.open_map("bg").unwrap();
    for key in 0..100 {
        map.put(key, key).unwrap();
    }

    let map_dir = dir.path().join("bg");
    let deadline = Instant::now() + Duration::from_secs(10);
    while chunk_files(&map_dir).is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!chunk_files(&map_dir).is_empty(), "no chunk written by maintenance");
    storage.close().unwrap();
}

#[test]
fn test_corruption_notifies_the_exception_handler() {
    let dir = tempdir().unwrap();
    let config = StorageConfig::new(dir.path()).maintenance_interval_secs(0);
    {
        let storage = BTreeStorage::open(config.clone()).unwrap();
        let map: BTreeMap<i64, String> = storage.open_map("fragile").unwrap();
        map.put(1, "one".to_string()).unwrap();
        storage.close().unwrap();
    }

    // damage the check value of the only page, which starts after the
    // 128 byte chunk header
    let files = chunk_files(&dir.path().join("fragile"));
    assert_eq!(files.len(), 1);
    let mut raw = std::fs::read(&files[0]).unwrap();
    raw[128 + 5] ^= 0xff;
    std::fs::write(&files[0], raw).unwrap();

    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);
    let handler: BackgroundExceptionHandler = Arc::new(move |e: &KestrelError| {
        assert!(e.is_corruption(), "{e}");
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let storage = BTreeStorage::open_with_handler(config, Some(handler)).unwrap();
    let opened = storage.open_map::<i64, String>("fragile");
    assert!(opened.unwrap_err().is_corruption());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[test]
fn test_read_only_storage() {
    let dir = tempdir().unwrap();
    {
        let storage = BTreeStorage::open(StorageConfig::new(dir.path())).unwrap();
        let map: BTreeMap<i64, i64> = storage.open_map("data").unwrap();
        map.put(1, 10).unwrap();
        storage.close().unwrap();
    }

    let storage = BTreeStorage::open(StorageConfig::new(dir.path()).read_only(true)).unwrap();
    let map: BTreeMap<i64, i64> = storage.open_map("data").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(10));
    assert!(matches!(map.put(2, 20), Err(KestrelError::ReadOnly)));
    assert!(matches!(storage.open_map::<i64, i64>("missing"), Err(KestrelError::MapNotFound(_))));
    assert!(matches!(storage.remove_map("data"), Err(KestrelError::ReadOnly)));
}
