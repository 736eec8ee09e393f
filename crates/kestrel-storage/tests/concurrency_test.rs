//! Concurrent writers, readers and saves against one map, in both
//! execution modes.

use std::collections::{BTreeMap as Model, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

use kestrel_storage::{BTreeMap, ExecutionMode, StorageConfig};

const THREADS: i64 = 8;

const MODES: [ExecutionMode; 2] = [ExecutionMode::Synchronous, ExecutionMode::Pooled];

fn config(dir: &Path, mode: ExecutionMode) -> StorageConfig {
    StorageConfig::new(dir)
        .page_split_size(512)
        .execution_mode(mode)
        .handler_threads(4)
}

// =============================================================================
// Writers
// =============================================================================

#[test]
fn test_disjoint_writers_match_a_serial_run() {
    for mode in MODES {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), mode);
        let map: BTreeMap<i64, i64> = BTreeMap::open("writers", config.clone()).unwrap();

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let map = map.clone();
                thread::spawn(move || {
                    let base = t * 100_000;
                    for key in base..base + 1500 {
                        map.put(key, key + 1).unwrap();
                    }
                    for key in (base..base + 1500).filter(|k| k % 3 == 0) {
                        assert_eq!(map.remove(&key).unwrap(), Some(key + 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut model = Model::new();
        for t in 0..THREADS {
            for key in (t * 100_000..t * 100_000 + 1500).filter(|k| k % 3 != 0) {
                model.insert(key, key + 1);
            }
        }
        let expected: Vec<(i64, i64)> = model.into_iter().collect();
        let actual: Vec<(i64, i64)> = map.cursor(None).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(map.size(), expected.len() as u64, "{mode:?}");
        assert_eq!(actual, expected, "{mode:?}");

        map.close().unwrap();
        let reopened: BTreeMap<i64, i64> = BTreeMap::open("writers", config).unwrap();
        assert_eq!(reopened.size(), expected.len() as u64);
        reopened.close().unwrap();
    }
}

#[test]
fn test_concurrent_appends_are_unique_and_increasing() {
    for mode in MODES {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), mode);
        let map: BTreeMap<i64, String> = BTreeMap::open("log", config).unwrap();

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let map = map.clone();
                thread::spawn(move || {
                    (0..1000)
                        .map(|i| map.append(format!("{t}-{i}")).unwrap())
                        .collect::<Vec<i64>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let keys = handle.join().unwrap();
            assert!(keys.windows(2).all(|w| w[0] < w[1]));
            for key in keys {
                assert!(all.insert(key), "duplicate key {key}");
            }
        }
        assert_eq!(all.len(), 8000);
        assert_eq!(map.size(), 8000);
        assert_eq!(map.first_key().unwrap(), Some(0));
        assert_eq!(map.last_key().unwrap(), Some(7999));
        map.close().unwrap();
    }
}

#[test]
fn test_replace_race_has_one_winner() {
    for mode in MODES {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), mode);
        let map: BTreeMap<i64, String> = BTreeMap::open("race", config).unwrap();

        for round in 0..200 {
            let key = round % 17;
            map.put(key, "v0".to_string()).unwrap();
            let barrier = Arc::new(Barrier::new(2));
            let contenders: Vec<_> = ["v1", "v2"]
                .into_iter()
                .map(|value| {
                    let map = map.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        map.replace(key, "v0".to_string(), value.to_string()).unwrap()
                    })
                })
                .collect();
            let won: Vec<bool> = contenders.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(won.iter().filter(|w| **w).count(), 1, "round {round}: {won:?}");
            let winner = if won[0] { "v1" } else { "v2" };
            assert_eq!(map.get(&key).unwrap().as_deref(), Some(winner));
        }
        map.close().unwrap();
    }
}

#[test]
fn test_appends_never_overwrite_concurrent_puts() {
    for mode in MODES {
        let dir = tempdir().unwrap();
        let map: BTreeMap<i64, String> = BTreeMap::open("mixed", config(dir.path(), mode)).unwrap();

        let putter = {
            let map = map.clone();
            thread::spawn(move || {
                for key in 0..3000 {
                    map.put(key, format!("put-{key}")).unwrap();
                }
            })
        };
        let appender = {
            let map = map.clone();
            thread::spawn(move || {
                (0..3000)
                    .map(|i| map.append(format!("append-{i}")).unwrap())
                    .collect::<Vec<i64>>()
            })
        };
        putter.join().unwrap();
        let appended = appender.join().unwrap();

        assert!(appended.windows(2).all(|w| w[0] < w[1]));
        // a put either came after the append and won, or the append moved on
        for key in 0..3000 {
            assert_eq!(map.get(&key).unwrap(), Some(format!("put-{key}")), "{mode:?} key {key}");
        }
        for key in appended.iter().filter(|k| **k >= 3000) {
            assert!(map.get(key).unwrap().unwrap().starts_with("append-"));
        }
        assert_eq!(map.size(), map.cursor(None).unwrap().count() as u64, "{mode:?}");
        map.close().unwrap();
    }
}

// =============================================================================
// Readers and saves
// =============================================================================

fn copy_chunk_files(from: &Path, to: &Path) {
    for entry in std::fs::read_dir(from).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|ext| ext == "chunk") {
            std::fs::copy(&path, to.join(path.file_name().unwrap())).unwrap();
        }
    }
}

#[test]
fn test_cursors_stay_ordered_while_the_tree_splits() {
    let dir = tempdir().unwrap();
    let map: BTreeMap<i64, i64> =
        BTreeMap::open("scan", StorageConfig::new(dir.path()).page_split_size(256)).unwrap();
    for key in (0..20_000).step_by(10) {
        map.put(key, key).unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let map = map.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut key = 1;
            while !stop.load(Ordering::Relaxed) && key < 20_000 {
                map.put(key, key).unwrap();
                key += 7;
            }
        })
    };

    for _ in 0..20 {
        let keys: Vec<i64> = map.cursor(None).unwrap().map(|e| e.unwrap().0).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        // every key present before the scan started is seen
        let seen: HashSet<i64> = keys.into_iter().collect();
        assert!((0..20_000).step_by(10).all(|k| seen.contains(&k)));
    }
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}

#[test]
fn test_saves_during_writes_persist_everything() {
    let dir = tempdir().unwrap();
    let config = StorageConfig::new(dir.path()).page_split_size(512);
    let map: BTreeMap<i64, String> = BTreeMap::open("busy", config.clone()).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let saver = {
        let map = map.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut saves = 0;
            while !done.load(Ordering::Acquire) {
                if map.save().unwrap() {
                    saves += 1;
                }
                map.compact().unwrap();
            }
            saves
        })
    };
    let writers: Vec<_> = (0..4i64)
        .map(|t| {
            let map = map.clone();
            thread::spawn(move || {
                for i in 0..3000 {
                    let key = i * 4 + t;
                    map.put(key, format!("{key}")).unwrap();
                    if i % 5 == 0 {
                        map.remove(&key).unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    let saves = saver.join().unwrap();
    println!("  {saves} saves ran alongside the writers");

    let expected: HashSet<i64> = (0..4i64)
        .flat_map(|t| (0..3000).filter(|i| i % 5 != 0).map(move |i| i * 4 + t))
        .collect();
    map.close().unwrap();

    let map: BTreeMap<i64, String> = BTreeMap::open("busy", config).unwrap();
    let entries: Vec<(i64, String)> = map.cursor(None).unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(entries.len(), expected.len());
    assert_eq!(map.size(), expected.len() as u64);
    for (key, value) in entries {
        assert!(expected.contains(&key));
        assert_eq!(value, key.to_string());
    }
}

#[test]
fn test_recovery_point_after_save_and_compact_is_readable() {
    let dir = tempdir().unwrap();
    let config = StorageConfig::new(dir.path()).page_split_size(512).min_fill_rate(50);
    let map: BTreeMap<i64, String> = BTreeMap::open("crash", config).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let writers: Vec<_> = (0..4i64)
        .map(|t| {
            let map = map.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut round = 0;
                while !done.load(Ordering::Acquire) {
                    for i in 0..200 {
                        let key = i * 4 + t;
                        map.put(key, format!("{key}")).unwrap();
                        if (i + round) % 7 == 0 {
                            map.remove(&key).unwrap();
                        }
                    }
                    round += 1;
                }
            })
        })
        .collect();

    // each pass leaves the files a crash right after it would leave
    let mut readable = 0;
    for _ in 0..25 {
        map.save().unwrap();
        map.compact().unwrap();
        let snapshot = tempdir().unwrap();
        copy_chunk_files(dir.path(), snapshot.path());

        let recovered: BTreeMap<i64, String> =
            BTreeMap::open("crash", StorageConfig::new(snapshot.path()).read_only(true)).unwrap();
        let entries: Vec<(i64, String)> = recovered.cursor(None).unwrap().map(|e| e.unwrap()).collect();
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        for (key, value) in &entries {
            assert_eq!(value, &key.to_string());
            assert_eq!(recovered.get(key).unwrap().as_ref(), Some(value));
        }
        if !entries.is_empty() {
            readable += 1;
        }
        recovered.close().unwrap();
    }
    done.store(true, Ordering::Release);
    for writer in writers {
        writer.join().unwrap();
    }
    assert!(readable > 0);
    map.close().unwrap();
}

// =============================================================================
// Callbacks
// =============================================================================

#[tokio::test]
async fn test_callbacks_bridge_to_async_callers() {
    let dir = tempdir().unwrap();
    let config = StorageConfig::new(dir.path())
        .execution_mode(ExecutionMode::Pooled)
        .handler_threads(2);
    let map: BTreeMap<i64, String> = BTreeMap::open("async", config).unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    map.put_async(1, "one".to_string(), move |r| {
        let _ = tx.send(r);
    });
    assert_eq!(rx.await.unwrap().unwrap(), None);

    let (tx, rx) = tokio::sync::oneshot::channel();
    map.append_async("two".to_string(), move |r| {
        let _ = tx.send(r);
    });
    assert_eq!(rx.await.unwrap().unwrap(), 2);

    let (tx, rx) = tokio::sync::oneshot::channel();
    map.replace_async(1, "one".to_string(), "uno".to_string(), move |r| {
        let _ = tx.send(r);
    });
    assert!(rx.await.unwrap().unwrap());

    let (tx, rx) = tokio::sync::oneshot::channel();
    map.get_async(1, move |r| {
        let _ = tx.send(r);
    });
    assert_eq!(rx.await.unwrap().unwrap().as_deref(), Some("uno"));

    let (tx, rx) = tokio::sync::oneshot::channel();
    map.cursor_async(None, move |r| {
        let _ = tx.send(r.map(|cursor| cursor.map(|e| e.map(|(k, _)| k)).collect::<Vec<_>>()));
    });
    let keys: Vec<i64> = rx.await.unwrap().unwrap().into_iter().map(|k| k.unwrap()).collect();
    assert_eq!(keys, vec![1, 2]);

    let (tx, rx) = tokio::sync::oneshot::channel();
    map.close_async(move |r| {
        let _ = tx.send(r);
    });
    rx.await.unwrap().unwrap();
    assert!(map.is_closed());
}
