//! A directory of named maps sharing one set of background resources.
//!
//! ```text
//! data_dir/
//! ├── .lock            held while the storage is open
//! ├── users/           one subdirectory of chunk files per map
//! └── events/
//! ```
//!
//! The storage owns the handler pool used by its maps in pooled execution
//! mode, the maintenance task that saves and compacts them, and the
//! exception handler told when a map's store panics.

use crate::btree::{BTreeMap, BackgroundExceptionHandler, MapContext, PageOperationHandlerFactory};
use crate::maintenance::MaintenanceTask;
use kestrel_chunk::{DirLock, FileSystem, LocalFileSystem};
use kestrel_common::{DataType, ExecutionMode, KestrelError, Result, StorageConfig};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Type-erased view of an open map, enough for maintenance and shutdown.
trait OpenMap: Send + Sync {
    fn is_closed(&self) -> bool;
    fn save_and_compact(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
}

impl<K: DataType, V: DataType> OpenMap for BTreeMap<K, V> {
    fn is_closed(&self) -> bool {
        BTreeMap::is_closed(self)
    }

    fn save_and_compact(&self) -> Result<()> {
        if self.is_closed() || self.is_read_only() {
            return Ok(());
        }
        self.save()?;
        self.compact()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        BTreeMap::close(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type Registry = Arc<Mutex<HashMap<String, Arc<dyn OpenMap>>>>;

/// A storage directory holding any number of named maps.
pub struct BTreeStorage {
    config: StorageConfig,
    fs: Arc<dyn FileSystem>,
    maps: Registry,
    handlers: Option<Arc<PageOperationHandlerFactory>>,
    exception_handler: Option<BackgroundExceptionHandler>,
    maintenance: Mutex<Option<MaintenanceTask>>,
    dir_lock: Mutex<Option<DirLock>>,
    closed: AtomicBool,
}

impl BTreeStorage {
    /// Opens the storage at `config.data_dir`, creating it if missing.
    pub fn open(config: StorageConfig) -> Result<Self> {
        Self::open_with_handler(config, None)
    }

    /// Opens the storage with a handler told about every map whose store
    /// panics, including failures of background saves.
    pub fn open_with_handler(
        config: StorageConfig,
        exception_handler: Option<BackgroundExceptionHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let dir_lock = if config.read_only {
            if !config.data_dir.is_dir() {
                return Err(KestrelError::ConfigError(format!(
                    "storage directory {} does not exist",
                    config.data_dir.display()
                )));
            }
            None
        } else {
            fs.create_dir_all(&config.data_dir)?;
            Some(fs.lock(&config.data_dir)?)
        };
        let handlers = match config.execution_mode {
            ExecutionMode::Pooled => Some(PageOperationHandlerFactory::new(config.handler_threads)?),
            ExecutionMode::Synchronous => None,
        };

        let maps: Registry = Arc::new(Mutex::new(HashMap::new()));
        let maintenance = match config.maintenance_interval() {
            Some(interval) if !config.read_only => {
                let maps = Arc::clone(&maps);
                Some(MaintenanceTask::start(interval, move || maintain_all(&maps))?)
            }
            _ => None,
        };

        info!(
            dir = %config.data_dir.display(),
            mode = ?config.execution_mode,
            read_only = config.read_only,
            "Opened storage"
        );
        Ok(Self {
            config,
            fs,
            maps,
            handlers,
            exception_handler,
            maintenance: Mutex::new(maintenance),
            dir_lock: Mutex::new(dir_lock),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(KestrelError::Closed);
        }
        Ok(())
    }

    fn map_dir(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(KestrelError::InvalidParameter {
                name: "map name".to_string(),
                value: name.to_string(),
            });
        }
        Ok(self.config.data_dir.join(name))
    }

    /// Opens the map called `name`, creating it if it does not exist.
    ///
    /// Opening a map that is already open returns another handle to it.
    /// The key and value types must match the ones it was first opened
    /// with in this storage.
    pub fn open_map<K: DataType, V: DataType>(&self, name: &str) -> Result<BTreeMap<K, V>> {
        self.check_open()?;
        let dir = self.map_dir(name)?;
        let mut maps = self.maps.lock();
        if maps.get(name).is_some_and(|open| open.is_closed()) {
            maps.remove(name);
        }
        if let Some(open) = maps.get(name) {
            return open
                .as_any()
                .downcast_ref::<BTreeMap<K, V>>()
                .cloned()
                .ok_or_else(|| KestrelError::ConfigError(format!("map {name} is open with other key or value types")));
        }
        if self.config.read_only && !dir.is_dir() {
            return Err(KestrelError::MapNotFound(name.to_string()));
        }
        let map = BTreeMap::open_in(
            name,
            &dir,
            &self.config,
            MapContext {
                fs: Arc::clone(&self.fs),
                handlers: self.handlers.clone(),
                owns_handlers: false,
                exception_handler: self.exception_handler.clone(),
                dir_lock: None,
            },
        )?;
        maps.insert(name.to_string(), Arc::new(map.clone()));
        Ok(map)
    }

    /// Names of all maps in the storage, open or not, sorted.
    pub fn map_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn has_map(&self, name: &str) -> bool {
        self.map_dir(name).is_ok_and(|dir| dir.is_dir())
    }

    /// Deletes the map called `name` with all of its data. Open handles of
    /// it become closed.
    pub fn remove_map(&self, name: &str) -> Result<()> {
        self.check_open()?;
        if self.config.read_only {
            return Err(KestrelError::ReadOnly);
        }
        let dir = self.map_dir(name)?;
        let open = self.maps.lock().remove(name);
        match open {
            Some(map) => {
                map.close()?;
            }
            None if !dir.is_dir() => return Err(KestrelError::MapNotFound(name.to_string())),
            None => {}
        }
        self.fs.remove_dir_all(&dir)?;
        info!(map = name, "Removed map from storage");
        Ok(())
    }

    /// Saves and compacts every open map once.
    pub fn maintain(&self) -> Result<()> {
        self.check_open()?;
        maintain_all(&self.maps)
    }

    /// Stops maintenance and closes every open map. The first error seen
    /// is returned after all maps were closed.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut task) = self.maintenance.lock().take() {
            task.stop();
        }
        let open: Vec<(String, Arc<dyn OpenMap>)> = self.maps.lock().drain().collect();
        let mut first_error = None;
        for (name, map) in open {
            if let Err(e) = map.close() {
                warn!(map = %name, error = %e, "Failed to close map");
                first_error.get_or_insert(e);
            }
        }
        if let Some(handlers) = &self.handlers {
            handlers.shutdown();
        }
        self.dir_lock.lock().take();
        info!(dir = %self.config.data_dir.display(), "Closed storage");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for BTreeStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close storage on drop");
        }
    }
}

impl std::fmt::Debug for BTreeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeStorage")
            .field("data_dir", &self.config.data_dir)
            .field("open_maps", &self.maps.lock().len())
            .finish()
    }
}

fn maintain_all(maps: &Registry) -> Result<()> {
    let open: Vec<Arc<dyn OpenMap>> = maps.lock().values().cloned().collect();
    let mut first_error = None;
    for map in open {
        if let Err(e) = map.save_and_compact() {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_map_returns_shared_handle() {
        let dir = tempdir().unwrap();
        let storage = BTreeStorage::open(StorageConfig::new(dir.path())).unwrap();
        let a: BTreeMap<i64, String> = storage.open_map("users").unwrap();
        let b: BTreeMap<i64, String> = storage.open_map("users").unwrap();
        a.put(1, "ada".to_string()).unwrap();
        assert_eq!(b.get(&1).unwrap(), Some("ada".to_string()));
        assert!(storage.open_map::<String, String>("users").is_err());
    }

    #[test]
    fn test_map_names_and_remove() {
        let dir = tempdir().unwrap();
        let storage = BTreeStorage::open(StorageConfig::new(dir.path())).unwrap();
        let users: BTreeMap<i64, i64> = storage.open_map("users").unwrap();
        let _events: BTreeMap<i64, i64> = storage.open_map("events").unwrap();
        users.put(1, 1).unwrap();
        users.save().unwrap();
        assert_eq!(storage.map_names().unwrap(), vec!["events".to_string(), "users".to_string()]);

        storage.remove_map("users").unwrap();
        assert!(users.is_closed());
        assert!(!storage.has_map("users"));
        assert_eq!(storage.map_names().unwrap(), vec!["events".to_string()]);
        assert!(matches!(storage.remove_map("users"), Err(KestrelError::MapNotFound(_))));
    }

    #[test]
    fn test_rejects_bad_map_names() {
        let dir = tempdir().unwrap();
        let storage = BTreeStorage::open(StorageConfig::new(dir.path())).unwrap();
        for name in ["", "..", "a/b", "x y"] {
            assert!(storage.open_map::<i64, i64>(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn test_directory_lock_blocks_second_open() {
        let dir = tempdir().unwrap();
        let storage = BTreeStorage::open(StorageConfig::new(dir.path())).unwrap();
        assert!(matches!(
            BTreeStorage::open(StorageConfig::new(dir.path())),
            Err(KestrelError::Locked(_))
        ));
        storage.close().unwrap();
        assert!(storage.is_closed());
        assert!(storage.open_map::<i64, i64>("late").is_err());
        BTreeStorage::open(StorageConfig::new(dir.path())).unwrap();
    }

    #[test]
    fn test_close_persists_every_map() {
        let dir = tempdir().unwrap();
        {
            let storage = BTreeStorage::open(StorageConfig::new(dir.path())).unwrap();
            for name in ["a", "b"] {
                let map: BTreeMap<i64, i64> = storage.open_map(name).unwrap();
                for key in 0..50 {
                    map.put(key, key).unwrap();
                }
            }
            storage.close().unwrap();
        }
        let storage = BTreeStorage::open(StorageConfig::new(dir.path())).unwrap();
        for name in ["a", "b"] {
            let map: BTreeMap<i64, i64> = storage.open_map(name).unwrap();
            assert_eq!(map.size(), 50);
            assert_eq!(map.get(&49).unwrap(), Some(49));
        }
    }

    #[test]
    fn test_maintain_saves_open_maps() {
        let dir = tempdir().unwrap();
        let storage = BTreeStorage::open(StorageConfig::new(dir.path())).unwrap();
        let map: BTreeMap<i64, i64> = storage.open_map("m").unwrap();
        map.put(7, 70).unwrap();
        storage.maintain().unwrap();
        assert!(!map.inner().store.has_unsaved_changes());
    }
}
