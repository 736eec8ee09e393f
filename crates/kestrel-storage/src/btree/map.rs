//! The public key-value map.
//!
//! A [`BTreeMap`] is a cheap handle to shared map state. Reads descend the
//! tree directly on the calling thread. Writes are [`SingleWrite`]
//! operations, run either on the calling thread or on a pooled handler
//! depending on the execution mode. Every operation also has an `_async`
//! form that hands its result to a callback instead of returning it.

use super::cursor::{seek_key, BTreeCursor, Direction};
use super::handler::{
    on_pooled_thread, run_to_completion, with_local_handler, CompletionListener, PageOperationHandlerFactory,
};
use super::operations::{Callback, MapOperation, MapTask, SingleWrite, WriteOp, WriteResult};
use super::store::{BTreeStore, BackgroundExceptionHandler};
use kestrel_cache::CacheStats;
use kestrel_chunk::{ChunkStats, DirLock, FileSystem, LocalFileSystem};
use kestrel_common::{DataType, ExecutionMode, KestrelError, Result, SequenceKey, StorageConfig};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// State shared by every handle of one map.
pub(crate) struct MapInner<K, V> {
    pub(crate) name: String,
    pub(crate) store: BTreeStore<K, V>,
    pub(crate) size: AtomicU64,
    /// Largest key sequence seen, the source of appended keys.
    pub(crate) max_key: AtomicI64,
    /// Shared by operations and saves, exclusive for clear, remove and close.
    pub(crate) lock: RwLock<()>,
    handlers: Option<Arc<PageOperationHandlerFactory>>,
    /// The handler pool was started for this map alone.
    owns_handlers: bool,
    dir_lock: Mutex<Option<DirLock>>,
}

/// Everything a map needs from whoever opens it.
pub(crate) struct MapContext {
    pub fs: Arc<dyn FileSystem>,
    pub handlers: Option<Arc<PageOperationHandlerFactory>>,
    pub owns_handlers: bool,
    pub exception_handler: Option<BackgroundExceptionHandler>,
    pub dir_lock: Option<DirLock>,
}

/// Point-in-time statistics of a map.
#[derive(Debug, Clone)]
pub struct MapStats {
    pub name: String,
    pub size: u64,
    pub cache: CacheStats,
    pub chunks: ChunkStats,
}

/// A persistent ordered map.
pub struct BTreeMap<K, V> {
    inner: Arc<MapInner<K, V>>,
}

impl<K, V> Clone for BTreeMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: DataType, V: DataType> BTreeMap<K, V> {
    /// Opens a standalone map stored directly in `config.data_dir`.
    ///
    /// The directory is locked against other writers until the map is
    /// closed. In pooled execution mode the map starts its own handlers.
    pub fn open(name: &str, config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let dir_lock = if config.read_only {
            None
        } else {
            fs.create_dir_all(&config.data_dir)?;
            Some(fs.lock(&config.data_dir)?)
        };
        let handlers = match config.execution_mode {
            ExecutionMode::Pooled => Some(PageOperationHandlerFactory::new(config.handler_threads)?),
            ExecutionMode::Synchronous => None,
        };
        let dir = config.data_dir.clone();
        Self::open_in(
            name,
            &dir,
            &config,
            MapContext {
                fs,
                handlers,
                owns_handlers: true,
                exception_handler: None,
                dir_lock,
            },
        )
    }

    pub(crate) fn open_in(name: &str, dir: &Path, config: &StorageConfig, context: MapContext) -> Result<Self> {
        let store = BTreeStore::open(context.fs, dir, config, context.exception_handler)?;
        let size = store.persisted_size();
        let map = Self {
            inner: Arc::new(MapInner {
                name: name.to_string(),
                store,
                size: AtomicU64::new(size),
                max_key: AtomicI64::new(-1),
                lock: RwLock::new(()),
                handlers: context.handlers,
                owns_handlers: context.owns_handlers,
                dir_lock: Mutex::new(context.dir_lock),
            }),
        };
        if let Some(sequence) = map.last_key()?.and_then(|key| key.sequence()) {
            map.inner.max_key.store(sequence, Ordering::Release);
        }
        info!(map = name, dir = %dir.display(), size, "Opened map");
        Ok(map)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn inner(&self) -> &Arc<MapInner<K, V>> {
        &self.inner
    }

    /// Number of entries.
    pub fn size(&self) -> u64 {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.store.is_read_only()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.store.check_open().is_err()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn read<R>(&self, read: impl FnOnce(&BTreeStore<K, V>) -> Result<R>) -> Result<R> {
        let _shared = self.inner.lock.read_recursive();
        self.inner.store.check_open()?;
        let _access = self.inner.store.read_access();
        read(&self.inner.store)
    }

    fn lookup(&self, key: &K, columns: Option<&[usize]>) -> Result<Option<V>> {
        self.read(|store| {
            let path = store.walk(key)?;
            let leaf = path
                .leaf_page()
                .as_leaf()
                .ok_or_else(|| KestrelError::Internal("walk ended on a non-leaf page".to_string()))?;
            match leaf.binary_search(key) {
                Ok(index) => store.leaf_value(leaf, index, columns).map(Some),
                Err(_) => Ok(None),
            }
        })
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.lookup(key, None)
    }

    /// Reads only the given value columns of `key`. Columns not asked for
    /// are left empty. Row storage maps always return the whole value.
    pub fn get_columns(&self, key: &K, columns: &[usize]) -> Result<Option<V>> {
        self.lookup(key, Some(columns))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn navigate(&self, key: Option<&K>, direction: Direction, inclusive: bool) -> Result<Option<K>> {
        self.read(|store| seek_key(store, key, direction, inclusive))
    }

    pub fn first_key(&self) -> Result<Option<K>> {
        self.navigate(None, Direction::Forward, true)
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        self.navigate(None, Direction::Backward, true)
    }

    /// Greatest key strictly below `key`.
    pub fn lower_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate(Some(key), Direction::Backward, false)
    }

    /// Greatest key at or below `key`.
    pub fn floor_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate(Some(key), Direction::Backward, true)
    }

    /// Least key strictly above `key`.
    pub fn higher_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate(Some(key), Direction::Forward, false)
    }

    /// Least key at or above `key`.
    pub fn ceiling_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate(Some(key), Direction::Forward, true)
    }

    /// Iterates ascending from the least key at or above `from`, or from
    /// the first key.
    pub fn cursor(&self, from: Option<&K>) -> Result<BTreeCursor<K, V>> {
        self.inner.store.check_open()?;
        Ok(BTreeCursor::new(Arc::clone(&self.inner), from.cloned()))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn write(&self, op: WriteOp<K, V>) -> SingleWrite<K, V> {
        SingleWrite::new(Arc::clone(&self.inner), op)
    }

    /// Runs an operation and waits for its output.
    fn execute<O: MapOperation + 'static>(&self, mut op: O) -> Result<O::Output> {
        match &self.inner.handlers {
            Some(handlers) if !on_pooled_thread() => {
                let listener = CompletionListener::new();
                let done = Arc::clone(&listener);
                handlers.submit(Box::new(Callback::new(op, move |result| done.complete(result))));
                listener.wait()
            }
            _ => {
                with_local_handler(|handler| run_to_completion(&mut op, handler))?;
                op.take_output()
            }
        }
    }

    /// Runs an operation and hands its output to `callback`. Without
    /// pooled handlers the callback runs before this returns.
    fn submit<O: MapOperation + 'static>(&self, mut op: O, callback: impl FnOnce(Result<O::Output>) + Send + 'static) {
        match &self.inner.handlers {
            Some(handlers) => handlers.submit(Box::new(Callback::new(op, callback))),
            None => {
                let result = with_local_handler(|handler| run_to_completion(&mut op, handler))
                    .and_then(|()| op.take_output());
                callback(result);
            }
        }
    }

    /// Runs `task` against this map as an operation.
    fn spawn<R: Send + 'static>(
        &self,
        task: impl FnOnce(&BTreeMap<K, V>) -> Result<R> + Send + 'static,
        callback: impl FnOnce(Result<R>) + Send + 'static,
    ) {
        let map = self.clone();
        self.submit(MapTask::new(move || task(&map)), callback);
    }

    /// Inserts or overwrites, returning the previous value.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.execute(self.write(WriteOp::Put { key, value }))?.into_previous()
    }

    /// Inserts only if `key` is absent. Returns the present value otherwise.
    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        self.execute(self.write(WriteOp::PutIfAbsent { key, value }))?.into_previous()
    }

    /// Writes `value` only if the current value equals `expected`.
    pub fn replace(&self, key: K, expected: V, value: V) -> Result<bool> {
        self.execute(self.write(WriteOp::Replace { key, expected, value }))?.into_replaced()
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.execute(self.write(WriteOp::Remove { key: key.clone() }))?.into_previous()
    }

    fn append_op(&self, value: V) -> Result<SingleWrite<K, V>>
    where
        K: SequenceKey,
    {
        self.inner.store.check_writable()?;
        let sequence = self.inner.max_key.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(self.write(WriteOp::Append {
            key: K::from_sequence(sequence),
            value,
            rekey: K::from_sequence,
        }))
    }

    /// Stores `value` under the next key of the map's sequence: one above
    /// the largest key ever written. Keys are unique and increasing across
    /// concurrent callers.
    pub fn append(&self, value: V) -> Result<K>
    where
        K: SequenceKey,
    {
        self.execute(self.append_op(value)?)?.into_appended()
    }

    // ------------------------------------------------------------------
    // Whole-map operations
    // ------------------------------------------------------------------

    /// Removes every entry. Every persisted page becomes garbage at once.
    pub fn clear(&self) -> Result<()> {
        let _exclusive = self.inner.lock.write();
        self.inner.store.clear()?;
        self.inner.size.store(0, Ordering::Release);
        debug!(map = %self.inner.name, "Cleared map");
        Ok(())
    }

    /// Writes the unsaved changes into a new chunk. Returns false if there
    /// were none.
    pub fn save(&self) -> Result<bool> {
        let _shared = self.inner.lock.read_recursive();
        self.inner.store.save(self.size())
    }

    /// Reclaims space held by garbage pages. Returns false if no chunk
    /// qualified.
    pub fn compact(&self) -> Result<bool> {
        let _shared = self.inner.lock.read_recursive();
        self.inner.store.compact(|| self.size())
    }

    /// Saves pending changes and closes the map. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let saved = {
            let _exclusive = self.inner.lock.write();
            if self.inner.store.check_open().is_err() && !self.inner.store.is_panicked() {
                return Ok(());
            }
            let saved = if self.inner.store.check_writable().is_ok() {
                self.inner.store.save(self.size()).map(|_| ())
            } else {
                Ok(())
            };
            self.inner.store.close();
            saved
        };
        self.release();
        info!(map = %self.inner.name, "Closed map");
        saved
    }

    /// Closes the map and deletes all of its files.
    pub fn remove_map(self) -> Result<()> {
        {
            let _exclusive = self.inner.lock.write();
            self.inner.store.destroy()?;
        }
        self.release();
        info!(map = %self.inner.name, "Removed map");
        Ok(())
    }

    fn release(&self) {
        if self.inner.owns_handlers {
            if let Some(handlers) = &self.inner.handlers {
                handlers.shutdown();
            }
        }
        self.inner.dir_lock.lock().take();
    }

    pub fn stats(&self) -> MapStats {
        MapStats {
            name: self.inner.name.clone(),
            size: self.size(),
            cache: self.inner.store.cache_stats(),
            chunks: self.inner.store.chunk_stats(),
        }
    }

    // ------------------------------------------------------------------
    // Callback forms
    // ------------------------------------------------------------------

    pub fn get_async(&self, key: K, callback: impl FnOnce(Result<Option<V>>) + Send + 'static) {
        self.spawn(move |map| map.get(&key), callback);
    }

    pub fn contains_key_async(&self, key: K, callback: impl FnOnce(Result<bool>) + Send + 'static) {
        self.spawn(move |map| map.contains_key(&key), callback);
    }

    pub fn size_async(&self, callback: impl FnOnce(Result<u64>) + Send + 'static) {
        self.spawn(|map| Ok(map.size()), callback);
    }

    pub fn is_empty_async(&self, callback: impl FnOnce(Result<bool>) + Send + 'static) {
        self.spawn(|map| Ok(map.is_empty()), callback);
    }

    pub fn first_key_async(&self, callback: impl FnOnce(Result<Option<K>>) + Send + 'static) {
        self.spawn(|map| map.first_key(), callback);
    }

    pub fn last_key_async(&self, callback: impl FnOnce(Result<Option<K>>) + Send + 'static) {
        self.spawn(|map| map.last_key(), callback);
    }

    pub fn lower_key_async(&self, key: K, callback: impl FnOnce(Result<Option<K>>) + Send + 'static) {
        self.spawn(move |map| map.lower_key(&key), callback);
    }

    pub fn floor_key_async(&self, key: K, callback: impl FnOnce(Result<Option<K>>) + Send + 'static) {
        self.spawn(move |map| map.floor_key(&key), callback);
    }

    pub fn higher_key_async(&self, key: K, callback: impl FnOnce(Result<Option<K>>) + Send + 'static) {
        self.spawn(move |map| map.higher_key(&key), callback);
    }

    pub fn ceiling_key_async(&self, key: K, callback: impl FnOnce(Result<Option<K>>) + Send + 'static) {
        self.spawn(move |map| map.ceiling_key(&key), callback);
    }

    pub fn cursor_async(
        &self,
        from: Option<K>,
        callback: impl FnOnce(Result<BTreeCursor<K, V>>) + Send + 'static,
    ) {
        self.spawn(move |map| map.cursor(from.as_ref()), callback);
    }

    pub fn put_async(&self, key: K, value: V, callback: impl FnOnce(Result<Option<V>>) + Send + 'static) {
        let op = self.write(WriteOp::Put { key, value });
        self.submit(op, move |result| callback(result.and_then(WriteResult::into_previous)));
    }

    pub fn put_if_absent_async(
        &self,
        key: K,
        value: V,
        callback: impl FnOnce(Result<Option<V>>) + Send + 'static,
    ) {
        let op = self.write(WriteOp::PutIfAbsent { key, value });
        self.submit(op, move |result| callback(result.and_then(WriteResult::into_previous)));
    }

    pub fn replace_async(
        &self,
        key: K,
        expected: V,
        value: V,
        callback: impl FnOnce(Result<bool>) + Send + 'static,
    ) {
        let op = self.write(WriteOp::Replace { key, expected, value });
        self.submit(op, move |result| callback(result.and_then(WriteResult::into_replaced)));
    }

    pub fn remove_async(&self, key: K, callback: impl FnOnce(Result<Option<V>>) + Send + 'static) {
        let op = self.write(WriteOp::Remove { key });
        self.submit(op, move |result| callback(result.and_then(WriteResult::into_previous)));
    }

    pub fn append_async(&self, value: V, callback: impl FnOnce(Result<K>) + Send + 'static)
    where
        K: SequenceKey,
    {
        match self.append_op(value) {
            Ok(op) => self.submit(op, move |result| callback(result.and_then(WriteResult::into_appended))),
            Err(e) => callback(Err(e)),
        }
    }

    pub fn clear_async(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        self.spawn(|map| map.clear(), callback);
    }

    pub fn save_async(&self, callback: impl FnOnce(Result<bool>) + Send + 'static) {
        self.spawn(|map| map.save(), callback);
    }

    pub fn close_async(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        self.spawn(|map| map.close(), callback);
    }

    pub fn remove_map_async(self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        self.spawn(|map| map.clone().remove_map(), callback);
    }
}

impl<K: DataType, V: DataType> std::fmt::Debug for BTreeMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeMap")
            .field("name", &self.inner.name)
            .field("size", &self.size())
            .field("dir", &self.inner.store.chunks().dir())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::StorageMode;
    use tempfile::tempdir;

    fn open(dir: &Path) -> BTreeMap<i64, String> {
        BTreeMap::open("test", StorageConfig::new(dir).page_split_size(512)).unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempdir().unwrap();
        let map = open(dir.path());
        assert!(map.is_empty());
        assert_eq!(map.put(1, "one".into()).unwrap(), None);
        assert_eq!(map.put(1, "uno".into()).unwrap().as_deref(), Some("one"));
        assert_eq!(map.get(&1).unwrap().as_deref(), Some("uno"));
        assert!(map.contains_key(&1).unwrap());
        assert_eq!(map.remove(&1).unwrap().as_deref(), Some("uno"));
        assert_eq!(map.remove(&1).unwrap(), None);
        assert!(map.get(&1).unwrap().is_none());
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn test_key_navigation() {
        let dir = tempdir().unwrap();
        let map = open(dir.path());
        assert_eq!(map.first_key().unwrap(), None);
        for key in [10, 20, 30] {
            map.put(key, key.to_string()).unwrap();
        }
        assert_eq!(map.first_key().unwrap(), Some(10));
        assert_eq!(map.last_key().unwrap(), Some(30));
        assert_eq!(map.lower_key(&20).unwrap(), Some(10));
        assert_eq!(map.floor_key(&20).unwrap(), Some(20));
        assert_eq!(map.floor_key(&25).unwrap(), Some(20));
        assert_eq!(map.higher_key(&20).unwrap(), Some(30));
        assert_eq!(map.ceiling_key(&21).unwrap(), Some(30));
        assert_eq!(map.higher_key(&30).unwrap(), None);
        assert_eq!(map.lower_key(&10).unwrap(), None);
    }

    #[test]
    fn test_append_continues_after_largest_key() {
        let dir = tempdir().unwrap();
        let map = open(dir.path());
        assert_eq!(map.append("a".into()).unwrap(), 0);
        map.put(41, "x".into()).unwrap();
        assert_eq!(map.append("b".into()).unwrap(), 42);
        map.close().unwrap();

        let map = open(dir.path());
        assert_eq!(map.append("c".into()).unwrap(), 43);
        assert_eq!(map.size(), 4);
    }

    #[test]
    fn test_clear_drops_entries_and_garbage_collects() {
        let dir = tempdir().unwrap();
        let map = open(dir.path());
        for key in 0..50 {
            map.put(key, "v".repeat(20)).unwrap();
        }
        map.save().unwrap();
        map.clear().unwrap();
        assert_eq!(map.size(), 0);
        assert_eq!(map.cursor(None).unwrap().count(), 0);
        assert!(map.stats().chunks.pending_removed > 0);

        map.put(7, "after".into()).unwrap();
        map.save().unwrap();
        assert_eq!(map.get(&7).unwrap().as_deref(), Some("after"));
    }

    #[test]
    fn test_closed_map_rejects_calls() {
        let dir = tempdir().unwrap();
        let map = open(dir.path());
        map.put(1, "a".into()).unwrap();
        map.close().unwrap();
        map.close().unwrap();
        assert!(map.is_closed());
        assert!(matches!(map.get(&1), Err(KestrelError::Closed)));
        assert!(matches!(map.put(2, "b".into()), Err(KestrelError::Closed)));
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let dir = tempdir().unwrap();
        let map = open(dir.path());
        let second: Result<BTreeMap<i64, String>> = BTreeMap::open("test", StorageConfig::new(dir.path()));
        assert!(matches!(second, Err(KestrelError::Locked(_))));
        map.close().unwrap();
        let reopened: BTreeMap<i64, String> = BTreeMap::open("test", StorageConfig::new(dir.path())).unwrap();
        reopened.close().unwrap();
    }

    #[test]
    fn test_callback_forms_run_inline_without_handlers() {
        let dir = tempdir().unwrap();
        let map = open(dir.path());
        let (tx, rx) = std::sync::mpsc::channel();
        let sent = tx.clone();
        map.put_async(5, "five".into(), move |r| sent.send(r.unwrap().is_none()).unwrap());
        assert!(rx.recv().unwrap());
        let sent = tx.clone();
        map.replace_async(5, "five".into(), "V".into(), move |r| sent.send(r.unwrap()).unwrap());
        assert!(rx.recv().unwrap());
        map.get_async(5, move |r| tx.send(r.unwrap().as_deref() == Some("V")).unwrap());
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn test_get_columns_in_column_mode() {
        use bytes::Bytes;
        use kestrel_common::Row;

        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path()).storage_mode(StorageMode::ColumnStorage);
        let map: BTreeMap<i64, Row> = BTreeMap::open("rows", config.clone()).unwrap();
        for key in 0..20 {
            let row = Row::new(vec![Bytes::from(format!("a{key}")), Bytes::from(format!("b{key}"))]);
            map.put(key, row).unwrap();
        }
        map.close().unwrap();

        let map: BTreeMap<i64, Row> = BTreeMap::open("rows", config).unwrap();
        let partial = map.get_columns(&3, &[1]).unwrap().unwrap();
        assert_eq!(partial.column(0), Some(&Bytes::new()));
        assert_eq!(partial.column(1), Some(&Bytes::from("b3")));
        let full = map.get(&3).unwrap().unwrap();
        assert_eq!(full.column(0), Some(&Bytes::from("a3")));

        // a write to a column leaf loads the other rows first
        map.put(3, Row::new(vec![Bytes::from("x"), Bytes::from("y")])).unwrap();
        assert_eq!(map.get(&4).unwrap().unwrap().column(1), Some(&Bytes::from("b4")));
        map.close().unwrap();
    }

    #[test]
    fn test_saved_pages_stay_within_split_size() {
        let dir = tempdir().unwrap();
        let map = open(dir.path());
        for key in (0..3000).rev() {
            map.put(key * 7 % 3001, format!("value-{key}")).unwrap();
        }
        map.save().unwrap();

        let chunks = map.inner().store.chunks().chunks();
        let mut pages = 0;
        for chunk in &chunks {
            for pos in chunk.page_positions() {
                let len = chunk.page_len(pos).unwrap();
                assert!(len <= 512, "page {pos:#x} is {len} bytes");
                pages += 1;
            }
        }
        assert!(pages > 20);
    }
}
