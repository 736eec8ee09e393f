//! Page store of one map: reads, caching, saves and compaction.
//!
//! The store connects the in-memory tree to chunk storage. Dirty pages live
//! only in their references until a save serializes them into a new chunk;
//! clean leaf and column pages are handed to the LIRS cache; node pages
//! stay with their references once loaded.

use super::format;
use super::page::{LeafPage, LeafValues, Page};
use super::reference::{PageReference, PageRelease};
use kestrel_cache::{CacheLongKeyLirs, CacheStats, LirsConfig, PageCache};
use kestrel_chunk::{ChunkBuilder, ChunkCompactor, ChunkManager, ChunkManagerConfig, ChunkStats, FileSystem};
use kestrel_common::compress::compressor_for;
use kestrel_common::page;
use kestrel_common::{
    Compressor, DataType, KestrelError, PageType, Result, StorageConfig, StorageMode, UNSAVED_POS,
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Callback notified once when a store panics.
pub type BackgroundExceptionHandler = Arc<dyn Fn(&KestrelError) + Send + Sync>;

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;
const STATE_PANICKED: u8 = 2;

/// References and pages from the root down to a leaf.
pub struct TreePath<K, V> {
    pub refs: Vec<Arc<PageReference<K, V>>>,
    pub pages: Vec<Arc<Page<K, V>>>,
}

impl<K: DataType, V: DataType> TreePath<K, V> {
    pub fn leaf_ref(&self) -> &Arc<PageReference<K, V>> {
        &self.refs[self.refs.len() - 1]
    }

    pub fn leaf_page(&self) -> &Arc<Page<K, V>> {
        &self.pages[self.pages.len() - 1]
    }

    /// Number of levels, the leaf included.
    pub fn depth(&self) -> usize {
        self.refs.len()
    }

    /// The references above the leaf, root first.
    pub fn ancestors(&self) -> Vec<Arc<PageReference<K, V>>> {
        self.refs[..self.refs.len() - 1].to_vec()
    }
}

/// A position written by a save, applied once the chunk is committed.
struct PendingInstall<K, V> {
    reference: Arc<PageReference<K, V>>,
    version: u64,
    pos: u64,
    columns: Vec<u64>,
}

pub struct BTreeStore<K, V> {
    /// Current root. Replaced, never modified in place, when the tree grows
    /// or shrinks a level.
    root: RwLock<Arc<PageReference<K, V>>>,
    /// Map size recorded by the newest chunk at open.
    persisted_size: u64,
    chunks: ChunkManager,
    cache: Arc<dyn PageCache<Arc<Page<K, V>>>>,
    compressor: Option<Arc<dyn Compressor>>,
    mode: StorageMode,
    split_size: usize,
    compactor: ChunkCompactor,
    read_only: bool,
    /// Serializes saves.
    save_lock: Mutex<()>,
    /// Shared by readers of persisted pages, exclusive while chunk files
    /// are deleted.
    access: RwLock<()>,
    /// Shared from superseding a page until its ancestors are dirty,
    /// exclusive while a save takes its removed set and root.
    change_gate: RwLock<()>,
    state: AtomicU8,
    panic_reason: Mutex<Option<String>>,
    exception_handler: Option<BackgroundExceptionHandler>,
}

impl<K: DataType, V: DataType> BTreeStore<K, V> {
    /// Opens the chunk directory `dir` with the settings of `config`.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        dir: &Path,
        config: &StorageConfig,
        exception_handler: Option<BackgroundExceptionHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let chunks = ChunkManager::open(
            fs,
            dir,
            ChunkManagerConfig {
                max_chunk_size: config.max_chunk_size,
                fsync_enabled: config.fsync_enabled,
                read_only: config.read_only,
            },
        )?;
        let (root, persisted_size) = match chunks.last_chunk() {
            Some(chunk) if chunk.root_pos() != UNSAVED_POS => {
                (PageReference::persisted(chunk.root_pos()), chunk.map_size())
            }
            _ => (PageReference::new(Page::Leaf(LeafPage::empty())), 0),
        };
        let cache: CacheLongKeyLirs<u64, Arc<Page<K, V>>> = CacheLongKeyLirs::new(LirsConfig {
            max_memory: config.cache_size,
            segment_count: config.cache_segments,
            ..Default::default()
        });
        Ok(Self {
            root: RwLock::new(root),
            persisted_size,
            chunks,
            cache: Arc::new(cache),
            compressor: compressor_for(config.compression),
            mode: config.storage_mode,
            split_size: config.page_split_size,
            compactor: ChunkCompactor::new(config.min_fill_rate, config.max_compact_bytes),
            read_only: config.read_only,
            save_lock: Mutex::new(()),
            access: RwLock::new(()),
            change_gate: RwLock::new(()),
            state: AtomicU8::new(STATE_OPEN),
            panic_reason: Mutex::new(None),
            exception_handler,
        })
    }

    pub fn chunks(&self) -> &ChunkManager {
        &self.chunks
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    pub fn split_size(&self) -> usize {
        self.split_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn root(&self) -> Arc<PageReference<K, V>> {
        Arc::clone(&self.root.read())
    }

    /// Installs a new root. The caller holds the lock of the old root and
    /// retires it afterwards.
    pub(crate) fn set_root(&self, root: Arc<PageReference<K, V>>) {
        *self.root.write() = root;
    }

    /// Map size stored with the newest chunk when the store was opened.
    pub fn persisted_size(&self) -> u64 {
        self.persisted_size
    }

    pub fn check_open(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => Ok(()),
            STATE_CLOSED => Err(KestrelError::Closed),
            _ => Err(KestrelError::Panicked(
                self.panic_reason.lock().clone().unwrap_or_default(),
            )),
        }
    }

    pub fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(KestrelError::ReadOnly);
        }
        Ok(())
    }

    pub fn is_panicked(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_PANICKED
    }

    /// Moves the store into the panicked state and notifies the exception
    /// handler. Returns the error for propagation.
    pub fn panic(&self, error: KestrelError) -> KestrelError {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_PANICKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.panic_reason.lock() = Some(error.to_string());
            warn!(dir = %self.chunks.dir().display(), error = %error, "Store panicked");
            if let Some(handler) = &self.exception_handler {
                handler(&error);
            }
        }
        error
    }

    pub(crate) fn close(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.cache.clear();
    }

    /// Guard held while persisted pages are read.
    pub(crate) fn read_access(&self) -> RwLockReadGuard<'_, ()> {
        self.access.read_recursive()
    }

    /// Guard held by a writer from superseding a page until the path above
    /// it is marked dirty. A save never starts inside that window.
    pub(crate) fn change_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.change_gate.read()
    }

    fn fail_read(&self, error: KestrelError) -> KestrelError {
        let error = match error {
            KestrelError::ChunkNotFound { chunk_id } => KestrelError::ChunkCorrupted {
                chunk_id,
                reason: "referenced chunk is missing".to_string(),
            },
            other => other,
        };
        if error.is_corruption() {
            self.panic(error)
        } else {
            error
        }
    }

    /// Reads a persisted page, through the cache.
    pub fn read_page(&self, pos: u64) -> Result<Arc<Page<K, V>>> {
        if let Some(page) = self.cache.get(pos) {
            return Ok(page);
        }
        let data = self.chunks.read_page(pos)?;
        let page = Arc::new(format::decode_page::<K, V>(pos, data)?);
        if !matches!(*page, Page::Node(_)) {
            self.cache.put(pos, Arc::clone(&page), page.memory());
        }
        Ok(page)
    }

    /// Returns the current page of a reference, reading it if necessary.
    pub fn load(&self, reference: &Arc<PageReference<K, V>>) -> Result<Arc<Page<K, V>>> {
        loop {
            let snapshot = reference.snapshot();
            if let Some(page) = snapshot.page {
                return Ok(page);
            }
            match self.read_page(snapshot.pos) {
                Ok(page) => return Ok(reference.loaded(snapshot.pos, page)),
                Err(_) if reference.pos() != snapshot.pos => {
                    trace!(pos = %page::format_pos(snapshot.pos), "Page moved while reading, reloading");
                }
                Err(e) => return Err(self.fail_read(e)),
            }
        }
    }

    /// Descends from the root to the leaf whose range contains `key`.
    pub fn walk(&self, key: &K) -> Result<TreePath<K, V>> {
        let mut refs = Vec::new();
        let mut pages = Vec::new();
        let mut current = self.root();
        loop {
            let page = self.load(&current)?;
            let next = match &*page {
                Page::Node(node) => Some(Arc::clone(node.child(node.child_index(key)))),
                Page::Leaf(_) => None,
                Page::Column(_) => {
                    return Err(self.panic(KestrelError::PageCorrupted {
                        pos: current.pos(),
                        reason: "column page linked as a tree page".to_string(),
                    }))
                }
            };
            refs.push(current);
            pages.push(page);
            match next {
                Some(child) => current = child,
                None => return Ok(TreePath { refs, pages }),
            }
        }
    }

    /// Value of entry `index` of a leaf. In column mode only `columns` are
    /// loaded (all of them if `None`).
    pub fn leaf_value(&self, leaf: &LeafPage<K, V>, index: usize, columns: Option<&[usize]>) -> Result<V> {
        match leaf.values() {
            LeafValues::Rows(values) => values
                .get(index)
                .cloned()
                .ok_or_else(|| KestrelError::Internal(format!("leaf entry {index} out of range"))),
            LeafValues::Columns(positions) => {
                let mut raw = vec![None; positions.len()];
                for (column, pos) in positions.iter().enumerate() {
                    if columns.map_or(true, |wanted| wanted.contains(&column)) {
                        let page = self.read_page(*pos).map_err(|e| self.fail_read(e))?;
                        raw[column] = page.as_column().and_then(|c| c.get(index)).cloned();
                    }
                }
                V::read_columns(&raw)
            }
        }
    }

    /// A copy of `leaf` with every value held inline.
    pub fn materialize(&self, leaf: &LeafPage<K, V>) -> Result<LeafPage<K, V>> {
        if leaf.is_materialized() {
            return Ok(leaf.copy());
        }
        let mut values = Vec::with_capacity(leaf.len());
        for index in 0..leaf.len() {
            values.push(self.leaf_value(leaf, index, None)?);
        }
        Ok(LeafPage::new(leaf.keys().to_vec(), values))
    }

    /// Marks the references of `path` dirty, leaf side first.
    ///
    /// A reference that left the tree means the path is stale; the live
    /// path to `key` is looked up again and marked instead.
    pub(crate) fn mark_path_dirty(&self, key: &K, mut path: Vec<Arc<PageReference<K, V>>>) -> Result<()> {
        loop {
            let stale = path.iter().rev().any(|reference| {
                reference.mark_dirty(self);
                reference.is_structurally_changed()
            });
            if !stale {
                return Ok(());
            }
            trace!("Dirty path changed structure, walking again");
            path = self.walk(key)?.ancestors();
        }
    }

    /// True if a save would write anything.
    pub fn has_unsaved_changes(&self) -> bool {
        self.root().is_dirty() || self.chunks.pending_removed_count() > 0
    }

    /// Writes every dirty page reachable from the root into a new chunk.
    ///
    /// Returns false if there was nothing to save. A failure to write the
    /// chunk panics the store.
    pub fn save(&self, map_size: u64) -> Result<bool> {
        let _save = self.save_lock.lock();
        self.check_writable()?;
        if !self.has_unsaved_changes() {
            return Ok(false);
        }
        let _access = self.read_access();
        let (mut builder, epoch, root) = {
            let _gate = self.change_gate.write();
            let (builder, epoch) = self.chunks.begin_save()?;
            (builder, epoch, self.root())
        };
        let mut installs = Vec::new();
        let root_pos = match self.write_tree(&root, &mut builder, &mut installs) {
            Ok(pos) => pos,
            Err(e) => {
                self.chunks.abort_save(builder, epoch);
                return Err(if e.is_corruption() { self.panic(e) } else { e });
            }
        };
        let pages = builder.page_count();
        let chunk = self
            .chunks
            .commit_save(builder, epoch, root_pos, map_size)
            .map_err(|e| self.panic(e))?;

        let mut rejected = 0;
        for install in installs {
            match install.reference.saved(install.version, install.pos, install.columns.clone()) {
                Some(Some(released)) => {
                    self.cache.put(install.pos, Arc::clone(&released), released.memory());
                }
                Some(None) => {}
                None => {
                    rejected += 1;
                    self.chunks
                        .mark_removed_all(std::iter::once(install.pos).chain(install.columns));
                }
            }
        }
        debug!(
            chunk_id = chunk.id(),
            pages,
            rejected,
            map_size,
            "Saved map"
        );
        Ok(true)
    }

    /// Serializes the dirty part of a subtree, returning its position.
    ///
    /// A page is snapshotted before its children, so a page changed during
    /// the save is detected through its version when installing.
    fn write_tree(
        &self,
        reference: &Arc<PageReference<K, V>>,
        builder: &mut ChunkBuilder,
        installs: &mut Vec<PendingInstall<K, V>>,
    ) -> Result<u64> {
        let snapshot = reference.snapshot();
        if snapshot.pos != UNSAVED_POS {
            return Ok(snapshot.pos);
        }
        let page = snapshot
            .page
            .ok_or_else(|| KestrelError::Internal("dirty reference without a page".to_string()))?;
        let (pos, columns) = match &*page {
            Page::Node(node) => {
                let mut children = Vec::with_capacity(node.child_count());
                for child in node.children() {
                    children.push(self.write_tree(child, builder, installs)?);
                }
                let payload = format::encode_node(node.keys(), &children);
                let pos = self.write_page(builder, PageType::Node, node.len(), &payload)?;
                (pos, Vec::new())
            }
            Page::Leaf(leaf) => self.write_leaf(leaf, builder)?,
            Page::Column(_) => {
                return Err(KestrelError::Internal(
                    "column page referenced from the tree".to_string(),
                ))
            }
        };
        installs.push(PendingInstall {
            reference: Arc::clone(reference),
            version: snapshot.version,
            pos,
            columns,
        });
        Ok(pos)
    }

    fn write_page(&self, builder: &mut ChunkBuilder, page_type: PageType, count: usize, payload: &[u8]) -> Result<u64> {
        format::write_page(builder, self.mode, self.compressor.as_deref(), page_type, count, payload)
    }

    fn write_leaf(&self, leaf: &LeafPage<K, V>, builder: &mut ChunkBuilder) -> Result<(u64, Vec<u64>)> {
        let materialized;
        let leaf = if leaf.is_materialized() {
            leaf
        } else {
            materialized = self.materialize(leaf)?;
            &materialized
        };
        let LeafValues::Rows(values) = leaf.values() else {
            return Err(KestrelError::Internal("leaf values not loaded".to_string()));
        };
        match self.mode {
            StorageMode::RowStorage => {
                let payload = format::encode_leaf_rows(leaf.keys(), values);
                let pos = self.write_page(builder, PageType::Leaf, leaf.len(), &payload)?;
                Ok((pos, Vec::new()))
            }
            StorageMode::ColumnStorage => {
                let count = format::column_count(values);
                let mut columns = Vec::with_capacity(count);
                for column in 0..count {
                    let payload = format::encode_column(values, column);
                    columns.push(self.write_page(builder, PageType::Column, values.len(), &payload)?);
                }
                let payload = format::encode_leaf_columns(leaf.keys(), &columns);
                let pos = self.write_page(builder, PageType::Leaf, leaf.len(), &payload)?;
                Ok((pos, columns))
            }
        }
    }

    /// Reclaims space: deletes chunks without live pages and rewrites the
    /// live pages of sparse chunks through a save.
    ///
    /// Returns false if there was nothing to do.
    pub fn compact(&self, map_size: impl Fn() -> u64) -> Result<bool> {
        self.check_writable()?;
        let plan = self.compactor.plan(&self.chunks);
        if plan.is_empty() {
            return Ok(false);
        }
        if !plan.delete.is_empty() {
            self.delete_chunks(&plan.delete)?;
        }
        if !plan.rewrite.is_empty() {
            let targets = plan.rewrite_set();
            {
                let _access = self.read_access();
                let mut ancestors = Vec::new();
                self.mark_for_rewrite(&self.root(), &targets, &mut ancestors)?;
            }
            self.save(map_size())?;
            let deleted = self.delete_chunks(&self.compactor.empty_chunks(&self.chunks))?;
            debug!(rewritten = plan.rewrite.len(), deleted, "Compacted chunks");
        }
        Ok(true)
    }

    /// Deletes chunk files and drops their pages from the cache, since a
    /// later chunk may reuse the id and with it the same positions.
    ///
    /// Returns the number of chunks deleted.
    fn delete_chunks(&self, chunk_ids: &[u32]) -> Result<usize> {
        let _exclusive = self.access.write();
        let mut deleted = 0;
        for &chunk_id in chunk_ids {
            let Some(chunk) = self.chunks.chunk(chunk_id) else {
                continue;
            };
            if self.chunks.delete_chunk(chunk_id)? {
                for pos in chunk.page_positions() {
                    self.cache.remove(pos);
                }
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn mark_for_rewrite(
        &self,
        reference: &Arc<PageReference<K, V>>,
        targets: &HashSet<u32>,
        ancestors: &mut Vec<Arc<PageReference<K, V>>>,
    ) -> Result<()> {
        let in_target = |pos: u64| pos != UNSAVED_POS && targets.contains(&page::chunk_id(pos));
        let pos = reference.pos();
        // row mode leaves outside the targets have nothing to move
        if self.mode == StorageMode::RowStorage && page::is_leaf_pos(pos) && !in_target(pos) {
            return Ok(());
        }
        let page = self.load(reference)?;
        let moved = match &*page {
            Page::Node(node) => {
                ancestors.push(Arc::clone(reference));
                for child in node.children() {
                    self.mark_for_rewrite(child, targets, ancestors)?;
                }
                ancestors.pop();
                in_target(pos)
            }
            Page::Leaf(_) => in_target(pos) || reference.columns().into_iter().any(in_target),
            Page::Column(_) => false,
        };
        if moved {
            let _gate = self.change_gate();
            if reference.mark_dirty_loaded(&page, pos, self) {
                match self.subtree_key(&page)? {
                    Some(key) => self.mark_path_dirty(&key, ancestors.clone())?,
                    None => {
                        for ancestor in ancestors.iter().rev() {
                            ancestor.mark_dirty(self);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Some key inside the range of a page, used to find its path again.
    fn subtree_key(&self, page: &Page<K, V>) -> Result<Option<K>> {
        match page {
            Page::Leaf(leaf) => Ok(leaf.keys().first().cloned()),
            Page::Node(node) => match node.keys().first() {
                Some(key) => Ok(Some(key.clone())),
                None => {
                    let child = self.load(node.child(0))?;
                    self.subtree_key(&child)
                }
            },
            Page::Column(_) => Ok(None),
        }
    }

    /// Drops the whole tree: every persisted page becomes garbage and the
    /// root is replaced by an empty leaf. No operation may run concurrently.
    pub(crate) fn clear(&self) -> Result<()> {
        self.check_writable()?;
        self.chunks.mark_all_removed();
        self.set_root(PageReference::new(Page::Leaf(LeafPage::empty())));
        self.cache.clear();
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn chunk_stats(&self) -> ChunkStats {
        self.chunks.stats()
    }

    /// Closes the store and deletes its directory.
    pub(crate) fn destroy(&self) -> Result<()> {
        self.close();
        self.chunks.destroy()
    }
}

impl<K: DataType, V: DataType> PageRelease for BTreeStore<K, V> {
    fn release(&self, positions: &[u64]) {
        self.chunks.release(positions);
        for pos in positions {
            self.cache.remove(*pos);
        }
    }
}
