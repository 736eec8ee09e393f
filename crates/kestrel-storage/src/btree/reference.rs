//! Page references: the mutable slots of the tree.
//!
//! Pages never change; a [`PageReference`] is what changes. It points at
//! the current version of one page (in memory, on disk, or both) and is the
//! unit of mutual exclusion between writers.
//!
//! ```text
//!             +-----------------------------+
//!  owner ---->| HandlerId or 0              |  try_lock / unlock
//!             +-----------------------------+
//!  state ---->| page: Option<Arc<Page>>     |  None = only on disk
//!             | pos:  u64                   |  0 = dirty, unsaved
//!             | version: u64                |  bumped on every change
//!             | columns: Vec<u64>           |  column pages of a leaf
//!             +-----------------------------+
//!  structurally_changed                        set once the reference
//!                                              left the tree
//! ```
//!
//! Every superseded position is handed to a [`PageRelease`]: the chunk
//! manager records it as removed, the store also drops it from the cache.
//! The version lets a concurrent save detect that the page it serialized
//! was replaced before the save could record the new position.

use super::handler::{HandlerSignal, PageOperationHandler};
use super::page::Page;
use kestrel_chunk::ChunkManager;
use kestrel_common::{DataType, UNSAVED_POS};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Receives the persisted positions a reference stops pointing at.
pub(crate) trait PageRelease {
    fn release(&self, positions: &[u64]);
}

impl PageRelease for ChunkManager {
    fn release(&self, positions: &[u64]) {
        self.mark_removed_all(positions.iter().copied());
    }
}

struct RefState<K, V> {
    page: Option<Arc<Page<K, V>>>,
    pos: u64,
    version: u64,
    columns: Vec<u64>,
}

impl<K, V> RefState<K, V> {
    /// Releases the persisted position and its column pages.
    fn supersede(&mut self, release: &dyn PageRelease) {
        if self.pos != UNSAVED_POS {
            let mut positions = std::mem::take(&mut self.columns);
            positions.push(self.pos);
            release.release(&positions);
            self.pos = UNSAVED_POS;
        }
        self.version += 1;
    }
}

/// Point-in-time view of a reference.
pub struct RefSnapshot<K, V> {
    pub page: Option<Arc<Page<K, V>>>,
    pub pos: u64,
    pub version: u64,
}

pub struct PageReference<K, V> {
    owner: AtomicU64,
    waiters: Mutex<Vec<Arc<HandlerSignal>>>,
    state: RwLock<RefState<K, V>>,
    structurally_changed: AtomicBool,
}

impl<K: DataType, V: DataType> PageReference<K, V> {
    fn with_state(page: Option<Arc<Page<K, V>>>, pos: u64) -> Arc<Self> {
        Arc::new(Self {
            owner: AtomicU64::new(0),
            waiters: Mutex::new(Vec::new()),
            state: RwLock::new(RefState {
                page,
                pos,
                version: 0,
                columns: Vec::new(),
            }),
            structurally_changed: AtomicBool::new(false),
        })
    }

    /// A reference to a new, unsaved page.
    pub fn new(page: Page<K, V>) -> Arc<Self> {
        Self::with_state(Some(Arc::new(page)), UNSAVED_POS)
    }

    /// A reference to a page that so far only exists on disk.
    pub fn persisted(pos: u64) -> Arc<Self> {
        Self::with_state(None, pos)
    }

    pub fn pos(&self) -> u64 {
        self.state.read().pos
    }

    pub fn is_dirty(&self) -> bool {
        self.pos() == UNSAVED_POS
    }

    /// The page, if it is held in memory by this reference.
    pub fn page(&self) -> Option<Arc<Page<K, V>>> {
        self.state.read().page.clone()
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Positions of the column pages of the current leaf version.
    pub fn columns(&self) -> Vec<u64> {
        self.state.read().columns.clone()
    }

    pub fn snapshot(&self) -> RefSnapshot<K, V> {
        let state = self.state.read();
        RefSnapshot {
            page: state.page.clone(),
            pos: state.pos,
            version: state.version,
        }
    }

    pub fn is_structurally_changed(&self) -> bool {
        self.structurally_changed.load(Ordering::Acquire)
    }

    /// Records a page just read from `pos`.
    ///
    /// Node pages are kept in the reference so every child reference exists
    /// exactly once; if another reader got there first, its page wins and is
    /// returned. Leaf pages are left to the cache, only their column
    /// positions are remembered.
    pub(crate) fn loaded(&self, pos: u64, page: Arc<Page<K, V>>) -> Arc<Page<K, V>> {
        let mut state = self.state.write();
        if state.pos != pos {
            return page;
        }
        match &*page {
            Page::Node(_) => match &state.page {
                Some(existing) => Arc::clone(existing),
                None => {
                    state.page = Some(Arc::clone(&page));
                    page
                }
            },
            Page::Leaf(leaf) => {
                if state.columns.is_empty() {
                    state.columns = leaf.column_positions().to_vec();
                }
                page
            }
            Page::Column(_) => page,
        }
    }

    /// Installs a new version of the page. The caller holds the lock.
    pub(crate) fn replace_page(&self, page: Arc<Page<K, V>>, release: &dyn PageRelease) {
        let mut state = self.state.write();
        state.supersede(release);
        state.page = Some(page);
    }

    /// Marks the in-memory page dirty so the next save rewrites it.
    ///
    /// Always bumps the version, even if the page already was dirty, so an
    /// in-flight save of the old content does not record its position.
    pub(crate) fn mark_dirty(&self, release: &dyn PageRelease) -> bool {
        let mut state = self.state.write();
        if state.page.is_none() {
            state.version += 1;
            return false;
        }
        state.supersede(release);
        true
    }

    /// Marks a page dirty that was read from `loaded_pos` without holding
    /// the lock. Does nothing if the reference moved on since.
    pub(crate) fn mark_dirty_loaded(
        &self,
        loaded: &Arc<Page<K, V>>,
        loaded_pos: u64,
        release: &dyn PageRelease,
    ) -> bool {
        let mut state = self.state.write();
        if state.pos != loaded_pos || loaded_pos == UNSAVED_POS {
            return false;
        }
        if state.page.is_none() {
            state.page = Some(Arc::clone(loaded));
        }
        state.supersede(release);
        true
    }

    /// Takes the reference out of the tree. Holders of its pages must
    /// restart from the root.
    ///
    /// `last` stays readable for walks that reached the reference through
    /// an older parent page.
    pub(crate) fn retire(&self, last: &Arc<Page<K, V>>, release: &dyn PageRelease) {
        self.structurally_changed.store(true, Ordering::Release);
        let mut state = self.state.write();
        state.supersede(release);
        if state.page.is_none() {
            state.page = Some(Arc::clone(last));
        }
    }

    /// Records the position a save wrote `version` to.
    ///
    /// Returns `None` if the page changed in the meantime; the written copy
    /// is then garbage and the caller must mark it removed. Otherwise
    /// returns the leaf page released from memory, if any, so the caller
    /// can hand it to the cache.
    pub(crate) fn saved(
        &self,
        version: u64,
        pos: u64,
        columns: Vec<u64>,
    ) -> Option<Option<Arc<Page<K, V>>>> {
        let mut state = self.state.write();
        if state.version != version || state.pos != UNSAVED_POS {
            return None;
        }
        state.pos = pos;
        state.columns = columns;
        let is_leaf = state.page.as_ref().map(|p| p.is_leaf()).unwrap_or(false);
        Some(if is_leaf { state.page.take() } else { None })
    }

    /// Takes the lock for `handler`. Reentrant for the same handler.
    ///
    /// On failure the handler is registered as a waiter and will be
    /// signalled by the next unlock.
    pub fn try_lock(self: &Arc<Self>, handler: &PageOperationHandler) -> Option<RefGuard<K, V>> {
        let id = handler.id().as_u64();
        let current = self.owner.load(Ordering::Acquire);
        if current == id {
            return Some(RefGuard {
                reference: Arc::clone(self),
                release: false,
            });
        }
        if current == 0
            && self
                .owner
                .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Some(RefGuard {
                reference: Arc::clone(self),
                release: true,
            });
        }
        self.waiters.lock().push(Arc::clone(handler.signal()));
        // the owner may have left between the CAS and the registration
        if self.owner.load(Ordering::Acquire) == 0 {
            handler.signal().notify();
        }
        None
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Release);
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            waiter.notify();
        }
    }
}

impl<K: DataType, V: DataType> std::fmt::Debug for PageReference<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("PageReference")
            .field("pos", &kestrel_common::page::format_pos(state.pos))
            .field("loaded", &state.page.is_some())
            .field("version", &state.version)
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("structurally_changed", &self.is_structurally_changed())
            .finish()
    }
}

/// Lock on a page reference, released on drop.
pub struct RefGuard<K: DataType, V: DataType> {
    reference: Arc<PageReference<K, V>>,
    release: bool,
}

impl<K: DataType, V: DataType> RefGuard<K, V> {
    pub fn reference(&self) -> &Arc<PageReference<K, V>> {
        &self.reference
    }
}

impl<K: DataType, V: DataType> Drop for RefGuard<K, V> {
    fn drop(&mut self) {
        if self.release {
            self.reference.unlock();
        }
    }
}
