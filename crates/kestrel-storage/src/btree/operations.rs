//! Single-key write operations.
//!
//! A write runs in phases, each one a short critical section over as few
//! page locks as possible. Between phases every lock is released, so a
//! phase that finds the tree changed under it simply walks again.
//!
//! ```text
//!   Leaf ──────── copy the leaf, apply the change, install the copy
//!    │
//!    ├─ leaf too large ──> Split ──────── split the deepest oversized page
//!    │                      ^   │         on the key's path into its parent
//!    │                      └───┘         (a new root above an old one)
//!    │
//!    └─ leaf emptied ────> RemoveEmpty ── unlink the leaf and every
//!                                         ancestor left without children
//! ```
//!
//! Locks are always taken child first, then parent. A lock that is held
//! elsewhere ends the run with [`OpStatus::Locked`]; a page found retired
//! or moved ends it with [`OpStatus::Retry`].

use super::handler::{OpStatus, PageOperation, PageOperationHandler};
use super::map::MapInner;
use super::page::{LeafPage, NodePage, Page};
use super::reference::PageReference;
use super::store::BTreeStore;
use kestrel_common::{DataType, KestrelError, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

/// A change to one key.
#[derive(Debug)]
pub enum WriteOp<K, V> {
    Put { key: K, value: V },
    PutIfAbsent { key: K, value: V },
    /// Writes `value` only if the current value equals `expected`.
    Replace { key: K, expected: V, value: V },
    Remove { key: K },
    /// Put under a key drawn from the map's sequence. `rekey` builds the
    /// replacement key when a concurrent put took the drawn one.
    Append { key: K, value: V, rekey: fn(i64) -> K },
}

impl<K, V> WriteOp<K, V> {
    pub fn key(&self) -> &K {
        match self {
            WriteOp::Put { key, .. }
            | WriteOp::PutIfAbsent { key, .. }
            | WriteOp::Replace { key, .. }
            | WriteOp::Remove { key }
            | WriteOp::Append { key, .. } => key,
        }
    }
}

/// What a write reports back.
#[derive(Debug)]
pub enum WriteResult<K, V> {
    /// Value held before the write (put, put-if-absent, remove).
    Previous(Option<V>),
    Replaced(bool),
    Appended(K),
}

impl<K, V> WriteResult<K, V> {
    pub fn into_previous(self) -> Result<Option<V>> {
        match self {
            WriteResult::Previous(previous) => Ok(previous),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_replaced(self) -> Result<bool> {
        match self {
            WriteResult::Replaced(replaced) => Ok(replaced),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_appended(self) -> Result<K> {
        match self {
            WriteResult::Appended(key) => Ok(key),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected<K, V>(result: &WriteResult<K, V>) -> KestrelError {
    let kind = match result {
        WriteResult::Previous(_) => "previous value",
        WriteResult::Replaced(_) => "replace outcome",
        WriteResult::Appended(_) => "appended key",
    };
    KestrelError::Internal(format!("write produced an unexpected {kind}"))
}

/// An operation producing a value once it succeeded.
pub trait MapOperation: PageOperation {
    type Output: Send + 'static;

    fn take_output(&mut self) -> Result<Self::Output>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Leaf,
    Split,
    RemoveEmpty,
}

/// A write of one key, run to completion by a handler.
pub struct SingleWrite<K, V> {
    map: Arc<MapInner<K, V>>,
    op: WriteOp<K, V>,
    phase: Phase,
    result: Option<WriteResult<K, V>>,
}

impl<K: DataType, V: DataType> SingleWrite<K, V> {
    pub(crate) fn new(map: Arc<MapInner<K, V>>, op: WriteOp<K, V>) -> Self {
        Self {
            map,
            op,
            phase: Phase::Leaf,
            result: None,
        }
    }

    fn run_leaf(&mut self, store: &BTreeStore<K, V>, handler: &PageOperationHandler) -> Result<OpStatus> {
        let key = self.op.key().clone();
        let path = store.walk(&key)?;
        let leaf_ref = Arc::clone(path.leaf_ref());
        let Some(guard) = leaf_ref.try_lock(handler) else {
            return Ok(OpStatus::Locked);
        };
        if leaf_ref.is_structurally_changed() {
            return Ok(OpStatus::Retry);
        }
        let page = store.load(&leaf_ref)?;
        let leaf = page
            .as_leaf()
            .ok_or_else(|| KestrelError::Internal("walk ended on a non-leaf page".to_string()))?;
        let materialized;
        let leaf = if leaf.is_materialized() {
            leaf
        } else {
            materialized = store.materialize(leaf)?;
            &materialized
        };

        if let WriteOp::Append { key: drawn, rekey, .. } = &mut self.op {
            if leaf.binary_search(drawn).is_ok() {
                let sequence = self.map.max_key.fetch_add(1, Ordering::AcqRel) + 1;
                trace!(sequence, "Appended key already taken, drawing the next one");
                *drawn = (*rekey)(sequence);
                return Ok(OpStatus::Retry);
            }
        }

        let (update, result) = self.apply(leaf)?;
        let Some((new_leaf, size_delta)) = update else {
            self.result = Some(result);
            return Ok(OpStatus::Succeeded);
        };
        let new_page = Arc::new(Page::Leaf(new_leaf));
        {
            let _gate = store.change_gate();
            leaf_ref.replace_page(Arc::clone(&new_page), store);
            match size_delta {
                1 => {
                    self.map.size.fetch_add(1, Ordering::AcqRel);
                }
                -1 => {
                    self.map.size.fetch_sub(1, Ordering::AcqRel);
                }
                _ => {}
            }
            if let Some(sequence) = key.sequence() {
                self.map.max_key.fetch_max(sequence, Ordering::AcqRel);
            }
            drop(guard);
            store.mark_path_dirty(&key, path.ancestors())?;
        }
        self.result = Some(result);

        if new_page.needs_split(store.split_size()) {
            self.phase = Phase::Split;
            return Ok(OpStatus::Retry);
        }
        if new_page.key_count() == 0 && path.depth() > 1 {
            self.phase = Phase::RemoveEmpty;
            return Ok(OpStatus::Retry);
        }
        Ok(OpStatus::Succeeded)
    }

    /// The modified leaf with its size change, or `None` if the leaf stays
    /// as it is, and the result to report.
    #[allow(clippy::type_complexity)]
    fn apply(&self, leaf: &LeafPage<K, V>) -> Result<(Option<(LeafPage<K, V>, i8)>, WriteResult<K, V>)> {
        let key = self.op.key();
        let index = leaf.binary_search(key);
        let previous = |i: usize| leaf.value(i).cloned();
        Ok(match (&self.op, index) {
            (WriteOp::Put { value, .. }, Ok(i)) => {
                (Some((leaf.with_value(i, value.clone())?, 0)), WriteResult::Previous(previous(i)))
            }
            (WriteOp::Put { value, .. } | WriteOp::PutIfAbsent { value, .. }, Err(i)) => (
                Some((leaf.with_inserted(i, key.clone(), value.clone())?, 1)),
                WriteResult::Previous(None),
            ),
            (WriteOp::PutIfAbsent { .. }, Ok(i)) => (None, WriteResult::Previous(previous(i))),
            (WriteOp::Replace { expected, value, .. }, Ok(i))
                if leaf.value(i).is_some_and(|current| current.value_eq(expected)) =>
            {
                (Some((leaf.with_value(i, value.clone())?, 0)), WriteResult::Replaced(true))
            }
            (WriteOp::Replace { .. }, _) => (None, WriteResult::Replaced(false)),
            (WriteOp::Remove { .. }, Ok(i)) => {
                (Some((leaf.with_removed(i)?, -1)), WriteResult::Previous(previous(i)))
            }
            (WriteOp::Remove { .. }, Err(_)) => (None, WriteResult::Previous(None)),
            (WriteOp::Append { .. }, Ok(_)) => {
                return Err(KestrelError::Internal("appended key already present".to_string()))
            }
            (WriteOp::Append { value, .. }, Err(i)) => (
                Some((leaf.with_inserted(i, key.clone(), value.clone())?, 1)),
                WriteResult::Appended(key.clone()),
            ),
        })
    }

    fn run_split(&mut self, store: &BTreeStore<K, V>, handler: &PageOperationHandler) -> Result<OpStatus> {
        let split_size = store.split_size();
        let path = store.walk(self.op.key())?;
        let Some(depth) = (0..path.depth())
            .rev()
            .find(|&d| path.pages[d].needs_split(split_size))
        else {
            return Ok(OpStatus::Succeeded);
        };
        let target = &path.refs[depth];
        let parent = depth.checked_sub(1).map(|d| &path.refs[d]);

        let Some(_target_lock) = target.try_lock(handler) else {
            return Ok(OpStatus::Locked);
        };
        let _parent_lock = match parent {
            Some(parent) => match parent.try_lock(handler) {
                Some(lock) => Some(lock),
                None => return Ok(OpStatus::Locked),
            },
            None => None,
        };
        if target.is_structurally_changed() || parent.is_some_and(|p| p.is_structurally_changed()) {
            return Ok(OpStatus::Retry);
        }
        let page = store.load(target)?;
        if !page.needs_split(split_size) {
            return Ok(OpStatus::Retry);
        }
        let (left, separator, right) = split_page(store, &page)?;
        let left = PageReference::new(left);
        let right = PageReference::new(right);

        match parent {
            None => {
                if !Arc::ptr_eq(&store.root(), target) {
                    return Ok(OpStatus::Retry);
                }
                let root = NodePage::new(vec![separator], vec![left, right]);
                let _gate = store.change_gate();
                store.set_root(PageReference::new(Page::Node(root)));
                target.retire(&page, store);
                trace!(depth = path.depth() + 1, "Root split, tree grew a level");
            }
            Some(parent) => {
                let parent_page = store.load(parent)?;
                let node = parent_page
                    .as_node()
                    .ok_or_else(|| KestrelError::Internal("parent is not a node page".to_string()))?;
                let Some(index) = node.index_of(target) else {
                    return Ok(OpStatus::Retry);
                };
                let node = node.with_child_split(index, separator, left, right);
                let _gate = store.change_gate();
                parent.replace_page(Arc::new(Page::Node(node)), store);
                target.retire(&page, store);
                store.mark_path_dirty(self.op.key(), path.refs[..depth - 1].to_vec())?;
            }
        }
        // the parent may need a split of its own now
        Ok(OpStatus::Retry)
    }

    fn run_remove_empty(&mut self, store: &BTreeStore<K, V>, handler: &PageOperationHandler) -> Result<OpStatus> {
        let path = store.walk(self.op.key())?;
        if path.depth() == 1 {
            return Ok(OpStatus::Succeeded);
        }
        let leaf_ref = path.leaf_ref();
        let mut locks = Vec::with_capacity(path.depth());
        match leaf_ref.try_lock(handler) {
            Some(lock) => locks.push(lock),
            None => return Ok(OpStatus::Locked),
        }
        if leaf_ref.is_structurally_changed() {
            return Ok(OpStatus::Retry);
        }
        let leaf_page = store.load(leaf_ref)?;
        if leaf_page.key_count() > 0 {
            // refilled in the meantime
            return Ok(OpStatus::Succeeded);
        }
        // pages of the references to retire, leaf first
        let mut unlinked = vec![leaf_page];

        // climb while unlinking would leave the parent without children
        let mut depth = path.depth() - 1;
        while depth > 0 {
            let parent = &path.refs[depth - 1];
            match parent.try_lock(handler) {
                Some(lock) => locks.push(lock),
                None => return Ok(OpStatus::Locked),
            }
            if parent.is_structurally_changed() {
                return Ok(OpStatus::Retry);
            }
            let parent_page = store.load(parent)?;
            let node = parent_page
                .as_node()
                .ok_or_else(|| KestrelError::Internal("parent is not a node page".to_string()))?;
            let Some(index) = node.index_of(&path.refs[depth]) else {
                return Ok(OpStatus::Retry);
            };
            if node.child_count() > 1 {
                let _gate = store.change_gate();
                parent.replace_page(Arc::new(Page::Node(node.without_child(index))), store);
                retire_chain(store, &path.refs[depth..], &unlinked);
                store.mark_path_dirty(self.op.key(), path.refs[..depth - 1].to_vec())?;
                return Ok(OpStatus::Succeeded);
            }
            unlinked.push(Arc::clone(&parent_page));
            depth -= 1;
        }

        // every page on the path held only this empty leaf
        if !Arc::ptr_eq(&store.root(), &path.refs[0]) {
            return Ok(OpStatus::Retry);
        }
        let _gate = store.change_gate();
        store.set_root(PageReference::new(Page::Leaf(LeafPage::empty())));
        retire_chain(store, &path.refs, &unlinked);
        trace!("Tree emptied, root reset to a leaf");
        Ok(OpStatus::Succeeded)
    }
}

/// Retires `refs` (root side first) with their `pages` (leaf side first).
fn retire_chain<K: DataType, V: DataType>(
    store: &BTreeStore<K, V>,
    refs: &[Arc<PageReference<K, V>>],
    pages: &[Arc<Page<K, V>>],
) {
    for (reference, page) in refs.iter().rev().zip(pages) {
        reference.retire(page, store);
    }
}

fn split_page<K: DataType, V: DataType>(
    store: &BTreeStore<K, V>,
    page: &Page<K, V>,
) -> Result<(Page<K, V>, K, Page<K, V>)> {
    match page {
        Page::Leaf(leaf) => {
            let (left, separator, right) = if leaf.is_materialized() {
                leaf.split()?
            } else {
                store.materialize(leaf)?.split()?
            };
            Ok((Page::Leaf(left), separator, Page::Leaf(right)))
        }
        Page::Node(node) => {
            let (left, separator, right) = node.split()?;
            Ok((Page::Node(left), separator, Page::Node(right)))
        }
        Page::Column(_) => Err(KestrelError::Internal("column pages are not split".to_string())),
    }
}

impl<K: DataType, V: DataType> PageOperation for SingleWrite<K, V> {
    fn run(&mut self, handler: &PageOperationHandler) -> Result<OpStatus> {
        let map = Arc::clone(&self.map);
        let _shared = map.lock.read_recursive();
        map.store.check_writable()?;
        let _access = map.store.read_access();
        match self.phase {
            Phase::Leaf => self.run_leaf(&map.store, handler),
            Phase::Split => self.run_split(&map.store, handler),
            Phase::RemoveEmpty => self.run_remove_empty(&map.store, handler),
        }
    }

    fn complete(self: Box<Self>, _result: Result<()>) {}
}

impl<K: DataType, V: DataType> MapOperation for SingleWrite<K, V> {
    type Output = WriteResult<K, V>;

    fn take_output(&mut self) -> Result<WriteResult<K, V>> {
        self.result
            .take()
            .ok_or_else(|| KestrelError::Internal("write finished without a result".to_string()))
    }
}

/// A closure run as an operation, so a pooled map can serve reads and
/// maintenance calls from a handler thread.
pub struct MapTask<R> {
    task: Option<Box<dyn FnOnce() -> Result<R> + Send>>,
    output: Option<Result<R>>,
}

impl<R: Send + 'static> MapTask<R> {
    pub fn new(task: impl FnOnce() -> Result<R> + Send + 'static) -> Self {
        Self {
            task: Some(Box::new(task)),
            output: None,
        }
    }
}

impl<R: Send + 'static> PageOperation for MapTask<R> {
    fn run(&mut self, _handler: &PageOperationHandler) -> Result<OpStatus> {
        if let Some(task) = self.task.take() {
            self.output = Some(task());
        }
        Ok(OpStatus::Succeeded)
    }

    fn complete(self: Box<Self>, _result: Result<()>) {}
}

impl<R: Send + 'static> MapOperation for MapTask<R> {
    type Output = R;

    fn take_output(&mut self) -> Result<R> {
        self.output
            .take()
            .unwrap_or_else(|| Err(KestrelError::Internal("task did not run".to_string())))
    }
}

/// Hands the output of an operation to a callback once it completes.
pub struct Callback<O: MapOperation> {
    op: O,
    callback: Box<dyn FnOnce(Result<O::Output>) + Send>,
}

impl<O: MapOperation> Callback<O> {
    pub fn new(op: O, callback: impl FnOnce(Result<O::Output>) + Send + 'static) -> Self {
        Self {
            op,
            callback: Box::new(callback),
        }
    }
}

impl<O: MapOperation> PageOperation for Callback<O> {
    fn run(&mut self, handler: &PageOperationHandler) -> Result<OpStatus> {
        self.op.run(handler)
    }

    fn complete(self: Box<Self>, result: Result<()>) {
        let Callback { mut op, callback } = *self;
        callback(result.and_then(|()| op.take_output()));
    }
}
