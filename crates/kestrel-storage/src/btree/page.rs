//! In-memory B+Tree pages.
//!
//! Pages are immutable once published. A mutation builds a modified copy
//! and installs it in the owning [`PageReference`], so a reader holding an
//! `Arc<Page>` keeps a consistent version for as long as it needs one.

use super::constants::{CHILD_MEMORY, COLUMN_POS_MEMORY, PAGE_MEMORY};
use super::reference::PageReference;
use bytes::Bytes;
use kestrel_common::{DataType, KestrelError, PageType, Result};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// A tree page.
pub enum Page<K, V> {
    Leaf(LeafPage<K, V>),
    Node(NodePage<K, V>),
    /// One value column of a leaf, column storage mode only.
    Column(ColumnPage),
}

impl<K: DataType, V: DataType> Page<K, V> {
    pub fn page_type(&self) -> PageType {
        match self {
            Page::Leaf(_) => PageType::Leaf,
            Page::Node(_) => PageType::Node,
            Page::Column(_) => PageType::Column,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Page::Leaf(_))
    }

    /// Keys of a leaf or node, rows of a column page.
    pub fn key_count(&self) -> usize {
        match self {
            Page::Leaf(leaf) => leaf.len(),
            Page::Node(node) => node.len(),
            Page::Column(column) => column.len(),
        }
    }

    /// Estimated memory footprint, used for splits and cache weights.
    pub fn memory(&self) -> usize {
        match self {
            Page::Leaf(leaf) => leaf.memory(),
            Page::Node(node) => node.memory(),
            Page::Column(column) => column.memory(),
        }
    }

    /// A page is split once it outgrows the threshold and has a key to
    /// split at. A single oversized entry stays in its own page.
    pub fn needs_split(&self, split_size: usize) -> bool {
        match self {
            Page::Column(_) => false,
            _ => self.memory() > split_size && self.key_count() >= 2,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafPage<K, V>> {
        match self {
            Page::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&NodePage<K, V>> {
        match self {
            Page::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_column(&self) -> Option<&ColumnPage> {
        match self {
            Page::Column(column) => Some(column),
            _ => None,
        }
    }
}

impl<K: DataType, V: DataType> std::fmt::Debug for Page<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("type", &self.page_type())
            .field("keys", &self.key_count())
            .field("memory", &self.memory())
            .finish()
    }
}

/// Binary search that starts at the index the previous search ended on.
///
/// Sequential access patterns hit the hinted slot on the first compare.
fn search_with_hint<K: DataType>(keys: &[K], key: &K, hint: &AtomicUsize) -> std::result::Result<usize, usize> {
    if keys.is_empty() {
        return Err(0);
    }
    let mut low: isize = 0;
    let mut high: isize = keys.len() as isize - 1;
    let mut x = hint.load(AtomicOrdering::Relaxed) as isize - 1;
    if x < 0 || x > high {
        x = high >> 1;
    }
    while low <= high {
        match key.compare(&keys[x as usize]) {
            Ordering::Greater => low = x + 1,
            Ordering::Less => high = x - 1,
            Ordering::Equal => {
                hint.store(x as usize + 1, AtomicOrdering::Relaxed);
                return Ok(x as usize);
            }
        }
        x = (low + high) >> 1;
    }
    hint.store(low as usize, AtomicOrdering::Relaxed);
    Err(low as usize)
}

/// Values of a leaf.
#[derive(Debug, Clone)]
pub enum LeafValues<V> {
    /// Values held inline.
    Rows(Vec<V>),
    /// Column storage: positions of the column pages, one per column.
    /// Values are assembled from column pages on demand.
    Columns(Vec<u64>),
}

/// Leaf page: ordered keys with parallel values.
pub struct LeafPage<K, V> {
    keys: Vec<K>,
    values: LeafValues<V>,
    memory: usize,
    hint: AtomicUsize,
}

impl<K: DataType, V: DataType> LeafPage<K, V> {
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn new(keys: Vec<K>, values: Vec<V>) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        let memory = PAGE_MEMORY
            + keys.iter().map(DataType::memory).sum::<usize>()
            + values.iter().map(DataType::memory).sum::<usize>();
        Self {
            keys,
            values: LeafValues::Rows(values),
            memory,
            hint: AtomicUsize::new(0),
        }
    }

    /// A column mode leaf as read from disk, values not yet loaded.
    pub fn with_column_positions(keys: Vec<K>, positions: Vec<u64>) -> Self {
        let memory = PAGE_MEMORY
            + keys.iter().map(DataType::memory).sum::<usize>()
            + positions.len() * COLUMN_POS_MEMORY;
        Self {
            keys,
            values: LeafValues::Columns(positions),
            memory,
            hint: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn key(&self, index: usize) -> &K {
        &self.keys[index]
    }

    pub fn memory(&self) -> usize {
        self.memory
    }

    /// `Ok(index)` of the key, or `Err(index)` where it would be inserted.
    pub fn binary_search(&self, key: &K) -> std::result::Result<usize, usize> {
        search_with_hint(&self.keys, key, &self.hint)
    }

    pub fn values(&self) -> &LeafValues<V> {
        &self.values
    }

    /// True if the values are held inline.
    pub fn is_materialized(&self) -> bool {
        matches!(self.values, LeafValues::Rows(_))
    }

    /// Inline value at `index`. None for column mode leaves read from disk.
    pub fn value(&self, index: usize) -> Option<&V> {
        match &self.values {
            LeafValues::Rows(values) => values.get(index),
            LeafValues::Columns(_) => None,
        }
    }

    /// Column page positions, empty unless the leaf was read in column mode.
    pub fn column_positions(&self) -> &[u64] {
        match &self.values {
            LeafValues::Rows(_) => &[],
            LeafValues::Columns(positions) => positions,
        }
    }

    fn rows(&self) -> Result<&[V]> {
        match &self.values {
            LeafValues::Rows(values) => Ok(values),
            LeafValues::Columns(_) => Err(KestrelError::Internal(
                "leaf values must be loaded before the leaf is modified".to_string(),
            )),
        }
    }

    /// A new page with the same content.
    pub fn copy(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            values: self.values.clone(),
            memory: self.memory,
            hint: AtomicUsize::new(self.hint.load(AtomicOrdering::Relaxed)),
        }
    }

    pub fn with_inserted(&self, index: usize, key: K, value: V) -> Result<Self> {
        let mut values = self.rows()?.to_vec();
        let mut keys = self.keys.clone();
        keys.insert(index, key);
        values.insert(index, value);
        Ok(Self::new(keys, values))
    }

    pub fn with_value(&self, index: usize, value: V) -> Result<Self> {
        let mut values = self.rows()?.to_vec();
        values[index] = value;
        Ok(Self::new(self.keys.clone(), values))
    }

    pub fn with_removed(&self, index: usize) -> Result<Self> {
        let mut values = self.rows()?.to_vec();
        let mut keys = self.keys.clone();
        keys.remove(index);
        values.remove(index);
        Ok(Self::new(keys, values))
    }

    /// Splits in the middle. No key is dropped; the separator is the first
    /// key of the right half.
    pub fn split(&self) -> Result<(Self, K, Self)> {
        let values = self.rows()?;
        let at = self.keys.len() / 2;
        if at == 0 {
            return Err(KestrelError::Internal("split of a leaf with one key".to_string()));
        }
        let left = Self::new(self.keys[..at].to_vec(), values[..at].to_vec());
        let right = Self::new(self.keys[at..].to_vec(), values[at..].to_vec());
        let separator = right.keys[0].clone();
        Ok((left, separator, right))
    }
}

/// Internal page: `keys.len() + 1` children.
///
/// Child `i` holds keys below `keys[i]` and at or above `keys[i - 1]`.
pub struct NodePage<K, V> {
    keys: Vec<K>,
    children: Vec<Arc<PageReference<K, V>>>,
    memory: usize,
    hint: AtomicUsize,
}

impl<K: DataType, V: DataType> NodePage<K, V> {
    pub fn new(keys: Vec<K>, children: Vec<Arc<PageReference<K, V>>>) -> Self {
        debug_assert_eq!(keys.len() + 1, children.len());
        let memory = PAGE_MEMORY
            + keys.iter().map(DataType::memory).sum::<usize>()
            + children.len() * CHILD_MEMORY;
        Self {
            keys,
            children,
            memory,
            hint: AtomicUsize::new(0),
        }
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn children(&self) -> &[Arc<PageReference<K, V>>] {
        &self.children
    }

    pub fn child(&self, index: usize) -> &Arc<PageReference<K, V>> {
        &self.children[index]
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn memory(&self) -> usize {
        self.memory
    }

    /// Index of the child whose range contains `key`.
    pub fn child_index(&self, key: &K) -> usize {
        match search_with_hint(&self.keys, key, &self.hint) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Index of a child reference, compared by identity.
    pub fn index_of(&self, child: &Arc<PageReference<K, V>>) -> Option<usize> {
        self.children.iter().position(|c| Arc::ptr_eq(c, child))
    }

    pub fn copy(&self) -> Self {
        Self::new(self.keys.clone(), self.children.clone())
    }

    /// Replaces child `index` with the two halves of its split.
    pub fn with_child_split(
        &self,
        index: usize,
        separator: K,
        left: Arc<PageReference<K, V>>,
        right: Arc<PageReference<K, V>>,
    ) -> Self {
        let mut keys = self.keys.clone();
        let mut children = self.children.clone();
        keys.insert(index, separator);
        children[index] = left;
        children.insert(index + 1, right);
        Self::new(keys, children)
    }

    /// Drops child `index` together with the key bounding it. The
    /// neighbouring child takes over its key range.
    pub fn without_child(&self, index: usize) -> Self {
        let mut keys = self.keys.clone();
        let mut children = self.children.clone();
        children.remove(index);
        if !keys.is_empty() {
            keys.remove(index.saturating_sub(1));
        }
        Self::new(keys, children)
    }

    /// Splits in the middle. The middle key moves up as the separator.
    pub fn split(&self) -> Result<(Self, K, Self)> {
        let at = self.keys.len() / 2;
        if self.keys.len() < 2 {
            return Err(KestrelError::Internal("split of a node with fewer than two keys".to_string()));
        }
        let left = Self::new(self.keys[..at].to_vec(), self.children[..=at].to_vec());
        let right = Self::new(self.keys[at + 1..].to_vec(), self.children[at + 1..].to_vec());
        Ok((left, self.keys[at].clone(), right))
    }
}

/// One column of every row of a leaf, stored as raw column bytes.
#[derive(Debug, Clone)]
pub struct ColumnPage {
    values: Vec<Bytes>,
    memory: usize,
}

impl ColumnPage {
    pub fn new(values: Vec<Bytes>) -> Self {
        let memory = PAGE_MEMORY + values.iter().map(|v| v.len() + 24).sum::<usize>();
        Self { values, memory }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, row: usize) -> Option<&Bytes> {
        self.values.get(row)
    }

    pub fn memory(&self) -> usize {
        self.memory
    }
}
