//! Ordered traversal and key navigation.
//!
//! A cursor reads one leaf at a time. Each leaf is taken as a whole from a
//! single page version, and the next leaf is found by seeking again from
//! the root for the least key above the last one returned. Keys therefore
//! come out strictly ascending even while writers split or unlink leaves.

use super::map::MapInner;
use super::page::Page;
use super::reference::PageReference;
use super::store::BTreeStore;
use kestrel_common::{DataType, KestrelError, Result};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Forward,
    Backward,
}

/// Finds the leaf entry nearest to `key` in `direction`.
///
/// Forward yields the least key above `key` (or equal to it if
/// `inclusive`), backward the greatest key below it. Without a key the
/// first or last entry of the tree is returned.
pub(crate) fn seek<K: DataType, V: DataType>(
    store: &BTreeStore<K, V>,
    key: Option<&K>,
    direction: Direction,
    inclusive: bool,
) -> Result<Option<(Arc<Page<K, V>>, usize)>> {
    // node pages on the way down with the child index taken in each
    let mut stack: Vec<(Arc<Page<K, V>>, usize)> = Vec::new();
    let mut key = key;
    let mut page = store.load(&store.root())?;
    loop {
        let step = match &*page {
            Page::Node(node) => {
                let index = match (key, direction) {
                    (Some(key), _) => node.child_index(key),
                    (None, Direction::Forward) => 0,
                    (None, Direction::Backward) => node.child_count() - 1,
                };
                Step::Down(Arc::clone(node.child(index)), index)
            }
            Page::Leaf(leaf) => {
                let found = match (key, direction) {
                    (None, Direction::Forward) => (!leaf.is_empty()).then_some(0),
                    (None, Direction::Backward) => leaf.len().checked_sub(1),
                    (Some(key), Direction::Forward) => {
                        let index = match leaf.binary_search(key) {
                            Ok(i) if inclusive => i,
                            Ok(i) => i + 1,
                            Err(i) => i,
                        };
                        (index < leaf.len()).then_some(index)
                    }
                    (Some(key), Direction::Backward) => match leaf.binary_search(key) {
                        Ok(i) if inclusive => Some(i),
                        Ok(i) | Err(i) => i.checked_sub(1),
                    },
                };
                found.map_or(Step::Exhausted, Step::Found)
            }
            Page::Column(_) => {
                return Err(KestrelError::Internal("column page linked as a tree page".to_string()));
            }
        };

        match step {
            Step::Found(index) => return Ok(Some((page, index))),
            Step::Down(child, index) => {
                stack.push((page, index));
                page = store.load(&child)?;
            }
            Step::Exhausted => {
                // nothing left in this leaf: continue in the neighbouring subtree
                key = None;
                let next = loop {
                    let Some((parent, index)) = stack.pop() else {
                        return Ok(None);
                    };
                    let node = parent
                        .as_node()
                        .ok_or_else(|| KestrelError::Internal("stacked page is not a node".to_string()))?;
                    let sibling = match direction {
                        Direction::Forward => Some(index + 1).filter(|&i| i < node.child_count()),
                        Direction::Backward => index.checked_sub(1),
                    };
                    if let Some(sibling) = sibling {
                        let child = Arc::clone(node.child(sibling));
                        stack.push((parent, sibling));
                        break child;
                    }
                };
                page = store.load(&next)?;
            }
        }
    }
}

enum Step<K, V> {
    Down(Arc<PageReference<K, V>>, usize),
    Found(usize),
    Exhausted,
}

/// Key of the entry found by [`seek`].
pub(crate) fn seek_key<K: DataType, V: DataType>(
    store: &BTreeStore<K, V>,
    key: Option<&K>,
    direction: Direction,
    inclusive: bool,
) -> Result<Option<K>> {
    Ok(seek(store, key, direction, inclusive)?
        .and_then(|(page, index)| page.as_leaf().map(|leaf| leaf.key(index).clone())))
}

/// Ascending iterator over the entries of a map.
///
/// Read-committed per leaf: every entry returned was committed when its
/// leaf was read, but entries of different leaves may come from different
/// moments.
pub struct BTreeCursor<K, V> {
    map: Arc<MapInner<K, V>>,
    /// Entries of the current leaf not yet returned.
    pending: VecDeque<(K, V)>,
    /// Where the next leaf is sought from.
    from: Option<K>,
    inclusive: bool,
    done: bool,
}

impl<K: DataType, V: DataType> BTreeCursor<K, V> {
    pub(crate) fn new(map: Arc<MapInner<K, V>>, from: Option<K>) -> Self {
        Self {
            map,
            pending: VecDeque::new(),
            from,
            inclusive: true,
            done: false,
        }
    }

    /// Loads the entries of the next leaf. Returns false at the end.
    fn fill(&mut self) -> Result<bool> {
        let map = Arc::clone(&self.map);
        let _shared = map.lock.read_recursive();
        map.store.check_open()?;
        let _access = map.store.read_access();

        let Some((page, index)) = seek(&map.store, self.from.as_ref(), Direction::Forward, self.inclusive)?
        else {
            return Ok(false);
        };
        let leaf = page
            .as_leaf()
            .ok_or_else(|| KestrelError::Internal("seek ended on a non-leaf page".to_string()))?;
        for i in index..leaf.len() {
            let value = map.store.leaf_value(leaf, i, None)?;
            self.pending.push_back((leaf.key(i).clone(), value));
        }
        self.from = self.pending.back().map(|(key, _)| key.clone());
        self.inclusive = false;
        Ok(true)
    }
}

impl<K: DataType, V: DataType> Iterator for BTreeCursor<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            if self.done {
                return None;
            }
            match self.fill() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::map::BTreeMap;
    use kestrel_common::StorageConfig;
    use tempfile::tempdir;

    fn filled(dir: &std::path::Path) -> BTreeMap<i64, i64> {
        let map = BTreeMap::open("cursor", StorageConfig::new(dir).page_split_size(256)).unwrap();
        // even keys only, spread over many leaves
        for key in (0..400).step_by(2) {
            map.put(key, key * 10).unwrap();
        }
        map
    }

    #[test]
    fn test_seek_in_both_directions() {
        let dir = tempdir().unwrap();
        let map = filled(dir.path());
        let store = &map.inner().store;
        let find = |key: i64, direction, inclusive| seek_key(store, Some(&key), direction, inclusive).unwrap();

        assert_eq!(find(10, Direction::Forward, true), Some(10));
        assert_eq!(find(10, Direction::Forward, false), Some(12));
        assert_eq!(find(11, Direction::Forward, false), Some(12));
        assert_eq!(find(10, Direction::Backward, true), Some(10));
        assert_eq!(find(10, Direction::Backward, false), Some(8));
        assert_eq!(find(0, Direction::Backward, false), None);
        assert_eq!(find(398, Direction::Forward, false), None);
        assert_eq!(find(-5, Direction::Forward, true), Some(0));
        assert_eq!(find(1000, Direction::Backward, true), Some(398));
        assert_eq!(seek_key(store, None, Direction::Forward, true).unwrap(), Some(0));
        assert_eq!(seek_key(store, None, Direction::Backward, true).unwrap(), Some(398));
    }

    #[test]
    fn test_seek_crosses_every_leaf_boundary() {
        let dir = tempdir().unwrap();
        let map = filled(dir.path());
        let store = &map.inner().store;
        for key in (1..399).step_by(2) {
            let above = seek_key(store, Some(&key), Direction::Forward, true).unwrap();
            let below = seek_key(store, Some(&key), Direction::Backward, true).unwrap();
            assert_eq!(above, Some(key + 1));
            assert_eq!(below, Some(key - 1));
        }
    }

    #[test]
    fn test_cursor_from_key() {
        let dir = tempdir().unwrap();
        let map = filled(dir.path());
        let entries: Vec<(i64, i64)> = map.cursor(Some(&101)).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 149);
        assert_eq!(entries[0], (102, 1020));
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_cursor_sees_committed_changes_of_later_leaves() {
        let dir = tempdir().unwrap();
        let map = filled(dir.path());
        let mut cursor = map.cursor(None).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap(), (0, 0));
        // written behind and ahead of the cursor
        map.put(-1, 0).unwrap();
        map.put(399, 3990).unwrap();
        let rest: Vec<i64> = cursor.map(|e| e.unwrap().0).collect();
        assert_eq!(rest.first(), Some(&2));
        assert_eq!(rest.last(), Some(&399));
        assert!(!rest.contains(&-1));
    }

    #[test]
    fn test_cursor_on_empty_map() {
        let dir = tempdir().unwrap();
        let map: BTreeMap<i64, i64> = BTreeMap::open("empty", StorageConfig::new(dir.path())).unwrap();
        assert_eq!(map.cursor(None).unwrap().count(), 0);
    }
}
