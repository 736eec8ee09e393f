//! Segmented LIRS cache with memory-weighted entries.
//!
//! Keys are hashed once; the high half selects a segment, the low half a
//! bucket inside it. Each segment has its own lock and an equal share of
//! the memory budget.

use crate::segment::Segment;
use crate::CacheStats;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use tracing::debug;

/// Tuning knobs of a [`CacheLongKeyLirs`].
#[derive(Debug, Clone)]
pub struct LirsConfig {
    /// Total memory budget in bytes.
    pub max_memory: usize,
    /// Number of segments, a power of two.
    pub segment_count: usize,
    /// Hot entries are moved to the top of the stack only after this many
    /// other moves, which keeps frequent hits cheap.
    pub stack_move_distance: u64,
    /// Ghost entries kept per resident entry.
    pub non_resident_queue_size: usize,
}

impl Default for LirsConfig {
    fn default() -> Self {
        Self {
            max_memory: 16 * 1024 * 1024,
            segment_count: 16,
            stack_move_distance: 32,
            non_resident_queue_size: 3,
        }
    }
}

/// A scan-resistant cache bounded by memory rather than entry count.
pub struct CacheLongKeyLirs<K, V> {
    segments: Box<[Mutex<Segment<K, V>>]>,
    segment_mask: usize,
    hasher: RandomState,
    config: LirsConfig,
}

impl<K: Hash + Eq, V: Clone> CacheLongKeyLirs<K, V> {
    /// Creates a cache. The segment count is rounded up to a power of two.
    pub fn new(config: LirsConfig) -> Self {
        let segment_count = config.segment_count.max(1).next_power_of_two();
        let per_segment = (config.max_memory / segment_count).max(1);
        let segments = (0..segment_count)
            .map(|_| {
                Mutex::new(Segment::new(
                    per_segment,
                    config.stack_move_distance,
                    config.non_resident_queue_size,
                ))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            segments,
            segment_mask: segment_count - 1,
            hasher: RandomState::new(),
            config: LirsConfig {
                segment_count,
                ..config
            },
        }
    }

    /// Creates a cache with default tuning and the given budget.
    pub fn with_max_memory(max_memory: usize) -> Self {
        Self::new(LirsConfig {
            max_memory,
            ..Default::default()
        })
    }

    #[inline]
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline]
    fn segment(&self, hash: u64) -> &Mutex<Segment<K, V>> {
        &self.segments[(hash >> 32) as usize & self.segment_mask]
    }

    /// Returns a resident value, recording the access.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.segment(hash).lock().get(key, hash).cloned()
    }

    /// Returns a resident value without changing its recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.segment(hash).lock().peek(key, hash).cloned()
    }

    /// Returns true if the key has a resident value.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.segment(hash).lock().peek(key, hash).is_some()
    }

    /// Adds an entry weighing `memory` bytes and evicts until the segment
    /// fits its budget again. Returns the previous resident value.
    pub fn put(&self, key: K, value: V, memory: usize) -> Option<V> {
        let hash = self.hash(&key);
        let mut segment = self.segment(hash).lock();
        let old = segment.put(key, hash, value, memory.max(1));
        Self::resize_if_needed(&mut segment);
        old
    }

    /// Removes an entry, resident or not.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let mut segment = self.segment(hash).lock();
        let old = segment.remove(key, hash);
        Self::resize_if_needed(&mut segment);
        old
    }

    fn resize_if_needed(segment: &mut Segment<K, V>) {
        if let Some(len) = segment.new_map_len() {
            debug!(from = segment.bucket_count(), to = len, "Resizing cache segment");
            segment.rehash(len);
        }
    }

    /// Drops every entry. Hit and miss counters are kept.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.lock().clear();
        }
    }

    /// Changes the total budget, evicting immediately if it shrank.
    pub fn set_max_memory(&mut self, max_memory: usize) {
        let per_segment = (max_memory / self.segments.len()).max(1);
        for segment in self.segments.iter() {
            segment.lock().set_max_memory(per_segment);
        }
        self.config.max_memory = max_memory;
    }

    /// Total budget in bytes.
    pub fn max_memory(&self) -> usize {
        self.config.max_memory
    }

    /// Memory held by resident entries.
    pub fn used_memory(&self) -> usize {
        self.segments.iter().map(|s| s.lock().used_memory()).sum()
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.lock().resident()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of hot entries.
    pub fn size_hot(&self) -> usize {
        self.segments.iter().map(|s| s.lock().hot()).sum()
    }

    /// Number of ghost entries remembered for re-reference detection.
    pub fn size_non_resident(&self) -> usize {
        self.segments.iter().map(|s| s.lock().non_resident()).sum()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            max_memory: self.config.max_memory,
            ..Default::default()
        };
        for segment in self.segments.iter() {
            let s = segment.lock();
            stats.hits += s.hits;
            stats.misses += s.misses;
            stats.used_memory += s.used_memory();
            stats.resident += s.resident();
            stats.non_resident += s.non_resident();
        }
        stats
    }
}

impl<K: Hash + Eq + Clone, V: Clone> CacheLongKeyLirs<K, V> {
    /// Keys of hot entries.
    pub fn hot_keys(&self) -> Vec<K> {
        self.collect_keys(|s| s.hot_keys())
    }

    /// Keys of resident cold entries.
    pub fn cold_keys(&self) -> Vec<K> {
        self.collect_keys(|s| s.queue_keys(false))
    }

    /// Keys of non-resident entries.
    pub fn non_resident_keys(&self) -> Vec<K> {
        self.collect_keys(|s| s.queue_keys(true))
    }

    fn collect_keys<F>(&self, f: F) -> Vec<K>
    where
        F: for<'a> Fn(&'a Segment<K, V>) -> Vec<&'a K>,
    {
        let mut keys = Vec::new();
        for segment in self.segments.iter() {
            let s = segment.lock();
            keys.extend(f(&*s).into_iter().cloned());
        }
        keys
    }
}
