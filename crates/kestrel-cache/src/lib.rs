//! Page cache for Kestrel.
//!
//! This crate provides a memory-bounded cache with:
//! - LIRS replacement (hot set, resident cold queue, ghost queue)
//! - Independently locked power-of-two segments
//! - Per-entry memory weights instead of a fixed entry count
//! - Hit and miss accounting

mod lirs;
mod segment;

pub use lirs::{CacheLongKeyLirs, LirsConfig};

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub used_memory: usize,
    pub max_memory: usize,
    pub resident: usize,
    pub non_resident: usize,
}

impl CacheStats {
    /// Fraction of lookups that found a resident value.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A cache of decoded pages keyed by page position.
pub trait PageCache<V>: Send + Sync {
    /// Returns the cached page at `pos`.
    fn get(&self, pos: u64) -> Option<V>;

    /// Caches a page weighing `memory` bytes.
    fn put(&self, pos: u64, page: V, memory: usize);

    /// Drops the page at `pos`.
    fn remove(&self, pos: u64);

    /// Drops every page.
    fn clear(&self);

    fn stats(&self) -> CacheStats;
}

impl<V> PageCache<V> for CacheLongKeyLirs<u64, V>
where
    V: Clone + Send,
{
    fn get(&self, pos: u64) -> Option<V> {
        CacheLongKeyLirs::get(self, &pos)
    }

    fn put(&self, pos: u64, page: V, memory: usize) {
        CacheLongKeyLirs::put(self, pos, page, memory);
    }

    fn remove(&self, pos: u64) {
        CacheLongKeyLirs::remove(self, &pos);
    }

    fn clear(&self) {
        CacheLongKeyLirs::clear(self);
    }

    fn stats(&self) -> CacheStats {
        CacheLongKeyLirs::stats(self)
    }
}
