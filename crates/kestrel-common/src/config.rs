//! Configuration structures for Kestrel.

use crate::error::{KestrelError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;

/// Default page split threshold in bytes (16 KB).
pub const DEFAULT_PAGE_SPLIT_SIZE: usize = 16 * 1024;

/// Default page cache budget in bytes (16 MB).
pub const DEFAULT_CACHE_SIZE: usize = 16 * 1024 * 1024;

/// Storage configuration shared by every map opened from one storage directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one subdirectory of chunk files per map.
    pub data_dir: PathBuf,
    /// A page whose memory estimate exceeds this many bytes is split.
    pub page_split_size: usize,
    /// Chunks whose live bytes fall below this percentage are rewritten by compaction.
    pub min_fill_rate: u8,
    /// Row or column storage for leaf values.
    pub storage_mode: StorageMode,
    /// Page cache budget in bytes.
    pub cache_size: usize,
    /// Number of independently locked cache segments (power of two).
    pub cache_segments: usize,
    /// Compression algorithm for page payloads.
    pub compression: CompressionType,
    /// Largest chunk a single save may produce.
    pub max_chunk_size: u64,
    /// Upper bound of live bytes one compaction run rewrites.
    pub max_compact_bytes: u64,
    /// Reject every mutation.
    pub read_only: bool,
    /// Enable fsync after each chunk write.
    pub fsync_enabled: bool,
    /// Number of pooled page operation handlers.
    pub handler_threads: usize,
    /// How synchronous map calls are executed.
    pub execution_mode: ExecutionMode,
    /// Seconds between background save + compact runs (0 = disabled).
    pub maintenance_interval_secs: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_split_size: DEFAULT_PAGE_SPLIT_SIZE,
            min_fill_rate: 30,
            storage_mode: StorageMode::RowStorage,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_segments: 16,
            compression: CompressionType::None,
            max_chunk_size: 256 * 1024 * 1024, // 256 MB
            max_compact_bytes: 64 * 1024 * 1024, // 64 MB
            read_only: false,
            fsync_enabled: true,
            handler_threads: num_cpus(),
            execution_mode: ExecutionMode::Synchronous,
            maintenance_interval_secs: 60,
        }
    }
}

impl StorageConfig {
    /// Creates a new config with the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Sets the page split threshold.
    pub fn page_split_size(mut self, size: usize) -> Self {
        self.page_split_size = size;
        self
    }

    /// Sets the minimum chunk fill rate (percent).
    pub fn min_fill_rate(mut self, rate: u8) -> Self {
        self.min_fill_rate = rate;
        self
    }

    /// Sets the storage mode.
    pub fn storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    /// Sets the cache budget in bytes.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Sets the number of cache segments.
    pub fn cache_segments(mut self, segments: usize) -> Self {
        self.cache_segments = segments;
        self
    }

    /// Sets the compression algorithm.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the maximum chunk size.
    pub fn max_chunk_size(mut self, size: u64) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Sets the compaction rewrite budget.
    pub fn max_compact_bytes(mut self, bytes: u64) -> Self {
        self.max_compact_bytes = bytes;
        self
    }

    /// Opens the storage read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Enables or disables fsync.
    pub fn fsync_enabled(mut self, enabled: bool) -> Self {
        self.fsync_enabled = enabled;
        self
    }

    /// Sets the number of pooled handlers.
    pub fn handler_threads(mut self, threads: usize) -> Self {
        self.handler_threads = threads;
        self
    }

    /// Sets how synchronous calls are executed.
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Sets the maintenance interval in seconds (0 disables the task).
    pub fn maintenance_interval_secs(mut self, secs: u32) -> Self {
        self.maintenance_interval_secs = secs;
        self
    }

    /// Returns the maintenance interval, or None when disabled.
    pub fn maintenance_interval(&self) -> Option<Duration> {
        if self.maintenance_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.maintenance_interval_secs as u64))
        }
    }

    /// Sizes the cache to a quarter of the available system memory.
    ///
    /// Never goes below the default budget so tiny machines still cache a
    /// useful number of leaves.
    pub fn auto_sized_cache(mut self) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        self.cache_size = (available_bytes / 4).max(DEFAULT_CACHE_SIZE);
        self
    }

    /// Checks that every setting is usable.
    pub fn validate(&self) -> Result<()> {
        if self.page_split_size < 64 {
            return Err(invalid("page_split_size", self.page_split_size));
        }
        if self.min_fill_rate == 0 || self.min_fill_rate > 100 {
            return Err(invalid("min_fill_rate", self.min_fill_rate));
        }
        if self.cache_segments == 0 || !self.cache_segments.is_power_of_two() {
            return Err(invalid("cache_segments", self.cache_segments));
        }
        if self.handler_threads == 0 {
            return Err(invalid("handler_threads", self.handler_threads));
        }
        if self.max_chunk_size < 4096 {
            return Err(invalid("max_chunk_size", self.max_chunk_size));
        }
        if self.cache_size == 0 {
            return Err(KestrelError::ConfigError(
                "cache_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: impl ToString) -> KestrelError {
    KestrelError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// How leaf values are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageMode {
    /// Keys and values are stored together in the leaf page.
    #[default]
    RowStorage,
    /// Each value column is stored in its own column page, read lazily.
    ColumnStorage,
}

impl StorageMode {
    /// Mode byte written into every page header.
    pub fn as_byte(self) -> u8 {
        match self {
            StorageMode::RowStorage => 0,
            StorageMode::ColumnStorage => 1,
        }
    }

    /// Parses a page header mode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(StorageMode::RowStorage),
            1 => Some(StorageMode::ColumnStorage),
            _ => None,
        }
    }
}

/// Compression algorithm for page payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionType {
    /// No compression.
    #[default]
    None,
    /// LZ4 compression (fast, moderate ratio).
    Lz4,
    /// Zstd compression (slower, better ratio).
    Zstd,
}

/// How a map runs the write operations issued by its synchronous methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// The calling thread acts as the page operation handler.
    #[default]
    Synchronous,
    /// The operation is queued on a pooled handler and the caller waits for it.
    Pooled,
}

/// Returns the number of available CPUs.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
