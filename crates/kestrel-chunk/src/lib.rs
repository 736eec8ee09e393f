//! Chunk storage for Kestrel.
//!
//! Every save of a map produces one append-only chunk file holding the
//! pages written by that save. This crate provides:
//! - The positional file abstraction chunk files are written through
//! - The chunk file format (header, page body, metadata, removed log)
//! - The chunk registry with removed-page epochs
//! - Compaction planning over chunk fill rates

pub mod chunk;
pub mod compactor;
pub mod constants;
pub mod file;
pub mod manager;

pub use chunk::{Chunk, ChunkBuilder, ChunkHeader};
pub use compactor::{ChunkCompactor, CompactionPlan};
pub use file::{DirLock, FileStorage, FileSystem, LocalFileStorage, LocalFileSystem};
pub use manager::{ChunkManager, ChunkManagerConfig, ChunkStats, ChunkUsage, SaveEpoch};
