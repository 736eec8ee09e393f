//! Embedded key-value storage for Kestrel.
//!
//! This crate provides:
//! - Persistent ordered maps backed by a copy-on-write B+Tree
//! - Optimistic per-page locking with retry and wake-up on unlock
//! - Synchronous and pooled execution of write operations
//! - Read-committed cursors and key navigation
//! - Saving into append-only chunks and compaction of sparse chunks
//! - A storage container for named maps with background maintenance

mod btree;
mod maintenance;
mod storage;

pub use btree::{
    run_to_completion, with_local_handler, BTreeCursor, BTreeMap, BackgroundExceptionHandler, Callback,
    CompletionListener, HandlerId, MapOperation, MapStats, MapTask, OpStatus, PageOperation, PageOperationHandler,
    PageOperationHandlerFactory, WriteOp, WriteResult,
};
pub use maintenance::MaintenanceTask;
pub use storage::BTreeStorage;

pub use kestrel_cache::CacheStats;
pub use kestrel_chunk::ChunkStats;
pub use kestrel_common::{
    CompressionType, DataType, ExecutionMode, KestrelError, Result, Row, SequenceKey, StorageConfig, StorageMode,
};
