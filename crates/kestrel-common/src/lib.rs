//! Kestrel common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Kestrel components.

pub mod codec;
pub mod compress;
pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use compress::Compressor;
pub use config::{CompressionType, ExecutionMode, StorageConfig, StorageMode};
pub use error::{KestrelError, Result};
pub use page::{PageType, UNSAVED_POS};
pub use types::{DataType, Row, SequenceKey};
