//! Error types for Kestrel.

use thiserror::Error;

/// Result type alias using KestrelError.
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Errors that can occur in Kestrel operations.
#[derive(Debug, Error)]
pub enum KestrelError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("Page corrupted at pos {pos:#x}: {reason}")]
    PageCorrupted { pos: u64, reason: String },

    #[error("Chunk {chunk_id} corrupted: {reason}")]
    ChunkCorrupted { chunk_id: u32, reason: String },

    #[error("Chunk not found: {chunk_id}")]
    ChunkNotFound { chunk_id: u32 },

    #[error("Chunk too large: {size} bytes (max {max})")]
    ChunkTooLarge { size: u64, max: u64 },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decode error: {0}")]
    Decode(String),

    // Store state errors
    #[error("Store is read-only")]
    ReadOnly,

    #[error("Store is closed")]
    Closed,

    #[error("Store panicked: {0}")]
    Panicked(String),

    #[error("Storage directory is locked: {0}")]
    Locked(String),

    #[error("Map not found: {0}")]
    MapNotFound(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KestrelError {
    /// Returns true if this error means stored data can no longer be trusted.
    ///
    /// Corruption takes the whole store down; everything else is reported to
    /// the caller of the failing operation only.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            KestrelError::PageCorrupted { .. } | KestrelError::ChunkCorrupted { .. }
        )
    }

    /// Rebuilds an equivalent error so one failure can be handed to several
    /// listeners. I/O errors keep their kind and message.
    pub fn duplicate(&self) -> KestrelError {
        match self {
            KestrelError::Io(e) => KestrelError::Io(std::io::Error::new(e.kind(), e.to_string())),
            KestrelError::PageCorrupted { pos, reason } => KestrelError::PageCorrupted {
                pos: *pos,
                reason: reason.clone(),
            },
            KestrelError::ChunkCorrupted { chunk_id, reason } => KestrelError::ChunkCorrupted {
                chunk_id: *chunk_id,
                reason: reason.clone(),
            },
            KestrelError::ChunkNotFound { chunk_id } => KestrelError::ChunkNotFound {
                chunk_id: *chunk_id,
            },
            KestrelError::ChunkTooLarge { size, max } => KestrelError::ChunkTooLarge {
                size: *size,
                max: *max,
            },
            KestrelError::Compression(msg) => KestrelError::Compression(msg.clone()),
            KestrelError::Decode(msg) => KestrelError::Decode(msg.clone()),
            KestrelError::ReadOnly => KestrelError::ReadOnly,
            KestrelError::Closed => KestrelError::Closed,
            KestrelError::Panicked(msg) => KestrelError::Panicked(msg.clone()),
            KestrelError::Locked(msg) => KestrelError::Locked(msg.clone()),
            KestrelError::MapNotFound(name) => KestrelError::MapNotFound(name.clone()),
            KestrelError::ConfigError(msg) => KestrelError::ConfigError(msg.clone()),
            KestrelError::InvalidParameter { name, value } => KestrelError::InvalidParameter {
                name: name.clone(),
                value: value.clone(),
            },
            KestrelError::UnsupportedOperation(msg) => {
                KestrelError::UnsupportedOperation(msg.clone())
            }
            KestrelError::Internal(msg) => KestrelError::Internal(msg.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: KestrelError = io_err.into();
        assert!(matches!(err, KestrelError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_page_corrupted_display() {
        let err = KestrelError::PageCorrupted {
            pos: 0x4000_0040,
            reason: "check value mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Page corrupted at pos 0x40000040: check value mismatch"
        );
        assert!(err.is_corruption());
    }

    #[test]
    fn test_chunk_errors_display() {
        let err = KestrelError::ChunkNotFound { chunk_id: 7 };
        assert_eq!(err.to_string(), "Chunk not found: 7");

        let err = KestrelError::ChunkTooLarge { size: 300, max: 256 };
        assert_eq!(err.to_string(), "Chunk too large: 300 bytes (max 256)");
        assert!(!err.is_corruption());

        let err = KestrelError::ChunkCorrupted {
            chunk_id: 3,
            reason: "bad magic".to_string(),
        };
        assert_eq!(err.to_string(), "Chunk 3 corrupted: bad magic");
        assert!(err.is_corruption());
    }

    #[test]
    fn test_state_errors_display() {
        assert_eq!(KestrelError::ReadOnly.to_string(), "Store is read-only");
        assert_eq!(KestrelError::Closed.to_string(), "Store is closed");
        assert_eq!(
            KestrelError::Panicked("disk gone".to_string()).to_string(),
            "Store panicked: disk gone"
        );
    }

    #[test]
    fn test_config_errors_display() {
        let err = KestrelError::InvalidParameter {
            name: "page_split_size".to_string(),
            value: "0".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid parameter: page_split_size = 0");
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let err = KestrelError::Io(IoError::new(ErrorKind::UnexpectedEof, "short read"));
        let copy = err.duplicate();
        match copy {
            KestrelError::Io(e) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected variant: {other:?}"),
        }

        let err = KestrelError::PageCorrupted {
            pos: 9,
            reason: "x".to_string(),
        };
        assert_eq!(err.duplicate().to_string(), err.to_string());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KestrelError>();
    }
}
