//! Chunk file format constants.

// Chunk header constants

/// Size of the chunk header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 128;

/// Magic bytes identifying a chunk file.
pub const CHUNK_MAGIC: [u8; 4] = *b"KCHK";

/// Current format version.
pub const CHUNK_VERSION: u32 = 1;

// Header field offsets

pub const OFF_MAGIC: usize = 0;
pub const OFF_VERSION: usize = 4;
pub const OFF_CHUNK_ID: usize = 8;
pub const OFF_PAGE_COUNT: usize = 12;
pub const OFF_SEQUENCE: usize = 16;
pub const OFF_ROOT_POS: usize = 24;
pub const OFF_MAP_SIZE: usize = 32;
pub const OFF_BODY_LEN: usize = 40;
pub const OFF_METADATA_OFFSET: usize = 48;
pub const OFF_REMOVED_COUNT: usize = 56;
pub const OFF_CREATED_AT: usize = 64;
/// The header checksum covers every byte before this offset.
pub const OFF_HEADER_CHECKSUM: usize = CHUNK_HEADER_SIZE - 4;

// Metadata constants

/// One metadata entry: page position (8) + page length (4).
pub const METADATA_ENTRY_SIZE: usize = 12;

/// One removed-page log entry.
pub const REMOVED_ENTRY_SIZE: usize = 8;

/// Trailing metadata checksum.
pub const METADATA_CHECKSUM_SIZE: usize = 4;

// File naming

/// Chunk file name prefix.
pub const CHUNK_FILE_PREFIX: &str = "c_";

/// Chunk file name extension.
pub const CHUNK_FILE_EXTENSION: &str = "chunk";

/// Name of the directory lock file.
pub const LOCK_FILE_NAME: &str = ".lock";
