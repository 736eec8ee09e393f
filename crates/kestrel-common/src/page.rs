//! Page locators and header constants.
//!
//! A persisted page is addressed by a single `u64` position:
//!
//! ```text
//! 63            38 37                          6 5      0
//! +---------------+-----------------------------+--------+
//! | chunk id (26) | offset within chunk (32)    | type   |
//! +---------------+-----------------------------+--------+
//! ```
//!
//! Position 0 is reserved for "not saved yet"; chunk ids start at 1 so no
//! persisted page ever encodes to 0.

use serde::{Deserialize, Serialize};

/// Bits used by the page type tag.
const TYPE_BITS: u32 = 6;
/// Bits used by the intra-chunk offset.
const OFFSET_BITS: u32 = 32;
/// Shift of the chunk id.
const CHUNK_SHIFT: u32 = TYPE_BITS + OFFSET_BITS;

/// Largest chunk id a position can carry.
pub const MAX_CHUNK_ID: u32 = (1 << (64 - CHUNK_SHIFT)) - 1;

/// Position of a page that has not been written yet.
pub const UNSAVED_POS: u64 = 0;

/// Payloads at or below this size are never compressed.
pub const MIN_COMPRESS_LENGTH: usize = 16;

/// Fixed part of every page: length (4) + mode (1) + check value (2).
pub const PAGE_HEADER_SIZE: usize = 7;

/// Type byte flag: payload compressed with the fast compressor.
pub const FLAG_COMPRESSED_FAST: u8 = 0x04;
/// Type byte flag: payload compressed with the high ratio compressor.
pub const FLAG_COMPRESSED_HIGH: u8 = 0x08;
/// Mask of the page type inside the type byte.
pub const PAGE_TYPE_MASK: u8 = 0x03;

/// Page types stored in the low bits of a position and in the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// B+ tree leaf page.
    Leaf = 0,
    /// B+ tree internal page.
    Node = 1,
    /// One value column of a leaf in column storage mode.
    Column = 2,
}

impl PageType {
    /// Parses a type tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PageType::Leaf),
            1 => Some(PageType::Node),
            2 => Some(PageType::Column),
            _ => None,
        }
    }
}

/// Packs a chunk id, an intra-chunk offset and a page type into a position.
#[inline]
pub fn page_pos(chunk_id: u32, offset: u32, page_type: PageType) -> u64 {
    debug_assert!(chunk_id <= MAX_CHUNK_ID);
    ((chunk_id as u64) << CHUNK_SHIFT) | ((offset as u64) << TYPE_BITS) | page_type as u64
}

/// Returns the chunk id encoded in a position.
#[inline]
pub fn chunk_id(pos: u64) -> u32 {
    (pos >> CHUNK_SHIFT) as u32
}

/// Returns the offset within the chunk encoded in a position.
#[inline]
pub fn page_offset(pos: u64) -> u32 {
    (pos >> TYPE_BITS) as u32
}

/// Returns the page type encoded in a position.
#[inline]
pub fn page_type(pos: u64) -> Option<PageType> {
    PageType::from_u8((pos & ((1 << TYPE_BITS) - 1)) as u8)
}

/// Returns true if the position points to a leaf page.
#[inline]
pub fn is_leaf_pos(pos: u64) -> bool {
    pos != UNSAVED_POS && page_type(pos) == Some(PageType::Leaf)
}

#[inline]
fn mix(value: u32) -> u16 {
    ((value >> 16) ^ value) as u16
}

/// Check value stored in every page header.
///
/// Mixes the chunk id, the offset and the page length so that a page read
/// from the wrong place, or truncated, is detected. This is corruption
/// detection only, not a cryptographic digest.
#[inline]
pub fn page_check_value(chunk_id: u32, offset: u32, length: u32) -> u16 {
    mix(chunk_id) ^ mix(offset) ^ mix(length)
}

/// Formats a position for log output.
pub fn format_pos(pos: u64) -> String {
    if pos == UNSAVED_POS {
        return "unsaved".to_string();
    }
    format!(
        "{}:{}:{:?}",
        chunk_id(pos),
        page_offset(pos),
        page_type(pos)
    )
}
