//! Binary page format.
//!
//! ```text
//! +---------+------+---------+-----------+------+----------------------+
//! | len u32 | mode | check   | key count | type | payload              |
//! | LE      | u8   | u16 LE  | varint    | u8   | raw, or varint len + |
//! |         |      |         |           |      | compressed bytes     |
//! +---------+------+---------+-----------+------+----------------------+
//! ```
//!
//! Payloads:
//! - Leaf, row mode: keys, then values.
//! - Leaf, column mode: keys, varint column count, one u64 column page
//!   position per column.
//! - Node: keys, then per child a u64 position and a leaf flag byte.
//! - Column: one length-prefixed raw column value per row.
//!
//! The length, mode and check value are written by the chunk builder and
//! verified by the chunk on read; this module handles the rest.

use super::constants::{CHILD_FLAG_LEAF, CHILD_FLAG_NODE};
use super::page::{ColumnPage, LeafPage, NodePage, Page};
use super::reference::PageReference;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_chunk::ChunkBuilder;
use kestrel_common::codec::{ensure_remaining, get_bytes, get_var_u64, put_bytes, put_var_u64, var_u64_len};
use kestrel_common::compress::compressor_for_flags;
use kestrel_common::page::{self, MIN_COMPRESS_LENGTH, PAGE_HEADER_SIZE, PAGE_TYPE_MASK};
use kestrel_common::{Compressor, DataType, KestrelError, PageType, Result, StorageMode, UNSAVED_POS};

/// Largest payload a compressed page may claim to expand to.
const MAX_UNCOMPRESSED_LEN: u64 = u32::MAX as u64;

/// Writes one page into `builder` and returns its position.
pub(crate) fn write_page(
    builder: &mut ChunkBuilder,
    mode: StorageMode,
    compressor: Option<&dyn Compressor>,
    page_type: PageType,
    count: usize,
    payload: &[u8],
) -> Result<u64> {
    let mut compressed = None;
    if let Some(compressor) = compressor {
        if payload.len() > MIN_COMPRESS_LENGTH {
            let out = compressor.compress(payload)?;
            if out.len() + var_u64_len(payload.len() as u64) < payload.len() {
                compressed = Some((compressor.flag(), out));
            }
        }
    }

    let offset = builder.begin_page(mode.as_byte())?;
    let buf = builder.buf();
    put_var_u64(buf, count as u64);
    match compressed {
        Some((flag, out)) => {
            buf.put_u8(page_type as u8 | flag);
            put_var_u64(buf, payload.len() as u64);
            buf.extend_from_slice(&out);
        }
        None => {
            buf.put_u8(page_type as u8);
            buf.extend_from_slice(payload);
        }
    }
    builder.end_page(offset, page_type)
}

pub(crate) fn encode_leaf_rows<K: DataType, V: DataType>(keys: &[K], values: &[V]) -> BytesMut {
    let mut buf = BytesMut::new();
    for key in keys {
        key.write(&mut buf);
    }
    for value in values {
        value.write(&mut buf);
    }
    buf
}

pub(crate) fn encode_leaf_columns<K: DataType>(keys: &[K], columns: &[u64]) -> BytesMut {
    let mut buf = BytesMut::new();
    for key in keys {
        key.write(&mut buf);
    }
    put_var_u64(&mut buf, columns.len() as u64);
    for pos in columns {
        buf.put_u64_le(*pos);
    }
    buf
}

pub(crate) fn encode_node<K: DataType>(keys: &[K], children: &[u64]) -> BytesMut {
    let mut buf = BytesMut::new();
    for key in keys {
        key.write(&mut buf);
    }
    for pos in children {
        buf.put_u64_le(*pos);
        buf.put_u8(if page::is_leaf_pos(*pos) {
            CHILD_FLAG_LEAF
        } else {
            CHILD_FLAG_NODE
        });
    }
    buf
}

/// Number of column pages a set of values spreads over.
pub(crate) fn column_count<V: DataType>(values: &[V]) -> usize {
    values.iter().map(DataType::column_count).max().unwrap_or(0)
}

pub(crate) fn encode_column<V: DataType>(values: &[V], column: usize) -> BytesMut {
    let mut buf = BytesMut::new();
    let mut raw = BytesMut::new();
    for value in values {
        raw.clear();
        value.write_column(column, &mut raw);
        put_bytes(&mut buf, &raw);
    }
    buf
}

/// Decodes a page read from `pos`. `data` starts at the length field.
///
/// Every failure is reported as corruption of that page.
pub(crate) fn decode_page<K: DataType, V: DataType>(pos: u64, data: Bytes) -> Result<Page<K, V>> {
    decode(pos, data).map_err(|e| {
        if e.is_corruption() {
            e
        } else {
            KestrelError::PageCorrupted {
                pos,
                reason: e.to_string(),
            }
        }
    })
}

fn corrupted(pos: u64, reason: impl Into<String>) -> KestrelError {
    KestrelError::PageCorrupted {
        pos,
        reason: reason.into(),
    }
}

fn decode<K: DataType, V: DataType>(pos: u64, data: Bytes) -> Result<Page<K, V>> {
    ensure_remaining(&data, PAGE_HEADER_SIZE)?;
    let mode = StorageMode::from_byte(data[4])
        .ok_or_else(|| corrupted(pos, format!("unknown storage mode {}", data[4])))?;
    let mut buf = data.slice(PAGE_HEADER_SIZE..);

    let count = get_var_u64(&mut buf)?;
    ensure_remaining(&buf, 1)?;
    let type_byte = buf.get_u8();
    let page_type = PageType::from_u8(type_byte & PAGE_TYPE_MASK)
        .ok_or_else(|| corrupted(pos, format!("unknown page type byte {type_byte:#04x}")))?;
    if page::page_type(pos) != Some(page_type) {
        return Err(corrupted(
            pos,
            format!("page type {page_type:?} does not match its position"),
        ));
    }

    let mut payload = match compressor_for_flags(type_byte) {
        Some(compressor) => {
            let len = get_var_u64(&mut buf)?;
            if len > MAX_UNCOMPRESSED_LEN {
                return Err(corrupted(pos, format!("uncompressed length {len}")));
            }
            Bytes::from(compressor.decompress(&buf, len as usize)?)
        }
        None => buf,
    };
    // every entry takes at least one byte
    if count > payload.len() as u64 {
        return Err(corrupted(pos, format!("{count} entries in {} bytes", payload.len())));
    }
    let count = count as usize;

    let page = match page_type {
        PageType::Leaf => {
            let keys = read_keys::<K>(&mut payload, count)?;
            match mode {
                StorageMode::RowStorage => {
                    let mut values = Vec::with_capacity(count);
                    for _ in 0..count {
                        values.push(V::read(&mut payload)?);
                    }
                    Page::Leaf(LeafPage::new(keys, values))
                }
                StorageMode::ColumnStorage => {
                    let columns = get_var_u64(&mut payload)? as usize;
                    ensure_remaining(&payload, columns.saturating_mul(8))?;
                    let positions = (0..columns).map(|_| payload.get_u64_le()).collect();
                    Page::Leaf(LeafPage::with_column_positions(keys, positions))
                }
            }
        }
        PageType::Node => {
            let keys = read_keys::<K>(&mut payload, count)?;
            ensure_remaining(&payload, (count + 1).saturating_mul(9))?;
            let mut children = Vec::with_capacity(count + 1);
            for _ in 0..=count {
                let child = payload.get_u64_le();
                let flag = payload.get_u8();
                let expected = if page::is_leaf_pos(child) {
                    CHILD_FLAG_LEAF
                } else {
                    CHILD_FLAG_NODE
                };
                if child == UNSAVED_POS || flag != expected {
                    return Err(corrupted(pos, format!("bad child position {child:#x}")));
                }
                children.push(PageReference::persisted(child));
            }
            Page::Node(NodePage::new(keys, children))
        }
        PageType::Column => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(get_bytes(&mut payload)?);
            }
            Page::Column(ColumnPage::new(values))
        }
    };

    if payload.has_remaining() {
        return Err(corrupted(pos, format!("{} trailing bytes", payload.remaining())));
    }
    Ok(page)
}

fn read_keys<K: DataType>(buf: &mut Bytes, count: usize) -> Result<Vec<K>> {
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        keys.push(K::read(buf)?);
    }
    Ok(keys)
}
