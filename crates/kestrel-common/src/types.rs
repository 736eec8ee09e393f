//! Key and value types stored in maps.
//!
//! A map is generic over a key type and a value type, both implementing
//! [`DataType`]. The trait supplies ordering, a memory estimate used for
//! split decisions and cache accounting, and the binary encoding used in
//! leaf and column pages.

use crate::codec::{get_bytes, get_var_u32, get_var_u64, put_bytes, put_var_u32, put_var_u64};
use crate::error::{KestrelError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::cmp::Ordering;

/// Fixed per-object overhead added to every memory estimate.
pub const OBJECT_OVERHEAD: usize = 24;

/// A type that can be stored as a map key or value.
pub trait DataType: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Total order used by the tree.
    fn compare(&self, other: &Self) -> Ordering;

    /// Approximate heap + inline size in bytes.
    fn memory(&self) -> usize;

    /// Appends the encoded value.
    fn write(&self, buf: &mut BytesMut);

    /// Decodes one value, advancing the buffer.
    fn read(buf: &mut Bytes) -> Result<Self>;

    /// Value equality used by replace-if-equal.
    fn value_eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }

    /// Numeric sequence of a key, tracked so appends continue after it.
    fn sequence(&self) -> Option<i64> {
        None
    }

    /// Number of columns this value splits into in column storage mode.
    fn column_count(&self) -> usize {
        1
    }

    /// Appends the raw bytes of one column.
    fn write_column(&self, column: usize, buf: &mut BytesMut) {
        if column == 0 {
            self.write(buf);
        }
    }

    /// Rebuilds a value from its columns. Columns that were not loaded are `None`.
    fn read_columns(columns: &[Option<Bytes>]) -> Result<Self> {
        match columns.first() {
            Some(Some(raw)) => {
                let mut raw = raw.clone();
                Self::read(&mut raw)
            }
            _ => Err(KestrelError::Decode(
                "column 0 was not loaded".to_string(),
            )),
        }
    }
}

/// Key types that can be generated by `append`.
pub trait SequenceKey: DataType {
    /// Builds the key for a sequence number.
    fn from_sequence(sequence: i64) -> Self;
}

impl DataType for i64 {
    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }

    fn memory(&self) -> usize {
        OBJECT_OVERHEAD
    }

    fn write(&self, buf: &mut BytesMut) {
        // zigzag keeps small negative keys short
        put_var_u64(buf, ((*self << 1) ^ (*self >> 63)) as u64);
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        let raw = get_var_u64(buf)?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    fn sequence(&self) -> Option<i64> {
        Some(*self)
    }
}

impl SequenceKey for i64 {
    fn from_sequence(sequence: i64) -> Self {
        sequence
    }
}

impl DataType for u64 {
    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }

    fn memory(&self) -> usize {
        OBJECT_OVERHEAD
    }

    fn write(&self, buf: &mut BytesMut) {
        put_var_u64(buf, *self);
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        get_var_u64(buf)
    }

    fn sequence(&self) -> Option<i64> {
        i64::try_from(*self).ok()
    }
}

impl SequenceKey for u64 {
    fn from_sequence(sequence: i64) -> Self {
        sequence.max(0) as u64
    }
}

impl DataType for i32 {
    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }

    fn memory(&self) -> usize {
        OBJECT_OVERHEAD
    }

    fn write(&self, buf: &mut BytesMut) {
        put_var_u32(buf, ((*self << 1) ^ (*self >> 31)) as u32);
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        let raw = get_var_u32(buf)?;
        Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
    }

    fn sequence(&self) -> Option<i64> {
        Some(*self as i64)
    }
}

impl DataType for String {
    fn compare(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }

    fn memory(&self) -> usize {
        OBJECT_OVERHEAD + self.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        put_bytes(buf, self.as_bytes());
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        let raw = get_bytes(buf)?;
        String::from_utf8(raw.to_vec()).map_err(|e| KestrelError::Decode(e.to_string()))
    }
}

impl DataType for Bytes {
    fn compare(&self, other: &Self) -> Ordering {
        self.as_ref().cmp(other.as_ref())
    }

    fn memory(&self) -> usize {
        OBJECT_OVERHEAD + self.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        put_bytes(buf, self);
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        get_bytes(buf)
    }
}

impl DataType for Vec<u8> {
    fn compare(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }

    fn memory(&self) -> usize {
        OBJECT_OVERHEAD + self.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        put_bytes(buf, self);
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(get_bytes(buf)?.to_vec())
    }
}

/// Multi-column value. In column storage mode each column lands in its
/// own column page and can be loaded independently.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    pub columns: Vec<Bytes>,
}

impl Row {
    pub fn new(columns: Vec<Bytes>) -> Self {
        Self { columns }
    }

    /// Returns a column, or None if it is out of range.
    pub fn column(&self, index: usize) -> Option<&Bytes> {
        self.columns.get(index)
    }
}

impl DataType for Row {
    fn compare(&self, other: &Self) -> Ordering {
        self.columns.cmp(&other.columns)
    }

    fn memory(&self) -> usize {
        OBJECT_OVERHEAD + self.columns.iter().map(|c| OBJECT_OVERHEAD + c.len()).sum::<usize>()
    }

    fn write(&self, buf: &mut BytesMut) {
        put_var_u32(buf, self.columns.len() as u32);
        for column in &self.columns {
            put_bytes(buf, column);
        }
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        let count = get_var_u32(buf)? as usize;
        if count > buf.remaining() {
            return Err(KestrelError::Decode(format!("row claims {count} columns")));
        }
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            columns.push(get_bytes(buf)?);
        }
        Ok(Row { columns })
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn write_column(&self, column: usize, buf: &mut BytesMut) {
        if let Some(data) = self.columns.get(column) {
            buf.extend_from_slice(data);
        }
    }

    fn read_columns(columns: &[Option<Bytes>]) -> Result<Self> {
        Ok(Row {
            columns: columns.iter().map(|c| c.clone().unwrap_or_default()).collect(),
        })
    }
}
