//! Primitive encode/decode helpers on top of `bytes`.
//!
//! Pages and chunk metadata are built with `BytesMut` and parsed from
//! `Bytes`; these helpers add the variable-length integers and
//! length-prefixed byte strings the formats need.

use crate::error::{KestrelError, Result};
use bytes::{Buf, BufMut, Bytes};

/// Writes an unsigned LEB128 varint.
#[inline]
pub fn put_var_u64(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Reads an unsigned LEB128 varint.
#[inline]
pub fn get_var_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(KestrelError::Decode("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(KestrelError::Decode("varint overflow".to_string()));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(KestrelError::Decode("varint overflow".to_string()));
        }
    }
}

/// Writes a varint that must fit in 32 bits.
#[inline]
pub fn put_var_u32(buf: &mut impl BufMut, value: u32) {
    put_var_u64(buf, value as u64);
}

/// Reads a varint that must fit in 32 bits.
#[inline]
pub fn get_var_u32(buf: &mut impl Buf) -> Result<u32> {
    let value = get_var_u64(buf)?;
    u32::try_from(value).map_err(|_| KestrelError::Decode(format!("varint {value} exceeds u32")))
}

/// Number of bytes `put_var_u64` emits for `value`.
#[inline]
pub fn var_u64_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Writes a length-prefixed byte string.
pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    put_var_u64(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Reads a length-prefixed byte string without copying.
pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_var_u64(buf)? as usize;
    ensure_remaining(buf, len)?;
    Ok(buf.split_to(len))
}

/// Writes a length-prefixed UTF-8 string.
pub fn put_str(buf: &mut impl BufMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

/// Reads a length-prefixed UTF-8 string.
pub fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|e| KestrelError::Decode(e.to_string()))
}

/// Fails with a decode error unless `len` more bytes are available.
#[inline]
pub fn ensure_remaining(buf: &impl Buf, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(KestrelError::Decode(format!(
            "need {len} bytes, {} remaining",
            buf.remaining()
        )));
    }
    Ok(())
}
