//! Page payload compression.

use crate::config::CompressionType;
use crate::error::{KestrelError, Result};
use crate::page::{FLAG_COMPRESSED_FAST, FLAG_COMPRESSED_HIGH};
use std::sync::Arc;

/// Zstd level used for the high ratio compressor.
const ZSTD_LEVEL: i32 = 3;

/// A block compressor for page payloads.
pub trait Compressor: Send + Sync {
    /// Flag stored in the page type byte for payloads this compressor wrote.
    fn flag(&self) -> u8;

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Decompresses into exactly `uncompressed_len` bytes.
    fn decompress(&self, input: &[u8], uncompressed_len: usize) -> Result<Vec<u8>>;
}

/// LZ4 block compression.
#[derive(Debug, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn flag(&self) -> u8 {
        FLAG_COMPRESSED_FAST
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::block::compress(input))
    }

    fn decompress(&self, input: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = lz4_flex::block::decompress(input, uncompressed_len)
            .map_err(|e| KestrelError::Compression(e.to_string()))?;
        check_len(out, uncompressed_len)
    }
}

/// Zstd compression.
#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn flag(&self) -> u8 {
        FLAG_COMPRESSED_HIGH
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(input, ZSTD_LEVEL).map_err(|e| KestrelError::Compression(e.to_string()))
    }

    fn decompress(&self, input: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = zstd::bulk::decompress(input, uncompressed_len)
            .map_err(|e| KestrelError::Compression(e.to_string()))?;
        check_len(out, uncompressed_len)
    }
}

fn check_len(out: Vec<u8>, expected: usize) -> Result<Vec<u8>> {
    if out.len() != expected {
        return Err(KestrelError::Compression(format!(
            "decompressed {} bytes, expected {expected}",
            out.len()
        )));
    }
    Ok(out)
}

/// Returns the compressor used for new pages, if any.
pub fn compressor_for(compression: CompressionType) -> Option<Arc<dyn Compressor>> {
    match compression {
        CompressionType::None => None,
        CompressionType::Lz4 => Some(Arc::new(Lz4Compressor)),
        CompressionType::Zstd => Some(Arc::new(ZstdCompressor)),
    }
}

/// Returns the compressor that wrote a page with the given type byte.
///
/// Pages written under an older setting stay readable after the
/// compression setting changes.
pub fn compressor_for_flags(type_byte: u8) -> Option<Arc<dyn Compressor>> {
    if type_byte & FLAG_COMPRESSED_HIGH != 0 {
        Some(Arc::new(ZstdCompressor))
    } else if type_byte & FLAG_COMPRESSED_FAST != 0 {
        Some(Arc::new(Lz4Compressor))
    } else {
        None
    }
}
