//! Chunk file format.
//!
//! A chunk holds every page written by one save:
//!
//! ```text
//! +------------------+  0
//! | header (128)     |
//! +------------------+  128
//! | pages            |  body, each page starts with its u32 length
//! +------------------+  metadata_offset
//! | (pos, len) * n   |
//! | removed pos * m  |
//! | crc32            |
//! +------------------+
//! ```
//!
//! The file is assembled in memory and written with a single call. A
//! header or metadata checksum failure on open marks an incomplete save.

use crate::constants::*;
use crate::file::FileStorage;
use bytes::{BufMut, Bytes, BytesMut};
use kestrel_common::page::{self, PageType, PAGE_HEADER_SIZE};
use kestrel_common::{KestrelError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed-size header at the start of every chunk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_id: u32,
    pub page_count: u32,
    /// Save sequence, unique and increasing across the life of a map.
    pub sequence: u64,
    /// Root page position at save time.
    pub root_pos: u64,
    /// Number of entries in the map at save time.
    pub map_size: u64,
    pub body_len: u64,
    pub metadata_offset: u64,
    pub removed_count: u32,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl ChunkHeader {
    /// Serializes the header, appending its checksum.
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut data = [0u8; CHUNK_HEADER_SIZE];
        data[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&CHUNK_MAGIC);
        data[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&CHUNK_VERSION.to_le_bytes());
        data[OFF_CHUNK_ID..OFF_CHUNK_ID + 4].copy_from_slice(&self.chunk_id.to_le_bytes());
        data[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].copy_from_slice(&self.page_count.to_le_bytes());
        data[OFF_SEQUENCE..OFF_SEQUENCE + 8].copy_from_slice(&self.sequence.to_le_bytes());
        data[OFF_ROOT_POS..OFF_ROOT_POS + 8].copy_from_slice(&self.root_pos.to_le_bytes());
        data[OFF_MAP_SIZE..OFF_MAP_SIZE + 8].copy_from_slice(&self.map_size.to_le_bytes());
        data[OFF_BODY_LEN..OFF_BODY_LEN + 8].copy_from_slice(&self.body_len.to_le_bytes());
        data[OFF_METADATA_OFFSET..OFF_METADATA_OFFSET + 8]
            .copy_from_slice(&self.metadata_offset.to_le_bytes());
        data[OFF_REMOVED_COUNT..OFF_REMOVED_COUNT + 4]
            .copy_from_slice(&self.removed_count.to_le_bytes());
        data[OFF_CREATED_AT..OFF_CREATED_AT + 8].copy_from_slice(&self.created_at.to_le_bytes());
        let checksum = crc32fast::hash(&data[..OFF_HEADER_CHECKSUM]);
        data[OFF_HEADER_CHECKSUM..].copy_from_slice(&checksum.to_le_bytes());
        data
    }

    /// Parses and validates a header.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let corrupted = |reason: String| KestrelError::ChunkCorrupted {
            chunk_id: 0,
            reason,
        };
        if data.len() < CHUNK_HEADER_SIZE {
            return Err(corrupted(format!("header has {} bytes", data.len())));
        }
        if data[OFF_MAGIC..OFF_MAGIC + 4] != CHUNK_MAGIC {
            return Err(corrupted("invalid magic bytes".to_string()));
        }
        let version = read_u32(data, OFF_VERSION);
        if version != CHUNK_VERSION {
            return Err(corrupted(format!("unsupported version: {version}")));
        }
        let stored = read_u32(data, OFF_HEADER_CHECKSUM);
        if stored != crc32fast::hash(&data[..OFF_HEADER_CHECKSUM]) {
            return Err(corrupted("header checksum mismatch".to_string()));
        }
        Ok(Self {
            chunk_id: read_u32(data, OFF_CHUNK_ID),
            page_count: read_u32(data, OFF_PAGE_COUNT),
            sequence: read_u64(data, OFF_SEQUENCE),
            root_pos: read_u64(data, OFF_ROOT_POS),
            map_size: read_u64(data, OFF_MAP_SIZE),
            body_len: read_u64(data, OFF_BODY_LEN),
            metadata_offset: read_u64(data, OFF_METADATA_OFFSET),
            removed_count: read_u32(data, OFF_REMOVED_COUNT),
            created_at: read_u64(data, OFF_CREATED_AT),
        })
    }
}

#[inline]
fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// File name of a chunk.
pub fn chunk_file_name(chunk_id: u32, sequence: u64) -> String {
    format!("{CHUNK_FILE_PREFIX}{chunk_id}_{sequence}.{CHUNK_FILE_EXTENSION}")
}

/// Parses `c_<id>_<sequence>.chunk`.
pub fn parse_chunk_file_name(path: &Path) -> Option<(u32, u64)> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_prefix(CHUNK_FILE_PREFIX)?
        .strip_suffix(CHUNK_FILE_EXTENSION)?
        .strip_suffix('.')?;
    let (id, sequence) = stem.split_once('_')?;
    Some((id.parse().ok()?, sequence.parse().ok()?))
}

/// Accumulates the pages of one save and produces the chunk image.
pub struct ChunkBuilder {
    chunk_id: u32,
    buf: BytesMut,
    pages: Vec<(u64, u32)>,
}

impl ChunkBuilder {
    pub fn new(chunk_id: u32) -> Self {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        buf.put_bytes(0, CHUNK_HEADER_SIZE);
        Self {
            chunk_id,
            buf,
            pages: Vec::new(),
        }
    }

    pub fn chunk_id(&self) -> u32 {
        self.chunk_id
    }

    /// Bytes written so far, header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Starts a page: writes the length and check value placeholders and
    /// the mode byte. Returns the page offset to pass to [`end_page`].
    ///
    /// [`end_page`]: ChunkBuilder::end_page
    pub fn begin_page(&mut self, mode: u8) -> Result<u32> {
        let offset = u32::try_from(self.buf.len()).map_err(|_| KestrelError::ChunkTooLarge {
            size: self.buf.len() as u64,
            max: u32::MAX as u64,
        })?;
        self.buf.put_u32_le(0);
        self.buf.put_u8(mode);
        self.buf.put_u16_le(0);
        Ok(offset)
    }

    /// Buffer the page body is appended to.
    pub fn buf(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Finishes the page started at `offset`, patching its length and
    /// check value. Returns the new page position.
    pub fn end_page(&mut self, offset: u32, page_type: PageType) -> Result<u64> {
        let start = offset as usize;
        let len = u32::try_from(self.buf.len() - start).map_err(|_| {
            KestrelError::ChunkTooLarge {
                size: (self.buf.len() - start) as u64,
                max: u32::MAX as u64,
            }
        })?;
        let check = page::page_check_value(self.chunk_id, offset, len);
        self.buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
        self.buf[start + 5..start + 7].copy_from_slice(&check.to_le_bytes());
        let pos = page::page_pos(self.chunk_id, offset, page_type);
        self.pages.push((pos, len));
        Ok(pos)
    }

    /// Appends metadata and the header. Fails if the image exceeds `max_size`.
    pub fn finish(
        mut self,
        sequence: u64,
        root_pos: u64,
        map_size: u64,
        removed: &[u64],
        max_size: u64,
    ) -> Result<(ChunkHeader, Bytes, Vec<(u64, u32)>)> {
        let body_len = (self.buf.len() - CHUNK_HEADER_SIZE) as u64;
        let metadata_offset = self.buf.len() as u64;
        let metadata_start = self.buf.len();
        for (pos, len) in &self.pages {
            self.buf.put_u64_le(*pos);
            self.buf.put_u32_le(*len);
        }
        for pos in removed {
            self.buf.put_u64_le(*pos);
        }
        let checksum = crc32fast::hash(&self.buf[metadata_start..]);
        self.buf.put_u32_le(checksum);

        let size = self.buf.len() as u64;
        if size > max_size {
            return Err(KestrelError::ChunkTooLarge {
                size,
                max: max_size,
            });
        }

        let header = ChunkHeader {
            chunk_id: self.chunk_id,
            page_count: self.pages.len() as u32,
            sequence,
            root_pos,
            map_size,
            body_len,
            metadata_offset,
            removed_count: removed.len() as u32,
            created_at: now_millis(),
        };
        self.buf[..CHUNK_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        Ok((header, self.buf.freeze(), self.pages))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A persisted chunk.
pub struct Chunk {
    header: ChunkHeader,
    file: Arc<dyn FileStorage>,
    /// Length of every page in the chunk, by position.
    pages: HashMap<u64, u32>,
    /// Removed positions persisted with this chunk.
    removed_log: Vec<u64>,
    total_bytes: u64,
}

impl Chunk {
    /// Wraps a chunk that was just written.
    pub fn new(
        header: ChunkHeader,
        file: Arc<dyn FileStorage>,
        pages: Vec<(u64, u32)>,
        removed_log: Vec<u64>,
    ) -> Self {
        let total_bytes = pages.iter().map(|(_, len)| *len as u64).sum();
        Self {
            header,
            file,
            pages: pages.into_iter().collect(),
            removed_log,
            total_bytes,
        }
    }

    /// Reads and validates the header and metadata of an existing chunk file.
    pub fn open(file: Arc<dyn FileStorage>) -> Result<Self> {
        let size = file.size()?;
        if size < CHUNK_HEADER_SIZE as u64 {
            return Err(KestrelError::ChunkCorrupted {
                chunk_id: 0,
                reason: format!("file has {size} bytes"),
            });
        }
        let header = ChunkHeader::from_bytes(&file.read_at(0, CHUNK_HEADER_SIZE)?)?;
        let corrupted = |reason: String| KestrelError::ChunkCorrupted {
            chunk_id: header.chunk_id,
            reason,
        };

        let metadata_len = header.page_count as u64 * METADATA_ENTRY_SIZE as u64
            + header.removed_count as u64 * REMOVED_ENTRY_SIZE as u64;
        let expected_size = header.metadata_offset + metadata_len + METADATA_CHECKSUM_SIZE as u64;
        if header.metadata_offset != CHUNK_HEADER_SIZE as u64 + header.body_len
            || size < expected_size
        {
            return Err(corrupted(format!(
                "file has {size} bytes, metadata ends at {expected_size}"
            )));
        }

        let metadata = file.read_at(
            header.metadata_offset,
            (metadata_len + METADATA_CHECKSUM_SIZE as u64) as usize,
        )?;
        let body = &metadata[..metadata_len as usize];
        let stored = read_u32(&metadata, metadata_len as usize);
        if stored != crc32fast::hash(body) {
            return Err(corrupted("metadata checksum mismatch".to_string()));
        }

        let mut pages = Vec::with_capacity(header.page_count as usize);
        let mut at = 0;
        for _ in 0..header.page_count {
            let pos = read_u64(body, at);
            let len = read_u32(body, at + 8);
            if page::chunk_id(pos) != header.chunk_id {
                return Err(corrupted(format!(
                    "page {} belongs to another chunk",
                    page::format_pos(pos)
                )));
            }
            pages.push((pos, len));
            at += METADATA_ENTRY_SIZE;
        }
        let mut removed_log = Vec::with_capacity(header.removed_count as usize);
        for _ in 0..header.removed_count {
            removed_log.push(read_u64(body, at));
            at += REMOVED_ENTRY_SIZE;
        }

        Ok(Self::new(header, file, pages, removed_log))
    }

    pub fn id(&self) -> u32 {
        self.header.chunk_id
    }

    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    pub fn root_pos(&self) -> u64 {
        self.header.root_pos
    }

    pub fn map_size(&self) -> u64 {
        self.header.map_size
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Sum of the lengths of all pages in the chunk.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_len(&self, pos: u64) -> Option<u32> {
        self.pages.get(&pos).copied()
    }

    pub fn page_positions(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.keys().copied()
    }

    pub fn removed_log(&self) -> &[u64] {
        &self.removed_log
    }

    /// Reads one page and verifies its length prefix and check value.
    ///
    /// The returned bytes start at the page's length field.
    pub fn read_page(&self, pos: u64) -> Result<Bytes> {
        let corrupted = |reason: String| KestrelError::PageCorrupted { pos, reason };
        let len = self
            .page_len(pos)
            .ok_or_else(|| corrupted(format!("not a page of chunk {}", self.id())))?;
        if (len as usize) < PAGE_HEADER_SIZE {
            return Err(corrupted(format!("recorded length {len} too small")));
        }
        let offset = page::page_offset(pos);
        let data = self.file.read_at(offset as u64, len as usize)?;

        let stored_len = read_u32(&data, 0);
        if stored_len != len {
            return Err(corrupted(format!(
                "length {stored_len} does not match recorded length {len}"
            )));
        }
        let stored_check = u16::from_le_bytes([data[5], data[6]]);
        let expected = page::page_check_value(self.id(), offset, len);
        if stored_check != expected {
            return Err(corrupted(format!(
                "check value {stored_check:#06x}, expected {expected:#06x}"
            )));
        }
        Ok(Bytes::from(data))
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.header.chunk_id)
            .field("sequence", &self.header.sequence)
            .field("pages", &self.pages.len())
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{FileSystem, LocalFileSystem};
    use tempfile::tempdir;

    fn build(chunk_id: u32) -> (ChunkHeader, Bytes, Vec<(u64, u32)>) {
        let mut builder = ChunkBuilder::new(chunk_id);
        let offset = builder.begin_page(0).unwrap();
        builder.buf().put_slice(b"leaf payload");
        let leaf = builder.end_page(offset, PageType::Leaf).unwrap();
        let offset = builder.begin_page(0).unwrap();
        builder.buf().put_slice(b"node");
        builder.end_page(offset, PageType::Node).unwrap();
        builder
            .finish(9, leaf, 42, &[page::page_pos(1, 128, PageType::Leaf)], u64::MAX)
            .unwrap()
    }

    #[test]
    fn test_header_bytes() {
        let (header, image, _) = build(3);
        assert_eq!(&image[..4], b"KCHK");
        let parsed = ChunkHeader::from_bytes(&image[..CHUNK_HEADER_SIZE]).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.sequence, 9);
        assert_eq!(parsed.map_size, 42);
        assert_eq!(parsed.page_count, 2);
    }

    #[test]
    fn test_header_checksum_detects_damage() {
        let (_, image, _) = build(3);
        let mut raw = image.to_vec();
        raw[OFF_ROOT_POS] ^= 0xFF;
        assert!(matches!(
            ChunkHeader::from_bytes(&raw[..CHUNK_HEADER_SIZE]),
            Err(KestrelError::ChunkCorrupted { .. })
        ));
    }

    #[test]
    fn test_write_open_and_read_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(chunk_file_name(3, 9));
        let (header, image, pages) = build(3);
        let file = LocalFileSystem.open(&path, true).unwrap();
        file.write_at(0, &image).unwrap();

        let chunk = Chunk::open(file).unwrap();
        assert_eq!(chunk.id(), 3);
        assert_eq!(chunk.root_pos(), header.root_pos);
        assert_eq!(chunk.removed_log().len(), 1);
        assert_eq!(chunk.page_count(), 2);

        let (leaf_pos, leaf_len) = pages[0];
        let data = chunk.read_page(leaf_pos).unwrap();
        assert_eq!(data.len(), leaf_len as usize);
        assert_eq!(&data[PAGE_HEADER_SIZE..], b"leaf payload");
        assert_eq!(page::page_offset(leaf_pos), CHUNK_HEADER_SIZE as u32);
    }

    #[test]
    fn test_truncated_chunk_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(chunk_file_name(1, 1));
        let (_, image, _) = build(1);
        let file = LocalFileSystem.open(&path, true).unwrap();
        file.write_at(0, &image[..image.len() - 3]).unwrap();
        assert!(matches!(
            Chunk::open(file),
            Err(KestrelError::ChunkCorrupted { chunk_id: 1, .. })
        ));
    }

    #[test]
    fn test_damaged_page_fails_check_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(chunk_file_name(2, 1));
        let (_, image, pages) = build(2);
        let mut raw = image.to_vec();
        let offset = page::page_offset(pages[0].0) as usize;
        raw[offset + 5] ^= 0x55;
        let file = LocalFileSystem.open(&path, true).unwrap();
        file.write_at(0, &raw).unwrap();

        let chunk = Chunk::open(file).unwrap();
        let err = chunk.read_page(pages[0].0).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_oversized_chunk() {
        let mut builder = ChunkBuilder::new(1);
        let offset = builder.begin_page(0).unwrap();
        builder.buf().put_bytes(7, 4096);
        builder.end_page(offset, PageType::Leaf).unwrap();
        assert!(matches!(
            builder.finish(1, 0, 0, &[], 1024),
            Err(KestrelError::ChunkTooLarge { max: 1024, .. })
        ));
    }

    #[test]
    fn test_file_names() {
        assert_eq!(chunk_file_name(12, 345), "c_12_345.chunk");
        assert_eq!(
            parse_chunk_file_name(Path::new("/x/c_12_345.chunk")),
            Some((12, 345))
        );
        assert_eq!(parse_chunk_file_name(Path::new("c_12.chunk")), None);
        assert_eq!(parse_chunk_file_name(Path::new(".lock")), None);
    }
}
