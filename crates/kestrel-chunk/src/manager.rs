//! Chunk registry.
//!
//! Tracks every live chunk of one map, allocates chunk ids, writes new
//! chunks and owns the set of removed (garbage) page positions.
//!
//! Removed positions go through two epochs. A position superseded since
//! the last save is *pending*: the last persisted root may still reference
//! it. When a save starts it takes the pending set, and once its chunk is
//! on disk those positions become *committed* garbage. Only committed
//! garbage counts against a chunk's fill rate, so compaction never deletes
//! a chunk the newest persisted root still points into.

use crate::chunk::{chunk_file_name, parse_chunk_file_name, Chunk, ChunkBuilder};
use crate::file::FileSystem;
use kestrel_common::page::{self, MAX_CHUNK_ID, UNSAVED_POS};
use kestrel_common::{KestrelError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Settings a [`ChunkManager`] needs from the storage configuration.
#[derive(Debug, Clone)]
pub struct ChunkManagerConfig {
    /// Largest chunk a save may write.
    pub max_chunk_size: u64,
    /// Sync every chunk file after writing it.
    pub fsync_enabled: bool,
    /// Never write or delete files.
    pub read_only: bool,
}

impl Default for ChunkManagerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 256 * 1024 * 1024,
            fsync_enabled: true,
            read_only: false,
        }
    }
}

/// Bitset of allocated chunk ids.
#[derive(Debug, Default, Clone)]
pub struct ChunkIdSet {
    words: Vec<u64>,
}

impl ChunkIdSet {
    pub fn contains(&self, id: u32) -> bool {
        let (word, bit) = (id as usize / 64, id % 64);
        self.words.get(word).map(|w| w & (1 << bit) != 0).unwrap_or(false)
    }

    pub fn insert(&mut self, id: u32) {
        let (word, bit) = (id as usize / 64, id % 64);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << bit;
    }

    pub fn remove(&mut self, id: u32) {
        let (word, bit) = (id as usize / 64, id % 64);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1 << bit);
        }
    }

    /// Returns the lowest free id, starting at 1.
    pub fn first_free(&self) -> u32 {
        for (i, word) in self.words.iter().enumerate() {
            // id 0 is never handed out
            let taken = if i == 0 { word | 1 } else { *word };
            if taken != u64::MAX {
                return (i * 64) as u32 + (!taken).trailing_zeros();
            }
        }
        (self.words.len() * 64).max(1) as u32
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Space accounting of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkUsage {
    pub chunk_id: u32,
    pub sequence: u64,
    pub total_bytes: u64,
    pub live_bytes: u64,
    pub page_count: usize,
    pub live_pages: usize,
}

impl ChunkUsage {
    /// Live bytes as a percentage of all page bytes.
    pub fn fill_rate(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        ((self.live_bytes * 100) / self.total_bytes) as u8
    }
}

/// Aggregate statistics over all chunks of a map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub chunk_count: usize,
    pub total_bytes: u64,
    pub live_bytes: u64,
    pub pending_removed: usize,
    pub committed_removed: usize,
}

impl ChunkStats {
    pub fn fill_rate(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        ((self.live_bytes * 100) / self.total_bytes) as u8
    }
}

/// Positions taken from the pending set by a save in progress.
#[derive(Debug, Default)]
pub struct SaveEpoch {
    removed: HashSet<u64>,
}

impl SaveEpoch {
    pub fn len(&self) -> usize {
        self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

struct ManagerState {
    chunks: BTreeMap<u32, Arc<Chunk>>,
    ids: ChunkIdSet,
    pending_removed: HashSet<u64>,
    committed_removed: HashSet<u64>,
    last_chunk: Option<Arc<Chunk>>,
    next_sequence: u64,
}

/// Registry and lifecycle of the chunks of one map.
pub struct ChunkManager {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    config: ChunkManagerConfig,
    state: RwLock<ManagerState>,
}

impl ChunkManager {
    /// Opens the chunk directory, loading every valid chunk.
    ///
    /// Chunks whose header or metadata fail validation are the remains of
    /// an interrupted save. They are skipped, and deleted unless read-only.
    pub fn open(fs: Arc<dyn FileSystem>, dir: &Path, config: ChunkManagerConfig) -> Result<Self> {
        fs.create_dir_all(dir)?;

        let mut chunks: BTreeMap<u32, Arc<Chunk>> = BTreeMap::new();
        let mut stale = Vec::new();
        for path in fs.list(dir)? {
            let Some((id, sequence)) = parse_chunk_file_name(&path) else {
                continue;
            };
            let loaded = fs.open(&path, false).and_then(Chunk::open);
            match loaded {
                Ok(chunk) if chunk.id() == id && chunk.sequence() == sequence => {
                    if let Some(existing) = chunks.get(&id) {
                        if existing.sequence() > sequence {
                            stale.push(path);
                            continue;
                        }
                        stale.push(existing.path().to_path_buf());
                    }
                    chunks.insert(id, Arc::new(chunk));
                }
                Ok(_) => {
                    warn!(path = %path.display(), "Chunk header does not match file name, ignoring");
                    stale.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring incomplete chunk");
                    stale.push(path);
                }
            }
        }

        if !config.read_only {
            for path in stale {
                fs.remove(&path)?;
            }
        }

        let last_chunk = chunks.values().max_by_key(|c| c.sequence()).cloned();
        let next_sequence = last_chunk.as_ref().map(|c| c.sequence() + 1).unwrap_or(1);
        let mut ids = ChunkIdSet::default();
        for id in chunks.keys() {
            ids.insert(*id);
        }
        // Only the newest log describes the persisted root, and only
        // positions in chunks that still exist matter.
        let committed_removed: HashSet<u64> = last_chunk
            .as_ref()
            .map(|c| {
                c.removed_log()
                    .iter()
                    .copied()
                    .filter(|pos| chunks.contains_key(&page::chunk_id(*pos)))
                    .collect()
            })
            .unwrap_or_default();

        info!(
            dir = %dir.display(),
            chunks = chunks.len(),
            removed = committed_removed.len(),
            "Opened chunk storage"
        );

        Ok(Self {
            fs,
            dir: dir.to_path_buf(),
            config,
            state: RwLock::new(ManagerState {
                chunks,
                ids,
                pending_removed: HashSet::new(),
                committed_removed,
                last_chunk,
                next_sequence,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// The chunk written by the most recent save.
    pub fn last_chunk(&self) -> Option<Arc<Chunk>> {
        self.state.read().last_chunk.clone()
    }

    pub fn chunk(&self, chunk_id: u32) -> Option<Arc<Chunk>> {
        self.state.read().chunks.get(&chunk_id).cloned()
    }

    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.state.read().chunks.values().cloned().collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// Reads and verifies the page at `pos`.
    pub fn read_page(&self, pos: u64) -> Result<bytes::Bytes> {
        let chunk_id = page::chunk_id(pos);
        let chunk = self
            .chunk(chunk_id)
            .ok_or(KestrelError::ChunkNotFound { chunk_id })?;
        chunk.read_page(pos)
    }

    /// Length of the page at `pos`, if its chunk is live.
    pub fn page_len(&self, pos: u64) -> Option<u32> {
        self.chunk(page::chunk_id(pos))?.page_len(pos)
    }

    /// Records that a persisted page was superseded.
    pub fn mark_removed(&self, pos: u64) {
        if pos != UNSAVED_POS {
            self.state.write().pending_removed.insert(pos);
        }
    }

    /// Records several superseded pages at once.
    pub fn mark_removed_all(&self, positions: impl IntoIterator<Item = u64>) {
        let mut state = self.state.write();
        state
            .pending_removed
            .extend(positions.into_iter().filter(|p| *p != UNSAVED_POS));
    }

    /// Marks every page of every chunk as garbage.
    pub fn mark_all_removed(&self) {
        let mut state = self.state.write();
        let all: Vec<u64> = state
            .chunks
            .values()
            .flat_map(|c| c.page_positions().collect::<Vec<_>>())
            .collect();
        state.pending_removed.extend(all);
    }

    /// Starts a save: allocates a chunk id and takes the pending removed set.
    pub fn begin_save(&self) -> Result<(ChunkBuilder, SaveEpoch)> {
        if self.config.read_only {
            return Err(KestrelError::ReadOnly);
        }
        let mut state = self.state.write();
        let chunk_id = state.ids.first_free();
        if chunk_id > MAX_CHUNK_ID {
            return Err(KestrelError::Internal(format!(
                "chunk id space exhausted ({} chunks)",
                state.chunks.len()
            )));
        }
        state.ids.insert(chunk_id);
        let removed = std::mem::take(&mut state.pending_removed);
        Ok((ChunkBuilder::new(chunk_id), SaveEpoch { removed }))
    }

    /// Gives back a chunk id and the pending positions of a failed save.
    pub fn abort_save(&self, builder: ChunkBuilder, epoch: SaveEpoch) {
        let mut state = self.state.write();
        let chunk_id = builder.chunk_id();
        if !state.chunks.contains_key(&chunk_id) {
            state.ids.remove(chunk_id);
        }
        state.pending_removed.extend(epoch.removed);
    }

    /// Writes the chunk and registers it as the newest recovery point.
    pub fn commit_save(
        &self,
        builder: ChunkBuilder,
        epoch: SaveEpoch,
        root_pos: u64,
        map_size: u64,
    ) -> Result<Arc<Chunk>> {
        let chunk_id = builder.chunk_id();
        let (sequence, removed_log) = {
            let state = self.state.read();
            let mut log: Vec<u64> = state
                .committed_removed
                .iter()
                .chain(epoch.removed.iter())
                .copied()
                .collect();
            log.sort_unstable();
            log.dedup();
            (state.next_sequence, log)
        };

        let written = builder
            .finish(
                sequence,
                root_pos,
                map_size,
                &removed_log,
                self.config.max_chunk_size,
            )
            .and_then(|(header, image, pages)| {
                let path = self.dir.join(chunk_file_name(chunk_id, sequence));
                let file = self.fs.open(&path, true)?;
                file.write_at(0, &image)?;
                if self.config.fsync_enabled {
                    file.sync()?;
                }
                Ok((header, file, pages, image.len()))
            });

        let (header, file, pages, size) = match written {
            Ok(w) => w,
            Err(e) => {
                let mut state = self.state.write();
                state.ids.remove(chunk_id);
                state.pending_removed.extend(epoch.removed);
                return Err(e);
            }
        };

        let chunk = Arc::new(Chunk::new(header, file, pages, removed_log));
        let mut state = self.state.write();
        state.next_sequence = sequence + 1;
        state.committed_removed.extend(epoch.removed);
        state.chunks.insert(chunk_id, Arc::clone(&chunk));
        state.last_chunk = Some(Arc::clone(&chunk));
        info!(
            chunk_id,
            sequence,
            pages = chunk.page_count(),
            bytes = size,
            "Wrote chunk"
        );
        Ok(chunk)
    }

    /// Deletes a chunk file. The newest chunk is never deleted.
    ///
    /// Removed positions inside the chunk are forgotten so a reused chunk
    /// id starts with a clean slate.
    pub fn delete_chunk(&self, chunk_id: u32) -> Result<bool> {
        if self.config.read_only {
            return Err(KestrelError::ReadOnly);
        }
        let chunk = {
            let mut state = self.state.write();
            if state.last_chunk.as_ref().map(|c| c.id()) == Some(chunk_id) {
                return Ok(false);
            }
            let Some(chunk) = state.chunks.remove(&chunk_id) else {
                return Ok(false);
            };
            state.ids.remove(chunk_id);
            state
                .committed_removed
                .retain(|pos| page::chunk_id(*pos) != chunk_id);
            state
                .pending_removed
                .retain(|pos| page::chunk_id(*pos) != chunk_id);
            chunk
        };
        self.fs.remove(chunk.path())?;
        info!(chunk_id, sequence = chunk.sequence(), "Deleted chunk");
        Ok(true)
    }

    /// Space accounting of every chunk, counting committed garbage only.
    pub fn usage(&self) -> Vec<ChunkUsage> {
        let state = self.state.read();
        let mut usage: BTreeMap<u32, ChunkUsage> = state
            .chunks
            .values()
            .map(|c| {
                (
                    c.id(),
                    ChunkUsage {
                        chunk_id: c.id(),
                        sequence: c.sequence(),
                        total_bytes: c.total_bytes(),
                        live_bytes: c.total_bytes(),
                        page_count: c.page_count(),
                        live_pages: c.page_count(),
                    },
                )
            })
            .collect();
        for pos in &state.committed_removed {
            let chunk_id = page::chunk_id(*pos);
            let (Some(u), Some(chunk)) = (usage.get_mut(&chunk_id), state.chunks.get(&chunk_id))
            else {
                continue;
            };
            if let Some(len) = chunk.page_len(*pos) {
                u.live_bytes -= len as u64;
                u.live_pages -= 1;
            }
        }
        usage.into_values().collect()
    }

    pub fn stats(&self) -> ChunkStats {
        let usage = self.usage();
        let state = self.state.read();
        ChunkStats {
            chunk_count: usage.len(),
            total_bytes: usage.iter().map(|u| u.total_bytes).sum(),
            live_bytes: usage.iter().map(|u| u.live_bytes).sum(),
            pending_removed: state.pending_removed.len(),
            committed_removed: state.committed_removed.len(),
        }
    }

    /// Number of positions superseded since the last save began.
    pub fn pending_removed_count(&self) -> usize {
        self.state.read().pending_removed.len()
    }

    /// Returns true if `pos` is already known to be garbage.
    pub fn is_removed(&self, pos: u64) -> bool {
        let state = self.state.read();
        state.pending_removed.contains(&pos) || state.committed_removed.contains(&pos)
    }

    /// Deletes the directory of this map and everything in it.
    pub fn destroy(&self) -> Result<()> {
        debug!(dir = %self.dir.display(), "Removing chunk directory");
        self.fs.remove_dir_all(&self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::LocalFileSystem;
    use bytes::BufMut;
    use kestrel_common::page::PageType;
    use tempfile::tempdir;

    fn open(dir: &Path) -> ChunkManager {
        ChunkManager::open(Arc::new(LocalFileSystem), dir, ChunkManagerConfig::default()).unwrap()
    }

    /// Writes a chunk with `n` leaf pages, returning their positions.
    fn save_pages(manager: &ChunkManager, n: usize) -> Vec<u64> {
        let (mut builder, epoch) = manager.begin_save().unwrap();
        let mut positions = Vec::new();
        for i in 0..n {
            let offset = builder.begin_page(0).unwrap();
            builder.buf().put_bytes(i as u8, 100);
            positions.push(builder.end_page(offset, PageType::Leaf).unwrap());
        }
        let root = positions.first().copied().unwrap_or(0);
        manager.commit_save(builder, epoch, root, n as u64).unwrap();
        positions
    }

    #[test]
    fn test_chunk_id_set() {
        let mut ids = ChunkIdSet::default();
        assert_eq!(ids.first_free(), 1);
        ids.insert(1);
        ids.insert(2);
        assert_eq!(ids.first_free(), 3);
        ids.remove(1);
        assert_eq!(ids.first_free(), 1);
        for id in 1..200 {
            ids.insert(id);
        }
        assert_eq!(ids.first_free(), 200);
        assert!(ids.contains(64));
        assert_eq!(ids.len(), 199);
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempdir().unwrap();
        let positions = {
            let manager = open(dir.path());
            save_pages(&manager, 3)
        };
        let manager = open(dir.path());
        assert_eq!(manager.chunk_count(), 1);
        let last = manager.last_chunk().unwrap();
        assert_eq!(last.root_pos(), positions[0]);
        assert_eq!(last.map_size(), 3);
        let page = manager.read_page(positions[2]).unwrap();
        assert_eq!(page.len(), 107);
    }

    #[test]
    fn test_removed_epochs() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path());
        let first = save_pages(&manager, 2);

        manager.mark_removed(first[0]);
        manager.mark_removed(UNSAVED_POS);
        let stats = manager.stats();
        assert_eq!(stats.pending_removed, 1);
        assert_eq!(stats.committed_removed, 0);
        // pending garbage does not lower the fill rate yet
        assert_eq!(manager.usage()[0].fill_rate(), 100);

        save_pages(&manager, 1);
        let stats = manager.stats();
        assert_eq!(stats.pending_removed, 0);
        assert_eq!(stats.committed_removed, 1);
        assert_eq!(manager.usage()[0].fill_rate(), 50);
    }

    #[test]
    fn test_removed_log_survives_reopen() {
        let dir = tempdir().unwrap();
        let first = {
            let manager = open(dir.path());
            let first = save_pages(&manager, 2);
            manager.mark_removed(first[1]);
            save_pages(&manager, 1);
            first
        };
        let manager = open(dir.path());
        assert!(manager.is_removed(first[1]));
        assert!(!manager.is_removed(first[0]));
        assert_eq!(manager.chunk_count(), 2);
    }

    #[test]
    fn test_delete_chunk_reuses_id_and_purges_removed() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path());
        let first = save_pages(&manager, 1);
        manager.mark_removed(first[0]);
        save_pages(&manager, 1);
        assert!(manager.is_removed(first[0]));

        assert!(manager.delete_chunk(1).unwrap());
        assert!(!manager.is_removed(first[0]));
        assert_eq!(manager.chunk_count(), 1);

        let next = save_pages(&manager, 1);
        assert_eq!(page::chunk_id(next[0]), 1);
        assert_eq!(manager.last_chunk().unwrap().sequence(), 3);
    }

    #[test]
    fn test_last_chunk_is_never_deleted() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path());
        save_pages(&manager, 1);
        assert!(!manager.delete_chunk(1).unwrap());
        assert_eq!(manager.chunk_count(), 1);
    }

    #[test]
    fn test_incomplete_chunk_is_ignored() {
        let dir = tempdir().unwrap();
        {
            let manager = open(dir.path());
            save_pages(&manager, 1);
        }
        let partial = dir.path().join(chunk_file_name(2, 2));
        std::fs::write(&partial, b"KCHK partial").unwrap();

        let manager = open(dir.path());
        assert_eq!(manager.chunk_count(), 1);
        assert_eq!(manager.last_chunk().unwrap().sequence(), 1);
        assert!(!partial.exists());
    }

    #[test]
    fn test_oversized_save_restores_pending() {
        let dir = tempdir().unwrap();
        let manager = ChunkManager::open(
            Arc::new(LocalFileSystem),
            dir.path(),
            ChunkManagerConfig {
                max_chunk_size: 512,
                ..Default::default()
            },
        )
        .unwrap();
        manager.mark_removed(page::page_pos(9, 128, PageType::Leaf));

        let (mut builder, epoch) = manager.begin_save().unwrap();
        let offset = builder.begin_page(0).unwrap();
        builder.buf().put_bytes(1, 1000);
        builder.end_page(offset, PageType::Leaf).unwrap();
        let err = manager.commit_save(builder, epoch, 0, 0).unwrap_err();
        assert!(matches!(err, KestrelError::ChunkTooLarge { .. }));
        assert_eq!(manager.chunk_count(), 0);
        assert_eq!(manager.stats().pending_removed, 1);
    }

    #[test]
    fn test_mark_all_removed() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path());
        save_pages(&manager, 4);
        manager.mark_all_removed();
        assert_eq!(manager.stats().pending_removed, 4);
    }

    #[test]
    fn test_read_only_rejects_save() {
        let dir = tempdir().unwrap();
        let manager = ChunkManager::open(
            Arc::new(LocalFileSystem),
            dir.path(),
            ChunkManagerConfig {
                read_only: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches!(manager.begin_save(), Err(KestrelError::ReadOnly)));
    }
}
