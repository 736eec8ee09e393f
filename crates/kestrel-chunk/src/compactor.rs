//! Compaction planning.
//!
//! The compactor only decides what to do. Rewriting live pages needs the
//! tree, so the map's store marks those pages dirty and saves; afterwards
//! it deletes the chunks left empty, as listed here.

use crate::manager::{ChunkManager, ChunkUsage};
use std::collections::HashSet;
use tracing::debug;

/// What one compaction run should do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Chunks without live pages, deleted right away.
    pub delete: Vec<u32>,
    /// Sparse chunks whose live pages must be rewritten.
    pub rewrite: Vec<u32>,
    /// Live bytes the rewrite will copy.
    pub rewrite_bytes: u64,
}

impl CompactionPlan {
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.rewrite.is_empty()
    }

    /// Chunk ids selected for rewriting, for position lookups.
    pub fn rewrite_set(&self) -> HashSet<u32> {
        self.rewrite.iter().copied().collect()
    }
}

/// Selects chunks to delete or rewrite.
#[derive(Debug, Clone)]
pub struct ChunkCompactor {
    /// Chunks below this fill rate (percent) are rewritten.
    min_fill_rate: u8,
    /// Upper bound of live bytes rewritten per run.
    max_compact_bytes: u64,
}

impl ChunkCompactor {
    pub fn new(min_fill_rate: u8, max_compact_bytes: u64) -> Self {
        Self {
            min_fill_rate,
            max_compact_bytes,
        }
    }

    /// Builds a plan from the current chunk usage.
    ///
    /// The newest chunk is left alone: it is the recovery point.
    pub fn plan(&self, manager: &ChunkManager) -> CompactionPlan {
        let last = manager.last_chunk().map(|c| c.id());
        let usage: Vec<ChunkUsage> = manager
            .usage()
            .into_iter()
            .filter(|u| Some(u.chunk_id) != last)
            .collect();
        self.plan_usage(&usage)
    }

    fn plan_usage(&self, usage: &[ChunkUsage]) -> CompactionPlan {
        let mut plan = CompactionPlan::default();
        let mut sparse = Vec::new();
        for u in usage {
            if u.live_bytes == 0 {
                plan.delete.push(u.chunk_id);
            } else if u.fill_rate() < self.min_fill_rate {
                sparse.push(*u);
            }
        }
        sparse.sort_by_key(|u| (u.fill_rate(), u.live_bytes));

        for u in sparse {
            // at least one chunk per run, even above the budget
            if !plan.rewrite.is_empty() && plan.rewrite_bytes + u.live_bytes > self.max_compact_bytes {
                break;
            }
            plan.rewrite.push(u.chunk_id);
            plan.rewrite_bytes += u.live_bytes;
        }

        if !plan.is_empty() {
            debug!(
                delete = ?plan.delete,
                rewrite = ?plan.rewrite,
                rewrite_bytes = plan.rewrite_bytes,
                "Compaction plan"
            );
        }
        plan
    }

    /// Chunks that no longer hold live pages, the newest one excepted.
    pub fn empty_chunks(&self, manager: &ChunkManager) -> Vec<u32> {
        let last = manager.last_chunk().map(|c| c.id());
        manager
            .usage()
            .into_iter()
            .filter(|u| u.live_bytes == 0 && Some(u.chunk_id) != last)
            .map(|u| u.chunk_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::LocalFileSystem;
    use crate::manager::ChunkManagerConfig;
    use bytes::BufMut;
    use kestrel_common::page::PageType;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn usage(chunk_id: u32, total: u64, live: u64) -> ChunkUsage {
        ChunkUsage {
            chunk_id,
            sequence: chunk_id as u64,
            total_bytes: total,
            live_bytes: live,
            page_count: 1,
            live_pages: if live > 0 { 1 } else { 0 },
        }
    }

    #[test]
    fn test_plan_orders_by_fill_rate_then_live_bytes() {
        let compactor = ChunkCompactor::new(50, u64::MAX);
        let plan = compactor.plan_usage(&[
            usage(1, 1000, 400),
            usage(2, 1000, 0),
            usage(3, 1000, 100),
            usage(4, 1000, 900),
            usage(5, 2000, 200),
        ]);
        assert_eq!(plan.delete, vec![2]);
        assert_eq!(plan.rewrite, vec![3, 5, 1]);
        assert_eq!(plan.rewrite_bytes, 700);
    }

    #[test]
    fn test_plan_respects_byte_budget() {
        let compactor = ChunkCompactor::new(50, 250);
        let plan = compactor.plan_usage(&[
            usage(1, 1000, 100),
            usage(2, 1000, 200),
            usage(3, 1000, 300),
        ]);
        assert_eq!(plan.rewrite, vec![1]);

        // the first candidate is taken even if it alone exceeds the budget
        let compactor = ChunkCompactor::new(50, 10);
        let plan = compactor.plan_usage(&[usage(1, 1000, 100)]);
        assert_eq!(plan.rewrite, vec![1]);
    }

    #[test]
    fn test_plan_and_delete_against_manager() {
        let dir = tempdir().unwrap();
        let manager =
            ChunkManager::open(Arc::new(LocalFileSystem), dir.path(), ChunkManagerConfig::default())
                .unwrap();
        let mut saved = Vec::new();
        for _ in 0..3 {
            let (mut builder, epoch) = manager.begin_save().unwrap();
            let offset = builder.begin_page(0).unwrap();
            builder.buf().put_bytes(0, 64);
            let pos = builder.end_page(offset, PageType::Leaf).unwrap();
            manager.commit_save(builder, epoch, pos, 1).unwrap();
            saved.push(pos);
            manager.mark_removed(pos);
        }
        // chunks 1 and 2 are committed garbage, chunk 3 is the newest
        let compactor = ChunkCompactor::new(30, 1 << 20);
        let plan = compactor.plan(&manager);
        assert_eq!(plan.delete, vec![1, 2]);
        assert!(plan.rewrite.is_empty());

        assert_eq!(compactor.empty_chunks(&manager), vec![1, 2]);
        for chunk_id in compactor.empty_chunks(&manager) {
            assert!(manager.delete_chunk(chunk_id).unwrap());
        }
        assert_eq!(manager.chunk_count(), 1);
        assert!(compactor.empty_chunks(&manager).is_empty());
    }
}
