// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::row::CompactedRow;
use crate::{
    cache::RowCache,
    interval_tree::OverlapTree,
    key::DecoratedKey,
    schema::Schema,
    sstable::{reader::RowHandle, SSTable},
    LocalDeletionTime, Timestamp,
};
use std::sync::Arc;

/// Safety margin added to the oldest unflushed memtable time before
/// counter shards may be merged away
const SHARD_MERGE_MARGIN_SECS: u64 = 5 * 3600;

/// Per-compaction context: purge predicate, row materialisation policy,
/// cache invalidation
///
/// Holds references to every live table *outside* the compaction set whose
/// token range overlaps it; the references are released when the
/// controller is dropped.
pub struct CompactionController {
    overlap_tree: OverlapTree,

    pub gc_before: LocalDeletionTime,

    /// Counter shards with a clock below this may be merged
    pub merge_shard_before: u64,

    schema: Arc<Schema>,
    row_cache: Option<Arc<RowCache>>,
    in_memory_limit: u64,

    /// Promoted-index block granularity, matching the table writer's
    pub(crate) promoted_block_size: u64,
}

impl CompactionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        live_tables: &[Arc<SSTable>],
        compacting: &[Arc<SSTable>],
        schema: Arc<Schema>,
        row_cache: Option<Arc<RowCache>>,
        gc_before: LocalDeletionTime,
        oldest_unflushed_secs: u32,
        in_memory_limit: u64,
        promoted_block_size: u64,
    ) -> Self {
        let union = compacting
            .iter()
            .map(|t| t.token_range())
            .reduce(|(a_lo, a_hi), (b_lo, b_hi)| (a_lo.min(b_lo), a_hi.max(b_hi)));

        let overlapping: Vec<_> = union.map_or_else(Vec::new, |(lo, hi)| {
            let compacting_gens: Vec<_> = compacting.iter().map(|t| t.generation()).collect();

            live_tables
                .iter()
                .filter(|t| !compacting_gens.contains(&t.generation()))
                .filter(|t| {
                    let (first, last) = t.token_range();
                    first <= hi && lo <= last
                })
                .cloned()
                .collect()
        });

        log::trace!(
            "compaction controller: {} overlapping tables outside the set",
            overlapping.len(),
        );

        Self {
            overlap_tree: OverlapTree::new(&overlapping),
            gc_before,
            merge_shard_before: u64::from(oldest_unflushed_secs) + SHARD_MERGE_MARGIN_SECS,
            schema,
            row_cache,
            in_memory_limit,
            promoted_block_size,
        }
    }

    /// Returns `true` if tombstones of this partition up to
    /// `max_deletion_timestamp` may be dropped.
    ///
    /// Purging is unsafe while any table outside the compaction set could
    /// still hold an older version of the partition: its shadowed data
    /// would resurrect once the tombstone is gone.
    #[must_use]
    pub fn should_purge(&self, key: &DecoratedKey, max_deletion_timestamp: Timestamp) -> bool {
        for table in self.overlap_tree.search(key.token) {
            if table.stats.min_timestamp <= max_deletion_timestamp
                && table.filter_may_contain(&key.key)
            {
                return false;
            }
        }

        true
    }

    /// Drops the cached row of a partition about to be rewritten.
    pub fn invalidate_cached_row(&self, key: &DecoratedKey) {
        if let Some(cache) = &self.row_cache {
            cache.invalidate(&key.key);
        }
    }

    /// Merges one partition's row versions into the appropriate
    /// materialisation.
    ///
    /// Returns `None` when the merged row purges down to nothing.
    pub fn compacted_row(
        &self,
        key: DecoratedKey,
        sources: Vec<RowHandle>,
    ) -> crate::Result<Option<CompactedRow>> {
        let total: u64 = sources.iter().map(RowHandle::row_size).sum();

        if total > self.in_memory_limit {
            CompactedRow::build_lazy(self, key, &sources)
        } else {
            CompactedRow::build_precompacted(self, key, &sources)
        }
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[cfg(test)]
    pub(crate) fn overlapping_count(&self) -> usize {
        self.overlap_tree.len()
    }
}
