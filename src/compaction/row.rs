// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::controller::CompactionController;
use crate::{
    cell::{Atom, Cell},
    coding::Encode,
    counter::CounterContext,
    deletion::DeletionInfo,
    histogram::StreamingHistogram,
    key::DecoratedKey,
    merge::{AtomMerger, BoxedAtomIterator, CellStream},
    row::Row,
    sstable::{
        index::{ColumnIndexBuilder, IndexEntry, IndexInfo},
        reader::RowHandle,
        writer::{StreamedRowStats, TableWriter},
    },
    Timestamp, GC_NONE, NO_DELETION_TIME,
};
use sha2::Digest;
use std::io::{BufWriter, Seek, SeekFrom, Write};

/// One output row of a compaction, in one of two materialisations
///
/// Small rows are merged fully in memory; rows over the in-memory limit
/// are streamed through a spool file so peak memory stays bounded by one
/// index block, at the cost of writing the atoms twice.
pub enum CompactedRow {
    Precompacted {
        key: DecoratedKey,
        row: Row,
    },

    Lazy {
        key: DecoratedKey,

        /// Top-level deletion pair; gathered range tombstones stay in the
        /// spooled atom stream
        deletion: DeletionInfo,

        atom_count: u32,
        atoms_len: u64,
        spool: std::fs::File,
        blocks: Vec<IndexInfo>,
        stats: StreamedRowStats,
        digest: [u8; 32],
    },
}

impl CompactedRow {
    #[must_use]
    pub fn key(&self) -> &DecoratedKey {
        match self {
            Self::Precompacted { key, .. } | Self::Lazy { key, .. } => key,
        }
    }

    /// Merges the sources fully in memory, then applies the purge rules.
    pub(crate) fn build_precompacted(
        controller: &CompactionController,
        key: DecoratedKey,
        sources: &[RowHandle],
    ) -> crate::Result<Option<Self>> {
        let schema = controller.schema().clone();
        let cmp = &schema.comparator;

        let mut deletion = DeletionInfo::live();
        for source in sources {
            deletion.merge(&source.deletion, cmp);
        }

        let mut atom_iters: Vec<BoxedAtomIterator<'_>> = vec![];
        for source in sources {
            atom_iters.push(Box::new(source.atoms()?));
        }

        let merger = AtomMerger::new(atom_iters, cmp, schema.is_counter());
        let mut stream = CellStream::new(merger, deletion, cmp);

        let mut cells = vec![];
        for cell in stream.by_ref() {
            cells.push(cell?);
        }

        let mut row = Row {
            deletion: stream.into_deletion(),
            cells,
        };

        // Purge is safe only if no table outside the compaction set could
        // hold data at or below any timestamp in this row
        let purge = controller.should_purge(&key, row.max_timestamp());

        // The delete-preservation rule: without purge permission, only
        // cells shadowed by their own row's tombstones are removed
        row.remove_deleted(
            if purge { controller.gc_before } else { GC_NONE },
            cmp,
        );

        if schema.is_counter() && purge {
            for cell in &mut row.cells {
                if let Cell::Live {
                    name,
                    value,
                    timestamp,
                } = cell
                {
                    *cell = Cell::Live {
                        name: name.clone(),
                        value: CounterContext::strip_old_shards(
                            value,
                            controller.merge_shard_before,
                        ),
                        timestamp: *timestamp,
                    };
                }
            }
        }

        if row.is_empty() {
            return Ok(None);
        }

        Ok(Some(Self::Precompacted { key, row }))
    }

    /// Streams the merge through a spool file: the single pass computes
    /// the column index, length, stats and digest; writing replays the
    /// spool into the table writer.
    pub(crate) fn build_lazy(
        controller: &CompactionController,
        key: DecoratedKey,
        sources: &[RowHandle],
    ) -> crate::Result<Option<Self>> {
        let schema = controller.schema().clone();
        let cmp = &schema.comparator;
        let counter = schema.is_counter();

        let mut deletion = DeletionInfo::live();
        for source in sources {
            deletion.merge(&source.deletion, cmp);
        }

        // The row tombstone's purgeability is known from the top-level
        // pairs alone; individual atoms re-check purge safety against
        // their own timestamp before being dropped
        let purge = controller.should_purge(&key, deletion.max_deletion_timestamp());
        let gc_before = controller.gc_before;

        let mut atom_iters: Vec<BoxedAtomIterator<'_>> = vec![];
        for source in sources {
            atom_iters.push(Box::new(source.atoms()?));
        }

        let merger = AtomMerger::new(atom_iters, cmp, counter);

        let spool = tempfile::tempfile()?;
        let mut spool_writer = BufWriter::new(spool);

        // Shadow tracking: top-level pair plus every gathered range
        // tombstone; atoms arrive in clustering order, so a covering
        // tombstone is always gathered before the cells it covers
        let mut gathered = deletion.clone();

        let mut blocks = ColumnIndexBuilder::new(controller.promoted_block_size);
        let mut atom_count: u32 = 0;
        let mut atoms_len: u64 = 0;

        let mut min_timestamp = Timestamp::MAX;
        let mut max_timestamp = Timestamp::MIN;
        let mut column_count: u64 = 0;
        let mut tombstones = StreamingHistogram::default();

        let mut hasher = sha2::Sha256::new();
        hasher.update(deletion.marked_for_delete_at.to_be_bytes());
        hasher.update(deletion.local_deletion_time.to_be_bytes());

        for atom in merger {
            let atom = atom?;

            let atom = match atom {
                Atom::RangeTombstone(rt) => {
                    if rt.local_deletion_time < gc_before
                        && controller.should_purge(&key, rt.timestamp)
                    {
                        continue;
                    }

                    if gathered.range_tombstones.contains(&rt) {
                        continue;
                    }

                    gathered.add_range_tombstone(rt.clone(), cmp);
                    tombstones.update(u64::from(rt.local_deletion_time));

                    min_timestamp = min_timestamp.min(rt.timestamp);
                    max_timestamp = max_timestamp.max(rt.timestamp);

                    rt.digest(&mut hasher);

                    Atom::RangeTombstone(rt)
                }
                Atom::Cell(cell) => {
                    if gathered.shadows(&cell, cmp) {
                        continue;
                    }

                    if cell.local_deletion_time() < gc_before
                        && controller.should_purge(&key, cell.timestamp())
                    {
                        continue;
                    }

                    let cell = if counter && purge {
                        match cell {
                            Cell::Live {
                                name,
                                value,
                                timestamp,
                            } => Cell::Live {
                                name,
                                value: CounterContext::strip_old_shards(
                                    &value,
                                    controller.merge_shard_before,
                                ),
                                timestamp,
                            },
                            other => other,
                        }
                    } else {
                        cell
                    };

                    min_timestamp = min_timestamp.min(cell.timestamp());
                    max_timestamp = max_timestamp.max(cell.timestamp());
                    column_count += 1;

                    let ldt = cell.local_deletion_time();
                    if ldt != NO_DELETION_TIME {
                        tombstones.update(u64::from(ldt));
                    }

                    cell.digest(&mut hasher);

                    Atom::Cell(cell)
                }
            };

            let size = atom.serialized_size();
            blocks.add(atom.position(), size);

            atom.encode_into(&mut spool_writer)?;

            atom_count += 1;
            atoms_len += size;
        }

        // Row-level tombstone purge
        let mut pair = DeletionInfo {
            range_tombstones: Vec::new(),
            ..deletion
        };
        if purge {
            pair.purge(gc_before);
        }

        if pair.has_row_tombstone() {
            min_timestamp = min_timestamp.min(pair.marked_for_delete_at);
            max_timestamp = max_timestamp.max(pair.marked_for_delete_at);
            tombstones.update(u64::from(pair.local_deletion_time));
        }

        if atom_count == 0 && !pair.has_row_tombstone() {
            return Ok(None);
        }

        spool_writer.flush()?;
        let mut spool = spool_writer
            .into_inner()
            .map_err(std::io::IntoInnerError::into_error)?;
        spool.seek(SeekFrom::Start(0))?;

        Ok(Some(Self::Lazy {
            key,
            deletion: pair,
            atom_count,
            atoms_len,
            spool,
            blocks: blocks.finish(),
            stats: StreamedRowStats {
                column_count,
                min_timestamp,
                max_timestamp,
                tombstones,
            },
            digest: hasher.finalize().into(),
        }))
    }

    /// Serializes the row into the table writer.
    pub fn write(self, writer: &mut TableWriter) -> crate::Result<IndexEntry> {
        match self {
            Self::Precompacted { key, row } => writer.append_row(&key, &row),
            Self::Lazy {
                key,
                deletion,
                atom_count,
                atoms_len,
                mut spool,
                blocks,
                stats,
                ..
            } => writer.append_streamed(
                &key,
                &deletion,
                atom_count,
                atoms_len,
                &mut spool,
                &blocks,
                stats,
            ),
        }
    }

    /// Deterministic digest of the merged row (for read-repair trees).
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        match self {
            Self::Precompacted { row, .. } => row.digest(),
            Self::Lazy { digest, .. } => *digest,
        }
    }
}
