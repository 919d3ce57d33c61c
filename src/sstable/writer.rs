// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    descriptor::{Component, Descriptor, Generation},
    filter::{KeyFilter, KeyHashes},
    index::{ColumnIndexBuilder, IndexEntry, IndexInfo, IndexWriter},
    stats::{StatsCollector, StatsMetadata},
    summary::{Summary, SummaryBuilder},
};
use crate::{
    coding::Encode,
    deletion::{DeletionInfo, TOP_LEVEL_SIZE},
    file::{fsync_directory, MAGIC_BYTES},
    histogram::StreamingHistogram,
    key::DecoratedKey,
    partitioner::Partitioner,
    replay::ReplayPosition,
    row::Row,
    schema::Schema,
    Timestamp, NO_DELETION_TIME,
};
use byteorder::{BigEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    sync::Arc,
};

/// Knobs of the sorted table writer
#[derive(Clone, Copy, Debug)]
pub struct WriterOptions {
    /// Bloom filter false positive target
    pub bloom_fp_rate: f32,

    /// Every n-th index entry is sampled into the summary
    pub index_interval: u32,

    /// Block granularity of the promoted row index; a row spanning more
    /// than one block gets its column index promoted
    pub promoted_block_size: u64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            bloom_fp_rate: 0.0001,
            index_interval: 128,
            promoted_block_size: /* 64 KiB */ 64 * 1_024,
        }
    }
}

/// Per-row statistics handed to [`TableWriter::append_streamed`] by the
/// lazily compacted row, which has already seen all atoms once
pub struct StreamedRowStats {
    pub column_count: u64,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub tombstones: StreamingHistogram,
}

/// Everything the writer produced, enough to open the table without
/// re-reading the component files
pub struct FinishedTable {
    pub descriptor: Descriptor,
    pub summary: Summary,
    pub filter: KeyFilter,
    pub stats: StatsMetadata,
}

/// Streaming writer of one immutable sorted table file set
///
/// Rows must arrive in ascending partition order, each row's cells in
/// clustering order. The writer is abortable: dropping it before
/// [`TableWriter::finish`] removes every produced file.
pub struct TableWriter {
    descriptor: Descriptor,
    schema: Arc<Schema>,
    partitioner: Arc<dyn Partitioner>,
    opts: WriterOptions,

    data: BufWriter<File>,
    data_offset: u64,

    index: IndexWriter,
    summary: SummaryBuilder,
    stats: Option<StatsCollector>,

    /// Hashes for the key filter; buffered because the filter is sized
    /// by the final row count
    filter_hashes: Vec<KeyHashes>,

    first_key: Option<DecoratedKey>,
    last_key: Option<DecoratedKey>,
    row_count: u64,

    finished: bool,
}

impl TableWriter {
    /// Sets up a new writer; creates the `Data` and `Index` files.
    pub fn new(
        descriptor: Descriptor,
        schema: Arc<Schema>,
        partitioner: Arc<dyn Partitioner>,
        opts: WriterOptions,
        replay_position: ReplayPosition,
        ancestors: Vec<Generation>,
    ) -> crate::Result<Self> {
        std::fs::create_dir_all(&descriptor.directory)?;

        let data_file = File::create(descriptor.path(Component::Data))?;
        let mut data = BufWriter::with_capacity(u16::MAX.into(), data_file);

        data.write_all(&MAGIC_BYTES)?;
        data.write_all(&descriptor.version.as_bytes())?;

        let index = IndexWriter::new(descriptor.path(Component::Index), descriptor.version)?;

        Ok(Self {
            data,
            data_offset: (MAGIC_BYTES.len() + 2) as u64,

            index,
            summary: SummaryBuilder::new(opts.index_interval),
            stats: Some(StatsCollector::new(replay_position, ancestors)),

            filter_hashes: Vec::new(),

            first_key: None,
            last_key: None,
            row_count: 0,

            finished: false,

            descriptor,
            schema,
            partitioner,
            opts,
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Bytes written to the `Data` component so far.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data_offset
    }

    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Writes a fully materialized row.
    ///
    /// # Panics
    ///
    /// Panics if rows arrive out of partition order - that is a bug in the
    /// caller, not an I/O condition.
    pub fn append_row(&mut self, key: &DecoratedKey, row: &Row) -> crate::Result<IndexEntry> {
        let cmp = &self.schema.comparator;

        let atoms = row.atoms(cmp);

        let mut builder = ColumnIndexBuilder::new(self.opts.promoted_block_size);
        let mut atoms_len = 0u64;

        for atom in &atoms {
            let size = atom.serialized_size();
            builder.add(atom.position(), size);
            atoms_len += size;
        }

        let blocks = builder.finish();

        let mut atom_bytes = Vec::with_capacity(atoms_len as usize);
        for atom in &atoms {
            atom.encode_into(&mut atom_bytes)?;
        }
        debug_assert_eq!(atoms_len, atom_bytes.len() as u64);

        // Tombstone drop times and timestamps for the stats sidecar
        if let Some(stats) = &mut self.stats {
            if row.deletion.has_row_tombstone() {
                stats.update_tombstone(row.deletion.local_deletion_time);
            }

            for rt in &row.deletion.range_tombstones {
                stats.update_tombstone(rt.local_deletion_time);
            }

            for cell in &row.cells {
                let ldt = cell.local_deletion_time();
                if ldt != NO_DELETION_TIME {
                    stats.update_tombstone(ldt);
                }
            }

            let min = row.min_timestamp();
            if min != Timestamp::MAX {
                stats.update_timestamps(min, row.max_timestamp());
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        self.append_parts(
            key,
            &row.deletion,
            row.atom_count() as u32,
            atoms_len,
            &mut &atom_bytes[..],
            &blocks,
            row.column_count() as u64,
        )
    }

    /// Writes a row whose atoms have been spooled by a lazily compacted row.
    pub(crate) fn append_streamed(
        &mut self,
        key: &DecoratedKey,
        deletion: &DeletionInfo,
        atom_count: u32,
        atoms_len: u64,
        atoms: &mut dyn Read,
        blocks: &[IndexInfo],
        row_stats: StreamedRowStats,
    ) -> crate::Result<IndexEntry> {
        if let Some(stats) = &mut self.stats {
            stats.merge_tombstones(&row_stats.tombstones);

            if row_stats.min_timestamp != Timestamp::MAX {
                stats.update_timestamps(row_stats.min_timestamp, row_stats.max_timestamp);
            }
        }

        self.append_parts(
            key,
            deletion,
            atom_count,
            atoms_len,
            atoms,
            blocks,
            row_stats.column_count,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn append_parts(
        &mut self,
        key: &DecoratedKey,
        deletion: &DeletionInfo,
        atom_count: u32,
        atoms_len: u64,
        atoms: &mut dyn Read,
        blocks: &[IndexInfo],
        column_count: u64,
    ) -> crate::Result<IndexEntry> {
        assert!(
            self.last_key.as_ref().is_none_or(|last| last < key),
            "rows must be written in ascending partition order",
        );

        let promoted = blocks.len() > 1;
        let promoted_len = if promoted {
            IndexInfo::list_size(blocks)
        } else {
            0
        };

        let row_size = TOP_LEVEL_SIZE + 4 + atoms_len + promoted_len;
        let row_start = self.data_offset;

        // (PK length, PK, row-length, row-deletion-info, atom count, atoms...)
        key.key.write_prefixed16(&mut self.data)?;
        self.data.write_u64::<BigEndian>(row_size)?;

        deletion.encode_into(&mut self.data)?;
        self.data.write_u32::<BigEndian>(atom_count)?;

        let copied = std::io::copy(&mut atoms.take(atoms_len), &mut self.data)?;
        if copied != atoms_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "atom stream ended early",
            )
            .into());
        }

        let promoted_offset = if promoted {
            let offset = row_start + 2 + key.key.len() as u64 + 8 + TOP_LEVEL_SIZE + 4 + atoms_len;
            IndexInfo::encode_list(blocks, &mut self.data)?;
            offset
        } else {
            0
        };

        self.data_offset = row_start + 2 + key.key.len() as u64 + 8 + row_size;

        let entry = IndexEntry {
            position: row_start,
            promoted_offset,
        };

        let index_offset = self.index.append(&key.key, entry)?;
        self.summary.register(&key.key, index_offset);

        self.filter_hashes.push(KeyFilter::hash(&key.key));

        if let Some(stats) = &mut self.stats {
            stats.update_row(row_size, column_count);
        }

        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        self.last_key = Some(key.clone());
        self.row_count += 1;

        Ok(entry)
    }

    /// Removes every produced file.
    pub fn abort(mut self) {
        self.cleanup();
        self.finished = true;
    }

    fn cleanup(&mut self) {
        log::debug!("removing aborted table write {}", self.descriptor);
        self.descriptor.delete_files();
    }

    /// Finishes the table, making sure all data is written durably.
    ///
    /// Returns `None` (and removes all files) if no row was written.
    pub fn finish(&mut self) -> crate::Result<Option<FinishedTable>> {
        // No rows written - just remove the files and publish nothing
        if self.row_count == 0 {
            self.cleanup();
            self.finished = true;
            return Ok(None);
        }

        self.data.flush()?;
        self.data.get_mut().sync_all()?;

        self.index.finish()?;

        #[allow(clippy::expect_used)]
        let first_key = self
            .first_key
            .clone()
            .expect("should have written at least 1 row");
        #[allow(clippy::expect_used)]
        let last_key = self
            .last_key
            .clone()
            .expect("should have written at least 1 row");

        let summary = std::mem::replace(&mut self.summary, SummaryBuilder::new(1))
            .finish(first_key.key.clone(), last_key.key.clone());

        summary.write_to_file(
            &self.descriptor.path(Component::Summary),
            self.descriptor.version,
        )?;

        let mut filter = KeyFilter::for_row_count(self.row_count, self.opts.bloom_fp_rate);
        for hashes in std::mem::take(&mut self.filter_hashes) {
            filter.insert_hash(hashes);
        }

        {
            let file = File::create(self.descriptor.path(Component::Filter))?;
            let mut writer = BufWriter::new(file);
            filter.encode_into(&mut writer)?;
            writer.flush()?;
            writer.get_mut().sync_all()?;
        }

        #[allow(clippy::expect_used)]
        let stats = self
            .stats
            .take()
            .expect("finish may only be called once")
            .finish(self.partitioner.name(), /* no compression */ -1.0);

        stats.write_to_file(&self.descriptor)?;

        // The TOC commits the set; everything before it is invisible
        self.descriptor.write_toc()?;
        fsync_directory(&self.descriptor.directory)?;

        log::debug!(
            "finished table {} ({} rows, {} bytes)",
            self.descriptor,
            self.row_count,
            self.data_offset,
        );

        self.finished = true;

        Ok(Some(FinishedTable {
            descriptor: self.descriptor.clone(),
            summary,
            filter,
            stats,
        }))
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioner::OrderPreservingPartitioner;
    use crate::sstable::format::FormatVersion;
    use crate::Cell;
    use test_log::test;

    fn writer(dir: &std::path::Path) -> crate::Result<TableWriter> {
        TableWriter::new(
            Descriptor::new("ks", "cf", 1, FormatVersion::CURRENT, dir),
            Arc::new(Schema::default()),
            Arc::new(OrderPreservingPartitioner),
            WriterOptions::default(),
            ReplayPosition::NONE,
            vec![],
        )
    }

    #[test]
    fn empty_writer_publishes_nothing() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut w = writer(dir.path())?;
        assert!(w.finish()?.is_none());

        // No file survives
        assert_eq!(0, std::fs::read_dir(dir.path())?.count());

        Ok(())
    }

    #[test]
    fn dropped_writer_removes_files() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let partitioner = OrderPreservingPartitioner;

        {
            let mut w = writer(dir.path())?;

            let mut row = Row::new();
            row.upsert(
                Cell::live("a", "v", 1),
                &crate::ClusteringComparator::Bytes,
                false,
            );

            w.append_row(&partitioner.decorate("k".into()), &row)?;
            // dropped without finish
        }

        assert_eq!(0, std::fs::read_dir(dir.path())?.count());

        Ok(())
    }

    #[test]
    fn finished_writer_commits_all_components() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let partitioner = OrderPreservingPartitioner;

        let mut w = writer(dir.path())?;

        for key in ["a", "b", "c"] {
            let mut row = Row::new();
            row.upsert(
                Cell::live("col", "v", 1),
                &crate::ClusteringComparator::Bytes,
                false,
            );
            w.append_row(&partitioner.decorate(key.into()), &row)?;
        }

        #[allow(clippy::expect_used)]
        let finished = w.finish()?.expect("should publish");

        assert!(finished.descriptor.is_complete()?);
        assert_eq!(3, finished.stats.estimated_row_size.count());
        assert!(finished.filter.maybe_contains(b"a"));
        assert!(finished.filter.maybe_contains(b"b"));
        assert!(finished.filter.maybe_contains(b"c"));
        assert!(!finished.filter.maybe_contains(b"d"));

        Ok(())
    }

    #[test]
    #[should_panic(expected = "ascending partition order")]
    fn out_of_order_rows_panic() {
        #[allow(clippy::expect_used)]
        let dir = tempfile::tempdir().expect("tempdir");
        let partitioner = OrderPreservingPartitioner;

        #[allow(clippy::expect_used)]
        let mut w = writer(dir.path()).expect("writer");

        let mut row = Row::new();
        row.upsert(
            Cell::live("col", "v", 1),
            &crate::ClusteringComparator::Bytes,
            false,
        );

        #[allow(clippy::expect_used)]
        w.append_row(&partitioner.decorate("b".into()), &row)
            .expect("append");

        let _ = w.append_row(&partitioner.decorate("a".into()), &row);
    }
}
