// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Immutable sorted table (SST) file sets: writer, reader, scanner

pub mod descriptor;
pub mod filter;
pub mod format;
pub mod index;
pub mod reader;
pub mod scanner;
pub mod stats;
pub mod summary;
pub mod writer;

pub use descriptor::{Component, Descriptor, Generation};
pub use filter::KeyFilter;
pub use format::FormatVersion;
pub use index::{IndexEntry, IndexInfo};
pub use stats::StatsMetadata;

use crate::{
    cache::KeyCache,
    clustering::ClusteringComparator,
    coding::Decode,
    error::Error,
    key::{DecoratedKey, Token},
    partitioner::Partitioner,
    row::Row,
    schema::Schema,
    LocalDeletionTime, Slice,
};
use reader::{DataIter, HandleIter};
use summary::Summary;
use writer::FinishedTable;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Reader over one immutable sorted table file set
///
/// Shared by `Arc`: the manifest, outstanding iterators and caches all hold
/// references; the physical files are deleted when the last reference is
/// dropped *and* the table was marked obsolete by a compaction swap.
pub struct SSTable {
    pub descriptor: Descriptor,
    pub schema: Arc<Schema>,
    pub stats: StatsMetadata,

    partitioner: Arc<dyn Partitioner>,
    filter: KeyFilter,
    summary: Summary,

    data_path: Arc<PathBuf>,
    data_size: u64,

    first_key: DecoratedKey,
    last_key: DecoratedKey,

    key_cache: Option<Arc<KeyCache>>,

    /// Set when corruption was observed; the store drops suspect tables
    /// from the live set
    suspect: AtomicBool,

    /// Set when a compaction swap superseded this table; files are
    /// deleted once the last reference drops
    obsolete: AtomicBool,
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSTable({})", self.descriptor)
    }
}

impl SSTable {
    /// Opens a committed table set from disk.
    pub fn open(
        descriptor: Descriptor,
        schema: Arc<Schema>,
        partitioner: Arc<dyn Partitioner>,
        key_cache: Option<Arc<KeyCache>>,
    ) -> crate::Result<Self> {
        if !descriptor.is_complete()? {
            log::error!("sorted table set {descriptor} is incomplete");
            return Err(Error::Unrecoverable);
        }

        let stats = StatsMetadata::load(&descriptor, partitioner.name())?;

        let filter = {
            let file = std::fs::File::open(descriptor.path(Component::Filter))?;
            let mut reader = std::io::BufReader::new(file);
            KeyFilter::decode_from(&mut reader)?
        };

        let summary = Summary::load(&descriptor.path(Component::Summary))?;

        Self::assemble(descriptor, schema, partitioner, summary, filter, stats, key_cache)
    }

    /// Builds the reader from a just-finished writer, without re-reading
    /// component files.
    pub fn from_finished(
        finished: FinishedTable,
        schema: Arc<Schema>,
        partitioner: Arc<dyn Partitioner>,
        key_cache: Option<Arc<KeyCache>>,
    ) -> crate::Result<Self> {
        let FinishedTable {
            descriptor,
            summary,
            filter,
            stats,
        } = finished;

        Self::assemble(descriptor, schema, partitioner, summary, filter, stats, key_cache)
    }

    fn assemble(
        descriptor: Descriptor,
        schema: Arc<Schema>,
        partitioner: Arc<dyn Partitioner>,
        summary: Summary,
        filter: KeyFilter,
        stats: StatsMetadata,
        key_cache: Option<Arc<KeyCache>>,
    ) -> crate::Result<Self> {
        let data_path = descriptor.path(Component::Data);
        let data_size = std::fs::metadata(&data_path)?.len();

        let first_key = partitioner.decorate(summary.first_key.clone());
        let last_key = partitioner.decorate(summary.last_key.clone());

        Ok(Self {
            data_path: Arc::new(data_path),
            data_size,
            first_key,
            last_key,
            descriptor,
            schema,
            stats,
            partitioner,
            filter,
            summary,
            key_cache,
            suspect: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.descriptor.generation
    }

    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    #[must_use]
    pub fn first_key(&self) -> &DecoratedKey {
        &self.first_key
    }

    #[must_use]
    pub fn last_key(&self) -> &DecoratedKey {
        &self.last_key
    }

    /// Token range covered by this table (inclusive bounds).
    #[must_use]
    pub fn token_range(&self) -> (Token, Token) {
        (self.first_key.token, self.last_key.token)
    }

    /// Returns `true` if the key ranges of `self` and `other` intersect.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.first_key <= other.last_key && other.first_key <= self.last_key
    }

    /// Returns `true` if the key falls within this table's key range.
    #[must_use]
    pub fn contains_key_range(&self, key: &DecoratedKey) -> bool {
        *key >= self.first_key && *key <= self.last_key
    }

    /// Returns `true` if the table may contain the key (range + bloom filter).
    ///
    /// Will never have a false negative.
    #[must_use]
    pub fn may_contain(&self, key: &DecoratedKey) -> bool {
        self.contains_key_range(key) && self.filter.maybe_contains(&key.key)
    }

    /// Bloom filter check on the raw key bytes only.
    #[must_use]
    pub fn filter_may_contain(&self, key: &[u8]) -> bool {
        self.filter.maybe_contains(key)
    }

    /// Looks up the index entry of a key, consulting the key cache first.
    pub fn index_entry(&self, key: &DecoratedKey) -> crate::Result<Option<IndexEntry>> {
        if let Some(cache) = &self.key_cache {
            if let Some(entry) = cache.get(self.generation(), &key.key) {
                return Ok(Some(entry));
            }
        }

        let Some(index_offset) = self.summary.search(key, &*self.partitioner) else {
            return Ok(None);
        };

        let entry = index::scan_index(
            &self.descriptor.path(Component::Index),
            index_offset,
            key,
            &*self.partitioner,
        )
        .map_err(|e| self.flag_corruption(e))?;

        if let (Some(cache), Some(entry)) = (&self.key_cache, entry) {
            cache.insert(self.generation(), &key.key, entry);
        }

        Ok(entry)
    }

    /// Reads the full row of a key, or `None` when absent.
    pub fn read_row(&self, key: &DecoratedKey) -> crate::Result<Option<Row>> {
        if !self.may_contain(key) {
            return Ok(None);
        }

        let Some(entry) = self.index_entry(key)? else {
            return Ok(None);
        };

        reader::read_row_at(
            &self.data_path,
            entry,
            &*self.partitioner,
            &self.schema.comparator,
        )
        .map(Some)
        .map_err(|e| self.flag_corruption(e))
    }

    /// Reads only the named columns of a key.
    ///
    /// `names` must be sorted by the table's clustering comparator.
    pub fn read_named(
        &self,
        key: &DecoratedKey,
        names: &[Slice],
    ) -> crate::Result<Option<Row>> {
        if !self.may_contain(key) {
            return Ok(None);
        }

        let Some(entry) = self.index_entry(key)? else {
            return Ok(None);
        };

        let result = if entry.is_promoted() {
            reader::read_named_promoted(
                &self.data_path,
                entry,
                names,
                &*self.partitioner,
                &self.schema.comparator,
            )
        } else {
            // Not promoted: read the row and filter
            reader::read_row_at(
                &self.data_path,
                entry,
                &*self.partitioner,
                &self.schema.comparator,
            )
            .map(|row| {
                let cells = names
                    .iter()
                    .filter_map(|name| row.get(name, &self.schema.comparator).cloned())
                    .collect();

                Row {
                    deletion: row.deletion,
                    cells,
                }
            })
        };

        result.map(Some).map_err(|e| self.flag_corruption(e))
    }

    /// Iterates all rows, fully materialized.
    pub fn iter(&self) -> crate::Result<DataIter> {
        DataIter::new(
            &self.data_path,
            self.partitioner.clone(),
            self.schema.comparator.clone(),
        )
    }

    /// Iterates row handles (for compaction).
    pub fn iter_handles(&self) -> crate::Result<HandleIter> {
        HandleIter::new(self.data_path.clone(), self.partitioner.clone())
    }

    /// Ratio of tombstones droppable at `gc_before` to estimated columns.
    #[must_use]
    pub fn droppable_tombstone_ratio(&self, gc_before: LocalDeletionTime) -> f64 {
        self.stats.droppable_tombstone_ratio(gc_before)
    }

    /// Converts decode errors into corruption, flagging the table suspect.
    fn flag_corruption(&self, e: Error) -> Error {
        match e {
            Error::Decode(inner) => {
                log::error!("corruption in {}: {inner:?}", self.descriptor);
                self.mark_suspect();
                Error::Corrupt(self.generation())
            }
            other => other,
        }
    }

    pub fn mark_suspect(&self) {
        self.suspect.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::Acquire)
    }

    /// Flags the table for physical deletion once the last reference drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for SSTable {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            log::debug!("deleting obsolete table files {}", self.descriptor);
            self.descriptor.delete_files();
        }
    }
}
