// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod meter;
pub mod slab;

use crate::{
    key::DecoratedKey,
    row::Row,
    schema::Schema,
    secondary_index::IndexUpdater,
    time::unix_timestamp_secs,
    Slice,
};
use crossbeam_skiplist::SkipMap;
use slab::SlabAllocator;
use std::ops::RangeBounds;
use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Mutex,
};

/// The initial live ratio, used until the first metering completes
const INITIAL_LIVE_RATIO: f64 = 10.0;

/// The in-memory, sorted write buffer of a store
///
/// A concurrent skip map of partition key → row. Writers merge incoming
/// rows into the stored row under a per-row mutex after winning (or losing)
/// the compare-and-set insert of the key; readers range-scan a monotone
/// snapshot of the map.
///
/// When the estimated live size exceeds the store's threshold, the
/// memtable is switched out and flushed into a sorted table.
pub struct Memtable {
    rows: SkipMap<DecoratedKey, Mutex<Row>>,

    slab: SlabAllocator,

    /// Serialized-byte estimate of the contents
    current_size: AtomicI64,

    /// Number of applied operations (cells + tombstones)
    operations: AtomicU64,

    /// Unix second this memtable became active
    created_at: u32,

    /// `deep size / serialized size`, calibrated by the metering task
    live_ratio: AtomicU64,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: SkipMap::new(),
            slab: SlabAllocator::default(),
            current_size: AtomicI64::new(0),
            operations: AtomicU64::new(0),
            created_at: unix_timestamp_secs(),
            live_ratio: AtomicU64::new(INITIAL_LIVE_RATIO.to_bits()),
        }
    }

    /// Merges a row version into the memtable.
    ///
    /// The key and all cell payloads are deep-copied through the slab
    /// allocator; the index updater observes every insert and replacement.
    pub fn put(
        &self,
        key: &DecoratedKey,
        row: Row,
        schema: &Schema,
        indexer: &dyn IndexUpdater,
    ) {
        let entry = match self.rows.get(key) {
            Some(entry) => entry,
            None => {
                // Clone the key through the slab, then compare-and-set;
                // losing the race just means using the winner's row
                let cloned = DecoratedKey::new(key.token, self.slab.allocate(&key.key));
                self.rows.get_or_insert(cloned, Mutex::new(Row::new()))
            }
        };

        let counter = schema.is_counter();
        let cmp = &schema.comparator;

        let mut operations = row.cells.len() as u64;
        if row.deletion.has_row_tombstone() {
            operations += 1;
        }
        operations += row.deletion.range_tombstone_count() as u64;

        let mut size_delta = 0i64;

        {
            #[allow(clippy::expect_used)]
            let mut stored = entry.value().lock().expect("lock is poisoned");

            if !row.deletion.is_live() {
                let mut incoming = row.deletion.clone();
                incoming.range_tombstones = incoming
                    .range_tombstones
                    .iter()
                    .map(|rt| self.slab.allocate_range_tombstone(rt))
                    .collect();

                #[allow(clippy::cast_possible_wrap)]
                for rt in &incoming.range_tombstones {
                    size_delta += (1 + rt.serialized_size()) as i64;
                }

                stored.deletion.merge(&incoming, cmp);
            }

            for cell in row.cells {
                let cell = self.slab.allocate_cell(&cell);

                let old_size = stored
                    .get(cell.name(), cmp)
                    .map_or(0, |old| 1 + old.serialized_size());

                let result = stored.upsert(cell, cmp, counter);

                let new_size = 1 + result.resolved.serialized_size();

                #[allow(clippy::cast_possible_wrap)]
                {
                    size_delta += new_size as i64 - old_size as i64;
                }

                match result.previous {
                    Some(old) => indexer.update(&old, &result.resolved),
                    None => indexer.insert(&result.resolved),
                }
            }
        }

        self.current_size.fetch_add(size_delta, Ordering::AcqRel);
        self.operations.fetch_add(operations, Ordering::AcqRel);
    }

    /// Returns a clone of the row stored for the key.
    #[must_use]
    pub fn get(&self, key: &DecoratedKey) -> Option<Row> {
        self.rows.get(key).map(|entry| {
            #[allow(clippy::expect_used)]
            entry.value().lock().expect("lock is poisoned").clone()
        })
    }

    /// Iterates entries in partition order, cloning each row.
    ///
    /// The underlying map offers a monotone snapshot: entries inserted
    /// during iteration may or may not be observed, removed entries never
    /// reappear.
    pub fn iter(&self) -> impl Iterator<Item = (DecoratedKey, Row)> + '_ {
        self.rows.iter().map(|entry| {
            #[allow(clippy::expect_used)]
            let row = entry.value().lock().expect("lock is poisoned").clone();
            (entry.key().clone(), row)
        })
    }

    /// Iterates entries within the given key bounds, in partition order.
    pub fn range<'a, R: RangeBounds<DecoratedKey> + 'a>(
        &'a self,
        range: R,
    ) -> impl Iterator<Item = (DecoratedKey, Row)> + 'a {
        self.rows.range(range).map(|entry| {
            #[allow(clippy::expect_used)]
            let row = entry.value().lock().expect("lock is poisoned").clone();
            (entry.key().clone(), row)
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Serialized-byte estimate of the contents.
    #[must_use]
    pub fn serialized_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire).max(0) as u64
    }

    /// Number of applied operations.
    #[must_use]
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Acquire)
    }

    /// Unix second this memtable became active.
    #[must_use]
    pub fn created_at(&self) -> u32 {
        self.created_at
    }

    /// Estimated in-memory footprint.
    ///
    /// `max(slab minimum, serialized size * live ratio)` - the slab floor
    /// guards against a drifting ratio estimate.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn live_size(&self) -> u64 {
        let estimated = (self.serialized_size() as f64 * self.live_ratio()) as u64;
        self.slab.minimum_size().max(estimated)
    }

    #[must_use]
    pub fn live_ratio(&self) -> f64 {
        f64::from_bits(self.live_ratio.load(Ordering::Acquire))
    }

    /// Installs a new live ratio (metering task only).
    ///
    /// Upward updates are believed immediately; downward updates are
    /// averaged with the previous value, so one skewed walk cannot
    /// collapse the estimate.
    pub(crate) fn set_live_ratio(&self, ratio: f64) {
        let ratio = ratio.clamp(1.0, 64.0);
        let old = self.live_ratio();

        let new = if ratio >= old { ratio } else { (old + ratio) / 2.0 };

        self.live_ratio.store(new.to_bits(), Ordering::Release);
    }

    /// Estimated bytes a flush of this memtable will write, for
    /// disk-space reservation: keys are written twice (data + index),
    /// plus 20% overhead for index, summary and filter.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn estimated_flush_bytes(&self) -> u64 {
        let key_bytes: u64 = self.rows.iter().map(|e| e.key().key.len() as u64).sum();

        ((2 * key_bytes + self.serialized_size()) as f64 * 1.2) as u64
    }

    /// Walks all rows, computing the deep in-memory footprint
    /// (metering task only).
    pub(crate) fn deep_size(&self) -> u64 {
        self.rows
            .iter()
            .map(|entry| {
                #[allow(clippy::expect_used)]
                let row = entry.value().lock().expect("lock is poisoned");

                entry.key().key.len() as u64
                    + std::mem::size_of::<DecoratedKey>() as u64
                    + row.deep_size()
            })
            .sum()
    }

    /// First key in the memtable, if any.
    #[must_use]
    pub fn first_key(&self) -> Option<DecoratedKey> {
        self.rows.front().map(|e| e.key().clone())
    }

    /// Raw key bytes of every partition, in order (tests only).
    #[doc(hidden)]
    #[must_use]
    pub fn keys(&self) -> Vec<Slice> {
        self.rows.iter().map(|e| e.key().key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        partitioner::{OrderPreservingPartitioner, Partitioner},
        secondary_index::{NoIndexes, SecondaryIndexManager},
        Cell, DeletionInfo,
    };
    use test_log::test;

    fn put(memtable: &Memtable, key: &str, row: Row) {
        let partitioner = OrderPreservingPartitioner;
        let schema = Schema::default();
        let decorated = partitioner.decorate(key.into());
        let indexes = NoIndexes;

        memtable.put(&decorated, row, &schema, &*indexes.updater_for(&decorated));
    }

    #[test]
    fn memtable_put_get() {
        let memtable = Memtable::new();
        let partitioner = OrderPreservingPartitioner;

        let mut row = Row::new();
        row.cells.push(Cell::live("col", "value", 1));

        put(&memtable, "key", row);

        assert_eq!(1, memtable.len());
        assert_eq!(1, memtable.operations());
        assert!(memtable.serialized_size() > 0);

        #[allow(clippy::expect_used)]
        let stored = memtable
            .get(&partitioner.decorate("key".into()))
            .expect("should exist");

        assert_eq!(1, stored.cells.len());
    }

    #[test]
    fn memtable_merges_row_versions() {
        let memtable = Memtable::new();
        let partitioner = OrderPreservingPartitioner;

        let mut row = Row::new();
        row.cells.push(Cell::live("a", "1", 1));
        put(&memtable, "key", row);

        let mut row = Row::new();
        row.cells.push(Cell::live("a", "2", 2));
        row.cells.push(Cell::live("b", "3", 2));
        put(&memtable, "key", row);

        #[allow(clippy::expect_used)]
        let stored = memtable
            .get(&partitioner.decorate("key".into()))
            .expect("should exist");

        assert_eq!(2, stored.cells.len());
        assert_eq!(
            Some(&Slice::from("2")),
            stored
                .get(b"a", &crate::ClusteringComparator::Bytes)
                .and_then(Cell::value),
        );

        assert_eq!(1, memtable.len());
        assert_eq!(3, memtable.operations());
    }

    #[test]
    fn memtable_size_delta_on_overwrite() {
        let memtable = Memtable::new();

        let mut row = Row::new();
        row.cells.push(Cell::live("a", "large-value-here", 1));
        put(&memtable, "key", row);

        let size_before = memtable.serialized_size();

        // Overwriting with a smaller value shrinks the estimate
        let mut row = Row::new();
        row.cells.push(Cell::live("a", "s", 2));
        put(&memtable, "key", row);

        assert!(memtable.serialized_size() < size_before);
    }

    #[test]
    fn memtable_iter_in_partition_order() {
        let memtable = Memtable::new();

        for key in ["delta", "alpha", "charlie", "bravo"] {
            let mut row = Row::new();
            row.cells.push(Cell::live("c", "v", 1));
            put(&memtable, key, row);
        }

        let keys: Vec<_> = memtable
            .iter()
            .map(|(k, _)| String::from_utf8_lossy(&k.key).into_owned())
            .collect();

        assert_eq!(vec!["alpha", "bravo", "charlie", "delta"], keys);
    }

    #[test]
    fn memtable_counts_tombstone_operations() {
        let memtable = Memtable::new();

        let row = Row {
            deletion: DeletionInfo::deleted_at(5, 100),
            cells: vec![],
        };
        put(&memtable, "key", row);

        assert_eq!(1, memtable.operations());
    }

    #[test]
    fn live_ratio_updates() {
        let memtable = Memtable::new();

        assert!((memtable.live_ratio() - INITIAL_LIVE_RATIO).abs() < f64::EPSILON);

        // Upward: believed
        memtable.set_live_ratio(20.0);
        assert!((memtable.live_ratio() - 20.0).abs() < f64::EPSILON);

        // Downward: averaged
        memtable.set_live_ratio(10.0);
        assert!((memtable.live_ratio() - 15.0).abs() < f64::EPSILON);

        // Clamped
        memtable.set_live_ratio(1_000.0);
        assert!((memtable.live_ratio() - 64.0).abs() < f64::EPSILON);
    }

    #[test]
    fn live_size_floors_at_slab_minimum() {
        let memtable = Memtable::new();

        let mut row = Row::new();
        row.cells.push(Cell::live("a", "v", 1));
        put(&memtable, "key", row);

        // One region allocated; tiny serialized size
        assert!(memtable.live_size() >= slab::REGION_SIZE);
    }
}
