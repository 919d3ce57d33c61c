// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::clustering::ClusteringComparator;

/// Behavioral class of a table
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TableKind {
    /// Regular wide-column table
    #[default]
    Standard,

    /// Commutative table; live cells hold counter shards and are merged,
    /// not overwritten
    Counter,

    /// Batchlog table; a flushed row that is tombstoned and empty is
    /// skipped entirely instead of being written out
    Batchlog,
}

/// Static description of the table this store holds
#[derive(Clone, Debug)]
pub struct Schema {
    /// Keyspace the table belongs to
    pub keyspace: String,

    /// Table name; used as the file name prefix of every sorted table
    pub table: String,

    /// Comparator ordering cells within a row
    pub comparator: ClusteringComparator,

    /// Seconds a tombstone must be kept before it may be purged
    pub gc_grace_seconds: u32,

    /// Behavioral class
    pub kind: TableKind,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            keyspace: "default".into(),
            table: "table".into(),
            comparator: ClusteringComparator::Bytes,
            gc_grace_seconds: 864_000, // 10 days
            kind: TableKind::Standard,
        }
    }
}

impl Schema {
    #[must_use]
    pub fn is_counter(&self) -> bool {
        self.kind == TableKind::Counter
    }

    #[must_use]
    pub fn is_batchlog(&self) -> bool {
        self.kind == TableKind::Batchlog
    }

    /// The `local_deletion_time` threshold below which tombstones are
    /// purgeable at wall-clock second `now`.
    #[must_use]
    pub fn gc_before(&self, now: u32) -> u32 {
        now.saturating_sub(self.gc_grace_seconds)
    }
}
