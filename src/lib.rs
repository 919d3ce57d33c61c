// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A log-structured single-table storage engine for wide-column data.
//!
//! ##### NOTE
//!
//! > This crate only provides the storage core of a single wide-column table,
//! > not a full database. It does not ship with a commit log; durability of
//! > unflushed writes is the responsibility of the embedding system, which
//! > collaborates through the [`CommitLog`] trait.
//!
//! ##### About
//!
//! Writes land in a concurrent sorted in-memory buffer (the memtable) under the
//! owning store's read lock. When the memtable's estimated live size exceeds a
//! threshold, it is atomically switched out and flushed into an immutable
//! sorted table (SST): a `Data` file of partition-ordered rows plus an index,
//! a sparse index summary, a bloom filter over partition keys and a versioned
//! statistics sidecar.
//!
//! Sorted tables are organised by a leveled manifest: L0 may contain
//! overlapping tables, every deeper level is a non-overlapping partition of
//! the key space. Background compaction merges overlapping versions of a row,
//! reconciles cells by timestamp and drops tombstones once it can prove no
//! older version of the shadowed data exists outside the compaction set.
//!
//! ```
//! use widetable::{Cell, Config, QueryFilter, Row};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let store = Config::new(folder.path()).open()?;
//!
//! let mut row = Row::new();
//! row.cells.push(Cell::live("col", "value", /* timestamp */ 1));
//! store.apply_write("my_key", row)?;
//!
//! // Convert the write buffer into a sorted table on disk
//! store.force_flush()?;
//!
//! // Merge tables, reconciling overlapping row versions
//! store.force_major_compaction()?;
//!
//! let row = store.get_row("my_key", &QueryFilter::all())?.expect("should exist");
//! assert_eq!(1, row.cells.len());
//! #
//! # Ok::<(), widetable::Error>(())
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fjall-rs/widetable/main/logo.png")]
#![doc(html_favicon_url = "https://raw.githubusercontent.com/fjall-rs/widetable/main/logo.png")]
#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

#[doc(hidden)]
pub mod cache;

mod cell;
mod clustering;
mod coding;

pub mod compaction;

mod config;
mod counter;
mod deletion;
mod error;

#[doc(hidden)]
pub mod executor;

#[doc(hidden)]
pub mod file;

mod histogram;
mod interval_tree;
mod key;

mod memtable;

#[doc(hidden)]
pub mod merge;

mod partitioner;
mod range_tombstone;
mod replay;
mod row;
mod schema;
mod secondary_index;
mod slice;

pub mod sstable;

#[doc(hidden)]
pub mod stop_signal;

mod store;
mod time;

#[doc(hidden)]
pub mod tracker;

#[doc(hidden)]
pub mod validation;

/// Timestamp of a write, in microseconds, supplied by the client
pub type Timestamp = i64;

/// Local deletion time in seconds since the unix epoch
///
/// Records *when* a tombstone was created, so that it can be
/// garbage collected once the grace period has passed.
pub type LocalDeletionTime = u32;

/// Sentinel meaning "not deleted"
pub const NO_DELETION_TIME: LocalDeletionTime = LocalDeletionTime::MAX;

/// Sentinel timestamp meaning "no deletion recorded"
pub const NO_TIMESTAMP: Timestamp = Timestamp::MIN;

/// Local deletion threshold that never matches any tombstone
///
/// Passing this as `gc_before` removes data shadowed by tombstones
/// without dropping any tombstone itself (the delete-preservation rule).
pub const GC_NONE: LocalDeletionTime = 0;

#[doc(hidden)]
pub use {
    cache::{KeyCache, RowCache},
    executor::{Executor, TaskFuture},
    memtable::Memtable,
    merge::RowMerger,
    sstable::{scanner::SSTableScanner, writer::TableWriter},
    tracker::{DataTracker, View},
    validation::TreeRoot,
};

pub use {
    cell::{Atom, Cell},
    clustering::ClusteringComparator,
    compaction::leveled::LeveledManifest,
    config::{Config, SystemContext},
    counter::CounterContext,
    deletion::DeletionInfo,
    error::{Error, Result},
    histogram::{EstimatedHistogram, StreamingHistogram},
    key::{DecoratedKey, Token},
    partitioner::{OrderPreservingPartitioner, Partitioner, Xxh3Partitioner},
    range_tombstone::RangeTombstone,
    replay::{CommitLog, NoopCommitLog, ReplayPosition},
    row::{QueryFilter, Row},
    schema::{Schema, TableKind},
    secondary_index::{IndexUpdater, NoIndexes, SecondaryIndexManager},
    slice::Slice,
    sstable::{Descriptor, Generation, SSTable},
    store::Store,
};
