// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{cell::Cell, key::DecoratedKey};

/// Observes cell changes of a single partition
///
/// Obtained per partition from the [`SecondaryIndexManager`]; the memtable
/// reports every insert and replacement, compaction reports cells that are
/// superseded by a newer version with a different value.
pub trait IndexUpdater {
    /// A cell was written where none existed.
    fn insert(&self, cell: &Cell);

    /// A cell replaced a previous version.
    fn update(&self, old: &Cell, new: &Cell);

    /// A previously-written cell was dropped in favor of a newer version.
    fn remove(&self, cell: &Cell);
}

/// Maintains secondary indexes against the write path
///
/// Index *queries* are out of scope for this crate; only maintenance hooks
/// are provided.
pub trait SecondaryIndexManager: Send + Sync + 'static {
    /// Returns `true` if any index is registered.
    ///
    /// A store without indexes may drop shadowed cells during flush;
    /// with indexes they must be retained so `remove` can observe them.
    fn has_indexes(&self) -> bool;

    /// Returns the updater observing the given partition.
    fn updater_for<'a>(&'a self, key: &DecoratedKey) -> Box<dyn IndexUpdater + 'a>;
}

/// Index manager of a store without secondary indexes
#[derive(Default)]
pub struct NoIndexes;

struct NoopUpdater;

impl IndexUpdater for NoopUpdater {
    fn insert(&self, _cell: &Cell) {}
    fn update(&self, _old: &Cell, _new: &Cell) {}
    fn remove(&self, _cell: &Cell) {}
}

impl SecondaryIndexManager for NoIndexes {
    fn has_indexes(&self) -> bool {
        false
    }

    fn updater_for<'a>(&'a self, _key: &DecoratedKey) -> Box<dyn IndexUpdater + 'a> {
        Box::new(NoopUpdater)
    }
}
