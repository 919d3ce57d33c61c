// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{memtable::Memtable, sstable::Generation, sstable::SSTable};
use std::sync::{Arc, RwLock};

/// Immutable snapshot of a store's data sources
///
/// A reader acquires the snapshot once and keeps using it for the whole
/// operation; swaps published in the meantime are invisible to it. The
/// `Arc`s inside double as reference counts: a superseded table's files
/// are deleted only when the last snapshot (or iterator) holding it drops.
pub struct View {
    /// The active, writable memtable
    pub memtable: Arc<Memtable>,

    /// Memtables switched out but not yet fully flushed
    pub flushing: Vec<Arc<Memtable>>,

    /// All live sorted tables
    pub tables: Vec<Arc<SSTable>>,
}

impl View {
    /// All memtables, active first, then flushing in switch order.
    #[must_use]
    pub fn memtables(&self) -> Vec<Arc<Memtable>> {
        let mut all = vec![self.memtable.clone()];
        all.extend(self.flushing.iter().cloned());
        all
    }

    /// Creation second of the oldest memtable that has not been flushed.
    #[must_use]
    pub fn oldest_unflushed_secs(&self) -> u32 {
        self.memtables()
            .iter()
            .map(|m| m.created_at())
            .min()
            .unwrap_or(0)
    }
}

/// Owns the current [`View`] and swaps it atomically on every mutation
///
/// All mutators build a new snapshot from the current one and publish it
/// through the single shared reference; readers clone the `Arc` under the
/// read lock and never block mutators afterwards.
pub struct DataTracker {
    view: RwLock<Arc<View>>,
}

impl Default for DataTracker {
    fn default() -> Self {
        Self::new(vec![])
    }
}

impl DataTracker {
    #[must_use]
    pub fn new(tables: Vec<Arc<SSTable>>) -> Self {
        Self {
            view: RwLock::new(Arc::new(View {
                memtable: Arc::new(Memtable::new()),
                flushing: Vec::new(),
                tables,
            })),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<View> {
        #[allow(clippy::expect_used)]
        self.view.read().expect("lock is poisoned").clone()
    }

    fn publish<F: FnOnce(&View) -> View>(&self, f: F) -> Arc<View> {
        #[allow(clippy::expect_used)]
        let mut guard = self.view.write().expect("lock is poisoned");

        let next = Arc::new(f(&guard));
        *guard = next.clone();
        next
    }

    /// Moves the active memtable to the flushing set and installs a fresh
    /// one; returns the switched-out memtable.
    ///
    /// Must be called under the store's switch lock.
    pub fn switch_memtable(&self) -> Arc<Memtable> {
        let mut switched = None;

        self.publish(|view| {
            let old = view.memtable.clone();
            switched = Some(old.clone());

            let mut flushing = view.flushing.clone();
            flushing.push(old);

            View {
                memtable: Arc::new(Memtable::new()),
                flushing,
                tables: view.tables.clone(),
            }
        });

        #[allow(clippy::expect_used)]
        switched.expect("publish ran")
    }

    /// Retires a flushed memtable, installing its output table (if any).
    pub fn replace_flushed(&self, memtable: &Arc<Memtable>, table: Option<Arc<SSTable>>) {
        self.publish(|view| {
            let flushing = view
                .flushing
                .iter()
                .filter(|m| !Arc::ptr_eq(m, memtable))
                .cloned()
                .collect();

            let mut tables = view.tables.clone();
            if let Some(table) = &table {
                tables.push(table.clone());
            }

            View {
                memtable: view.memtable.clone(),
                flushing,
                tables,
            }
        });
    }

    /// Swaps compaction inputs for outputs and flags the inputs obsolete;
    /// their files disappear when the last outstanding reference drops.
    pub fn replace_compacted(
        &self,
        inputs: &[Arc<SSTable>],
        outputs: &[Arc<SSTable>],
    ) {
        let input_gens: Vec<Generation> = inputs.iter().map(|t| t.generation()).collect();

        self.publish(|view| {
            let mut tables: Vec<_> = view
                .tables
                .iter()
                .filter(|t| !input_gens.contains(&t.generation()))
                .cloned()
                .collect();

            tables.extend(outputs.iter().cloned());

            View {
                memtable: view.memtable.clone(),
                flushing: view.flushing.clone(),
                tables,
            }
        });

        // Mark obsolete only after the swap: anything still holding the
        // old snapshot keeps the files alive until it drops
        for input in inputs {
            input.mark_obsolete();
        }
    }

    /// Drops a single table from the live set without deleting its files
    /// (the corruption path).
    pub fn remove_table(&self, generation: Generation) {
        self.publish(|view| View {
            memtable: view.memtable.clone(),
            flushing: view.flushing.clone(),
            tables: view
                .tables
                .iter()
                .filter(|t| t.generation() != generation)
                .cloned()
                .collect(),
        });
    }

    /// Empties the tracker; with `delete` the table files are removed
    /// once their references drain.
    pub fn invalidate(&self, delete: bool) {
        let old = self.publish(|view| {
            if delete {
                for table in &view.tables {
                    table.mark_obsolete();
                }
            }

            View {
                memtable: Arc::new(Memtable::new()),
                flushing: Vec::new(),
                tables: Vec::new(),
            }
        });

        drop(old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn switch_moves_memtable_to_flushing() {
        let tracker = DataTracker::default();

        let before = tracker.current();
        let switched = tracker.switch_memtable();

        assert!(Arc::ptr_eq(&before.memtable, &switched));

        let after = tracker.current();
        assert_eq!(1, after.flushing.len());
        assert!(!Arc::ptr_eq(&after.memtable, &switched));
    }

    #[test]
    fn replace_flushed_retires_memtable() {
        let tracker = DataTracker::default();

        let switched = tracker.switch_memtable();
        tracker.replace_flushed(&switched, None);

        let view = tracker.current();
        assert!(view.flushing.is_empty());
        assert!(view.tables.is_empty());
    }

    #[test]
    fn snapshot_is_stable_across_swaps() {
        let tracker = DataTracker::default();

        let snapshot = tracker.current();
        tracker.switch_memtable();

        // The old snapshot still sees the pre-switch state
        assert!(snapshot.flushing.is_empty());
        assert_eq!(1, tracker.current().flushing.len());
    }
}
