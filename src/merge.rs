// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! k-way merge primitives: rows across tables, atoms within a row

use crate::{
    cell::{Atom, Cell},
    clustering::ClusteringComparator,
    deletion::DeletionInfo,
    key::DecoratedKey,
};
use interval_heap::IntervalHeap as Heap;
use std::cmp::Ordering;

pub type BoxedAtomIterator<'a> = Box<dyn Iterator<Item = crate::Result<Atom>> + 'a>;

/// Merges `k` per-row atom streams into one stream in clustering order
///
/// Equal-named cells are reduced via [`Cell::reconcile`]; range tombstones
/// pass through one at a time (they are gathered by [`CellStream`]).
///
/// Uses linear head selection instead of a heap because the ordering is
/// defined by a runtime comparator and `k` is the compaction fan-in, which
/// is small.
pub struct AtomMerger<'a> {
    sources: Vec<BoxedAtomIterator<'a>>,
    heads: Vec<Option<Atom>>,
    cmp: &'a ClusteringComparator,
    counter: bool,
    initialized: bool,
}

impl<'a> AtomMerger<'a> {
    #[must_use]
    pub fn new(
        sources: Vec<BoxedAtomIterator<'a>>,
        cmp: &'a ClusteringComparator,
        counter: bool,
    ) -> Self {
        let heads = sources.iter().map(|_| None).collect();

        Self {
            sources,
            heads,
            cmp,
            counter,
            initialized: false,
        }
    }

    fn refill(&mut self, idx: usize) -> crate::Result<()> {
        let Some(source) = self.sources.get_mut(idx) else {
            return Ok(());
        };

        let head = match source.next() {
            Some(item) => Some(item?),
            None => None,
        };

        if let Some(slot) = self.heads.get_mut(idx) {
            *slot = head;
        }

        Ok(())
    }

    fn initialize(&mut self) -> crate::Result<()> {
        for idx in 0..self.sources.len() {
            self.refill(idx)?;
        }
        self.initialized = true;
        Ok(())
    }

    /// Compares two atoms by clustering position, range tombstones first.
    fn atom_cmp(&self, a: &Atom, b: &Atom) -> Ordering {
        self.cmp
            .compare(a.position(), b.position())
            .then_with(|| a.kind_rank().cmp(&b.kind_rank()))
    }
}

impl Iterator for AtomMerger<'_> {
    type Item = crate::Result<Atom>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            fail_iter!(self.initialize());
        }

        // Find the smallest head
        let mut best: Option<usize> = None;

        for (idx, head) in self.heads.iter().enumerate() {
            let Some(atom) = head else { continue };

            best = match best {
                None => Some(idx),
                Some(best_idx) => {
                    let best_atom = self.heads.get(best_idx)?.as_ref()?;

                    if self.atom_cmp(atom, best_atom) == Ordering::Less {
                        Some(idx)
                    } else {
                        Some(best_idx)
                    }
                }
            };
        }

        let best_idx = best?;
        let atom = self.heads.get_mut(best_idx)?.take()?;
        fail_iter!(self.refill(best_idx));

        let Atom::Cell(mut cell) = atom else {
            // Range tombstones pass through individually
            return Some(Ok(atom));
        };

        // Reduce all equal-named cells from the other sources
        loop {
            let mut other_idx = None;

            for (idx, head) in self.heads.iter().enumerate() {
                if let Some(Atom::Cell(other)) = head {
                    if self.cmp.compare(other.name(), cell.name()) == Ordering::Equal {
                        other_idx = Some(idx);
                        break;
                    }
                }
            }

            let Some(idx) = other_idx else { break };

            let Some(Atom::Cell(other)) = self.heads.get_mut(idx)?.take() else {
                break;
            };
            fail_iter!(self.refill(idx));

            cell = cell.reconcile(other, self.counter);
        }

        Some(Ok(Atom::Cell(cell)))
    }
}

/// Wraps an [`AtomMerger`], gathering range tombstones into a deletion
/// info side channel and yielding only cells
pub struct CellStream<'a> {
    inner: AtomMerger<'a>,
    deletion: DeletionInfo,
    cmp: &'a ClusteringComparator,
}

impl<'a> CellStream<'a> {
    #[must_use]
    pub fn new(inner: AtomMerger<'a>, deletion: DeletionInfo, cmp: &'a ClusteringComparator) -> Self {
        Self {
            inner,
            deletion,
            cmp,
        }
    }

    /// The gathered deletion info (call after exhausting the stream).
    #[must_use]
    pub fn into_deletion(self) -> DeletionInfo {
        self.deletion
    }

    /// The deletion info gathered so far.
    ///
    /// Atoms arrive in clustering order, so every range tombstone covering
    /// an already-yielded position has been gathered.
    #[must_use]
    pub fn deletion(&self) -> &DeletionInfo {
        &self.deletion
    }
}

impl Iterator for CellStream<'_> {
    type Item = crate::Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match fail_iter!(self.inner.next()?) {
                Atom::Cell(cell) => return Some(Ok(cell)),
                Atom::RangeTombstone(rt) => {
                    if !self.deletion.range_tombstones.contains(&rt) {
                        self.deletion.add_range_tombstone(rt, self.cmp);
                    }
                }
            }
        }
    }
}

pub type BoxedRowIterator<'a, T> =
    Box<dyn Iterator<Item = crate::Result<(DecoratedKey, T)>> + 'a>;

struct HeapItem<T>(usize, DecoratedKey, T);

impl<T> PartialEq for HeapItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.1 == other.1 && self.0 == other.0
    }
}

impl<T> Eq for HeapItem<T> {}

impl<T> PartialOrd for HeapItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.1.cmp(&other.1).then_with(|| self.0.cmp(&other.0))
    }
}

/// Merges `k` partition-ordered row streams, yielding groups of equal-key
/// row versions (one group per output row)
///
/// This is the outer merge of compaction and multi-table reads; the inner,
/// per-row cell merge is [`AtomMerger`].
pub struct RowMerger<'a, T> {
    sources: Vec<BoxedRowIterator<'a, T>>,
    heap: Heap<HeapItem<T>>,
    pending: Option<HeapItem<T>>,
    initialized: bool,
}

impl<'a, T> RowMerger<'a, T> {
    #[must_use]
    pub fn new(sources: Vec<BoxedRowIterator<'a, T>>) -> Self {
        let heap = Heap::with_capacity(sources.len());

        Self {
            sources,
            heap,
            pending: None,
            initialized: false,
        }
    }

    fn refill(&mut self, idx: usize) -> crate::Result<()> {
        let Some(source) = self.sources.get_mut(idx) else {
            return Ok(());
        };

        if let Some(item) = source.next() {
            let (key, payload) = item?;
            self.heap.push(HeapItem(idx, key, payload));
        }

        Ok(())
    }

    fn initialize(&mut self) -> crate::Result<()> {
        for idx in 0..self.sources.len() {
            self.refill(idx)?;
        }
        self.initialized = true;
        Ok(())
    }
}

impl<T> Iterator for RowMerger<'_, T> {
    type Item = crate::Result<(DecoratedKey, Vec<T>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            fail_iter!(self.initialize());
        }

        let first = match self.pending.take() {
            Some(item) => item,
            None => self.heap.pop_min()?,
        };

        let key = first.1.clone();
        fail_iter!(self.refill(first.0));

        let mut group = vec![(first.0, first.2)];

        while let Some(item) = self.heap.pop_min() {
            if item.1 == key {
                fail_iter!(self.refill(item.0));
                group.push((item.0, item.2));
            } else {
                self.pending = Some(item);
                break;
            }
        }

        // Deterministic source order within a group
        group.sort_by_key(|(idx, _)| *idx);

        Some(Ok((key, group.into_iter().map(|(_, t)| t).collect())))
    }
}
