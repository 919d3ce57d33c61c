// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cell::{Atom, Cell},
    clustering::ClusteringComparator,
    deletion::{DeletionInfo, TOP_LEVEL_SIZE},
    LocalDeletionTime, Slice, Timestamp, NO_TIMESTAMP,
};
use sha2::Digest;

/// Outcome of inserting a cell into a row
pub struct UpsertResult {
    /// The cell version that was stored before, if any
    pub previous: Option<Cell>,

    /// The cell version that is stored now
    pub resolved: Cell,
}

/// One partition's worth of data: a deletion state plus an ordered
/// sequence of cells
///
/// Rows handed out by the engine keep their cells in clustering order.
/// Rows passed *into* [`crate::Store::apply_write`] may list cells in any
/// order; they are reconciled one by one.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Row {
    /// Row-level deletion state
    pub deletion: DeletionInfo,

    /// Cells, ordered by the clustering comparator
    pub cells: Vec<Cell>,
}

impl Row {
    /// Creates an empty, live row.
    #[must_use]
    pub fn new() -> Self {
        Self {
            deletion: DeletionInfo::live(),
            cells: Vec::new(),
        }
    }

    /// Creates a row carrying only a deletion state.
    #[must_use]
    pub fn tombstone(timestamp: Timestamp, local_deletion_time: LocalDeletionTime) -> Self {
        Self {
            deletion: DeletionInfo::deleted_at(timestamp, local_deletion_time),
            cells: Vec::new(),
        }
    }

    /// Looks up a cell by name.
    #[must_use]
    pub fn get(&self, name: &[u8], cmp: &ClusteringComparator) -> Option<&Cell> {
        self.cells
            .binary_search_by(|probe| cmp.compare(probe.name(), name))
            .ok()
            .and_then(|idx| self.cells.get(idx))
    }

    /// Inserts a cell, reconciling with any existing version of the same name.
    pub fn upsert(&mut self, cell: Cell, cmp: &ClusteringComparator, counter: bool) -> UpsertResult {
        match self
            .cells
            .binary_search_by(|probe| cmp.compare(probe.name(), cell.name()))
        {
            Ok(idx) => {
                #[allow(clippy::indexing_slicing)]
                let previous = self.cells[idx].clone();
                let resolved = previous.clone().reconcile(cell, counter);

                #[allow(clippy::indexing_slicing)]
                {
                    self.cells[idx] = resolved.clone();
                }

                UpsertResult {
                    previous: Some(previous),
                    resolved,
                }
            }
            Err(idx) => {
                self.cells.insert(idx, cell.clone());

                UpsertResult {
                    previous: None,
                    resolved: cell,
                }
            }
        }
    }

    /// Merges another row version into this one.
    pub fn merge_from(&mut self, other: Self, cmp: &ClusteringComparator, counter: bool) {
        self.deletion.merge(&other.deletion, cmp);

        for cell in other.cells {
            self.upsert(cell, cmp, counter);
        }
    }

    /// Removes cells shadowed by tombstones, then purges tombstones older
    /// than `gc_before`.
    ///
    /// Passing [`crate::GC_NONE`] removes only shadowed cells and keeps
    /// every tombstone (the delete-preservation rule of the write path).
    pub fn remove_deleted(&mut self, gc_before: LocalDeletionTime, cmp: &ClusteringComparator) {
        let deletion = self.deletion.clone();

        self.cells.retain(|cell| {
            !deletion.shadows(cell, cmp) && cell.local_deletion_time() >= gc_before
        });

        self.deletion.purge(gc_before);
    }

    /// Returns `true` if the row carries neither cells nor deletion state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.deletion.is_live()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn atom_count(&self) -> usize {
        self.cells.len() + self.deletion.range_tombstone_count()
    }

    /// Highest write timestamp in the row, including tombstones.
    #[must_use]
    pub fn max_timestamp(&self) -> Timestamp {
        self.cells
            .iter()
            .map(Cell::timestamp)
            .fold(self.deletion.max_deletion_timestamp(), Timestamp::max)
    }

    /// Lowest write timestamp in the row, including tombstones.
    ///
    /// [`Timestamp::MAX`] for a row without any timestamps.
    #[must_use]
    pub fn min_timestamp(&self) -> Timestamp {
        let mut min = Timestamp::MAX;

        if self.deletion.marked_for_delete_at != NO_TIMESTAMP {
            min = self.deletion.marked_for_delete_at;
        }

        for rt in &self.deletion.range_tombstones {
            min = min.min(rt.timestamp);
        }

        for cell in &self.cells {
            min = min.min(cell.timestamp());
        }

        min
    }

    /// Serialized size of the row body: deletion pair, atom count and atoms.
    #[must_use]
    pub fn serialized_size(&self) -> u64 {
        let atoms: u64 = self
            .cells
            .iter()
            .map(|c| 1 + c.serialized_size())
            .chain(
                self.deletion
                    .range_tombstones
                    .iter()
                    .map(|rt| 1 + rt.serialized_size()),
            )
            .sum();

        TOP_LEVEL_SIZE + 4 + atoms
    }

    /// The row's atom stream in clustering order.
    ///
    /// Range tombstones are interleaved by their start bound and precede
    /// cells at the same position.
    #[must_use]
    pub fn atoms(&self, cmp: &ClusteringComparator) -> Vec<Atom> {
        let mut out = Vec::with_capacity(self.atom_count());

        let mut cells = self.cells.iter().peekable();
        let mut rts = self.deletion.range_tombstones.iter().peekable();

        loop {
            match (cells.peek(), rts.peek()) {
                (None, None) => break,
                (Some(_), None) => {
                    #[allow(clippy::expect_used)]
                    out.push(Atom::Cell(cells.next().expect("just peeked").clone()));
                }
                (None, Some(_)) => {
                    #[allow(clippy::expect_used)]
                    out.push(Atom::RangeTombstone(
                        rts.next().expect("just peeked").clone(),
                    ));
                }
                (Some(cell), Some(rt)) => {
                    #[allow(clippy::expect_used)]
                    if cmp.compare(&rt.start, cell.name()) != std::cmp::Ordering::Greater {
                        out.push(Atom::RangeTombstone(
                            rts.next().expect("just peeked").clone(),
                        ));
                    } else {
                        out.push(Atom::Cell(cells.next().expect("just peeked").clone()));
                    }
                }
            }
        }

        out
    }

    /// Rebuilds a row from a deletion pair and an atom stream.
    #[must_use]
    pub fn from_atoms(
        deletion: DeletionInfo,
        atoms: impl IntoIterator<Item = Atom>,
        cmp: &ClusteringComparator,
    ) -> Self {
        let mut row = Self {
            deletion,
            cells: Vec::new(),
        };

        for atom in atoms {
            match atom {
                Atom::Cell(cell) => row.cells.push(cell),
                Atom::RangeTombstone(rt) => row.deletion.add_range_tombstone(rt, cmp),
            }
        }

        debug_assert!(
            row.cells
                .windows(2)
                .all(|w| cmp.compare(w[0].name(), w[1].name()) == std::cmp::Ordering::Less),
            "atom stream was not sorted"
        );

        row
    }

    /// Strips everything a reader should not observe: shadowed cells,
    /// tombstoned cells and expired cells.
    ///
    /// Returns `None` if nothing observable remains and the row carries no
    /// deletion state either.
    #[must_use]
    pub fn observable(mut self, now: u32, cmp: &ClusteringComparator) -> Option<Self> {
        let deletion = self.deletion.clone();

        self.cells
            .retain(|cell| cell.is_live_at(now) && !deletion.shadows(cell, cmp));

        if self.cells.is_empty() && self.deletion.is_live() {
            None
        } else {
            Some(self)
        }
    }

    /// Cells within `[start, end]`, in forward or reverse clustering order.
    #[must_use]
    pub fn slice_cells(
        &self,
        start: &[u8],
        end: &[u8],
        reversed: bool,
        count: usize,
        cmp: &ClusteringComparator,
    ) -> Vec<Cell> {
        let in_range = self
            .cells
            .iter()
            .filter(|cell| cmp.in_range(cell.name(), start, end));

        if reversed {
            in_range.rev().take(count).cloned().collect()
        } else {
            in_range.take(count).cloned().collect()
        }
    }

    /// Deterministic digest over deletion info, column count and cells,
    /// in clustering order. Used for read-repair comparison.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = sha2::Sha256::new();

        self.deletion.digest(&mut hasher);

        #[allow(clippy::cast_possible_truncation)]
        hasher.update((self.cells.len() as u32).to_be_bytes());

        for cell in &self.cells {
            cell.digest(&mut hasher);
        }

        hasher.finalize().into()
    }

    /// Approximate in-memory footprint, for live-ratio metering.
    #[must_use]
    pub(crate) fn deep_size(&self) -> u64 {
        let cells: u64 = self
            .cells
            .iter()
            .map(|cell| {
                std::mem::size_of::<Cell>() as u64
                    + cell.name().len() as u64
                    + cell.value().map_or(0, |v| v.len() as u64)
            })
            .sum();

        let rts: u64 = self
            .deletion
            .range_tombstones
            .iter()
            .map(|rt| {
                std::mem::size_of_val(rt) as u64 + rt.start.len() as u64 + rt.end.len() as u64
            })
            .sum();

        std::mem::size_of::<Self>() as u64 + cells + rts
    }
}

/// Which columns of a row a read wants
#[derive(Clone, Debug)]
pub enum QueryFilter {
    /// A contiguous clustering range; empty bounds are unbounded
    Slice {
        start: Slice,
        end: Slice,
        reversed: bool,
        count: usize,
    },

    /// An explicit set of column names, sorted by the table's comparator
    Names(Vec<Slice>),
}

impl QueryFilter {
    /// A filter returning the whole row.
    #[must_use]
    pub fn all() -> Self {
        Self::Slice {
            start: Slice::empty(),
            end: Slice::empty(),
            reversed: false,
            count: usize::MAX,
        }
    }

    /// A filter returning the given columns.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Slice>,
    {
        Self::Names(names.into_iter().map(Into::into).collect())
    }

    /// Returns `true` if this filter selects every column.
    #[must_use]
    pub fn is_full_row(&self) -> bool {
        match self {
            Self::Slice {
                start, end, count, ..
            } => start.is_empty() && end.is_empty() && *count == usize::MAX,
            Self::Names(_) => false,
        }
    }

    pub(crate) fn apply(&self, row: Row, cmp: &ClusteringComparator) -> Row {
        match self {
            Self::Slice {
                start,
                end,
                reversed,
                count,
            } => {
                let cells = row.slice_cells(start, end, *reversed, *count, cmp);
                Row {
                    deletion: row.deletion,
                    cells,
                }
            }
            Self::Names(names) => {
                let cells = names
                    .iter()
                    .filter_map(|name| row.get(name, cmp).cloned())
                    .collect();

                Row {
                    deletion: row.deletion,
                    cells,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range_tombstone::RangeTombstone;
    use test_log::test;

    fn cmp() -> ClusteringComparator {
        ClusteringComparator::Bytes
    }

    #[test]
    fn row_upsert_keeps_order() {
        let mut row = Row::new();
        row.upsert(Cell::live("c", "3", 1), &cmp(), false);
        row.upsert(Cell::live("a", "1", 1), &cmp(), false);
        row.upsert(Cell::live("b", "2", 1), &cmp(), false);

        let names: Vec<_> = row.cells.iter().map(|c| c.name().clone()).collect();
        assert_eq!(
            names,
            vec![b"a".into(), b"b".into(), b"c".into()] as Vec<Slice>
        );
    }

    #[test]
    fn row_upsert_reconciles() {
        let mut row = Row::new();
        row.upsert(Cell::live("a", "old", 1), &cmp(), false);
        let result = row.upsert(Cell::live("a", "new", 2), &cmp(), false);

        assert!(result.previous.is_some());
        assert_eq!(1, row.cells.len());
        assert_eq!(
            Some(&Slice::from("new")),
            row.get(b"a", &cmp()).and_then(Cell::value)
        );
    }

    #[test]
    fn remove_deleted_preserves_tombstones() {
        let mut row = Row::new();
        row.upsert(Cell::live("a", "1", 1), &cmp(), false);
        row.upsert(Cell::deleted("b", 5, 100), &cmp(), false);
        row.deletion.merge(&DeletionInfo::deleted_at(2, 100), &cmp());

        row.remove_deleted(crate::GC_NONE, &cmp());

        // Cell "a" (ts 1) is shadowed by the row tombstone (ts 2),
        // the cell tombstone "b" survives, the row tombstone survives
        assert_eq!(1, row.cells.len());
        assert!(row.get(b"b", &cmp()).is_some());
        assert!(row.deletion.has_row_tombstone());
    }

    #[test]
    fn remove_deleted_purges_with_gc_before() {
        let mut row = Row::new();
        row.upsert(Cell::deleted("b", 5, 100), &cmp(), false);
        row.deletion.merge(&DeletionInfo::deleted_at(2, 150), &cmp());

        row.remove_deleted(200, &cmp());

        assert!(row.is_empty());
    }

    #[test]
    fn atoms_interleave_range_tombstones() {
        let mut row = Row::new();
        row.upsert(Cell::live("a", "1", 1), &cmp(), false);
        row.upsert(Cell::live("m", "2", 1), &cmp(), false);
        row.deletion
            .add_range_tombstone(RangeTombstone::new("b", "d", 1, 1), &cmp());

        let atoms = row.atoms(&cmp());
        assert_eq!(3, atoms.len());

        assert!(matches!(atoms.first(), Some(Atom::Cell(_))));
        assert!(matches!(atoms.get(1), Some(Atom::RangeTombstone(_))));
        assert!(matches!(atoms.get(2), Some(Atom::Cell(_))));
    }

    #[test]
    fn from_atoms_round_trip() {
        let mut row = Row::new();
        row.upsert(Cell::live("a", "1", 1), &cmp(), false);
        row.upsert(Cell::deleted("x", 3, 50), &cmp(), false);
        row.deletion
            .add_range_tombstone(RangeTombstone::new("b", "d", 2, 60), &cmp());

        let rebuilt = Row::from_atoms(
            DeletionInfo {
                range_tombstones: Vec::new(),
                ..row.deletion.clone()
            },
            row.atoms(&cmp()),
            &cmp(),
        );

        assert_eq!(row, rebuilt);
    }

    #[test]
    fn observable_hides_shadowed_and_expired() {
        let mut row = Row::new();
        row.upsert(Cell::live("a", "1", 1), &cmp(), false);
        row.upsert(Cell::expiring("b", "2", 1, 60, 500), &cmp(), false);
        row.upsert(Cell::deleted("c", 1, 400), &cmp(), false);

        #[allow(clippy::expect_used)]
        let visible = row.clone().observable(400, &cmp()).expect("should remain");
        assert_eq!(2, visible.cells.len());

        #[allow(clippy::expect_used)]
        let visible = row.observable(600, &cmp()).expect("should remain");
        assert_eq!(1, visible.cells.len());
    }

    #[test]
    fn digest_is_order_insensitive_to_insertion() {
        let mut a = Row::new();
        a.upsert(Cell::live("x", "1", 1), &cmp(), false);
        a.upsert(Cell::live("y", "2", 1), &cmp(), false);

        let mut b = Row::new();
        b.upsert(Cell::live("y", "2", 1), &cmp(), false);
        b.upsert(Cell::live("x", "1", 1), &cmp(), false);

        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn slice_cells_reversed() {
        let mut row = Row::new();
        for name in ["a", "b", "c", "d"] {
            row.upsert(Cell::live(name, "v", 1), &cmp(), false);
        }

        let cells = row.slice_cells(b"b", b"d", true, 2, &cmp());
        let names: Vec<_> = cells.iter().map(|c| c.name().clone()).collect();
        assert_eq!(names, vec![b"d".into(), b"c".into()] as Vec<Slice>);
    }
}
