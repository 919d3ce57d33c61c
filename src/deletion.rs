// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cell::Cell,
    clustering::ClusteringComparator,
    coding::{Decode, DecodeError, Encode, EncodeError},
    range_tombstone::RangeTombstone,
    LocalDeletionTime, Timestamp, NO_DELETION_TIME, NO_TIMESTAMP,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Serialized size of the top-level deletion pair
pub const TOP_LEVEL_SIZE: u64 = 8 + 4;

/// Row-level deletion state
///
/// The top-level pair `(marked_for_delete_at, local_deletion_time)` shadows
/// every cell with a timestamp at or below `marked_for_delete_at`; the range
/// tombstones shadow cells within their bounds. On disk only the top-level
/// pair is stored here; range tombstones travel as atoms and are gathered
/// back on read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeletionInfo {
    /// Timestamp at and below which the whole row is deleted
    pub marked_for_delete_at: Timestamp,

    /// Wall-clock second the row deletion was issued
    pub local_deletion_time: LocalDeletionTime,

    /// Range tombstones, ordered by start bound
    pub range_tombstones: Vec<RangeTombstone>,
}

impl Default for DeletionInfo {
    fn default() -> Self {
        Self::live()
    }
}

impl DeletionInfo {
    /// Deletion info of a row that was never deleted.
    #[must_use]
    pub fn live() -> Self {
        Self {
            marked_for_delete_at: NO_TIMESTAMP,
            local_deletion_time: NO_DELETION_TIME,
            range_tombstones: Vec::new(),
        }
    }

    /// Row-level tombstone.
    #[must_use]
    pub fn deleted_at(timestamp: Timestamp, local_deletion_time: LocalDeletionTime) -> Self {
        Self {
            marked_for_delete_at: timestamp,
            local_deletion_time,
            range_tombstones: Vec::new(),
        }
    }

    /// Returns `true` if neither a row tombstone nor any range tombstone exists.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.marked_for_delete_at == NO_TIMESTAMP && self.range_tombstones.is_empty()
    }

    /// Returns `true` if a row-level tombstone exists.
    #[must_use]
    pub fn has_row_tombstone(&self) -> bool {
        self.marked_for_delete_at != NO_TIMESTAMP
    }

    /// Inserts a range tombstone, keeping the start-bound order.
    pub fn add_range_tombstone(&mut self, rt: RangeTombstone, cmp: &ClusteringComparator) {
        let idx = self.range_tombstones.partition_point(|x| {
            cmp.compare(&x.start, &rt.start) != std::cmp::Ordering::Greater
        });
        self.range_tombstones.insert(idx, rt);
    }

    /// Merges another deletion info into this one.
    pub fn merge(&mut self, other: &Self, cmp: &ClusteringComparator) {
        if (other.marked_for_delete_at, other.local_deletion_time)
            > (self.marked_for_delete_at, self.local_deletion_time)
        {
            self.marked_for_delete_at = other.marked_for_delete_at;
            self.local_deletion_time = other.local_deletion_time;
        }

        for rt in &other.range_tombstones {
            self.add_range_tombstone(rt.clone(), cmp);
        }
    }

    /// The highest deletion timestamp applying to the given column name.
    #[must_use]
    pub fn deletion_timestamp_for(&self, name: &[u8], cmp: &ClusteringComparator) -> Timestamp {
        let mut max = self.marked_for_delete_at;

        for rt in &self.range_tombstones {
            if rt.timestamp > max && rt.covers(name, cmp) {
                max = rt.timestamp;
            }
        }

        max
    }

    /// Returns `true` if the cell is shadowed by a row or range tombstone.
    #[must_use]
    pub fn shadows(&self, cell: &Cell, cmp: &ClusteringComparator) -> bool {
        self.deletion_timestamp_for(cell.name(), cmp) >= cell.timestamp()
    }

    /// The highest deletion timestamp recorded anywhere in this info.
    #[must_use]
    pub fn max_deletion_timestamp(&self) -> Timestamp {
        self.range_tombstones
            .iter()
            .map(|rt| rt.timestamp)
            .fold(self.marked_for_delete_at, Timestamp::max)
    }

    /// Drops tombstones older than `gc_before`.
    ///
    /// Cells shadowed by the dropped tombstones must have been removed
    /// beforehand (see `Row::remove_deleted`).
    pub fn purge(&mut self, gc_before: LocalDeletionTime) {
        if self.has_row_tombstone() && self.local_deletion_time < gc_before {
            self.marked_for_delete_at = NO_TIMESTAMP;
            self.local_deletion_time = NO_DELETION_TIME;
        }

        self.range_tombstones
            .retain(|rt| rt.local_deletion_time >= gc_before);
    }

    #[must_use]
    pub fn range_tombstone_count(&self) -> usize {
        self.range_tombstones.len()
    }

    /// Feeds the deletion info into a row digest.
    pub fn digest(&self, hasher: &mut sha2::Sha256) {
        use sha2::Digest;

        hasher.update(self.marked_for_delete_at.to_be_bytes());
        hasher.update(self.local_deletion_time.to_be_bytes());

        for rt in &self.range_tombstones {
            rt.digest(hasher);
        }
    }
}

// NOTE: Only the top-level pair is serialized; range tombstones are
// written as atoms by the row serializer.
impl Encode for DeletionInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_i64::<BigEndian>(self.marked_for_delete_at)?;
        writer.write_u32::<BigEndian>(self.local_deletion_time)?;
        Ok(())
    }
}

impl Decode for DeletionInfo {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let marked_for_delete_at = reader.read_i64::<BigEndian>()?;
        let local_deletion_time = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            marked_for_delete_at,
            local_deletion_time,
            range_tombstones: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn deletion_shadows_older_cells() {
        let cmp = ClusteringComparator::Bytes;
        let info = DeletionInfo::deleted_at(10, 100);

        assert!(info.shadows(&Cell::live("a", "v", 9), &cmp));
        assert!(info.shadows(&Cell::live("a", "v", 10), &cmp));
        assert!(!info.shadows(&Cell::live("a", "v", 11), &cmp));
    }

    #[test]
    fn range_tombstone_shadows_covered_cells() {
        let cmp = ClusteringComparator::Bytes;

        let mut info = DeletionInfo::live();
        info.add_range_tombstone(RangeTombstone::new("b", "d", 5, 100), &cmp);

        assert!(info.shadows(&Cell::live("c", "v", 4), &cmp));
        assert!(!info.shadows(&Cell::live("c", "v", 6), &cmp));
        assert!(!info.shadows(&Cell::live("z", "v", 1), &cmp));
    }

    #[test]
    fn purge_honors_gc_before() {
        let cmp = ClusteringComparator::Bytes;

        let mut info = DeletionInfo::deleted_at(10, 100);
        info.add_range_tombstone(RangeTombstone::new("b", "d", 5, 300), &cmp);

        let mut unpurged = info.clone();
        unpurged.purge(100);
        assert!(unpurged.has_row_tombstone());
        assert_eq!(1, unpurged.range_tombstone_count());

        info.purge(200);
        assert!(!info.has_row_tombstone());
        assert_eq!(1, info.range_tombstone_count());

        info.purge(301);
        assert!(info.is_live());
    }

    #[test]
    fn merge_keeps_newest_marker() {
        let cmp = ClusteringComparator::Bytes;

        let mut a = DeletionInfo::deleted_at(5, 50);
        let b = DeletionInfo::deleted_at(10, 100);

        a.merge(&b, &cmp);
        assert_eq!(10, a.marked_for_delete_at);
        assert_eq!(100, a.local_deletion_time);

        // Merging an older marker changes nothing
        a.merge(&DeletionInfo::deleted_at(3, 30), &cmp);
        assert_eq!(10, a.marked_for_delete_at);
    }

    #[test]
    fn range_tombstones_stay_sorted() {
        let cmp = ClusteringComparator::Bytes;

        let mut info = DeletionInfo::live();
        info.add_range_tombstone(RangeTombstone::new("x", "z", 1, 1), &cmp);
        info.add_range_tombstone(RangeTombstone::new("a", "c", 1, 1), &cmp);
        info.add_range_tombstone(RangeTombstone::new("m", "n", 1, 1), &cmp);

        let starts: Vec<_> = info
            .range_tombstones
            .iter()
            .map(|rt| rt.start.clone())
            .collect();

        assert_eq!(starts, vec![b"a".into(), b"m".into(), b"x".into()] as Vec<crate::Slice>);
    }
}
