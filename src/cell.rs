// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    counter::CounterContext,
    range_tombstone::RangeTombstone,
    LocalDeletionTime, Slice, Timestamp, NO_DELETION_TIME,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha2::Digest;
use std::cmp::Ordering;
use std::io::{Read, Write};

/// A single column of a row
///
/// All cells within a row are ordered by the clustering comparator on their
/// name. Overlapping versions of the same cell are reconciled during reads,
/// memtable inserts and compaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Cell {
    /// A regular live column
    Live {
        name: Slice,
        value: Slice,
        timestamp: Timestamp,
    },

    /// A live column with a time-to-live
    ///
    /// `local_deletion_time` is the wall-clock second at which the cell
    /// expires and starts counting towards tombstone purge.
    Expiring {
        name: Slice,
        value: Slice,
        timestamp: Timestamp,
        ttl: u32,
        local_deletion_time: LocalDeletionTime,
    },

    /// A cell tombstone
    Deleted {
        name: Slice,
        timestamp: Timestamp,
        local_deletion_time: LocalDeletionTime,
    },
}

impl Cell {
    /// Creates a live cell.
    pub fn live<N: Into<Slice>, V: Into<Slice>>(name: N, value: V, timestamp: Timestamp) -> Self {
        Self::Live {
            name: name.into(),
            value: value.into(),
            timestamp,
        }
    }

    /// Creates an expiring cell.
    pub fn expiring<N: Into<Slice>, V: Into<Slice>>(
        name: N,
        value: V,
        timestamp: Timestamp,
        ttl: u32,
        local_deletion_time: LocalDeletionTime,
    ) -> Self {
        Self::Expiring {
            name: name.into(),
            value: value.into(),
            timestamp,
            ttl,
            local_deletion_time,
        }
    }

    /// Creates a cell tombstone.
    pub fn deleted<N: Into<Slice>>(
        name: N,
        timestamp: Timestamp,
        local_deletion_time: LocalDeletionTime,
    ) -> Self {
        Self::Deleted {
            name: name.into(),
            timestamp,
            local_deletion_time,
        }
    }

    #[must_use]
    pub fn name(&self) -> &Slice {
        match self {
            Self::Live { name, .. } | Self::Expiring { name, .. } | Self::Deleted { name, .. } => {
                name
            }
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Live { timestamp, .. }
            | Self::Expiring { timestamp, .. }
            | Self::Deleted { timestamp, .. } => *timestamp,
        }
    }

    /// The second at which this cell was deleted or expires.
    ///
    /// [`NO_DELETION_TIME`] for live cells.
    #[must_use]
    pub fn local_deletion_time(&self) -> LocalDeletionTime {
        match self {
            Self::Live { .. } => NO_DELETION_TIME,
            Self::Expiring {
                local_deletion_time,
                ..
            }
            | Self::Deleted {
                local_deletion_time,
                ..
            } => *local_deletion_time,
        }
    }

    #[must_use]
    pub fn value(&self) -> Option<&Slice> {
        match self {
            Self::Live { value, .. } | Self::Expiring { value, .. } => Some(value),
            Self::Deleted { .. } => None,
        }
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Deleted { .. })
    }

    /// Returns `true` if the cell is visible at wall-clock second `now`.
    #[must_use]
    pub fn is_live_at(&self, now: u32) -> bool {
        match self {
            Self::Live { .. } => true,
            Self::Expiring {
                local_deletion_time,
                ..
            } => *local_deletion_time > now,
            Self::Deleted { .. } => false,
        }
    }

    /// Serialized size of the cell payload, excluding the atom tag.
    #[must_use]
    pub fn serialized_size(&self) -> u64 {
        let base = match self {
            Self::Live { name, value, .. } => 2 + name.len() as u64 + 4 + value.len() as u64 + 8,
            Self::Expiring { name, value, .. } => {
                2 + name.len() as u64 + 4 + value.len() as u64 + 8 + 4 + 4
            }
            Self::Deleted { name, .. } => 2 + name.len() as u64 + 8 + 4,
        };
        base
    }

    /// Reconciles two versions of the same cell.
    ///
    /// Winner by timestamp; ties between live cells are broken by value bytes
    /// (then by local deletion time), ties against a tombstone go to the
    /// tombstone. For counter cells the shards of both values are merged
    /// instead of either value winning.
    #[must_use]
    pub fn reconcile(self, other: Self, counter: bool) -> Self {
        debug_assert_eq!(self.name(), other.name(), "reconcile requires equal names");

        let self_dead = self.is_tombstone();
        let other_dead = other.is_tombstone();

        if counter && !self_dead && !other_dead {
            return Self::Live {
                name: self.name().clone(),
                timestamp: self.timestamp().max(other.timestamp()),
                value: CounterContext::merge(
                    self.value().map(|v| &**v).unwrap_or_default(),
                    other.value().map(|v| &**v).unwrap_or_default(),
                ),
            };
        }

        match self.timestamp().cmp(&other.timestamp()) {
            Ordering::Greater => self,
            Ordering::Less => other,
            Ordering::Equal => match (self_dead, other_dead) {
                (true, false) => self,
                (false, true) => other,
                _ => {
                    // Deterministic tie-break so that replicas agree
                    let value_ord = self
                        .value()
                        .map(|v| &**v)
                        .unwrap_or_default()
                        .cmp(other.value().map(|v| &**v).unwrap_or_default());

                    match value_ord {
                        Ordering::Greater => self,
                        Ordering::Less => other,
                        Ordering::Equal => {
                            if self.local_deletion_time() >= other.local_deletion_time() {
                                self
                            } else {
                                other
                            }
                        }
                    }
                }
            },
        }
    }

    /// Feeds the cell into a row digest.
    pub fn digest(&self, hasher: &mut sha2::Sha256) {
        hasher.update([self.tag()]);
        hasher.update(self.name());
        hasher.update(self.timestamp().to_be_bytes());

        if let Some(value) = self.value() {
            hasher.update(value);
        }

        if let Self::Expiring { ttl, .. } = self {
            hasher.update(ttl.to_be_bytes());
        }

        if self.local_deletion_time() != NO_DELETION_TIME {
            hasher.update(self.local_deletion_time().to_be_bytes());
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Live { .. } => 0,
            Self::Expiring { .. } => 1,
            Self::Deleted { .. } => 2,
        }
    }
}

/// One element of a row's on-disk atom stream
///
/// Rows are serialized as a stream of atoms in clustering order; range
/// tombstones are interleaved with cells, positioned by their start bound.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Atom {
    Cell(Cell),
    RangeTombstone(RangeTombstone),
}

impl Atom {
    /// The clustering position of the atom (cell name or tombstone start).
    #[must_use]
    pub fn position(&self) -> &Slice {
        match self {
            Self::Cell(cell) => cell.name(),
            Self::RangeTombstone(rt) => &rt.start,
        }
    }

    /// Range tombstones sort before cells at the same position.
    #[must_use]
    pub fn kind_rank(&self) -> u8 {
        match self {
            Self::RangeTombstone(_) => 0,
            Self::Cell(_) => 1,
        }
    }

    /// Serialized size including the atom tag.
    #[must_use]
    pub fn serialized_size(&self) -> u64 {
        1 + match self {
            Self::Cell(cell) => cell.serialized_size(),
            Self::RangeTombstone(rt) => rt.serialized_size(),
        }
    }
}

const TAG_LIVE: u8 = 0;
const TAG_EXPIRING: u8 = 1;
const TAG_DELETED: u8 = 2;
const TAG_RANGE_TOMBSTONE: u8 = 3;

impl Encode for Atom {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::Cell(Cell::Live {
                name,
                value,
                timestamp,
            }) => {
                writer.write_u8(TAG_LIVE)?;
                name.write_prefixed16(writer)?;
                value.write_prefixed32(writer)?;
                writer.write_i64::<BigEndian>(*timestamp)?;
            }
            Self::Cell(Cell::Expiring {
                name,
                value,
                timestamp,
                ttl,
                local_deletion_time,
            }) => {
                writer.write_u8(TAG_EXPIRING)?;
                name.write_prefixed16(writer)?;
                value.write_prefixed32(writer)?;
                writer.write_i64::<BigEndian>(*timestamp)?;
                writer.write_u32::<BigEndian>(*ttl)?;
                writer.write_u32::<BigEndian>(*local_deletion_time)?;
            }
            Self::Cell(Cell::Deleted {
                name,
                timestamp,
                local_deletion_time,
            }) => {
                writer.write_u8(TAG_DELETED)?;
                name.write_prefixed16(writer)?;
                writer.write_i64::<BigEndian>(*timestamp)?;
                writer.write_u32::<BigEndian>(*local_deletion_time)?;
            }
            Self::RangeTombstone(rt) => {
                writer.write_u8(TAG_RANGE_TOMBSTONE)?;
                rt.encode_into(writer)?;
            }
        }

        Ok(())
    }
}

impl Decode for Atom {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        Ok(match tag {
            TAG_LIVE => {
                let name = Slice::read_prefixed16(reader)?;
                let value = Slice::read_prefixed32(reader)?;
                let timestamp = reader.read_i64::<BigEndian>()?;

                Self::Cell(Cell::Live {
                    name,
                    value,
                    timestamp,
                })
            }
            TAG_EXPIRING => {
                let name = Slice::read_prefixed16(reader)?;
                let value = Slice::read_prefixed32(reader)?;
                let timestamp = reader.read_i64::<BigEndian>()?;
                let ttl = reader.read_u32::<BigEndian>()?;
                let local_deletion_time = reader.read_u32::<BigEndian>()?;

                Self::Cell(Cell::Expiring {
                    name,
                    value,
                    timestamp,
                    ttl,
                    local_deletion_time,
                })
            }
            TAG_DELETED => {
                let name = Slice::read_prefixed16(reader)?;
                let timestamp = reader.read_i64::<BigEndian>()?;
                let local_deletion_time = reader.read_u32::<BigEndian>()?;

                Self::Cell(Cell::Deleted {
                    name,
                    timestamp,
                    local_deletion_time,
                })
            }
            TAG_RANGE_TOMBSTONE => Self::RangeTombstone(RangeTombstone::decode_from(reader)?),
            _ => return Err(DecodeError::InvalidTag(("Atom", tag))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn atom_serde_round_trip() -> crate::Result<()> {
        let atoms = [
            Atom::Cell(Cell::live("name", "value", 17)),
            Atom::Cell(Cell::expiring("name", "value", 17, 3_600, 1_234)),
            Atom::Cell(Cell::deleted("name", 17, 1_234)),
            Atom::RangeTombstone(RangeTombstone::new("a", "z", 17, 1_234)),
        ];

        for atom in atoms {
            let bytes = atom.encode_into_vec();
            assert_eq!(bytes.len() as u64, atom.serialized_size());

            let decoded = Atom::decode_from(&mut Cursor::new(bytes))?;
            assert_eq!(atom, decoded);
        }

        Ok(())
    }

    #[test]
    fn cell_reconcile_by_timestamp() {
        let old = Cell::live("a", "old", 1);
        let new = Cell::live("a", "new", 2);

        assert_eq!(new.clone(), old.clone().reconcile(new.clone(), false));
        assert_eq!(new.clone(), new.reconcile(old, false));
    }

    #[test]
    fn cell_reconcile_value_tie_break() {
        let a = Cell::live("a", "xx", 5);
        let b = Cell::live("a", "yy", 5);

        // Greater value bytes win on a timestamp tie
        assert_eq!(b.clone(), a.clone().reconcile(b.clone(), false));
        assert_eq!(b.clone(), b.reconcile(a, false));
    }

    #[test]
    fn cell_reconcile_tombstone_wins_tie() {
        let live = Cell::live("a", "v", 5);
        let dead = Cell::deleted("a", 5, 100);

        assert_eq!(dead.clone(), live.clone().reconcile(dead.clone(), false));
        assert_eq!(dead.clone(), dead.clone().reconcile(live.clone(), false));

        // ... but loses when the live write is newer
        let newer = Cell::live("a", "v", 6);
        assert_eq!(newer.clone(), newer.clone().reconcile(dead, false));
    }

    #[test]
    fn expired_cell_not_live() {
        let cell = Cell::expiring("a", "v", 1, 60, 1_000);
        assert!(cell.is_live_at(999));
        assert!(!cell.is_live_at(1_000));
        assert!(!cell.is_live_at(2_000));
    }
}
