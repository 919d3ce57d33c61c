// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    clustering::ClusteringComparator,
    coding::{Decode, DecodeError, Encode, EncodeError},
    LocalDeletionTime, Slice, Timestamp,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Deletion of a contiguous range of columns `[start, end]` within one row
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeTombstone {
    pub start: Slice,
    pub end: Slice,
    pub timestamp: Timestamp,
    pub local_deletion_time: LocalDeletionTime,
}

impl RangeTombstone {
    pub fn new<S: Into<Slice>, E: Into<Slice>>(
        start: S,
        end: E,
        timestamp: Timestamp,
        local_deletion_time: LocalDeletionTime,
    ) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            timestamp,
            local_deletion_time,
        }
    }

    /// Returns `true` if the given column name falls within the tombstone's bounds.
    #[must_use]
    pub fn covers(&self, name: &[u8], cmp: &ClusteringComparator) -> bool {
        cmp.in_range(name, &self.start, &self.end)
    }

    /// Serialized size, excluding the atom tag.
    #[must_use]
    pub fn serialized_size(&self) -> u64 {
        2 + self.start.len() as u64 + 2 + self.end.len() as u64 + 8 + 4
    }

    /// Feeds the tombstone into a row digest.
    pub fn digest(&self, hasher: &mut sha2::Sha256) {
        use sha2::Digest;

        hasher.update(&self.start);
        hasher.update(&self.end);
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.local_deletion_time.to_be_bytes());
    }
}

impl Encode for RangeTombstone {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.start.write_prefixed16(writer)?;
        self.end.write_prefixed16(writer)?;

        writer.write_i64::<BigEndian>(self.timestamp)?;
        writer.write_u32::<BigEndian>(self.local_deletion_time)?;

        Ok(())
    }
}

impl Decode for RangeTombstone {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let start = Slice::read_prefixed16(reader)?;
        let end = Slice::read_prefixed16(reader)?;

        let timestamp = reader.read_i64::<BigEndian>()?;
        let local_deletion_time = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            start,
            end,
            timestamp,
            local_deletion_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn range_tombstone_covers() {
        let rt = RangeTombstone::new("b", "d", 1, 100);
        let cmp = ClusteringComparator::Bytes;

        assert!(!rt.covers(b"a", &cmp));
        assert!(rt.covers(b"b", &cmp));
        assert!(rt.covers(b"c", &cmp));
        assert!(rt.covers(b"d", &cmp));
        assert!(!rt.covers(b"e", &cmp));
    }

    #[test]
    fn range_tombstone_serde_round_trip() -> crate::Result<()> {
        let rt = RangeTombstone::new("abc", "def", -5, 42);

        let bytes = rt.encode_into_vec();
        assert_eq!(bytes.len() as u64, rt.serialized_size());

        let decoded = RangeTombstone::decode_from(&mut &bytes[..])?;
        assert_eq!(rt, decoded);

        Ok(())
    }
}
