// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// A monotone commit-log coordinate
///
/// Persisted in every flushed table's statistics sidecar; on crash replay,
/// mutations at or below a flushed position are skipped.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ReplayPosition {
    /// Commit-log segment id, `-1` for the none-position
    pub segment: i64,

    /// Byte offset within the segment
    pub position: u32,
}

impl ReplayPosition {
    /// Position of tables not created by a flush (compaction outputs,
    /// streamed tables); sorts before every real position.
    pub const NONE: Self = Self {
        segment: -1,
        position: 0,
    };

    #[must_use]
    pub fn new(segment: i64, position: u32) -> Self {
        Self { segment, position }
    }
}

impl PartialOrd for ReplayPosition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReplayPosition {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.segment, self.position).cmp(&(other.segment, other.position))
    }
}

impl Encode for ReplayPosition {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_i64::<BigEndian>(self.segment)?;
        writer.write_u32::<BigEndian>(self.position)?;
        Ok(())
    }
}

impl Decode for ReplayPosition {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let segment = reader.read_i64::<BigEndian>()?;
        let position = reader.read_u32::<BigEndian>()?;
        Ok(Self { segment, position })
    }
}

/// Interface to the external commit log
///
/// The engine never writes to the commit log itself; it records the current
/// position with each flushed table and reports flush completion in
/// position order, so the log can discard fully persisted segments.
pub trait CommitLog: Send + Sync + 'static {
    /// The position up to which all mutations have been appended.
    fn current_position(&self) -> ReplayPosition;

    /// Called, in monotone position order, once everything below
    /// `position` has been persisted to a sorted table.
    fn on_memtable_flush(&self, position: ReplayPosition);
}

/// Commit log stub for embeddings without one
#[derive(Default)]
pub struct NoopCommitLog;

impl CommitLog for NoopCommitLog {
    fn current_position(&self) -> ReplayPosition {
        ReplayPosition::NONE
    }

    fn on_memtable_flush(&self, _position: ReplayPosition) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn replay_position_order() {
        assert!(ReplayPosition::NONE < ReplayPosition::new(0, 0));
        assert!(ReplayPosition::new(1, 500) < ReplayPosition::new(2, 0));
        assert!(ReplayPosition::new(2, 1) < ReplayPosition::new(2, 2));
    }

    #[test]
    fn replay_position_serde_round_trip() -> crate::Result<()> {
        let pos = ReplayPosition::new(42, 1_234);

        let bytes = pos.encode_into_vec();
        let decoded = ReplayPosition::decode_from(&mut &bytes[..])?;

        assert_eq!(pos, decoded);
        Ok(())
    }
}
