// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    descriptor::{Component, Descriptor, Generation},
    format::FormatVersion,
};
use crate::{
    coding::{Decode, DecodeError, Encode},
    error::Error,
    file::MAGIC_BYTES,
    histogram::{EstimatedHistogram, StreamingHistogram},
    replay::ReplayPosition,
    LocalDeletionTime, Timestamp,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Statistics sidecar of a sorted table
///
/// Versioned and forward-compatible: each field is gated by a flag of the
/// table's format version; fields an older version did not track default to
/// a sentinel the read path handles conservatively.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsMetadata {
    /// Histogram of serialized row sizes
    pub estimated_row_size: EstimatedHistogram,

    /// Histogram of per-row column counts
    pub estimated_column_count: EstimatedHistogram,

    /// Commit-log position at flush time; `NONE` for compaction outputs
    pub replay_position: ReplayPosition,

    /// Lowest write timestamp in the table
    ///
    /// `Timestamp::MIN` when the version did not track it, so purge
    /// safety degrades conservatively.
    pub min_timestamp: Timestamp,

    /// Highest write timestamp in the table
    pub max_timestamp: Timestamp,

    /// `compressed / uncompressed`, `-1.0` when unknown
    pub compression_ratio: f64,

    /// Identifier of the partitioner the table was written with
    pub partitioner: String,

    /// Generations merged into this table by compaction
    pub ancestors: Vec<Generation>,

    /// Histogram of tombstone local deletion times
    pub estimated_tombstone_drop_time: StreamingHistogram,
}

impl StatsMetadata {
    /// Ratio of tombstones droppable at `gc_before` to estimated column count.
    #[must_use]
    pub fn droppable_tombstone_ratio(&self, gc_before: LocalDeletionTime) -> f64 {
        let columns = self.estimated_column_count.mean() * self.estimated_column_count.count();

        if columns == 0 {
            return 0.0;
        }

        #[allow(clippy::cast_precision_loss)]
        {
            self.estimated_tombstone_drop_time.sum(u64::from(gc_before)) / columns as f64
        }
    }

    fn encode_into<W: Write>(
        &self,
        writer: &mut W,
        version: FormatVersion,
    ) -> crate::Result<()> {
        self.estimated_row_size.encode_into(writer)?;
        self.estimated_column_count.encode_into(writer)?;

        if version.has_replay_position() {
            self.replay_position.encode_into(writer)?;
        }

        if version.tracks_timestamps() {
            writer.write_i64::<BigEndian>(self.min_timestamp)?;
            writer.write_i64::<BigEndian>(self.max_timestamp)?;
        }

        if version.has_compression_ratio() {
            writer.write_f64::<BigEndian>(self.compression_ratio)?;
        }

        if version.has_partitioner() {
            let bytes = self.partitioner.as_bytes();

            #[allow(clippy::cast_possible_truncation)]
            writer.write_u16::<BigEndian>(bytes.len() as u16)?;
            writer.write_all(bytes)?;
        }

        if version.has_ancestors() {
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32::<BigEndian>(self.ancestors.len() as u32)?;

            for ancestor in &self.ancestors {
                writer.write_u32::<BigEndian>(*ancestor)?;
            }
        }

        if version.has_tombstone_histogram() {
            self.estimated_tombstone_drop_time.encode_into(writer)?;
        }

        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R, version: FormatVersion) -> crate::Result<Self> {
        let estimated_row_size = EstimatedHistogram::decode_from(reader)?;
        let estimated_column_count = EstimatedHistogram::decode_from(reader)?;

        let replay_position = if version.has_replay_position() {
            ReplayPosition::decode_from(reader)?
        } else {
            ReplayPosition::NONE
        };

        let (min_timestamp, max_timestamp) = if version.tracks_timestamps() {
            (
                reader.read_i64::<BigEndian>()?,
                reader.read_i64::<BigEndian>()?,
            )
        } else {
            // Sentinels: assume the table may contain arbitrarily old data
            (Timestamp::MIN, Timestamp::MAX)
        };

        let compression_ratio = if version.has_compression_ratio() {
            reader.read_f64::<BigEndian>()?
        } else {
            -1.0
        };

        let partitioner = if version.has_partitioner() {
            let len = reader.read_u16::<BigEndian>()?;
            let mut buf = vec![0; len.into()];
            reader.read_exact(&mut buf)?;

            std::str::from_utf8(&buf)
                .map_err(DecodeError::from)?
                .to_owned()
        } else {
            String::new()
        };

        let ancestors = if version.has_ancestors() {
            let count = reader.read_u32::<BigEndian>()?;

            if count > 1 << 20 {
                return Err(DecodeError::InvalidLength("ancestors").into());
            }

            let mut ancestors = Vec::with_capacity(count as usize);
            for _ in 0..count {
                ancestors.push(reader.read_u32::<BigEndian>()?);
            }
            ancestors
        } else {
            Vec::new()
        };

        let estimated_tombstone_drop_time = if version.has_tombstone_histogram() {
            StreamingHistogram::decode_from(reader)?
        } else {
            StreamingHistogram::default()
        };

        Ok(Self {
            estimated_row_size,
            estimated_column_count,
            replay_position,
            min_timestamp,
            max_timestamp,
            compression_ratio,
            partitioner,
            ancestors,
            estimated_tombstone_drop_time,
        })
    }

    /// Writes the sidecar component file.
    pub fn write_to_file(&self, descriptor: &Descriptor) -> crate::Result<()> {
        let path = descriptor.path(Component::Statistics);

        let file = std::fs::File::create(&path)?;
        let mut writer = std::io::BufWriter::new(file);

        writer.write_all(&MAGIC_BYTES)?;
        writer.write_all(&descriptor.version.as_bytes())?;

        self.encode_into(&mut writer, descriptor.version)?;

        writer.flush()?;
        writer.get_mut().sync_all()?;

        Ok(())
    }

    /// Loads the sidecar, asserting the partitioner identity.
    pub fn load(descriptor: &Descriptor, expected_partitioner: &str) -> crate::Result<Self> {
        let path = descriptor.path(Component::Statistics);
        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::new(file);

        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Statistics").into());
        }

        let mut version = [0u8; 2];
        reader.read_exact(&mut version)?;
        let version = FormatVersion::parse(version)?;

        let stats = Self::decode_from(&mut reader, version)?;

        if version.has_partitioner() && stats.partitioner != expected_partitioner {
            return Err(Error::PartitionerMismatch {
                expected: expected_partitioner.into(),
                got: stats.partitioner,
            });
        }

        Ok(stats)
    }
}

/// Accumulates statistics while a sorted table is written
pub struct StatsCollector {
    row_size: EstimatedHistogram,
    column_count: EstimatedHistogram,
    tombstone_drop_time: StreamingHistogram,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    replay_position: ReplayPosition,
    ancestors: Vec<Generation>,
}

impl StatsCollector {
    #[must_use]
    pub fn new(replay_position: ReplayPosition, ancestors: Vec<Generation>) -> Self {
        Self {
            row_size: EstimatedHistogram::default(),
            column_count: EstimatedHistogram::default(),
            tombstone_drop_time: StreamingHistogram::default(),
            min_timestamp: Timestamp::MAX,
            max_timestamp: Timestamp::MIN,
            replay_position,
            ancestors,
        }
    }

    pub fn update_row(&mut self, row_size: u64, column_count: u64) {
        self.row_size.add(row_size);
        self.column_count.add(column_count);
    }

    pub fn update_timestamps(&mut self, min: Timestamp, max: Timestamp) {
        self.min_timestamp = self.min_timestamp.min(min);
        self.max_timestamp = self.max_timestamp.max(max);
    }

    pub fn update_tombstone(&mut self, local_deletion_time: LocalDeletionTime) {
        self.tombstone_drop_time.update(u64::from(local_deletion_time));
    }

    /// Folds a per-row tombstone histogram in (used by streamed rows).
    pub fn merge_tombstones(&mut self, other: &StreamingHistogram) {
        self.tombstone_drop_time.merge(other);
    }

    #[must_use]
    pub fn finish(self, partitioner: &str, compression_ratio: f64) -> StatsMetadata {
        StatsMetadata {
            estimated_row_size: self.row_size,
            estimated_column_count: self.column_count,
            estimated_tombstone_drop_time: self.tombstone_drop_time,

            // An empty table never observed a timestamp
            min_timestamp: if self.min_timestamp == Timestamp::MAX {
                0
            } else {
                self.min_timestamp
            },
            max_timestamp: if self.max_timestamp == Timestamp::MIN {
                0
            } else {
                self.max_timestamp
            },

            replay_position: self.replay_position,
            compression_ratio,
            partitioner: partitioner.into(),
            ancestors: self.ancestors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample_stats() -> StatsMetadata {
        let mut collector = StatsCollector::new(ReplayPosition::new(3, 77), vec![1, 2]);
        collector.update_row(1_000, 10);
        collector.update_row(2_000, 20);
        collector.update_timestamps(5, 900);
        collector.update_tombstone(1_000);
        collector.update_tombstone(2_000);
        collector.finish("order-preserving", -1.0)
    }

    #[test]
    fn stats_round_trip_current_version() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let descriptor = Descriptor::new("ks", "cf", 1, FormatVersion::CURRENT, dir.path());

        let stats = sample_stats();
        stats.write_to_file(&descriptor)?;

        let loaded = StatsMetadata::load(&descriptor, "order-preserving")?;
        assert_eq!(stats, loaded);

        Ok(())
    }

    #[test]
    fn stats_old_version_uses_sentinels() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let descriptor = Descriptor::new("ks", "cf", 1, FormatVersion::WA, dir.path());

        let stats = sample_stats();
        stats.write_to_file(&descriptor)?;

        // No partitioner is recorded in "wa", so any expected value passes
        let loaded = StatsMetadata::load(&descriptor, "whatever")?;

        assert_eq!(Timestamp::MIN, loaded.min_timestamp);
        assert_eq!(Timestamp::MAX, loaded.max_timestamp);
        assert!((loaded.compression_ratio - -1.0).abs() < f64::EPSILON);
        assert!(loaded.ancestors.is_empty());
        assert_eq!(stats.replay_position, loaded.replay_position);

        Ok(())
    }

    #[test]
    fn stats_partitioner_mismatch_refused() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let descriptor = Descriptor::new("ks", "cf", 1, FormatVersion::CURRENT, dir.path());

        sample_stats().write_to_file(&descriptor)?;

        let result = StatsMetadata::load(&descriptor, "xxh3");
        assert!(matches!(result, Err(Error::PartitionerMismatch { .. })));

        Ok(())
    }

    #[test]
    fn droppable_tombstone_ratio() {
        let stats = sample_stats();

        // Both tombstones dropped before 3000
        let ratio = stats.droppable_tombstone_ratio(3_000);
        assert!(ratio > 0.0);

        // Nothing droppable before the first tombstone
        assert!(stats.droppable_tombstone_ratio(0).abs() < f64::EPSILON);

        // Zero columns => ratio 0
        let empty = StatsCollector::new(ReplayPosition::NONE, vec![]).finish("x", -1.0);
        assert!(empty.droppable_tombstone_ratio(u32::MAX).abs() < f64::EPSILON);
    }
}
