// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::DecodeError,
    file::MAGIC_BYTES,
    key::DecoratedKey,
    partitioner::Partitioner,
    sstable::format::FormatVersion,
    Slice,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{Read, Write},
    path::Path,
};

/// Sparse in-memory sample of the `Index` component
///
/// Every `sample_interval`-th index entry is recorded with its offset, so
/// a point lookup scans at most one interval's worth of index entries.
/// Also records the table's first and last key, which bound its token range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Summary {
    pub sample_interval: u32,

    pub first_key: Slice,
    pub last_key: Slice,

    /// `(raw key, index file offset)`, in partition order
    entries: Vec<(Slice, u64)>,
}

impl Summary {
    /// Finds the index offset to start scanning from for the target key.
    ///
    /// Returns `None` if the target sorts before the first sampled key,
    /// i.e. before every key in the table.
    #[must_use]
    pub fn search(&self, target: &DecoratedKey, partitioner: &dyn Partitioner) -> Option<u64> {
        let idx = self.entries.partition_point(|(key, _)| {
            partitioner.decorate(key.clone()) <= *target
        });

        if idx == 0 {
            return None;
        }

        self.entries.get(idx - 1).map(|(_, offset)| *offset)
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Writes the `Summary` component file.
    pub fn write_to_file(&self, path: &Path, version: FormatVersion) -> crate::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);

        writer.write_all(&MAGIC_BYTES)?;
        writer.write_all(&version.as_bytes())?;

        writer.write_u32::<BigEndian>(self.sample_interval)?;

        self.first_key.write_prefixed16(&mut writer)?;
        self.last_key.write_prefixed16(&mut writer)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.entries.len() as u32)?;

        for (key, offset) in &self.entries {
            key.write_prefixed16(&mut writer)?;
            writer.write_u64::<BigEndian>(*offset)?;
        }

        writer.flush()?;
        writer.get_mut().sync_all()?;

        Ok(())
    }

    /// Loads the `Summary` component file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);

        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Summary").into());
        }

        let mut version = [0u8; 2];
        reader.read_exact(&mut version)?;
        FormatVersion::parse(version)?;

        let sample_interval = reader.read_u32::<BigEndian>()?;

        let first_key = Slice::read_prefixed16(&mut reader)?;
        let last_key = Slice::read_prefixed16(&mut reader)?;

        let count = reader.read_u32::<BigEndian>()?;

        if count > 1 << 28 {
            return Err(DecodeError::InvalidLength("Summary").into());
        }

        let mut entries = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let key = Slice::read_prefixed16(&mut reader)?;
            let offset = reader.read_u64::<BigEndian>()?;
            entries.push((key, offset));
        }

        Ok(Self {
            sample_interval,
            first_key,
            last_key,
            entries,
        })
    }
}

/// Collects summary samples while the index is written
pub struct SummaryBuilder {
    sample_interval: u32,
    entries: Vec<(Slice, u64)>,
    seen: u64,
}

impl SummaryBuilder {
    #[must_use]
    pub fn new(sample_interval: u32) -> Self {
        Self {
            sample_interval: sample_interval.max(1),
            entries: Vec::new(),
            seen: 0,
        }
    }

    /// Registers an index entry; the first of every interval is sampled.
    pub fn register(&mut self, key: &Slice, index_offset: u64) {
        if self.seen % u64::from(self.sample_interval) == 0 {
            self.entries.push((key.clone(), index_offset));
        }

        self.seen += 1;
    }

    #[must_use]
    pub fn finish(self, first_key: Slice, last_key: Slice) -> Summary {
        Summary {
            sample_interval: self.sample_interval,
            first_key,
            last_key,
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioner::OrderPreservingPartitioner;
    use test_log::test;

    fn sample_summary() -> Summary {
        let mut builder = SummaryBuilder::new(2);

        builder.register(&Slice::from("a"), 100);
        builder.register(&Slice::from("c"), 200);
        builder.register(&Slice::from("e"), 300);
        builder.register(&Slice::from("g"), 400);

        builder.finish("a".into(), "g".into())
    }

    #[test]
    fn summary_search() {
        let partitioner = OrderPreservingPartitioner;
        let summary = sample_summary();

        // Sampled: a => 100, e => 300
        assert_eq!(2, summary.entry_count());

        let search = |key: &str| {
            summary.search(&partitioner.decorate(key.into()), &partitioner)
        };

        assert_eq!(None, search("0"));
        assert_eq!(Some(100), search("a"));
        assert_eq!(Some(100), search("d"));
        assert_eq!(Some(300), search("e"));
        assert_eq!(Some(300), search("zzz"));
    }

    #[test]
    fn summary_file_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("summary");

        let summary = sample_summary();
        summary.write_to_file(&path, FormatVersion::CURRENT)?;

        let loaded = Summary::load(&path)?;
        assert_eq!(summary, loaded);

        Ok(())
    }
}
