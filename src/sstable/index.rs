// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::MAGIC_BYTES,
    key::DecoratedKey,
    partitioner::Partitioner,
    sstable::format::FormatVersion,
    Slice,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// One block of a promoted row index
///
/// Covers the contiguous atom range `[first_name, last_name]` at
/// `offset` (relative to the row's atom region) spanning `width` bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexInfo {
    pub first_name: Slice,
    pub last_name: Slice,
    pub offset: u64,
    pub width: u64,
}

impl Encode for IndexInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.first_name.write_prefixed16(writer)?;
        self.last_name.write_prefixed16(writer)?;

        writer.write_u64::<BigEndian>(self.offset)?;
        writer.write_u64::<BigEndian>(self.width)?;

        Ok(())
    }
}

impl Decode for IndexInfo {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let first_name = Slice::read_prefixed16(reader)?;
        let last_name = Slice::read_prefixed16(reader)?;

        let offset = reader.read_u64::<BigEndian>()?;
        let width = reader.read_u64::<BigEndian>()?;

        Ok(Self {
            first_name,
            last_name,
            offset,
            width,
        })
    }
}

impl IndexInfo {
    /// Serialized size of this entry.
    #[must_use]
    pub fn serialized_size(&self) -> u64 {
        2 + self.first_name.len() as u64 + 2 + self.last_name.len() as u64 + 8 + 8
    }

    /// Serialized size of a promoted index block list.
    #[must_use]
    pub fn list_size(list: &[Self]) -> u64 {
        4 + list.iter().map(Self::serialized_size).sum::<u64>()
    }

    /// Writes a promoted index block list.
    pub fn encode_list<W: Write>(list: &[Self], writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(list.len() as u32)?;

        for info in list {
            info.encode_into(writer)?;
        }

        Ok(())
    }

    /// Reads a promoted index block list.
    pub fn decode_list<R: Read>(reader: &mut R) -> Result<Vec<Self>, DecodeError> {
        let count = reader.read_u32::<BigEndian>()?;

        if count > 1 << 24 {
            return Err(DecodeError::InvalidLength("IndexInfo list"));
        }

        let mut list = Vec::with_capacity(count as usize);
        for _ in 0..count {
            list.push(Self::decode_from(reader)?);
        }

        Ok(list)
    }
}

/// An entry of the `Index` component
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    /// Offset of the row in the `Data` component
    pub position: u64,

    /// Offset of the row's promoted index in the `Data` component,
    /// `0` if the row is not promoted
    pub promoted_offset: u64,
}

impl IndexEntry {
    #[must_use]
    pub fn is_promoted(&self) -> bool {
        self.promoted_offset != 0
    }
}

impl Encode for IndexEntry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<BigEndian>(self.position)?;
        writer.write_u64::<BigEndian>(self.promoted_offset)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let position = reader.read_u64::<BigEndian>()?;
        let promoted_offset = reader.read_u64::<BigEndian>()?;

        Ok(Self {
            position,
            promoted_offset,
        })
    }
}

/// Streaming writer of the `Index` component
pub struct IndexWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
}

impl IndexWriter {
    pub fn new(path: PathBuf, version: FormatVersion) -> crate::Result<Self> {
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&MAGIC_BYTES)?;
        writer.write_all(&version.as_bytes())?;

        Ok(Self {
            path,
            writer,
            offset: (MAGIC_BYTES.len() + 2) as u64,
        })
    }

    /// Appends an entry; returns the offset the entry starts at, for
    /// summary sampling.
    pub fn append(&mut self, key: &Slice, entry: IndexEntry) -> crate::Result<u64> {
        let entry_offset = self.offset;

        key.write_prefixed16(&mut self.writer)?;
        entry.encode_into(&mut self.writer)?;

        self.offset += 2 + key.len() as u64 + 16;

        Ok(entry_offset)
    }

    pub fn finish(&mut self) -> crate::Result<()> {
        self.writer.flush()?;
        self.writer.get_mut().sync_all()?;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Scans the `Index` component from `start_offset` for the target key.
///
/// Entries are in partition order, so the scan stops at the first key
/// greater than the target.
pub(crate) fn scan_index(
    path: &Path,
    start_offset: u64,
    target: &DecoratedKey,
    partitioner: &dyn Partitioner,
) -> crate::Result<Option<IndexEntry>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(start_offset))?;

    loop {
        let key_len = match reader.read_u16::<BigEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let key = Slice::from_reader(&mut reader, key_len.into())
            .map_err(crate::coding::DecodeError::from)?;

        let entry = IndexEntry::decode_from(&mut reader)?;

        let decorated = partitioner.decorate(key);

        match decorated.cmp(target) {
            std::cmp::Ordering::Less => {}
            std::cmp::Ordering::Equal => return Ok(Some(entry)),
            std::cmp::Ordering::Greater => return Ok(None),
        }
    }
}

/// Builds the promoted row index while a row's atoms are written
///
/// Atoms are grouped into blocks of roughly `block_size` bytes; a row
/// that spans more than one block gets its index promoted.
pub struct ColumnIndexBuilder {
    block_size: u64,
    blocks: Vec<IndexInfo>,

    current_first: Option<Slice>,
    current_last: Option<Slice>,
    current_offset: u64,
    current_width: u64,

    cursor: u64,
}

impl ColumnIndexBuilder {
    #[must_use]
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size: block_size.max(1),
            blocks: Vec::new(),
            current_first: None,
            current_last: None,
            current_offset: 0,
            current_width: 0,
            cursor: 0,
        }
    }

    /// Registers one atom at clustering position `name` with `size`
    /// serialized bytes.
    ///
    /// Positions must arrive in clustering order, so block bounds are
    /// monotone and can be binary-searched.
    pub fn add(&mut self, name: &Slice, size: u64) {
        if self.current_first.is_none() {
            self.current_first = Some(name.clone());
            self.current_offset = self.cursor;
        }

        self.current_last = Some(name.clone());
        self.current_width += size;
        self.cursor += size;

        if self.current_width >= self.block_size {
            self.close_block();
        }
    }

    fn close_block(&mut self) {
        let (Some(first), Some(last)) = (self.current_first.take(), self.current_last.take())
        else {
            return;
        };

        self.blocks.push(IndexInfo {
            first_name: first,
            last_name: last,
            offset: self.current_offset,
            width: self.current_width,
        });

        self.current_width = 0;
    }

    /// Closes the trailing block and returns all blocks.
    #[must_use]
    pub fn finish(mut self) -> Vec<IndexInfo> {
        self.close_block();
        self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn index_info_list_round_trip() -> crate::Result<()> {
        let list = vec![
            IndexInfo {
                first_name: "a".into(),
                last_name: "f".into(),
                offset: 0,
                width: 100,
            },
            IndexInfo {
                first_name: "g".into(),
                last_name: "z".into(),
                offset: 100,
                width: 60,
            },
        ];

        let mut bytes = vec![];
        IndexInfo::encode_list(&list, &mut bytes)?;
        assert_eq!(bytes.len() as u64, IndexInfo::list_size(&list));

        let decoded = IndexInfo::decode_list(&mut &bytes[..])?;
        assert_eq!(list, decoded);

        Ok(())
    }

    #[test]
    fn column_index_builder_blocks() {
        let mut builder = ColumnIndexBuilder::new(100);

        for (name, size) in [("a", 60u64), ("b", 60), ("c", 10), ("d", 40)] {
            let name = Slice::from(name);
            builder.add(&name, size);
        }

        let blocks = builder.finish();
        assert_eq!(2, blocks.len());

        let first = blocks.first().cloned();
        assert_eq!(
            Some((Slice::from("a"), Slice::from("b"), 0, 120)),
            first.map(|b| (b.first_name, b.last_name, b.offset, b.width)),
        );

        let second = blocks.get(1).cloned();
        assert_eq!(
            Some((Slice::from("c"), Slice::from("d"), 120, 50)),
            second.map(|b| (b.first_name, b.last_name, b.offset, b.width)),
        );
    }

    #[test]
    fn column_index_builder_single_block() {
        let mut builder = ColumnIndexBuilder::new(1_000);
        let name = Slice::from("a");
        builder.add(&name, 10);

        // A single block means the row is not promoted
        assert_eq!(1, builder.finish().len());
    }
}
