// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::index::{IndexEntry, IndexInfo};
use crate::{
    cell::Atom,
    clustering::ClusteringComparator,
    coding::{Decode, DecodeError},
    deletion::{DeletionInfo, TOP_LEVEL_SIZE},
    file::MAGIC_BYTES,
    key::DecoratedKey,
    partitioner::Partitioner,
    row::Row,
    sstable::format::FormatVersion,
    Slice,
};
use byteorder::{BigEndian, ReadBytesExt};
use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

/// Decoded fixed-size prefix of a row
struct RowHeader {
    key: DecoratedKey,
    row_start: u64,
    row_size: u64,
    deletion: DeletionInfo,
    atom_count: u32,
}

const HEADER_TAIL: u64 = TOP_LEVEL_SIZE + 4;

/// Reads a row header; `None` on clean end-of-file.
fn read_header(
    reader: &mut BufReader<File>,
    pos: u64,
    partitioner: &dyn Partitioner,
) -> crate::Result<Option<RowHeader>> {
    let key_len = match reader.read_u16::<BigEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let key = Slice::from_reader(reader, key_len.into()).map_err(DecodeError::from)?;
    let row_size = reader.read_u64::<BigEndian>()?;

    if row_size < HEADER_TAIL {
        return Err(DecodeError::InvalidLength("row size").into());
    }

    let deletion = DeletionInfo::decode_from(reader)?;
    let atom_count = reader.read_u32::<BigEndian>()?;

    Ok(Some(RowHeader {
        key: partitioner.decorate(key),
        row_start: pos,
        row_size,
        deletion,
        atom_count,
    }))
}

fn open_data(path: &Path) -> crate::Result<(BufReader<File>, u64)> {
    let file = File::open(path)?;
    let file_size = file.metadata()?.len();

    let mut reader = BufReader::with_capacity(u16::MAX.into(), file);

    let mut magic = [0u8; MAGIC_BYTES.len()];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC_BYTES {
        return Err(DecodeError::InvalidHeader("Data").into());
    }

    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    FormatVersion::parse(version)?;

    Ok((reader, file_size))
}

/// Streaming iterator over all rows of a `Data` component, fully
/// materializing each row
///
/// Tracks exactly how many bytes it has consumed, so whole-set scans can
/// assert `position == file size` (the validation scanner contract).
pub struct DataIter {
    reader: BufReader<File>,
    partitioner: Arc<dyn Partitioner>,
    cmp: ClusteringComparator,
    pos: u64,
    file_size: u64,
    failed: bool,
}

impl DataIter {
    pub fn new(
        path: &Path,
        partitioner: Arc<dyn Partitioner>,
        cmp: ClusteringComparator,
    ) -> crate::Result<Self> {
        let (reader, file_size) = open_data(path)?;

        Ok(Self {
            reader,
            partitioner,
            cmp,
            pos: (MAGIC_BYTES.len() + 2) as u64,
            file_size,
            failed: false,
        })
    }

    /// Bytes consumed so far, including the file header.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

impl Iterator for DataIter {
    type Item = crate::Result<(DecoratedKey, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let header = match read_header(&mut self.reader, self.pos, &*self.partitioner) {
            Ok(None) => return None,
            Ok(Some(header)) => header,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        let mut row = Row {
            deletion: header.deletion,
            cells: Vec::new(),
        };

        let mut atom_bytes = 0u64;

        for _ in 0..header.atom_count {
            let atom = fail_iter!(Atom::decode_from(&mut self.reader).map_err(|e| {
                self.failed = true;
                crate::Error::from(e)
            }));

            atom_bytes += atom.serialized_size();

            match atom {
                Atom::Cell(cell) => row.cells.push(cell),
                Atom::RangeTombstone(rt) => row.deletion.add_range_tombstone(rt, &self.cmp),
            }
        }

        // Skip the promoted index, if any
        let consumed = HEADER_TAIL + atom_bytes;
        if consumed > header.row_size {
            self.failed = true;
            return Some(Err(DecodeError::InvalidLength("row overrun").into()));
        }

        #[allow(clippy::cast_possible_wrap)]
        if consumed < header.row_size {
            fail_iter!(self
                .reader
                .seek_relative((header.row_size - consumed) as i64)
                .map_err(crate::Error::from));
        }

        self.pos = header.row_start + 2 + header.key.key.len() as u64 + 8 + header.row_size;

        Some(Ok((header.key, row)))
    }
}

/// A row located in a `Data` component, re-readable without keeping the
/// file open
///
/// Compaction keeps handles instead of materialized rows so that oversized
/// rows can be streamed twice (index pass + write pass).
#[derive(Clone)]
pub struct RowHandle {
    path: Arc<PathBuf>,
    pub key: DecoratedKey,

    /// Top-level deletion pair; range tombstones stay in the atom stream
    pub deletion: DeletionInfo,

    pub atom_count: u32,
    atoms_offset: u64,
    row_size: u64,
}

impl RowHandle {
    /// Total serialized size of the row body (used to pick the
    /// in-memory vs. streaming merge path).
    #[must_use]
    pub fn row_size(&self) -> u64 {
        self.row_size
    }

    /// Opens a fresh atom stream over this row.
    pub fn atoms(&self) -> crate::Result<AtomIter> {
        let file = File::open(&*self.path)?;
        let mut reader = BufReader::with_capacity(u16::MAX.into(), file);
        reader.seek(SeekFrom::Start(self.atoms_offset))?;

        Ok(AtomIter {
            reader,
            remaining: self.atom_count,
        })
    }

    /// Fully materializes the row.
    pub fn materialize(&self, cmp: &ClusteringComparator) -> crate::Result<Row> {
        let mut row = Row {
            deletion: self.deletion.clone(),
            cells: Vec::new(),
        };

        for atom in self.atoms()? {
            match atom? {
                Atom::Cell(cell) => row.cells.push(cell),
                Atom::RangeTombstone(rt) => row.deletion.add_range_tombstone(rt, cmp),
            }
        }

        Ok(row)
    }
}

/// Streaming iterator over one row's atoms
pub struct AtomIter {
    reader: BufReader<File>,
    remaining: u32,
}

impl Iterator for AtomIter {
    type Item = crate::Result<Atom>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        self.remaining -= 1;

        Some(Atom::decode_from(&mut self.reader).map_err(crate::Error::from))
    }
}

/// Streaming iterator over row handles of a `Data` component
pub struct HandleIter {
    reader: BufReader<File>,
    path: Arc<PathBuf>,
    partitioner: Arc<dyn Partitioner>,
    pos: u64,
    failed: bool,
}

impl HandleIter {
    pub fn new(path: Arc<PathBuf>, partitioner: Arc<dyn Partitioner>) -> crate::Result<Self> {
        let (reader, _) = open_data(&path)?;

        Ok(Self {
            reader,
            path,
            partitioner,
            pos: (MAGIC_BYTES.len() + 2) as u64,
            failed: false,
        })
    }
}

impl Iterator for HandleIter {
    type Item = crate::Result<RowHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let header = match read_header(&mut self.reader, self.pos, &*self.partitioner) {
            Ok(None) => return None,
            Ok(Some(header)) => header,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        let key_len = header.key.key.len() as u64;
        let atoms_offset = header.row_start + 2 + key_len + 8 + HEADER_TAIL;
        let row_end = header.row_start + 2 + key_len + 8 + header.row_size;

        #[allow(clippy::cast_possible_wrap)]
        fail_iter!(self
            .reader
            .seek_relative((header.row_size - HEADER_TAIL) as i64)
            .map_err(crate::Error::from));

        self.pos = row_end;

        Some(Ok(RowHandle {
            path: self.path.clone(),
            key: header.key,
            deletion: header.deletion,
            atom_count: header.atom_count,
            atoms_offset,
            row_size: header.row_size,
        }))
    }
}

/// Reads one row at the given index entry position.
pub(crate) fn read_row_at(
    path: &Path,
    entry: IndexEntry,
    partitioner: &dyn Partitioner,
    cmp: &ClusteringComparator,
) -> crate::Result<Row> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(u16::MAX.into(), file);
    reader.seek(SeekFrom::Start(entry.position))?;

    let Some(header) = read_header(&mut reader, entry.position, partitioner)? else {
        return Err(DecodeError::InvalidLength("row position past end").into());
    };

    let mut row = Row {
        deletion: header.deletion,
        cells: Vec::new(),
    };

    for _ in 0..header.atom_count {
        match Atom::decode_from(&mut reader)? {
            Atom::Cell(cell) => row.cells.push(cell),
            Atom::RangeTombstone(rt) => row.deletion.add_range_tombstone(rt, cmp),
        }
    }

    Ok(row)
}

/// Named-column read through the promoted row index.
///
/// Blocks are binary-searched once for the first name; each subsequent name
/// only moves the block cursor forward, so a block is loaded at most once
/// per query.
pub(crate) fn read_named_promoted(
    path: &Path,
    entry: IndexEntry,
    names: &[Slice],
    partitioner: &dyn Partitioner,
    cmp: &ClusteringComparator,
) -> crate::Result<Row> {
    debug_assert!(entry.is_promoted());

    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(u16::MAX.into(), file);

    reader.seek(SeekFrom::Start(entry.position))?;
    let Some(header) = read_header(&mut reader, entry.position, partitioner)? else {
        return Err(DecodeError::InvalidLength("row position past end").into());
    };

    let atoms_start = entry.position + 2 + header.key.key.len() as u64 + 8 + HEADER_TAIL;

    reader.seek(SeekFrom::Start(entry.promoted_offset))?;
    let blocks = IndexInfo::decode_list(&mut reader)?;

    let mut row = Row {
        deletion: header.deletion,
        cells: Vec::new(),
    };

    let Some(first_name) = names.first() else {
        return Ok(row);
    };

    // Binary-search the starting block once
    let mut block_idx = blocks.partition_point(|block| {
        cmp.compare(&block.last_name, first_name) == std::cmp::Ordering::Less
    });

    let mut loaded: Option<(usize, Vec<Atom>)> = None;

    for name in names {
        // Skip to the block that could contain this name
        while let Some(block) = blocks.get(block_idx) {
            if cmp.compare(&block.last_name, name) == std::cmp::Ordering::Less {
                block_idx += 1;
            } else {
                break;
            }
        }

        let Some(block) = blocks.get(block_idx) else {
            break;
        };

        if cmp.compare(&block.first_name, name) == std::cmp::Ordering::Greater {
            // Name falls between blocks: not present
            continue;
        }

        // Load the block, at most once per query
        if loaded.as_ref().map(|(idx, _)| *idx) != Some(block_idx) {
            reader.seek(SeekFrom::Start(atoms_start + block.offset))?;

            let mut atoms = vec![];
            let mut consumed = 0u64;

            while consumed < block.width {
                let atom = Atom::decode_from(&mut reader)?;
                consumed += atom.serialized_size();
                atoms.push(atom);
            }

            loaded = Some((block_idx, atoms));
        }

        if let Some((_, atoms)) = &loaded {
            for atom in atoms {
                match atom {
                    Atom::Cell(cell) => {
                        if cmp.compare(cell.name(), name) == std::cmp::Ordering::Equal {
                            row.cells.push(cell.clone());
                        }
                    }
                    Atom::RangeTombstone(rt) => {
                        if !row.deletion.range_tombstones.contains(rt) {
                            row.deletion.add_range_tombstone(rt.clone(), cmp);
                        }
                    }
                }
            }
        }
    }

    Ok(row)
}
