// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use byteview::ByteView;
use std::io::{Read, Write};

/// The byte-string currency of the engine: partition keys, column names
/// and cell values
///
/// Cloning is reference-counted, so rows can be handed between memtable,
/// merge and writer without copying payloads. The wire formats length-
/// prefix these as either 16-bit (keys, names, tombstone bounds) or
/// 32-bit (values) fields; the `*_prefixed` helpers below are the single
/// implementation of both framings.
#[derive(Debug, Clone, Eq, Hash, Ord)]
pub struct Slice {
    bytes: ByteView,
}

impl Slice {
    /// Copies a byte slice into a new [`Slice`].
    #[must_use]
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// The empty byte string (also an unbounded slice-filter bound).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            bytes: ByteView::new(&[]),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reads exactly `len` bytes from the reader.
    pub(crate) fn from_reader<R: Read>(reader: &mut R, len: usize) -> std::io::Result<Self> {
        ByteView::from_reader(reader, len).map(|bytes| Self { bytes })
    }

    /// Writes the slice with a 16-bit length prefix (keys, names, bounds).
    pub(crate) fn write_prefixed16<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        // NOTE: Keys and names are limited to 16-bit length
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.len() as u16)?;
        writer.write_all(self)
    }

    /// Reads a slice with a 16-bit length prefix.
    pub(crate) fn read_prefixed16<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let len = reader.read_u16::<BigEndian>()?;
        Self::from_reader(reader, len.into())
    }

    /// Writes the slice with a 32-bit length prefix (cell values).
    pub(crate) fn write_prefixed32<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        // NOTE: Values are limited to 32-bit length
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.len() as u32)?;
        writer.write_all(self)
    }

    /// Reads a slice with a 32-bit length prefix.
    pub(crate) fn read_prefixed32<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let len = reader.read_u32::<BigEndian>()?;
        Self::from_reader(reader, len as usize)
    }
}

impl AsRef<[u8]> for Slice {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::ops::Deref for Slice {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

impl std::borrow::Borrow<[u8]> for Slice {
    fn borrow(&self) -> &[u8] {
        self
    }
}

impl From<Vec<u8>> for Slice {
    fn from(value: Vec<u8>) -> Self {
        Self {
            bytes: ByteView::from(value),
        }
    }
}

impl From<String> for Slice {
    fn from(value: String) -> Self {
        value.into_bytes().into()
    }
}

impl From<&[u8]> for Slice {
    fn from(value: &[u8]) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Slice {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl<const N: usize> From<[u8; N]> for Slice {
    fn from(value: [u8; N]) -> Self {
        Self::new(&value)
    }
}

impl<const N: usize> From<&[u8; N]> for Slice {
    fn from(value: &[u8; N]) -> Self {
        Self::new(value)
    }
}

// Comparisons go through `AsRef<[u8]>`, so slices compare against
// anything byte-shaped (including each other) without conversions.
impl<T> PartialEq<T> for Slice
where
    T: AsRef<[u8]>,
{
    fn eq(&self, other: &T) -> bool {
        self.as_ref() == other.as_ref()
    }
}

impl PartialEq<Slice> for &[u8] {
    fn eq(&self, other: &Slice) -> bool {
        *self == other.as_ref()
    }
}

impl<T> PartialOrd<T> for Slice
where
    T: AsRef<[u8]>,
{
    fn partial_cmp(&self, other: &T) -> Option<std::cmp::Ordering> {
        self.as_ref().partial_cmp(other.as_ref())
    }
}

impl PartialOrd<Slice> for &[u8] {
    fn partial_cmp(&self, other: &Slice) -> Option<std::cmp::Ordering> {
        (*self).partial_cmp(other.as_ref())
    }
}
