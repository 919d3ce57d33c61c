// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::MAGIC_BYTES,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Seed of the second hash function; any fixed odd constant works, this
/// one is the 64-bit golden ratio
const SECOND_HASH_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// The pair of key hashes all filter probes are derived from
///
/// The table writer buffers one pair per row until the row count is
/// known, instead of buffering raw partition keys.
pub type KeyHashes = (u64, u64);

/// Membership filter over the partition keys of one sorted table
///
/// Backs the `Filter` component: a point read consults it before paying
/// for an index lookup, a compaction's purge predicate consults the
/// filters of tables outside the compaction set. Answers may-contain with
/// the configured false-positive rate and never produces a false negative.
///
/// Probe positions are derived from two seeded hashes of the raw key
/// bytes, so the filter needs neither the partitioner nor the token.
#[derive(Debug, Eq, PartialEq)]
pub struct KeyFilter {
    /// Bit set, packed into words
    words: Vec<u64>,

    bit_count: u64,

    /// Probes per key
    hash_count: u32,
}

impl KeyFilter {
    /// Sizes a filter for the given row count and false-positive target.
    ///
    /// The probe count follows from the target alone
    /// (`k = log2(1 / fp_rate)`); the bit budget is then whatever keeps
    /// those probes honest (`k / ln 2` bits per key).
    #[must_use]
    pub fn for_row_count(rows: u64, fp_rate: f32) -> Self {
        let rows = rows.max(1);
        let fp_rate = f64::from(fp_rate).clamp(1e-8, 0.5);

        let hash_count = (-fp_rate.log2()).ceil().max(1.0);
        let bits_per_key = hash_count / std::f64::consts::LN_2;

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let bit_count = ((rows as f64) * bits_per_key).ceil() as u64;

        let word_count = bit_count.div_ceil(64).max(1);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Self {
            words: vec![0; word_count as usize],
            bit_count: word_count * 64,
            hash_count: hash_count as u32,
        }
    }

    /// Hashes a partition key for filter insertion or lookup.
    #[must_use]
    pub fn hash(key: &[u8]) -> KeyHashes {
        (
            xxhash_rust::xxh3::xxh3_64(key),
            xxhash_rust::xxh3::xxh3_64_with_seed(key, SECOND_HASH_SEED),
        )
    }

    /// The bit index of probe `i`.
    fn probe(&self, (h1, h2): KeyHashes, i: u64) -> u64 {
        h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count
    }

    /// Registers a hashed key.
    pub fn insert_hash(&mut self, hashes: KeyHashes) {
        for i in 0..u64::from(self.hash_count) {
            let bit = self.probe(hashes, i);

            if let Some(word) = self.words.get_mut((bit / 64) as usize) {
                *word |= 1 << (bit % 64);
            }
        }
    }

    /// Returns `false` if the hashed key is definitely absent.
    #[must_use]
    pub fn maybe_contains_hash(&self, hashes: KeyHashes) -> bool {
        (0..u64::from(self.hash_count)).all(|i| {
            let bit = self.probe(hashes, i);

            self.words
                .get((bit / 64) as usize)
                .is_some_and(|word| word & (1 << (bit % 64)) != 0)
        })
    }

    /// Returns `false` if the partition key is definitely absent.
    #[must_use]
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        self.maybe_contains_hash(Self::hash(key))
    }

    /// Size of the bit set in bytes.
    #[must_use]
    pub fn byte_count(&self) -> usize {
        self.words.len() * 8
    }
}

impl Encode for KeyFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;

        writer.write_u64::<BigEndian>(self.bit_count)?;
        writer.write_u32::<BigEndian>(self.hash_count)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.words.len() as u32)?;

        for word in &self.words {
            writer.write_u64::<BigEndian>(*word)?;
        }

        Ok(())
    }
}

impl Decode for KeyFilter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Filter"));
        }

        let bit_count = reader.read_u64::<BigEndian>()?;
        let hash_count = reader.read_u32::<BigEndian>()?;
        let word_count = reader.read_u32::<BigEndian>()?;

        if hash_count == 0 || bit_count != u64::from(word_count) * 64 {
            return Err(DecodeError::InvalidLength("Filter"));
        }

        let mut words = Vec::with_capacity(word_count as usize);
        for _ in 0..word_count {
            words.push(reader.read_u64::<BigEndian>()?);
        }

        Ok(Self {
            words,
            bit_count,
            hash_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn filter_never_false_negative() {
        let keys: Vec<String> = (0..1_000).map(|_| nanoid::nanoid!()).collect();

        let mut filter = KeyFilter::for_row_count(keys.len() as u64, 0.01);

        for key in &keys {
            filter.insert_hash(KeyFilter::hash(key.as_bytes()));
        }

        for key in &keys {
            assert!(filter.maybe_contains(key.as_bytes()));
        }
    }

    #[test]
    fn filter_rejects_most_absent_keys() {
        let mut filter = KeyFilter::for_row_count(10_000, 0.01);

        for _ in 0..10_000 {
            filter.insert_hash(KeyFilter::hash(nanoid::nanoid!().as_bytes()));
        }

        let mut false_positives = 0;
        let probes = 10_000;

        for _ in 0..probes {
            if filter.maybe_contains(nanoid::nanoid!().as_bytes()) {
                false_positives += 1;
            }
        }

        // Target is 1%; anything in the low single digits is healthy
        #[allow(clippy::cast_precision_loss)]
        let rate = f64::from(false_positives) / f64::from(probes);
        assert!(rate < 0.04, "false positive rate was {rate}");
    }

    #[test]
    fn filter_empty_contains_nothing() {
        let filter = KeyFilter::for_row_count(100, 0.001);

        assert!(!filter.maybe_contains(b"some_partition_key"));
        assert!(!filter.maybe_contains(b""));
    }

    #[test]
    fn filter_sizing_scales_with_rows_and_target() {
        let small = KeyFilter::for_row_count(1_000, 0.01);
        let more_rows = KeyFilter::for_row_count(100_000, 0.01);
        let stricter = KeyFilter::for_row_count(1_000, 0.0001);

        assert!(more_rows.byte_count() > small.byte_count());
        assert!(stricter.byte_count() > small.byte_count());
        assert!(stricter.hash_count > small.hash_count);
    }

    #[test]
    fn filter_serde_round_trip() -> crate::Result<()> {
        let mut filter = KeyFilter::for_row_count(32, 0.001);

        for key in ["alpha", "bravo", "charlie"] {
            filter.insert_hash(KeyFilter::hash(key.as_bytes()));
        }

        let bytes = filter.encode_into_vec();
        let decoded = KeyFilter::decode_from(&mut &bytes[..])?;

        assert_eq!(filter, decoded);
        assert!(decoded.maybe_contains(b"alpha"));
        assert!(!decoded.maybe_contains(b"delta"));

        Ok(())
    }

    #[test]
    fn filter_rejects_bad_header() {
        let bytes = vec![0u8; 64];
        assert!(KeyFilter::decode_from(&mut &bytes[..]).is_err());
    }
}
