// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;
use byteorder::{BigEndian, ReadBytesExt};

/// One increment source of a distributed counter
///
/// `clock` is a wall-clock second; a shard with a higher clock supersedes
/// an older shard from the same source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Shard {
    id: u64,
    clock: u64,
    count: i64,
}

/// Shard arithmetic for commutative (counter) tables
///
/// A counter cell's value is an ordered list of shards. Merging two values
/// keeps, per source, the shard with the highest clock; the counter total is
/// the sum over shards.
pub struct CounterContext;

impl CounterContext {
    /// Encodes a single-shard counter value.
    #[must_use]
    pub fn shard(id: u64, clock: u64, count: i64) -> Slice {
        encode(&[Shard { id, clock, count }])
    }

    /// Merges two counter values shard-wise.
    #[must_use]
    pub fn merge(a: &[u8], b: &[u8]) -> Slice {
        let mut shards = decode(a);

        for shard in decode(b) {
            match shards.binary_search_by_key(&shard.id, |s| s.id) {
                Ok(idx) => {
                    #[allow(clippy::indexing_slicing)]
                    if shard.clock > shards[idx].clock {
                        shards[idx] = shard;
                    }
                }
                Err(idx) => shards.insert(idx, shard),
            }
        }

        encode(&shards)
    }

    /// Folds shards with `clock < merge_before` into a single merged shard.
    ///
    /// The counter total is preserved; only per-source history older than
    /// the threshold is collapsed.
    #[must_use]
    pub fn strip_old_shards(value: &[u8], merge_before: u64) -> Slice {
        let shards = decode(value);

        let (old, mut keep): (Vec<_>, Vec<_>) =
            shards.into_iter().partition(|s| s.clock < merge_before);

        if old.is_empty() {
            return Slice::new(value);
        }

        let folded = Shard {
            id: 0,
            clock: merge_before,
            count: old.iter().map(|s| s.count).sum(),
        };

        match keep.binary_search_by_key(&folded.id, |s| s.id) {
            Ok(idx) => {
                #[allow(clippy::indexing_slicing)]
                {
                    keep[idx].count += folded.count;
                    keep[idx].clock = keep[idx].clock.max(folded.clock);
                }
            }
            Err(idx) => keep.insert(idx, folded),
        }

        encode(&keep)
    }

    /// The counter total.
    #[must_use]
    pub fn total(value: &[u8]) -> i64 {
        decode(value).iter().map(|s| s.count).sum()
    }
}

fn encode(shards: &[Shard]) -> Slice {
    let mut out = Vec::with_capacity(2 + shards.len() * 24);

    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(shards.len() as u16).to_be_bytes());

    for shard in shards {
        out.extend_from_slice(&shard.id.to_be_bytes());
        out.extend_from_slice(&shard.clock.to_be_bytes());
        out.extend_from_slice(&shard.count.to_be_bytes());
    }

    out.into()
}

/// Lenient decode: a malformed value yields no shards, so reconciliation
/// degrades to plain value comparison instead of erroring mid-merge.
fn decode(mut value: &[u8]) -> Vec<Shard> {
    let Ok(count) = value.read_u16::<BigEndian>() else {
        return vec![];
    };

    let mut shards = Vec::with_capacity(count.into());

    for _ in 0..count {
        let (Ok(id), Ok(clock), Ok(count)) = (
            value.read_u64::<BigEndian>(),
            value.read_u64::<BigEndian>(),
            value.read_i64::<BigEndian>(),
        ) else {
            return vec![];
        };

        shards.push(Shard { id, clock, count });
    }

    shards.sort_by_key(|s| s.id);
    shards
}
