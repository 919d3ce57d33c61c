// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;

/// Position of a partition key in the token ring (the partitioner's hash)
pub type Token = u64;

/// A partition key decorated with its token
///
/// Partitions are ordered by token first, then by raw key bytes, which is
/// the on-disk order of rows inside a sorted table.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct DecoratedKey {
    /// The partitioner's hash of the key
    pub token: Token,

    /// The raw partition key bytes
    pub key: Slice,
}

impl DecoratedKey {
    #[must_use]
    pub fn new(token: Token, key: Slice) -> Self {
        Self { token, key }
    }
}

impl std::fmt::Debug for DecoratedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{:?}",
            self.token,
            String::from_utf8_lossy(&self.key)
        )
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Order by token, THEN by raw key bytes
//
// This is the order of partitions on disk; getting it wrong breaks
// every merge and every index lookup.
impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}
