// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{DecoratedKey, Slice, Token};
use std::sync::Arc;

/// Maps partition keys onto the token ring
///
/// The partitioner identifier is persisted in every sorted table's
/// statistics sidecar and asserted on load; opening a table written by a
/// different partitioner is refused.
pub trait Partitioner: Send + Sync + 'static {
    /// Stable identifier, persisted in the statistics sidecar.
    fn name(&self) -> &'static str;

    /// Hashes a partition key onto the ring.
    fn token(&self, key: &[u8]) -> Token;

    /// Decorates raw key bytes with their token.
    fn decorate(&self, key: Slice) -> DecoratedKey {
        let token = self.token(&key);
        DecoratedKey::new(token, key)
    }
}

/// Default partitioner, hashing keys with xxh3
#[derive(Default)]
pub struct Xxh3Partitioner;

impl Partitioner for Xxh3Partitioner {
    fn name(&self) -> &'static str {
        "xxh3"
    }

    fn token(&self, key: &[u8]) -> Token {
        xxhash_rust::xxh3::xxh3_64(key)
    }
}

/// Partitioner whose token order equals the byte order of keys
///
/// Useful for range scans over raw keys (and for tests that reason about
/// on-disk ordering); offers no load distribution.
#[derive(Default)]
pub struct OrderPreservingPartitioner;

impl Partitioner for OrderPreservingPartitioner {
    fn name(&self) -> &'static str {
        "order-preserving"
    }

    fn token(&self, key: &[u8]) -> Token {
        let mut buf = [0u8; 8];

        for (idx, byte) in key.iter().take(8).enumerate() {
            #[allow(clippy::indexing_slicing)]
            {
                buf[idx] = *byte;
            }
        }

        Token::from_be_bytes(buf)
    }
}

/// Resolves a partitioner by its persisted identifier.
#[must_use]
pub fn from_name(name: &str) -> Option<Arc<dyn Partitioner>> {
    match name {
        "xxh3" => Some(Arc::new(Xxh3Partitioner)),
        "order-preserving" => Some(Arc::new(OrderPreservingPartitioner)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn order_preserving_tokens_sort_like_keys() {
        let p = OrderPreservingPartitioner;
        assert!(p.token(b"a") < p.token(b"b"));
        assert!(p.token(b"ab") < p.token(b"b"));
        assert!(p.token(b"ba") > p.token(b"b"));
    }

    #[test]
    fn xxh3_token_is_stable() {
        let p = Xxh3Partitioner;
        assert_eq!(p.token(b"abc"), p.token(b"abc"));
    }

    #[test]
    fn partitioner_resolution() {
        assert!(from_name("xxh3").is_some());
        assert!(from_name("order-preserving").is_some());
        assert!(from_name("murmur3").is_none());
    }
}
