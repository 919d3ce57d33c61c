// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{row::Row, sstable::Generation, sstable::IndexEntry, Slice};
use quick_cache::sync::Cache;
use std::sync::Arc;

/// Caches `Index` component lookups per `(generation, key)`
///
/// Entries survive compaction: when a compaction writes a row whose key was
/// cached against any input table, it re-registers the entry for the output
/// table, so hot keys stay hot across table swaps.
pub struct KeyCache {
    inner: Cache<(Generation, Slice), IndexEntry>,
}

impl KeyCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Cache::new(capacity),
        }
    }

    pub fn insert(&self, generation: Generation, key: &Slice, entry: IndexEntry) {
        self.inner.insert((generation, key.clone()), entry);
    }

    #[must_use]
    pub fn get(&self, generation: Generation, key: &Slice) -> Option<IndexEntry> {
        self.inner.get(&(generation, key.clone()))
    }

    #[must_use]
    pub fn contains(&self, generation: Generation, key: &Slice) -> bool {
        self.inner.peek(&(generation, key.clone())).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Caches fully merged rows per raw partition key
///
/// Writers invalidate on update; compaction invalidates on row
/// materialisation.
pub struct RowCache {
    inner: Cache<Slice, Arc<Row>>,
}

impl RowCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Cache::new(capacity),
        }
    }

    pub fn insert(&self, key: &Slice, row: Arc<Row>) {
        self.inner.insert(key.clone(), row);
    }

    #[must_use]
    pub fn get(&self, key: &Slice) -> Option<Arc<Row>> {
        self.inner.get(key)
    }

    pub fn invalidate(&self, key: &Slice) {
        self.inner.remove(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn key_cache_basic() {
        let cache = KeyCache::new(10);
        let key = Slice::from("k");

        let entry = IndexEntry {
            position: 42,
            promoted_offset: 0,
        };

        assert!(cache.get(1, &key).is_none());
        cache.insert(1, &key, entry);

        assert_eq!(Some(entry), cache.get(1, &key));
        assert!(cache.get(2, &key).is_none());
        assert_eq!(1, cache.len());
    }

    #[test]
    fn row_cache_invalidation() {
        let cache = RowCache::new(10);
        let key = Slice::from("k");

        cache.insert(&key, Arc::new(Row::new()));
        assert!(cache.get(&key).is_some());

        cache.invalidate(&key);
        assert!(cache.get(&key).is_none());
    }
}
