// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    executor::Executor,
    partitioner::{Partitioner, Xxh3Partitioner},
    replay::{CommitLog, NoopCommitLog},
    schema::Schema,
    secondary_index::{NoIndexes, SecondaryIndexManager},
    store::Store,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Store configuration
pub struct Config {
    /// Primary directory of the store
    pub path: PathBuf,

    /// Additional flush locations; a flush failing on one disk is retried
    /// on the next
    pub extra_data_dirs: Vec<PathBuf>,

    /// Static description of the table
    pub schema: Schema,

    /// Token function; persisted per table and asserted on open
    pub partitioner: Arc<dyn Partitioner>,

    /// External commit log (position source + flush notifications)
    pub commit_log: Arc<dyn CommitLog>,

    /// Secondary index maintenance hooks
    pub index_manager: Arc<dyn SecondaryIndexManager>,

    /// Memtable live-size threshold that triggers a flush
    ///
    /// Default = 64 MiB
    pub memtable_threshold: u64,

    /// Bloom filter false positive target
    pub bloom_fp_rate: f32,

    /// Every n-th index entry is sampled into the summary
    pub index_interval: u32,

    /// Block granularity of the promoted row index
    ///
    /// Default = 64 KiB
    pub promoted_block_size: u64,

    /// Compaction output files are rotated at this size
    ///
    /// Default = 64 MiB
    pub max_sstable_size: u64,

    /// Size ratio between levels (a.k.a. growth rate)
    ///
    /// Default = 10
    pub fanout: u64,

    /// Rows merging to more than this many bytes take the streaming
    /// (two-pass) compaction path
    ///
    /// Default = 64 MiB
    pub in_memory_compaction_limit: u64,

    /// Number of concurrent flush writers
    pub flush_writers: usize,

    /// Bound of the flush queue; submitters block once it is full
    pub flush_queue_size: usize,

    /// Number of concurrent compactions
    pub compaction_threads: usize,

    /// Key cache capacity in entries; 0 disables
    pub key_cache_capacity: usize,

    /// Row cache capacity in entries; 0 disables
    pub row_cache_capacity: usize,
}

impl Config {
    /// Creates a config with sensible defaults in the given directory.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            extra_data_dirs: Vec::new(),
            schema: Schema::default(),
            partitioner: Arc::new(Xxh3Partitioner),
            commit_log: Arc::new(NoopCommitLog),
            index_manager: Arc::new(NoIndexes),
            memtable_threshold: 64 * 1_024 * 1_024,
            bloom_fp_rate: 0.0001,
            index_interval: 128,
            promoted_block_size: 64 * 1_024,
            max_sstable_size: 64 * 1_024 * 1_024,
            fanout: 10,
            in_memory_compaction_limit: 64 * 1_024 * 1_024,
            flush_writers: 1,
            flush_queue_size: 4,
            compaction_threads: 2,
            key_cache_capacity: 16_384,
            row_cache_capacity: 1_024,
        }
    }

    #[must_use]
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    #[must_use]
    pub fn partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    #[must_use]
    pub fn commit_log(mut self, commit_log: Arc<dyn CommitLog>) -> Self {
        self.commit_log = commit_log;
        self
    }

    #[must_use]
    pub fn index_manager(mut self, index_manager: Arc<dyn SecondaryIndexManager>) -> Self {
        self.index_manager = index_manager;
        self
    }

    #[must_use]
    pub fn extra_data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.extra_data_dirs.push(path.as_ref().into());
        self
    }

    #[must_use]
    pub fn memtable_threshold(mut self, bytes: u64) -> Self {
        self.memtable_threshold = bytes;
        self
    }

    #[must_use]
    pub fn bloom_fp_rate(mut self, fp_rate: f32) -> Self {
        self.bloom_fp_rate = fp_rate;
        self
    }

    #[must_use]
    pub fn max_sstable_size(mut self, bytes: u64) -> Self {
        self.max_sstable_size = bytes;
        self
    }

    #[must_use]
    pub fn fanout(mut self, fanout: u64) -> Self {
        self.fanout = fanout;
        self
    }

    #[must_use]
    pub fn in_memory_compaction_limit(mut self, bytes: u64) -> Self {
        self.in_memory_compaction_limit = bytes;
        self
    }

    #[must_use]
    pub fn index_interval(mut self, interval: u32) -> Self {
        self.index_interval = interval;
        self
    }

    #[must_use]
    pub fn promoted_block_size(mut self, bytes: u64) -> Self {
        self.promoted_block_size = bytes;
        self
    }

    #[must_use]
    pub fn flush_writers(mut self, writers: usize) -> Self {
        self.flush_writers = writers;
        self
    }

    #[must_use]
    pub fn flush_queue_size(mut self, size: usize) -> Self {
        self.flush_queue_size = size;
        self
    }

    #[must_use]
    pub fn compaction_threads(mut self, threads: usize) -> Self {
        self.compaction_threads = threads;
        self
    }

    #[must_use]
    pub fn key_cache_capacity(mut self, entries: usize) -> Self {
        self.key_cache_capacity = entries;
        self
    }

    #[must_use]
    pub fn row_cache_capacity(mut self, entries: usize) -> Self {
        self.row_cache_capacity = entries;
        self
    }

    /// Opens the store with a private [`SystemContext`].
    pub fn open(self) -> crate::Result<Store> {
        let context = Arc::new(SystemContext::new(&self));
        Store::open(self, context)
    }

    /// Opens the store sharing an existing [`SystemContext`]
    /// (pools and caches) with other stores.
    pub fn open_with(self, context: Arc<SystemContext>) -> crate::Result<Store> {
        Store::open(self, context)
    }
}

/// Process-wide shared state: the task pools
///
/// Initialised once at startup and passed explicitly to every store;
/// nothing in this crate lives in module-level state. Caches are
/// per-store (their keys embed table generations, which are only unique
/// within one store).
pub struct SystemContext {
    pub executor: Executor,
}

impl SystemContext {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            executor: Executor::new(
                config.flush_writers,
                config.flush_queue_size,
                config.compaction_threads,
            ),
        }
    }
}
