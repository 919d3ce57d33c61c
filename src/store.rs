// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::{KeyCache, RowCache},
    compaction::{leveled::LeveledManifest, worker},
    config::{Config, SystemContext},
    error::Error,
    executor::{promise, TaskFuture},
    file::LEVEL_MANIFEST_FILE,
    key::Token,
    memtable::{
        meter::{meter_live_ratio, MeteringGate},
        Memtable,
    },
    partitioner::Partitioner,
    replay::ReplayPosition,
    row::{QueryFilter, Row},
    schema::Schema,
    slice::Slice,
    sstable::{
        writer::{TableWriter, WriterOptions},
        Descriptor, FormatVersion, Generation, SSTable,
    },
    stop_signal::StopSignal,
    time::unix_timestamp_secs,
    tracker::DataTracker,
    validation::{validate, TreeRoot},
    LocalDeletionTime, GC_NONE,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
};

/// A single-table wide-column store
///
/// Cheap to clone; all clones share the same underlying state. Writes go
/// through [`Store::apply_write`], durability of unflushed writes is the
/// embedding system's commit log's business.
#[derive(Clone)]
pub struct Store(Arc<StoreInner>);

struct StoreInner {
    config: Config,
    schema: Arc<Schema>,
    context: Arc<SystemContext>,

    tracker: DataTracker,
    manifest: Mutex<LeveledManifest>,

    key_cache: Option<Arc<KeyCache>>,
    row_cache: Option<Arc<RowCache>>,

    /// Serializes compaction selection + execution: two concurrent
    /// compactions could otherwise produce overlapping outputs for the
    /// same level, violating the manifest's non-overlap invariant
    compaction_lock: Mutex<()>,

    /// Writers hold this for reading, the memtable switch for writing
    switch_lock: RwLock<()>,

    next_generation: AtomicU32,

    /// Set after a flush failed on every location; all further writes
    /// are refused
    writes_halted: AtomicBool,

    metering: MeteringGate,
    stop_signal: StopSignal,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.stop_signal.send();
    }
}

impl Store {
    /// Opens (or creates) a store, recovering committed sorted tables
    /// from every data directory.
    pub(crate) fn open(config: Config, context: Arc<SystemContext>) -> crate::Result<Self> {
        let schema = Arc::new(config.schema.clone());

        let key_cache = (config.key_cache_capacity > 0)
            .then(|| Arc::new(KeyCache::new(config.key_cache_capacity)));
        let row_cache = (config.row_cache_capacity > 0)
            .then(|| Arc::new(RowCache::new(config.row_cache_capacity)));

        let mut tables: Vec<Arc<SSTable>> = vec![];

        for dir in std::iter::once(&config.path).chain(config.extra_data_dirs.iter()) {
            std::fs::create_dir_all(dir)?;

            for descriptor in Descriptor::discover(dir, &schema.keyspace, &schema.table)? {
                let table = SSTable::open(
                    descriptor,
                    schema.clone(),
                    config.partitioner.clone(),
                    key_cache.clone(),
                )?;

                tables.push(Arc::new(table));
            }
        }

        let next_generation = tables
            .iter()
            .map(|t| t.generation())
            .max()
            .unwrap_or(0)
            + 1;

        log::info!(
            "opened store {}/{} with {} tables",
            schema.keyspace,
            schema.table,
            tables.len(),
        );

        let manifest = LeveledManifest::load(
            config.max_sstable_size,
            config.fanout,
            config.path.join(LEVEL_MANIFEST_FILE),
            &tables,
        )?;

        Ok(Self(Arc::new(StoreInner {
            tracker: DataTracker::new(tables),
            manifest: Mutex::new(manifest),
            key_cache,
            row_cache,
            compaction_lock: Mutex::new(()),
            switch_lock: RwLock::new(()),
            next_generation: AtomicU32::new(next_generation),
            writes_halted: AtomicBool::new(false),
            metering: MeteringGate::default(),
            stop_signal: StopSignal::default(),
            schema,
            config,
            context,
        })))
    }

    /// Merges a row version into the store.
    pub fn apply_write<K: Into<Slice>>(&self, key: K, row: Row) -> crate::Result<()> {
        if self.0.writes_halted.load(Ordering::Acquire) {
            return Err(Error::WritesHalted);
        }

        let key = self.partitioner().decorate(key.into());

        {
            #[allow(clippy::expect_used)]
            let _guard = self.0.switch_lock.read().expect("lock is poisoned");

            let view = self.0.tracker.current();
            let updater = self.0.config.index_manager.updater_for(&key);

            view.memtable.put(&key, row, self.schema(), &*updater);
        }

        if let Some(cache) = self.row_cache() {
            cache.invalidate(&key.key);
        }

        self.maybe_meter();

        if self.0.tracker.current().memtable.live_size() >= self.0.config.memtable_threshold {
            // Fire-and-forget; failures halt writes through the flag
            drop(self.switch_and_flush());
        }

        Ok(())
    }

    /// Reads one partition through the given filter.
    ///
    /// Returns the observable row: shadowed, deleted and expired cells
    /// are stripped; `None` if nothing observable remains.
    pub fn get_row<K: Into<Slice>>(
        &self,
        key: K,
        filter: &QueryFilter,
    ) -> crate::Result<Option<Row>> {
        let key = self.partitioner().decorate(key.into());
        let now = unix_timestamp_secs();

        let schema = self.schema().clone();
        let cmp = &schema.comparator;
        let counter = schema.is_counter();

        let full_row = filter.is_full_row();

        if full_row {
            if let Some(cache) = self.row_cache() {
                if let Some(row) = cache.get(&key.key) {
                    return Ok((*row).clone().observable(now, cmp));
                }
            }
        }

        // Names must be scanned in clustering order
        let sorted_names = match filter {
            QueryFilter::Names(names) => {
                let mut names = names.clone();
                names.sort_by(|a, b| cmp.compare(a, b));
                Some(names)
            }
            QueryFilter::Slice { .. } => None,
        };

        let view = self.0.tracker.current();

        let mut merged: Option<Row> = None;

        for memtable in view.memtables() {
            if let Some(row) = memtable.get(&key) {
                absorb(&mut merged, row, &schema, counter);
            }
        }

        for table in &view.tables {
            if !table.may_contain(&key) {
                continue;
            }

            let result = match &sorted_names {
                Some(names) => table.read_named(&key, names),
                None => table.read_row(&key),
            };

            match result {
                Ok(Some(row)) => absorb(&mut merged, row, &schema, counter),
                Ok(None) => {}
                Err(Error::Corrupt(generation)) => {
                    // Mark-suspect already happened inside the reader;
                    // drop the table from the live set and surface
                    self.drop_corrupt_table(generation)?;
                    return Err(Error::Corrupt(generation));
                }
                Err(e) => return Err(e),
            }
        }

        let Some(merged) = merged else {
            return Ok(None);
        };

        if full_row {
            if let Some(cache) = self.row_cache() {
                cache.insert(&key.key, Arc::new(merged.clone()));
            }
        }

        Ok(filter.apply(merged, cmp).observable(now, cmp))
    }

    /// Switches the memtable out and waits for its flush to complete.
    pub fn force_flush(&self) -> crate::Result<()> {
        match self.switch_and_flush() {
            None => Ok(()),
            Some(future) => future.wait(),
        }
    }

    /// Runs leveled compaction until no level is over target, starting
    /// with a major pass over every live table.
    pub fn force_major_compaction(&self) -> crate::Result<()> {
        self.compact_with_gc_before(self.schema().gc_before(unix_timestamp_secs()))
    }

    /// Like [`Store::force_major_compaction`], with an explicit tombstone
    /// purge threshold.
    pub fn compact_with_gc_before(
        &self,
        gc_before: LocalDeletionTime,
    ) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let _serialize = self.0.compaction_lock.lock().expect("lock is poisoned");

        let major = {
            #[allow(clippy::expect_used)]
            let mut manifest = self.0.manifest.lock().expect("lock is poisoned");

            let task = manifest.major_task();
            if let Some(task) = &task {
                manifest.mark_compacting(&task.generations());
            }
            task
        };

        if let Some(task) = major {
            worker::run(self, &task, gc_before)?;
        }

        // Drain follow-up work (levels pushed over target by the major pass)
        loop {
            let next = {
                #[allow(clippy::expect_used)]
                self.0.manifest.lock().expect("lock is poisoned").next_task()
            };

            let Some(task) = next else { break };

            worker::run(self, &task, gc_before)?;
        }

        Ok(())
    }

    /// Compacts exactly the given tables (user-defined compaction).
    ///
    /// Inputs that are all in L0 produce L0 outputs; otherwise outputs go
    /// to the deepest input level, so the non-overlap invariant of
    /// untouched levels cannot be violated.
    pub fn compact_tables(
        &self,
        generations: &[Generation],
        gc_before: LocalDeletionTime,
    ) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let _serialize = self.0.compaction_lock.lock().expect("lock is poisoned");

        let task = {
            #[allow(clippy::expect_used)]
            let mut manifest = self.0.manifest.lock().expect("lock is poisoned");

            let tables: Vec<_> = manifest
                .all_tables()
                .into_iter()
                .filter(|t| generations.contains(&t.generation()))
                .collect();

            if tables.is_empty() {
                return Ok(());
            }

            let target_level = tables
                .iter()
                .filter_map(|t| manifest.level_of(t.generation()))
                .max()
                .unwrap_or(0);

            let task = crate::compaction::Task {
                tables,
                target_level,
            };

            manifest.mark_compacting(&task.generations());
            task
        };

        worker::run(self, &task, gc_before)
    }

    /// Submits a whole-range digest scan; the returned future resolves to
    /// the scan's tree root.
    pub fn submit_validation(
        &self,
        range: (Token, Token),
    ) -> TaskFuture<crate::Result<TreeRoot>> {
        let (lo, hi) = range;

        let tables: Vec<_> = self
            .0
            .tracker
            .current()
            .tables
            .iter()
            .filter(|t| {
                let (first, last) = t.token_range();
                first <= hi && lo <= last
            })
            .cloned()
            .collect();

        let stop = self.0.stop_signal.clone();
        let (promise, future) = promise();

        self.0.context.executor.compaction_pool.execute(move || {
            promise.complete(validate(tables, range, &stop));
        });

        future
    }

    // -- flush machinery ---------------------------------------------------

    /// Switches the active memtable out (if non-empty) and submits the
    /// flush task; returns a future resolving on flush completion.
    fn switch_and_flush(&self) -> Option<TaskFuture<crate::Result<()>>> {
        let (memtable, position, ticket) = {
            #[allow(clippy::expect_used)]
            let _guard = self.0.switch_lock.write().expect("lock is poisoned");

            let view = self.0.tracker.current();

            if view.memtable.is_empty() {
                return None;
            }

            let position = self.0.config.commit_log.current_position();
            let memtable = self.0.tracker.switch_memtable();

            let commit_log = self.0.config.commit_log.clone();
            let ticket = self
                .0
                .context
                .executor
                .flush_signal
                .register(position, move |pos| commit_log.on_memtable_flush(pos));

            (memtable, position, ticket)
        };

        let store = self.clone();
        let (promise, future) = promise();

        // Submission blocks while the flush queue is full, which
        // admission-throttles writers that keep filling memtables
        self.0.context.executor.flush_pool.execute(move || {
            match store.flush_task(&memtable, position) {
                Ok(table) => {
                    store.0.tracker.replace_flushed(&memtable, table.clone());

                    if let Some(table) = table {
                        #[allow(clippy::expect_used)]
                        let result = store
                            .0
                            .manifest
                            .lock()
                            .expect("lock is poisoned")
                            .add_flushed(table);

                        if let Err(e) = result {
                            log::error!("failed to persist manifest: {e:?}");
                        }
                    }

                    store.0.context.executor.flush_signal.complete(ticket);
                    store.schedule_compaction_check();

                    promise.complete(Ok(()));
                }
                Err(e) => {
                    log::error!("flush failed on every location, halting writes: {e:?}");

                    // The memtable stays in the flushing set and the
                    // commit-log position is never signaled
                    store.0.writes_halted.store(true, Ordering::Release);

                    promise.complete(Err(e));
                }
            }
        });

        Some(future)
    }

    /// Writes one memtable into a sorted table, rotating through data
    /// directories on failure.
    fn flush_task(
        &self,
        memtable: &Arc<Memtable>,
        position: ReplayPosition,
    ) -> crate::Result<Option<Arc<SSTable>>> {
        let estimated = memtable.estimated_flush_bytes();
        let mut last_err = None;

        let locations: Vec<PathBuf> = std::iter::once(self.0.config.path.clone())
            .chain(self.0.config.extra_data_dirs.iter().cloned())
            .collect();

        for (attempt, dir) in locations.iter().enumerate() {
            if attempt > 0 {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }

            log::debug!("flushing {estimated} estimated bytes into {dir:?}");

            match self.flush_into(dir.clone(), memtable, position) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    log::warn!("flush into {dir:?} failed: {e:?}");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(Error::Unrecoverable))
    }

    fn flush_into(
        &self,
        dir: PathBuf,
        memtable: &Arc<Memtable>,
        position: ReplayPosition,
    ) -> crate::Result<Option<Arc<SSTable>>> {
        let schema = self.schema().clone();
        let cmp = &schema.comparator;

        let descriptor = Descriptor::new(
            &schema.keyspace,
            &schema.table,
            self.next_generation(),
            FormatVersion::CURRENT,
            dir,
        );

        let mut writer = TableWriter::new(
            descriptor,
            schema.clone(),
            self.partitioner().clone(),
            WriterOptions {
                bloom_fp_rate: self.0.config.bloom_fp_rate,
                index_interval: self.0.config.index_interval,
                promoted_block_size: self.0.config.promoted_block_size,
            },
            position,
            vec![],
        )?;

        let drop_shadowed = !self.0.config.index_manager.has_indexes();

        for (key, mut row) in memtable.iter() {
            if !row.deletion.is_live() && drop_shadowed {
                // Cells obsoleted by the row's own tombstones need not be
                // written; the tombstones themselves always are
                row.remove_deleted(GC_NONE, cmp);
            }

            if schema.is_batchlog()
                && row.deletion.has_row_tombstone()
                && row.cells.is_empty()
            {
                continue;
            }

            writer.append_row(&key, &row)?;
        }

        match writer.finish()? {
            None => {
                log::debug!("flush produced no output");
                Ok(None)
            }
            Some(finished) => Ok(Some(Arc::new(SSTable::from_finished(
                finished,
                schema,
                self.partitioner().clone(),
                self.key_cache().clone(),
            )?))),
        }
    }

    /// Submits a background check that runs compaction tasks until no
    /// level is over target.
    fn schedule_compaction_check(&self) {
        let store = self.clone();

        self.0.context.executor.compaction_pool.execute(move || {
            loop {
                if store.0.stop_signal.is_stopped() {
                    return;
                }

                #[allow(clippy::expect_used)]
                let _serialize = store.0.compaction_lock.lock().expect("lock is poisoned");

                let task = {
                    #[allow(clippy::expect_used)]
                    store.0.manifest.lock().expect("lock is poisoned").next_task()
                };

                let Some(task) = task else { return };

                let gc_before = store.schema().gc_before(unix_timestamp_secs());

                if let Err(e) = worker::run(&store, &task, gc_before) {
                    log::error!("background compaction failed: {e:?}");
                    return;
                }
            }
        });
    }

    fn maybe_meter(&self) {
        if !self.0.metering.try_claim() {
            return;
        }

        let store = self.clone();
        let memtable = self.0.tracker.current().memtable.clone();

        self.0.context.executor.meter_pool.execute(move || {
            meter_live_ratio(&memtable);
            store.0.metering.release();
        });
    }

    // -- corruption --------------------------------------------------------

    /// Removes a suspect table from the live set; its files are kept on
    /// disk for inspection.
    pub(crate) fn drop_corrupt_table(&self, generation: Generation) -> crate::Result<()> {
        log::warn!("dropping suspect table {generation} from the live set");

        self.0.tracker.remove_table(generation);

        #[allow(clippy::expect_used)]
        self.0
            .manifest
            .lock()
            .expect("lock is poisoned")
            .remove(generation)
    }

    // -- accessors ---------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.0.schema
    }

    #[must_use]
    pub fn partitioner(&self) -> &Arc<dyn Partitioner> {
        &self.0.config.partitioner
    }

    #[must_use]
    pub fn context(&self) -> &Arc<SystemContext> {
        &self.0.context
    }

    #[must_use]
    pub fn key_cache(&self) -> &Option<Arc<KeyCache>> {
        &self.0.key_cache
    }

    #[must_use]
    pub fn row_cache(&self) -> &Option<Arc<RowCache>> {
        &self.0.row_cache
    }

    #[must_use]
    pub(crate) fn tracker(&self) -> &DataTracker {
        &self.0.tracker
    }

    #[must_use]
    pub(crate) fn stop_signal(&self) -> &StopSignal {
        &self.0.stop_signal
    }

    pub(crate) fn next_generation(&self) -> Generation {
        self.0.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn manifest_replace(
        &self,
        inputs: &[Arc<SSTable>],
        outputs: &[Arc<SSTable>],
        target_level: usize,
    ) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        self.0
            .manifest
            .lock()
            .expect("lock is poisoned")
            .replace(inputs, outputs, target_level)
    }

    pub(crate) fn manifest_unmark_compacting(&self, generations: &[Generation]) {
        #[allow(clippy::expect_used)]
        self.0
            .manifest
            .lock()
            .expect("lock is poisoned")
            .unmark_compacting(generations);
    }

    /// Number of live sorted tables.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.0.tracker.current().tables.len()
    }

    /// The live tables of one level.
    #[must_use]
    pub fn level_tables(&self, level: usize) -> Vec<Arc<SSTable>> {
        #[allow(clippy::expect_used)]
        self.0
            .manifest
            .lock()
            .expect("lock is poisoned")
            .level_tables(level)
    }

    /// Summed data size of one level, in bytes.
    #[must_use]
    pub fn level_size_bytes(&self, level: usize) -> u64 {
        #[allow(clippy::expect_used)]
        self.0
            .manifest
            .lock()
            .expect("lock is poisoned")
            .level_size_bytes(level)
    }

    /// Number of tables in one level.
    #[must_use]
    pub fn level_count(&self, level: usize) -> usize {
        #[allow(clippy::expect_used)]
        self.0
            .manifest
            .lock()
            .expect("lock is poisoned")
            .level_count(level)
    }

    /// Stops background work (compactions, validations) cooperatively.
    pub fn stop(&self) {
        self.0.stop_signal.send();
    }

    /// The active memtable's estimated live size, in bytes.
    #[must_use]
    pub fn memtable_live_size(&self) -> u64 {
        self.0.tracker.current().memtable.live_size()
    }
}

fn absorb(merged: &mut Option<Row>, row: Row, schema: &Schema, counter: bool) {
    match merged {
        None => *merged = Some(row),
        Some(m) => m.merge_from(row, &schema.comparator, counter),
    }
}
