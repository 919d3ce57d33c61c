// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{controller::CompactionController, Task};
use crate::{
    error::Error,
    merge::{BoxedRowIterator, RowMerger},
    replay::ReplayPosition,
    sstable::{
        reader::RowHandle,
        writer::{FinishedTable, TableWriter, WriterOptions},
        Descriptor, FormatVersion, Generation, SSTable,
    },
    store::Store,
    LocalDeletionTime,
};
use std::sync::Arc;

/// Rotates output writers so no output file exceeds the configured
/// maximum table size; aborts everything on failure
struct OutputWriters<'a> {
    store: &'a Store,
    ancestors: Vec<Generation>,
    current: Option<TableWriter>,
    finished: Vec<FinishedTable>,
}

impl<'a> OutputWriters<'a> {
    fn new(store: &'a Store, ancestors: Vec<Generation>) -> Self {
        Self {
            store,
            ancestors,
            current: None,
            finished: Vec::new(),
        }
    }

    fn writer(&mut self) -> crate::Result<&mut TableWriter> {
        let rotate = self
            .current
            .as_ref()
            .is_some_and(|w| w.data_size() >= self.store.config().max_sstable_size);

        if rotate {
            self.rotate()?;
        }

        if self.current.is_none() {
            let generation = self.store.next_generation();

            let descriptor = Descriptor::new(
                &self.store.schema().keyspace,
                &self.store.schema().table,
                generation,
                FormatVersion::CURRENT,
                &self.store.config().path,
            );

            let writer = TableWriter::new(
                descriptor,
                self.store.schema().clone(),
                self.store.partitioner().clone(),
                WriterOptions {
                    bloom_fp_rate: self.store.config().bloom_fp_rate,
                    index_interval: self.store.config().index_interval,
                    promoted_block_size: self.store.config().promoted_block_size,
                },
                // Compaction outputs carry no commit-log position
                ReplayPosition::NONE,
                self.ancestors.clone(),
            )?;

            self.current = Some(writer);
        }

        #[allow(clippy::expect_used)]
        Ok(self.current.as_mut().expect("just installed"))
    }

    fn rotate(&mut self) -> crate::Result<()> {
        if let Some(mut writer) = self.current.take() {
            if let Some(finished) = writer.finish()? {
                self.finished.push(finished);
            }
        }

        Ok(())
    }

    fn finish_all(&mut self) -> crate::Result<Vec<Arc<SSTable>>> {
        self.rotate()?;

        let mut outputs = Vec::with_capacity(self.finished.len());

        for finished in self.finished.drain(..) {
            match SSTable::from_finished(
                finished,
                self.store.schema().clone(),
                self.store.partitioner().clone(),
                self.store.key_cache().clone(),
            ) {
                Ok(table) => outputs.push(Arc::new(table)),
                Err(e) => {
                    for output in &outputs {
                        output.mark_obsolete();
                    }
                    return Err(e);
                }
            }
        }

        Ok(outputs)
    }

    /// Removes every output produced so far (error path).
    fn abort(&mut self) {
        if let Some(writer) = self.current.take() {
            writer.abort();
        }

        for finished in self.finished.drain(..) {
            finished.descriptor.delete_files();
        }
    }
}

/// Runs one compaction task to completion.
///
/// On any error the outputs are removed, references released and the
/// manifest left untouched, so a retry is always safe. A task containing
/// a suspect table is retried once without it after the store dropped the
/// table from the live set.
pub fn run(store: &Store, task: &Task, gc_before: LocalDeletionTime) -> crate::Result<()> {
    match run_inner(store, task, gc_before) {
        Err(Error::Corrupt(generation)) => {
            log::warn!("compaction hit corrupt table {generation}, retrying without it");

            store.drop_corrupt_table(generation)?;

            let remaining: Vec<_> = task
                .tables
                .iter()
                .filter(|t| t.generation() != generation)
                .cloned()
                .collect();

            if remaining.is_empty() {
                return Ok(());
            }

            let retry = Task {
                tables: remaining,
                target_level: task.target_level,
            };

            run_inner(store, &retry, gc_before)
        }
        other => other,
    }
}

#[allow(clippy::too_many_lines)]
fn run_inner(store: &Store, task: &Task, gc_before: LocalDeletionTime) -> crate::Result<()> {
    let start = std::time::Instant::now();

    log::debug!("compacting {task:?} (gc_before={gc_before})");

    let view = store.tracker().current();

    let controller = CompactionController::new(
        &view.tables,
        &task.tables,
        store.schema().clone(),
        store.row_cache().clone(),
        gc_before,
        view.oldest_unflushed_secs(),
        store.config().in_memory_compaction_limit,
        store.config().promoted_block_size,
    );

    let result = (|| -> crate::Result<Vec<Arc<SSTable>>> {
        let mut sources: Vec<BoxedRowIterator<'_, RowHandle>> = vec![];

        for table in &task.tables {
            let iter = table.iter_handles()?;
            sources.push(Box::new(
                iter.map(|item| item.map(|handle| (handle.key.clone(), handle))),
            ));
        }

        let merger = RowMerger::new(sources);
        let mut writers = OutputWriters::new(store, task.generations());

        for group in merger {
            // Checkpoint between rows
            if store.stop_signal().is_stopped() {
                writers.abort();
                return Err(Error::Stopped);
            }

            let (key, handles) = match group {
                Ok(group) => group,
                Err(e) => {
                    writers.abort();
                    return Err(e);
                }
            };

            controller.invalidate_cached_row(&key);

            let step = (|| -> crate::Result<()> {
                let Some(compacted) = controller.compacted_row(key.clone(), handles)? else {
                    return Ok(());
                };

                // Key-cache survival: keys that were hot against any input
                // table are pre-registered for the output table
                let preheat = store.key_cache().as_ref().is_some_and(|cache| {
                    task.tables
                        .iter()
                        .any(|t| cache.contains(t.generation(), &key.key))
                });

                let writer = writers.writer()?;
                let output_generation = writer.descriptor().generation;

                let entry = compacted.write(writer)?;

                if preheat {
                    if let Some(cache) = store.key_cache() {
                        cache.insert(output_generation, &key.key, entry);
                    }
                }

                Ok(())
            })();

            if let Err(e) = step {
                writers.abort();
                return Err(e);
            }
        }

        match writers.finish_all() {
            Ok(outputs) => Ok(outputs),
            Err(e) => {
                writers.abort();
                Err(e)
            }
        }
    })();

    let outputs = match result {
        Ok(outputs) => outputs,
        Err(e) => {
            store.manifest_unmark_compacting(&task.generations());
            return Err(e);
        }
    };

    store.tracker().replace_compacted(&task.tables, &outputs);
    store.manifest_replace(&task.tables, &outputs, task.target_level)?;

    log::info!(
        "compacted {} tables into {} at L{} in {:?}",
        task.tables.len(),
        outputs.len(),
        task.target_level,
        start.elapsed(),
    );

    Ok(())
}
