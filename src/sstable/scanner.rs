// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{reader::DataIter, SSTable};
use crate::{key::DecoratedKey, row::Row};
use std::sync::Arc;

/// Positional scanner over a set of sorted tables
///
/// Used by validation/repair scans. Reports how many data-file bytes have
/// been consumed: after exhausting the scanner, `current_position()` equals
/// the summed size of all `Data` components of the input set.
pub struct SSTableScanner {
    tables: Vec<Arc<SSTable>>,
    table_idx: usize,

    current: Option<DataIter>,

    /// Bytes of fully consumed tables
    consumed_base: u64,

    total_size: u64,
}

impl SSTableScanner {
    #[must_use]
    pub fn new(tables: Vec<Arc<SSTable>>) -> Self {
        let total_size = tables.iter().map(|t| t.data_size()).sum();

        Self {
            tables,
            table_idx: 0,
            current: None,
            consumed_base: 0,
            total_size,
        }
    }

    /// Data-file bytes read so far.
    #[must_use]
    pub fn current_position(&self) -> u64 {
        self.consumed_base
            + self
                .current
                .as_ref()
                .map_or(0, super::reader::DataIter::position)
    }

    /// Summed size of all `Data` components of the input set.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

impl Iterator for SSTableScanner {
    type Item = crate::Result<(DecoratedKey, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let table = self.tables.get(self.table_idx)?;
                self.current = Some(fail_iter!(table.iter()));
            }

            #[allow(clippy::expect_used)]
            let iter = self.current.as_mut().expect("just installed");

            if let Some(item) = iter.next() {
                return Some(item);
            }

            // Table exhausted; account for it wholesale so that position
            // stays exact even if a table had trailing padding
            self.consumed_base += iter.file_size();
            self.current = None;
            self.table_idx += 1;
        }
    }
}
