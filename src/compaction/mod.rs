// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Leveled compaction: candidate selection, merge execution, purge control

pub mod controller;
pub mod leveled;
pub mod row;
pub mod worker;

use crate::sstable::{Generation, SSTable};
use std::sync::Arc;

/// Upper bound on L0 tables pulled into a single L0 -> L1 compaction
pub const MAX_COMPACTING_L0: usize = 32;

/// Number of levels (L0..=L8)
pub const MAX_LEVELS: usize = 9;

/// One unit of compaction work: merge `tables` into `target_level`
#[derive(Clone)]
pub struct Task {
    pub tables: Vec<Arc<SSTable>>,
    pub target_level: usize,
}

impl Task {
    #[must_use]
    pub fn generations(&self) -> Vec<Generation> {
        self.tables.iter().map(|t| t.generation()).collect()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.tables.iter().map(|t| t.data_size()).sum()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Task({:?} -> L{}, {} bytes)",
            self.generations(),
            self.target_level,
            self.total_bytes(),
        )
    }
}
