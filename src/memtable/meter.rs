// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Memtable;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Gate ensuring at most one live-ratio metering is pending per store;
/// later submissions while one is in flight are dropped
#[derive(Default)]
pub struct MeteringGate(AtomicBool);

impl MeteringGate {
    /// Tries to claim the gate; `false` means a metering is already pending.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Walks the memtable and recalibrates its live ratio.
///
/// Runs on the executor's single metering thread; the walk holds each
/// row lock only briefly.
#[allow(clippy::cast_precision_loss)]
pub fn meter_live_ratio(memtable: &Arc<Memtable>) {
    let serialized = memtable.serialized_size();

    if serialized == 0 {
        return;
    }

    let deep = memtable.deep_size();
    let ratio = deep as f64 / serialized as f64;

    memtable.set_live_ratio(ratio);

    log::trace!(
        "metered live ratio {:.2} (deep={deep}, serialized={serialized})",
        memtable.live_ratio(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        partitioner::{OrderPreservingPartitioner, Partitioner},
        secondary_index::{NoIndexes, SecondaryIndexManager},
        Cell, Row, Schema,
    };
    use test_log::test;

    #[test]
    fn metering_gate_single_pending() {
        let gate = MeteringGate::default();

        assert!(gate.try_claim());
        assert!(!gate.try_claim());

        gate.release();
        assert!(gate.try_claim());
    }

    #[test]
    fn metering_updates_ratio() {
        let memtable = Arc::new(Memtable::new());
        let partitioner = OrderPreservingPartitioner;
        let schema = Schema::default();
        let indexes = NoIndexes;

        let key = partitioner.decorate("key".into());

        let mut row = Row::new();
        row.cells.push(Cell::live("col", "value", 1));
        memtable.put(&key, row, &schema, &*indexes.updater_for(&key));

        meter_live_ratio(&memtable);

        // The walked ratio must be inside the clamp window
        let ratio = memtable.live_ratio();
        assert!(ratio >= 1.0);
        assert!(ratio <= 64.0);
    }

    #[test]
    fn metering_empty_memtable_is_noop() {
        let memtable = Arc::new(Memtable::new());
        let before = memtable.live_ratio();

        meter_live_ratio(&memtable);

        assert!((memtable.live_ratio() - before).abs() < f64::EPSILON);
    }
}
