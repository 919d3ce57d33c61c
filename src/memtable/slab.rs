// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{cell::Cell, range_tombstone::RangeTombstone, Slice};
use std::sync::atomic::{AtomicU64, Ordering};

/// Region granularity; regions are only ever freed wholesale with the
/// memtable
pub const REGION_SIZE: u64 = 1024 * 1024;

/// Region-accounted allocator for memtable byte strings
///
/// Every key, name and value entering the memtable is deep-copied through
/// this allocator, detaching it from caller-owned buffers. Space is
/// accounted in fixed-size regions; the summed region footprint is a hard
/// lower bound on the memtable's live size, however badly the live-ratio
/// estimate drifts.
pub struct SlabAllocator {
    region_size: u64,
    allocated: AtomicU64,
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new(REGION_SIZE)
    }
}

impl SlabAllocator {
    #[must_use]
    pub fn new(region_size: u64) -> Self {
        Self {
            region_size: region_size.max(1),
            allocated: AtomicU64::new(0),
        }
    }

    /// Deep-copies a byte string into the slab.
    pub fn allocate(&self, bytes: &[u8]) -> Slice {
        self.allocated.fetch_add(bytes.len() as u64, Ordering::AcqRel);
        Slice::new(bytes)
    }

    /// Deep-copies a cell's name and value into the slab.
    #[must_use]
    pub fn allocate_cell(&self, cell: &Cell) -> Cell {
        match cell {
            Cell::Live {
                name,
                value,
                timestamp,
            } => Cell::Live {
                name: self.allocate(name),
                value: self.allocate(value),
                timestamp: *timestamp,
            },
            Cell::Expiring {
                name,
                value,
                timestamp,
                ttl,
                local_deletion_time,
            } => Cell::Expiring {
                name: self.allocate(name),
                value: self.allocate(value),
                timestamp: *timestamp,
                ttl: *ttl,
                local_deletion_time: *local_deletion_time,
            },
            Cell::Deleted {
                name,
                timestamp,
                local_deletion_time,
            } => Cell::Deleted {
                name: self.allocate(name),
                timestamp: *timestamp,
                local_deletion_time: *local_deletion_time,
            },
        }
    }

    /// Deep-copies a range tombstone's bounds into the slab.
    #[must_use]
    pub fn allocate_range_tombstone(&self, rt: &RangeTombstone) -> RangeTombstone {
        RangeTombstone {
            start: self.allocate(&rt.start),
            end: self.allocate(&rt.end),
            timestamp: rt.timestamp,
            local_deletion_time: rt.local_deletion_time,
        }
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Footprint of the slab, rounded up to whole regions.
    ///
    /// A hard lower bound on the owning memtable's live size.
    #[must_use]
    pub fn minimum_size(&self) -> u64 {
        let allocated = self.allocated();

        if allocated == 0 {
            0
        } else {
            allocated.div_ceil(self.region_size) * self.region_size
        }
    }
}
