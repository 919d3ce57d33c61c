use widetable::{Cell, CommitLog, Config, OrderPreservingPartitioner, ReplayPosition, Row};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
};
use test_log::test;

#[derive(Default)]
struct RecordingCommitLog {
    segment: AtomicI64,
    flushed: Mutex<Vec<ReplayPosition>>,
}

impl CommitLog for RecordingCommitLog {
    fn current_position(&self) -> ReplayPosition {
        ReplayPosition::new(self.segment.fetch_add(1, Ordering::SeqCst), 0)
    }

    fn on_memtable_flush(&self, position: ReplayPosition) {
        #[allow(clippy::expect_used)]
        self.flushed.lock().expect("lock").push(position);
    }
}

#[test]
fn flush_positions_signaled_in_order() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let commit_log = Arc::new(RecordingCommitLog::default());

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .commit_log(commit_log.clone())
        .memtable_threshold(u64::MAX)
        .flush_writers(2)
        .open()?;

    for idx in 0..5 {
        let mut row = Row::new();
        row.cells.push(Cell::live("col", "value", idx));
        store.apply_write(format!("key{idx}").as_str(), row)?;

        store.force_flush()?;
    }

    #[allow(clippy::expect_used)]
    let flushed = commit_log.flushed.lock().expect("lock").clone();

    assert_eq!(5, flushed.len());

    // Monotone non-decreasing, every flush below the signaled position
    // is durably persisted
    for window in flushed.windows(2) {
        assert!(window[0] <= window[1], "positions signaled out of order");
    }

    Ok(())
}
