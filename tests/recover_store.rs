use widetable::{Cell, Config, OrderPreservingPartitioner, QueryFilter, Row};
use std::sync::Arc;
use test_log::test;

#[test]
fn reopened_store_serves_flushed_data() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(folder.path())
            .partitioner(Arc::new(OrderPreservingPartitioner))
            .memtable_threshold(u64::MAX)
            .open()?;

        for key in ["a", "b", "c"] {
            let mut row = Row::new();
            row.cells.push(Cell::live("col", "value", 1));
            store.apply_write(key, row)?;
        }

        store.force_flush()?;
        assert_eq!(1, store.table_count());
    }

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .open()?;

    assert_eq!(1, store.table_count());

    for key in ["a", "b", "c"] {
        #[allow(clippy::expect_used)]
        let row = store
            .get_row(key, &QueryFilter::all())?
            .expect("row should be recovered");
        assert_eq!(1, row.cells.len());
    }

    assert!(store.get_row("nope", &QueryFilter::all())?.is_none());

    Ok(())
}

#[test]
fn reopened_store_keeps_levels() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(folder.path())
            .partitioner(Arc::new(OrderPreservingPartitioner))
            .memtable_threshold(u64::MAX)
            .open()?;

        let mut row = Row::new();
        row.cells.push(Cell::live("col", "value", 1));
        store.apply_write("key", row)?;

        store.force_flush()?;
        store.force_major_compaction()?;

        assert_eq!(1, store.level_count(1));
    }

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .open()?;

    // The leveled layout survived the restart
    assert_eq!(0, store.level_count(0));
    assert_eq!(1, store.level_count(1));

    Ok(())
}

#[test]
fn partitioner_mismatch_refuses_to_open() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(folder.path())
            .partitioner(Arc::new(OrderPreservingPartitioner))
            .memtable_threshold(u64::MAX)
            .open()?;

        let mut row = Row::new();
        row.cells.push(Cell::live("col", "value", 1));
        store.apply_write("key", row)?;
        store.force_flush()?;
    }

    // Default partitioner is xxh3, the table was written order-preserving
    let result = Config::new(folder.path()).open();

    assert!(matches!(
        result,
        Err(widetable::Error::PartitionerMismatch { .. }),
    ));

    Ok(())
}
