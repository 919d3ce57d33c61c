use widetable::{Config, DeletionInfo, OrderPreservingPartitioner, Row, Schema, TableKind};
use std::sync::Arc;
use test_log::test;

/// A batchlog row that is tombstoned and empty is skipped at flush time;
/// if nothing else was written, no table is published at all.
#[test]
fn batchlog_tombstone_only_flush_publishes_nothing() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .schema(Schema {
            kind: TableKind::Batchlog,
            ..Schema::default()
        })
        .memtable_threshold(u64::MAX)
        .open()?;

    // A row tombstone without any preceding live row
    let row = Row {
        deletion: DeletionInfo::deleted_at(5, 1_000),
        cells: vec![],
    };
    store.apply_write("batch1", row)?;

    store.force_flush()?;

    assert_eq!(0, store.table_count());

    // No table files were left behind
    let files = std::fs::read_dir(folder.path())?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().contains("-Data.db"))
        .count();
    assert_eq!(0, files);

    Ok(())
}

/// The same row in a standard table IS flushed: the tombstone must be
/// preserved so replicas can reconcile the deletion.
#[test]
fn standard_tombstone_only_flush_publishes() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .memtable_threshold(u64::MAX)
        .open()?;

    let row = Row {
        deletion: DeletionInfo::deleted_at(5, 1_000),
        cells: vec![],
    };
    store.apply_write("key", row)?;

    store.force_flush()?;

    assert_eq!(1, store.table_count());

    Ok(())
}
