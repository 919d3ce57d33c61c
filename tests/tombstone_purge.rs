use widetable::{
    Cell, Config, OrderPreservingPartitioner, Partitioner, QueryFilter, Row, Schema,
};
use std::sync::Arc;
use test_log::test;

fn schema() -> Schema {
    Schema {
        gc_grace_seconds: 0,
        ..Schema::default()
    }
}

#[test]
fn tombstone_purged_without_overlap() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .schema(schema())
        .memtable_threshold(u64::MAX)
        .open()?;

    // Insert, flush
    let mut row = Row::new();
    row.cells.push(Cell::live("c", "v", 1));
    store.apply_write("key", row)?;
    store.force_flush()?;

    // Delete the column, flush; both tables now sit in L0
    let mut row = Row::new();
    row.cells.push(Cell::deleted("c", 2, 1_000));
    store.apply_write("key", row)?;
    store.force_flush()?;

    assert_eq!(2, store.level_count(0));

    let generations: Vec<_> = store
        .level_tables(0)
        .iter()
        .map(|t| t.generation())
        .collect();

    // No table outside the set contains the key, and gc_before is past
    // the tombstone's deletion time: column and tombstone both drop
    store.compact_tables(&generations, /* gc_before */ 2_000)?;

    assert_eq!(0, store.table_count(), "the row should purge to nothing");
    assert!(store.get_row("key", &QueryFilter::all())?.is_none());

    Ok(())
}

#[test]
fn tombstone_kept_when_gc_grace_holds() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .schema(schema())
        .memtable_threshold(u64::MAX)
        .open()?;

    let mut row = Row::new();
    row.cells.push(Cell::live("c", "v", 1));
    store.apply_write("key", row)?;
    store.force_flush()?;

    let mut row = Row::new();
    row.cells.push(Cell::deleted("c", 2, 1_000));
    store.apply_write("key", row)?;
    store.force_flush()?;

    let generations: Vec<_> = store
        .level_tables(0)
        .iter()
        .map(|t| t.generation())
        .collect();

    // gc_before below the tombstone's deletion time: the tombstone stays
    store.compact_tables(&generations, /* gc_before */ 500)?;

    assert_eq!(1, store.table_count());

    let tables = store.level_tables(0);
    #[allow(clippy::expect_used)]
    let output = tables.first().expect("one output");

    let partitioner = OrderPreservingPartitioner;
    #[allow(clippy::expect_used)]
    let raw = output
        .read_row(&partitioner.decorate("key".into()))?
        .expect("row exists");

    assert_eq!(1, raw.cells.len());
    assert!(raw.cells.first().is_some_and(Cell::is_tombstone));

    // The shadowed column stays invisible
    assert!(store.get_row("key", &QueryFilter::all())?.is_none());

    Ok(())
}
