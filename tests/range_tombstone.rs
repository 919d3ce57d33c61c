use widetable::{
    Cell, Config, DeletionInfo, OrderPreservingPartitioner, QueryFilter, RangeTombstone, Row,
    Slice,
};
use std::sync::Arc;
use test_log::test;

fn live_row(names: &[&str], timestamp: i64) -> Row {
    let mut row = Row::new();
    for name in names {
        row.cells.push(Cell::live(*name, "value", timestamp));
    }
    row
}

#[test]
fn range_tombstone_shadows_covered_columns() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .memtable_threshold(u64::MAX)
        .open()?;

    store.apply_write("key", live_row(&["a", "b", "c", "d", "e"], 1))?;

    // Delete [b, d]
    let mut deletion = DeletionInfo::live();
    deletion.range_tombstones = vec![RangeTombstone::new("b", "d", 2, 1_000)];
    store.apply_write("key", Row {
        deletion,
        cells: vec![],
    })?;

    let check = |store: &widetable::Store| -> widetable::Result<()> {
        #[allow(clippy::expect_used)]
        let row = store
            .get_row("key", &QueryFilter::all())?
            .expect("row exists");

        let names: Vec<_> = row.cells.iter().map(|c| c.name().clone()).collect();
        assert_eq!(names, vec![b"a".into(), b"e".into()] as Vec<Slice>);

        // Named reads agree
        #[allow(clippy::expect_used)]
        let row = store
            .get_row("key", &QueryFilter::names(["a", "c"]))?
            .expect("row exists");
        assert_eq!(1, row.cells.len());

        Ok(())
    };

    // From the memtable...
    check(&store)?;

    // ...from a flushed table...
    store.force_flush()?;
    check(&store)?;

    // ...and after compaction
    store.force_major_compaction()?;
    check(&store)?;

    // Writes newer than the tombstone become visible again
    store.apply_write("key", live_row(&["c"], 3))?;

    #[allow(clippy::expect_used)]
    let row = store
        .get_row("key", &QueryFilter::all())?
        .expect("row exists");
    assert_eq!(3, row.cells.len());

    Ok(())
}

#[test]
fn slice_filter_reads_subrange() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .memtable_threshold(u64::MAX)
        .open()?;

    store.apply_write("key", live_row(&["a", "b", "c", "d", "e"], 1))?;
    store.force_flush()?;

    let filter = QueryFilter::Slice {
        start: "b".into(),
        end: "d".into(),
        reversed: true,
        count: 2,
    };

    #[allow(clippy::expect_used)]
    let row = store.get_row("key", &filter)?.expect("row exists");

    let names: Vec<_> = row.cells.iter().map(|c| c.name().clone()).collect();
    assert_eq!(names, vec![b"d".into(), b"c".into()] as Vec<Slice>);

    Ok(())
}
