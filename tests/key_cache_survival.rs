use widetable::{Cell, Config, OrderPreservingPartitioner, QueryFilter, Row};
use std::sync::Arc;
use test_log::test;

#[test]
fn key_cache_survives_compaction() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .memtable_threshold(u64::MAX)
        .row_cache_capacity(0)
        .open()?;

    for key in ["key1", "key2"] {
        let mut row = Row::new();
        row.cells.push(Cell::live("col", "value", 1));
        store.apply_write(key, row)?;
    }

    store.force_flush()?;

    #[allow(clippy::expect_used)]
    let key_cache = store.key_cache().clone().expect("key cache enabled");
    assert_eq!(0, key_cache.len());

    // Reads populate the cache through the index lookup
    assert!(store.get_row("key1", &QueryFilter::all())?.is_some());
    assert!(store.get_row("key2", &QueryFilter::all())?.is_some());
    assert_eq!(2, key_cache.len());

    // Compaction pre-registers entries for the output table, so hot keys
    // stay hot: old + new entries coexist
    store.force_major_compaction()?;
    assert_eq!(4, key_cache.len());

    // Re-reads hit the new table's entries without growing the cache
    assert!(store.get_row("key1", &QueryFilter::all())?.is_some());
    assert!(store.get_row("key2", &QueryFilter::all())?.is_some());
    assert_eq!(4, key_cache.len());

    Ok(())
}
