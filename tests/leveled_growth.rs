use widetable::{Cell, Config, OrderPreservingPartitioner, QueryFilter, Row, Token};
use std::sync::Arc;
use test_log::test;

#[test]
fn leveled_growth_fills_deeper_levels() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .max_sstable_size(64 * 1_024)
        .memtable_threshold(u64::MAX)
        .compaction_threads(1)
        .open()?;

    let value = vec![7u8; 8 * 1_024];

    // One flushed table per partition, all landing in L0
    for key_idx in 0..20 {
        let mut row = Row::new();

        for col_idx in 0..10 {
            row.cells.push(Cell::live(
                format!("col{col_idx:02}").as_str(),
                value.as_slice(),
                1,
            ));
        }

        store.apply_write(format!("key{key_idx:02}").as_str(), row)?;
        store.force_flush()?;
    }

    store.force_major_compaction()?;
    store.force_major_compaction()?;

    // ~1.6 MiB of data against a 320 KiB L1 target must spill into L2
    assert!(store.level_size_bytes(1) > 0, "L1 should hold data");
    assert!(store.level_size_bytes(2) > 0, "L2 should hold data");
    assert_eq!(0, store.level_count(0));

    // Every row is still fully readable
    for key_idx in 0..20 {
        let row = store.get_row(format!("key{key_idx:02}").as_str(), &QueryFilter::all())?;
        assert_eq!(Some(10), row.map(|r| r.cells.len()));
    }

    // A validation scan over the full token range completes
    let root = store
        .submit_validation((Token::MIN, Token::MAX))
        .wait()?;
    assert_ne!([0u8; 32], root);

    Ok(())
}
