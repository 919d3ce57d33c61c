use widetable::{Cell, Config, OrderPreservingPartitioner, Row, SSTableScanner};
use std::sync::Arc;
use test_log::test;

#[test]
fn scanner_position_equals_data_size() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .memtable_threshold(u64::MAX)
        .open()?;

    let value = vec![3u8; 100 * 1_024];

    for key in ["row1", "row2"] {
        let mut row = Row::new();

        for col_idx in 0..10 {
            row.cells.push(Cell::live(
                format!("col{col_idx:02}").as_str(),
                value.as_slice(),
                1,
            ));
        }

        store.apply_write(key, row)?;
    }

    store.force_flush()?;
    store.force_major_compaction()?;

    let tables = store.level_tables(1);
    assert!(!tables.is_empty());

    let expected: u64 = tables.iter().map(|t| t.data_size()).sum();

    let mut scanner = SSTableScanner::new(tables);

    let mut rows = 0;
    for item in scanner.by_ref() {
        item?;
        rows += 1;
    }

    assert_eq!(2, rows);
    assert_eq!(expected, scanner.current_position());

    // Advancing past the end leaves the position at the total
    assert!(scanner.next().is_none());
    assert_eq!(expected, scanner.current_position());

    Ok(())
}
