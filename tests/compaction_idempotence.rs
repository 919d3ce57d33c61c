use widetable::{Cell, Config, OrderPreservingPartitioner, Row};
use std::sync::Arc;
use test_log::test;

/// Compacting a single table with no overlaps and no droppable tombstones
/// reproduces its data file byte for byte.
#[test]
fn single_table_compaction_is_byte_identical() -> widetable::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(folder.path())
        .partitioner(Arc::new(OrderPreservingPartitioner))
        .memtable_threshold(u64::MAX)
        .open()?;

    for key_idx in 0..10 {
        let mut row = Row::new();

        for col_idx in 0..20 {
            row.cells.push(Cell::live(
                format!("col{col_idx:02}").as_str(),
                format!("value-{key_idx}-{col_idx}").as_str(),
                42,
            ));
        }

        // A cell tombstone that is NOT droppable (gc_before stays at 0)
        row.cells.push(Cell::deleted("zzz", 43, u32::MAX));

        store.apply_write(format!("key{key_idx:02}").as_str(), row)?;
    }

    store.force_flush()?;

    let tables = store.level_tables(0);
    assert_eq!(1, tables.len());

    #[allow(clippy::expect_used)]
    let input = tables.first().expect("one table");
    let input_generation = input.generation();

    let input_bytes = std::fs::read(
        input
            .descriptor
            .path(widetable::sstable::Component::Data),
    )?;

    store.compact_tables(&[input_generation], /* gc_before */ 0)?;

    let tables = store.level_tables(0);
    assert_eq!(1, tables.len());

    #[allow(clippy::expect_used)]
    let output = tables.first().expect("one table");
    assert_ne!(input_generation, output.generation());

    let output_bytes = std::fs::read(
        output
            .descriptor
            .path(widetable::sstable::Component::Data),
    )?;

    assert_eq!(input_bytes, output_bytes);

    // The ancestry records where the output came from
    assert_eq!(vec![input_generation], output.stats.ancestors);

    Ok(())
}
