// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    error::Error,
    key::Token,
    sstable::{scanner::SSTableScanner, SSTable},
    stop_signal::StopSignal,
};
use sha2::Digest;
use std::sync::Arc;

/// Stop-signal poll interval, in rows
const POLL_INTERVAL: u64 = 1_000;

/// Digest of a whole-range scan (a repair tree root)
pub type TreeRoot = [u8; 32];

/// Scans every row of the given tables within the token range and folds
/// the row digests into a single root hash.
///
/// Used by repair to compare data between replicas; rows hash in
/// partition order per table set, so equal data yields equal roots.
/// The stop signal is observed through a gate polling every
/// [`POLL_INTERVAL`] rows.
pub fn validate(
    tables: Vec<Arc<SSTable>>,
    range: (Token, Token),
    stop: &StopSignal,
) -> crate::Result<TreeRoot> {
    let (lo, hi) = range;

    let mut scanner = SSTableScanner::new(tables);
    let mut hasher = sha2::Sha256::new();
    let mut gate = stop.gate(POLL_INTERVAL);
    let mut rows: u64 = 0;

    for item in scanner.by_ref() {
        let (key, row) = item?;

        if key.token >= lo && key.token <= hi {
            hasher.update(&key.key);
            hasher.update(row.digest());
        }

        rows += 1;

        if gate.is_stopped() {
            return Err(Error::Stopped);
        }
    }

    debug_assert_eq!(
        scanner.total_size(),
        scanner.current_position(),
        "scan must consume every data byte",
    );

    log::debug!("validated {rows} rows in token range [{lo}, {hi}]");

    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        partitioner::{OrderPreservingPartitioner, Partitioner},
        replay::ReplayPosition,
        schema::Schema,
        sstable::{
            writer::{TableWriter, WriterOptions},
            Descriptor, FormatVersion,
        },
        Cell, ClusteringComparator, Row,
    };
    use test_log::test;

    fn build_table(
        dir: &std::path::Path,
        generation: u32,
        keys: &[&str],
    ) -> crate::Result<Arc<SSTable>> {
        let partitioner: Arc<dyn Partitioner> = Arc::new(OrderPreservingPartitioner);
        let schema = Arc::new(Schema::default());

        let mut writer = TableWriter::new(
            Descriptor::new("ks", "cf", generation, FormatVersion::CURRENT, dir),
            schema.clone(),
            partitioner.clone(),
            WriterOptions::default(),
            ReplayPosition::NONE,
            vec![],
        )?;

        for key in keys {
            let mut row = Row::new();
            row.upsert(
                Cell::live("col", "v", 1),
                &ClusteringComparator::Bytes,
                false,
            );
            writer.append_row(&partitioner.decorate((*key).into()), &row)?;
        }

        #[allow(clippy::expect_used)]
        let finished = writer.finish()?.expect("should publish");

        Ok(Arc::new(SSTable::from_finished(
            finished, schema, partitioner, None,
        )?))
    }

    #[test]
    fn equal_data_yields_equal_roots() -> crate::Result<()> {
        let dir_a = tempfile::tempdir()?;
        let dir_b = tempfile::tempdir()?;

        let a = build_table(dir_a.path(), 1, &["k1", "k2"])?;
        let b = build_table(dir_b.path(), 7, &["k1", "k2"])?;

        let stop = StopSignal::default();
        let full = (Token::MIN, Token::MAX);

        let root_a = validate(vec![a], full, &stop)?;
        let root_b = validate(vec![b], full, &stop)?;

        assert_eq!(root_a, root_b);

        Ok(())
    }

    #[test]
    fn different_data_yields_different_roots() -> crate::Result<()> {
        let dir_a = tempfile::tempdir()?;
        let dir_b = tempfile::tempdir()?;

        let a = build_table(dir_a.path(), 1, &["k1"])?;
        let b = build_table(dir_b.path(), 1, &["k2"])?;

        let stop = StopSignal::default();
        let full = (Token::MIN, Token::MAX);

        assert_ne!(
            validate(vec![a], full, &stop)?,
            validate(vec![b], full, &stop)?,
        );

        Ok(())
    }

    #[test]
    fn range_restricts_hashed_rows() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let partitioner = OrderPreservingPartitioner;

        let table = build_table(dir.path(), 1, &["a", "z"])?;
        let stop = StopSignal::default();

        // Range covering only "a"
        let only_a = (
            partitioner.token(b"a"),
            partitioner.token(b"a"),
        );

        let dir_b = tempfile::tempdir()?;
        let just_a = build_table(dir_b.path(), 1, &["a"])?;

        assert_eq!(
            validate(vec![table], only_a, &stop)?,
            validate(vec![just_a], (Token::MIN, Token::MAX), &stop)?,
        );

        Ok(())
    }
}
