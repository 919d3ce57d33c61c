// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Task, MAX_COMPACTING_L0, MAX_LEVELS};
use crate::{
    file::rewrite_atomic,
    key::DecoratedKey,
    sstable::{Generation, SSTable},
};
use rustc_hash::FxHashSet;
use std::{path::PathBuf, sync::Arc};

/// L0 is compacted when it holds at least this many tables
const L0_TRIGGER: usize = 4;

/// The invariant-bearing layout of sorted tables across levels
///
/// L0 receives flushed tables and may contain overlapping key ranges;
/// every level below is a non-overlapping partition of the key space,
/// kept ordered by first key. The generation → level assignment is
/// persisted next to the data files and re-applied on startup.
pub struct LeveledManifest {
    levels: Vec<Vec<Arc<SSTable>>>,

    /// Round-robin cursor per level: the last key bound that was compacted
    last_compacted: Vec<Option<DecoratedKey>>,

    /// Generations currently part of a running compaction; excluded from
    /// scoring and candidate selection
    compacting: FxHashSet<Generation>,

    max_sstable_size: u64,
    fanout: u64,

    path: PathBuf,
}

impl LeveledManifest {
    #[must_use]
    pub fn new(max_sstable_size: u64, fanout: u64, path: PathBuf) -> Self {
        Self {
            levels: (0..MAX_LEVELS).map(|_| Vec::new()).collect(),
            last_compacted: (0..MAX_LEVELS).map(|_| None).collect(),
            compacting: FxHashSet::default(),
            max_sstable_size: max_sstable_size.max(1),
            fanout: fanout.max(2),
            path,
        }
    }

    /// Rebuilds the manifest from the persisted generation → level map.
    ///
    /// Tables without an assignment, or whose assignment would violate
    /// the non-overlap invariant, are demoted to L0.
    pub fn load(
        max_sstable_size: u64,
        fanout: u64,
        path: PathBuf,
        tables: &[Arc<SSTable>],
    ) -> crate::Result<Self> {
        let mut manifest = Self::new(max_sstable_size, fanout, path);

        let mut assignment = rustc_hash::FxHashMap::default();

        if manifest.path.try_exists()? {
            let content = std::fs::read_to_string(&manifest.path)?;

            for line in content.lines() {
                let Some((generation, level)) = line.split_once(' ') else {
                    continue;
                };

                if let (Ok(generation), Ok(level)) =
                    (generation.parse::<Generation>(), level.parse::<usize>())
                {
                    assignment.insert(generation, level.min(MAX_LEVELS - 1));
                }
            }
        }

        for table in tables {
            let level = assignment.get(&table.generation()).copied().unwrap_or(0);

            if level > 0 && manifest.would_overlap(level, table) {
                log::warn!(
                    "table {} would overlap in L{level}; demoting to L0",
                    table.descriptor,
                );
                manifest.insert(0, table.clone());
            } else {
                manifest.insert(level, table.clone());
            }
        }

        manifest.persist()?;

        Ok(manifest)
    }

    fn would_overlap(&self, level: usize, table: &Arc<SSTable>) -> bool {
        self.levels
            .get(level)
            .is_some_and(|tables| tables.iter().any(|t| t.overlaps(table)))
    }

    fn insert(&mut self, level: usize, table: Arc<SSTable>) {
        let Some(tables) = self.levels.get_mut(level) else {
            return;
        };

        if level == 0 {
            tables.push(table);
        } else {
            let idx =
                tables.partition_point(|t| t.first_key() < table.first_key());
            tables.insert(idx, table);
        }
    }

    /// Registers a freshly flushed table in L0.
    pub fn add_flushed(&mut self, table: Arc<SSTable>) -> crate::Result<()> {
        self.insert(0, table);
        self.persist()
    }

    /// Drops a table (corruption path); levels keep their order.
    pub fn remove(&mut self, generation: Generation) -> crate::Result<()> {
        for tables in &mut self.levels {
            tables.retain(|t| t.generation() != generation);
        }

        self.compacting.remove(&generation);
        self.persist()
    }

    /// Applies a compaction result: inputs out, outputs into the target
    /// level, first-key order preserved.
    ///
    /// # Panics
    ///
    /// Panics if the result violates the non-overlap invariant of any
    /// affected level - that is a compaction bug, not a recoverable state.
    pub fn replace(
        &mut self,
        inputs: &[Arc<SSTable>],
        outputs: &[Arc<SSTable>],
        target_level: usize,
    ) -> crate::Result<()> {
        let input_gens: FxHashSet<Generation> =
            inputs.iter().map(|t| t.generation()).collect();

        for tables in &mut self.levels {
            tables.retain(|t| !input_gens.contains(&t.generation()));
        }

        for output in outputs {
            self.insert(target_level.min(MAX_LEVELS - 1), output.clone());
        }

        for generation in &input_gens {
            self.compacting.remove(generation);
        }

        self.assert_disjoint();
        self.persist()
    }

    /// Verifies the non-overlap invariant of every level above L0.
    pub fn assert_disjoint(&self) {
        for (level, tables) in self.levels.iter().enumerate().skip(1) {
            for pair in tables.windows(2) {
                let (Some(a), Some(b)) = (pair.first(), pair.get(1)) else {
                    continue;
                };

                assert!(
                    a.last_key() < b.first_key(),
                    "overlap in L{level}: {} and {}",
                    a.descriptor,
                    b.descriptor,
                );
            }
        }
    }

    fn persist(&self) -> crate::Result<()> {
        let mut content = String::new();

        for (level, tables) in self.levels.iter().enumerate() {
            for table in tables {
                content.push_str(&format!("{} {level}\n", table.generation()));
            }
        }

        rewrite_atomic(&self.path, content.as_bytes())?;
        Ok(())
    }

    #[must_use]
    pub fn level_tables(&self, level: usize) -> Vec<Arc<SSTable>> {
        self.levels.get(level).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn level_count(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn level_size_bytes(&self, level: usize) -> u64 {
        self.levels
            .get(level)
            .map_or(0, |tables| tables.iter().map(|t| t.data_size()).sum())
    }

    #[must_use]
    pub fn all_tables(&self) -> Vec<Arc<SSTable>> {
        self.levels.iter().flatten().cloned().collect()
    }

    /// The level a generation currently belongs to.
    #[must_use]
    pub fn level_of(&self, generation: Generation) -> Option<usize> {
        self.levels
            .iter()
            .position(|tables| tables.iter().any(|t| t.generation() == generation))
    }

    pub fn mark_compacting(&mut self, generations: &[Generation]) {
        self.compacting.extend(generations.iter().copied());
    }

    pub fn unmark_compacting(&mut self, generations: &[Generation]) {
        for generation in generations {
            self.compacting.remove(generation);
        }
    }

    fn target_size(&self, level: usize) -> u64 {
        debug_assert!(level >= 1);

        let base = 5 * self.max_sstable_size;
        base * self.fanout.pow((level - 1) as u32)
    }

    /// `size / target` per level; L0 is scored by table count.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self, level: usize) -> f64 {
        let Some(tables) = self.levels.get(level) else {
            return 0.0;
        };

        // Tables already being compacted are spoken for
        let eligible = tables
            .iter()
            .filter(|t| !self.compacting.contains(&t.generation()));

        if level == 0 {
            eligible.count() as f64 / L0_TRIGGER as f64
        } else {
            let bytes: u64 = eligible.map(|t| t.data_size()).sum();
            bytes as f64 / self.target_size(level) as f64
        }
    }

    /// Picks the next compaction task: the level with the highest
    /// score >= 1 wins, ties go to the lowest level.
    pub fn next_task(&mut self) -> Option<Task> {
        let mut best: Option<(usize, f64)> = None;

        for level in 0..MAX_LEVELS {
            let score = self.score(level);

            if score >= 1.0 && best.is_none_or(|(_, s)| score > s) {
                best = Some((level, score));
            }
        }

        let (level, score) = best?;

        log::debug!("L{level} has score {score:.2}, picking candidates");

        let task = if level == 0 {
            self.l0_task()
        } else {
            self.leveled_task(level)
        };

        if let Some(task) = &task {
            self.mark_compacting(&task.generations());
        }

        task
    }

    /// A forced task over every live, non-compacting table.
    #[must_use]
    pub fn major_task(&self) -> Option<Task> {
        let tables: Vec<_> = self
            .levels
            .iter()
            .flatten()
            .filter(|t| !self.compacting.contains(&t.generation()))
            .cloned()
            .collect();

        if tables.is_empty() {
            return None;
        }

        Some(Task {
            tables,
            target_level: 1,
        })
    }

    /// L0 compaction: an overlap-closure of up to [`MAX_COMPACTING_L0`]
    /// L0 tables, plus every L1 table overlapping their union.
    fn l0_task(&self) -> Option<Task> {
        let mut l0: Vec<_> = self
            .levels
            .first()?
            .iter()
            .filter(|t| !self.compacting.contains(&t.generation()))
            .cloned()
            .collect();

        // Oldest first, so the backlog drains fairly
        l0.sort_by_key(|t| t.generation());

        let seed = l0.first()?.clone();

        let mut set = vec![seed];

        // Grow the set by transitive overlap
        loop {
            if set.len() >= MAX_COMPACTING_L0 {
                break;
            }

            let (min, max) = set_bounds(&set);

            let next = l0.iter().find(|t| {
                !set.iter().any(|s| s.generation() == t.generation())
                    && *t.first_key() <= max
                    && min <= *t.last_key()
            });

            match next {
                Some(table) => set.push(table.clone()),
                None => break,
            }
        }

        let (min, max) = set_bounds(&set);

        let next_level: Vec<_> = self
            .levels
            .get(1)?
            .iter()
            .filter(|t| *t.first_key() <= max && min <= *t.last_key())
            .cloned()
            .collect();

        if next_level
            .iter()
            .any(|t| self.compacting.contains(&t.generation()))
        {
            // Blocked by an on-going compaction into L1
            return None;
        }

        set.extend(next_level);

        Some(Task {
            tables: set,
            target_level: 1,
        })
    }

    /// Lk -> Lk+1 compaction: one Lk table picked round-robin, plus every
    /// Lk+1 table it overlaps.
    fn leveled_task(&mut self, level: usize) -> Option<Task> {
        let tables: Vec<_> = self
            .levels
            .get(level)?
            .iter()
            .filter(|t| !self.compacting.contains(&t.generation()))
            .cloned()
            .collect();

        if tables.is_empty() {
            return None;
        }

        // Resume after the bound that was compacted last; wrap around
        let cursor = self.last_compacted.get(level).cloned().flatten();

        let start = cursor.map_or(0, |bound| {
            tables.partition_point(|t| *t.first_key() <= bound)
        });

        for offset in 0..tables.len() {
            let idx = (start + offset) % tables.len();
            let Some(picked) = tables.get(idx) else {
                continue;
            };

            let overlaps: Vec<_> = self
                .levels
                .get(level + 1)
                .map(|next| {
                    next.iter()
                        .filter(|t| {
                            t.first_key() <= picked.last_key()
                                && picked.first_key() <= t.last_key()
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            if overlaps
                .iter()
                .any(|t| self.compacting.contains(&t.generation()))
            {
                continue;
            }

            if let Some(slot) = self.last_compacted.get_mut(level) {
                *slot = Some(picked.last_key().clone());
            }

            let mut set = vec![picked.clone()];
            set.extend(overlaps);

            return Some(Task {
                tables: set,
                target_level: level + 1,
            });
        }

        None
    }
}

fn set_bounds(set: &[Arc<SSTable>]) -> (DecoratedKey, DecoratedKey) {
    #[allow(clippy::expect_used)]
    let first = set.first().expect("set is never empty");

    let mut min = first.first_key().clone();
    let mut max = first.last_key().clone();

    for table in set {
        if table.first_key() < &min {
            min = table.first_key().clone();
        }
        if table.last_key() > &max {
            max = table.last_key().clone();
        }
    }

    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::KeyCache,
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
        generation: Generation,
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

        let mut keys = keys.to_vec();
        keys.sort_unstable();

        for key in keys {
            let mut row = Row::new();
            row.upsert(
                Cell::live("col", "v", 1),
                &ClusteringComparator::Bytes,
                false,
            );
            writer.append_row(&partitioner.decorate(key.into()), &row)?;
        }

        #[allow(clippy::expect_used)]
        let finished = writer.finish()?.expect("should publish");

        Ok(Arc::new(SSTable::from_finished(
            finished,
            schema,
            partitioner,
            None::<Arc<KeyCache>>,
        )?))
    }

    fn manifest(dir: &std::path::Path) -> LeveledManifest {
        LeveledManifest::new(1_024 * 1_024, 10, dir.join("leveled.manifest"))
    }

    #[test]
    fn l0_triggers_by_count() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut m = manifest(dir.path());

        for generation in 1..=3 {
            m.add_flushed(build_table(dir.path(), generation, &["a", "z"])?)?;
        }

        assert!(m.next_task().is_none());

        m.add_flushed(build_table(dir.path(), 4, &["a", "z"])?)?;

        #[allow(clippy::expect_used)]
        let task = m.next_task().expect("L0 is at trigger");
        assert_eq!(4, task.tables.len());
        assert_eq!(1, task.target_level);

        // Candidates are now marked compacting; no second task
        assert!(m.next_task().is_none());

        Ok(())
    }

    #[test]
    fn l0_task_pulls_overlapping_l1() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut m = manifest(dir.path());

        // Two disjoint L1 tables
        let l1_left = build_table(dir.path(), 10, &["a", "c"])?;
        let l1_right = build_table(dir.path(), 11, &["x", "z"])?;
        m.replace(&[], &[l1_left, l1_right], 1)?;

        // Four L0 tables confined to the left half
        for generation in 1..=4 {
            m.add_flushed(build_table(dir.path(), generation, &["a", "b"])?)?;
        }

        #[allow(clippy::expect_used)]
        let task = m.next_task().expect("L0 is at trigger");

        // 4 x L0 + the left L1 table; the right one does not overlap
        assert_eq!(5, task.tables.len());
        assert!(task.generations().contains(&10));
        assert!(!task.generations().contains(&11));

        Ok(())
    }

    #[test]
    fn replace_moves_tables_between_levels() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut m = manifest(dir.path());

        let input = build_table(dir.path(), 1, &["a", "z"])?;
        m.add_flushed(input.clone())?;
        assert_eq!(1, m.level_count(0));

        let out_left = build_table(dir.path(), 2, &["a", "m"])?;
        let out_right = build_table(dir.path(), 3, &["n", "z"])?;

        m.replace(&[input], &[out_left, out_right], 1)?;

        assert_eq!(0, m.level_count(0));
        assert_eq!(2, m.level_count(1));
        assert_eq!(Some(1), m.level_of(2));
        assert_eq!(Some(1), m.level_of(3));

        Ok(())
    }

    #[test]
    #[should_panic(expected = "overlap in L1")]
    fn replace_panics_on_overlap() {
        #[allow(clippy::expect_used)]
        let dir = tempfile::tempdir().expect("tempdir");
        let mut m = manifest(dir.path());

        #[allow(clippy::expect_used)]
        let a = build_table(dir.path(), 1, &["a", "m"]).expect("table");
        #[allow(clippy::expect_used)]
        let b = build_table(dir.path(), 2, &["g", "z"]).expect("table");

        let _ = m.replace(&[], &[a, b], 1);
    }

    #[test]
    fn manifest_persists_levels() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("leveled.manifest");

        let t1 = build_table(dir.path(), 1, &["a", "m"])?;
        let t2 = build_table(dir.path(), 2, &["n", "z"])?;

        {
            let mut m = LeveledManifest::new(1_024, 10, path.clone());
            m.replace(&[], &[t1.clone(), t2.clone()], 2)?;
        }

        let m = LeveledManifest::load(1_024, 10, path, &[t1, t2])?;
        assert_eq!(2, m.level_count(2));
        assert_eq!(0, m.level_count(0));

        Ok(())
    }

    #[test]
    fn load_demotes_overlapping_assignment() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("leveled.manifest");

        let t1 = build_table(dir.path(), 1, &["a", "m"])?;
        let t2 = build_table(dir.path(), 2, &["g", "z"])?;

        // Claim both live in L1, which cannot be true
        std::fs::write(&path, "1 1\n2 1\n")?;

        let m = LeveledManifest::load(1_024, 10, path, &[t1, t2])?;

        assert_eq!(1, m.level_count(1));
        assert_eq!(1, m.level_count(0));
        m.assert_disjoint();

        Ok(())
    }

    #[test]
    fn major_task_covers_everything() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut m = manifest(dir.path());

        m.add_flushed(build_table(dir.path(), 1, &["a", "b"])?)?;

        let l1 = build_table(dir.path(), 2, &["c", "d"])?;
        m.replace(&[], &[l1], 1)?;

        #[allow(clippy::expect_used)]
        let task = m.major_task().expect("tables exist");
        assert_eq!(2, task.tables.len());

        Ok(())
    }

    #[test]
    fn leveled_task_round_robin() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        // Tiny max size: L1 target = 5 bytes, always over
        let mut m = LeveledManifest::new(1, 10, dir.path().join("leveled.manifest"));

        let a = build_table(dir.path(), 1, &["a", "c"])?;
        let b = build_table(dir.path(), 2, &["d", "f"])?;
        m.replace(&[], &[a, b], 1)?;

        #[allow(clippy::expect_used)]
        let first = m.next_task().expect("L1 over target");
        assert_eq!(2, first.target_level);
        assert_eq!(vec![1], first.generations());
        m.unmark_compacting(&first.generations());

        // Cursor advanced: next pick rotates to the other table
        #[allow(clippy::expect_used)]
        let second = m.next_task().expect("L1 still over target");
        assert_eq!(vec![2], second.generations());

        Ok(())
    }
}
