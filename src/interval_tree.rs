// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{key::Token, sstable::SSTable};
use std::sync::Arc;

/// Static interval tree over the token ranges of a set of sorted tables
///
/// Built once per compaction from the tables *outside* the compaction set;
/// answers "which tables could contain this token" for the purge predicate.
///
/// Flattened representation: intervals sorted by start token with a prefix
/// maximum over end tokens for pruning, instead of a pointer-based tree.
pub struct OverlapTree {
    /// `(first_token, last_token, table)`, sorted by first token
    intervals: Vec<(Token, Token, Arc<SSTable>)>,

    /// `prefix_max_end[i] = max(intervals[0..=i].last_token)`
    prefix_max_end: Vec<Token>,
}

impl OverlapTree {
    #[must_use]
    pub fn new(tables: &[Arc<SSTable>]) -> Self {
        let mut intervals: Vec<_> = tables
            .iter()
            .map(|table| {
                let (first, last) = table.token_range();
                (first, last, table.clone())
            })
            .collect();

        intervals.sort_by_key(|(first, _, _)| *first);

        let mut prefix_max_end = Vec::with_capacity(intervals.len());
        let mut max_end = Token::MIN;

        for (_, last, _) in &intervals {
            max_end = max_end.max(*last);
            prefix_max_end.push(max_end);
        }

        Self {
            intervals,
            prefix_max_end,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// All tables whose token range contains the given token.
    pub fn search(&self, token: Token) -> impl Iterator<Item = &Arc<SSTable>> {
        // Only intervals starting at or before the token can contain it
        let bound = self
            .intervals
            .partition_point(|(first, _, _)| *first <= token);

        // Walk backwards; once the prefix max end drops below the token,
        // no earlier interval can reach it
        let mut matches = vec![];

        for idx in (0..bound).rev() {
            let Some(max_end) = self.prefix_max_end.get(idx) else {
                break;
            };

            if *max_end < token {
                break;
            }

            if let Some((_, last, table)) = self.intervals.get(idx) {
                if *last >= token {
                    matches.push(table);
                }
            }
        }

        matches.into_iter()
    }
}
