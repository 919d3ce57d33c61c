// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

const DEFAULT_BUCKET_COUNT: usize = 90;
const DEFAULT_MAX_BINS: usize = 100;

/// Histogram with fixed, exponentially growing bucket offsets
///
/// Tracks row sizes and column counts in the statistics sidecar. Values
/// larger than the last offset land in an overflow bucket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EstimatedHistogram {
    offsets: Vec<u64>,

    /// One bucket per offset, plus a trailing overflow bucket
    buckets: Vec<u64>,
}

impl Default for EstimatedHistogram {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_COUNT)
    }
}

impl EstimatedHistogram {
    /// Creates a histogram with the given number of buckets.
    #[must_use]
    pub fn new(bucket_count: usize) -> Self {
        let mut offsets = Vec::with_capacity(bucket_count);
        let mut last: u64 = 1;

        for _ in 0..bucket_count {
            offsets.push(last);

            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_precision_loss,
                clippy::cast_sign_loss
            )]
            let next = ((last as f64) * 1.2).round() as u64;

            last = next.max(last + 1);
        }

        Self {
            buckets: vec![0; offsets.len() + 1],
            offsets,
        }
    }

    /// Records a value.
    pub fn add(&mut self, value: u64) {
        let idx = self.offsets.partition_point(|&offset| offset < value);

        #[allow(clippy::indexing_slicing)]
        {
            // NOTE: idx == offsets.len() is the overflow bucket
            self.buckets[idx] += 1;
        }
    }

    /// Number of recorded values.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Mean of the recorded values, estimated by bucket upper bounds.
    #[must_use]
    pub fn mean(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }

        let mut sum: u128 = 0;

        for (idx, &bucket) in self.buckets.iter().enumerate() {
            let offset = self
                .offsets
                .get(idx)
                .or_else(|| self.offsets.last())
                .copied()
                .unwrap_or(1);

            sum += u128::from(bucket) * u128::from(offset);
        }

        #[allow(clippy::cast_possible_truncation)]
        {
            (sum / u128::from(count)) as u64
        }
    }

    /// Largest non-empty bucket offset.
    #[must_use]
    pub fn max(&self) -> u64 {
        for (idx, &bucket) in self.buckets.iter().enumerate().rev() {
            if bucket > 0 {
                return self
                    .offsets
                    .get(idx)
                    .or_else(|| self.offsets.last())
                    .copied()
                    .unwrap_or(0);
            }
        }

        0
    }
}

impl Encode for EstimatedHistogram {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.offsets.len() as u32)?;

        for &offset in &self.offsets {
            writer.write_u64_varint(offset)?;
        }

        for &bucket in &self.buckets {
            writer.write_u64_varint(bucket)?;
        }

        Ok(())
    }
}

impl Decode for EstimatedHistogram {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let len = reader.read_u32_varint()? as usize;

        if len > 10_000 {
            return Err(DecodeError::InvalidLength("EstimatedHistogram"));
        }

        let mut offsets = Vec::with_capacity(len);
        for _ in 0..len {
            offsets.push(reader.read_u64_varint()?);
        }

        let mut buckets = Vec::with_capacity(len + 1);
        for _ in 0..=len {
            buckets.push(reader.read_u64_varint()?);
        }

        Ok(Self { offsets, buckets })
    }
}

/// Bin-compressing streaming histogram
///
/// Records tombstone drop times in the statistics sidecar: once the number
/// of distinct points exceeds `max_bins`, the two closest bins are merged
/// into their weighted midpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamingHistogram {
    max_bins: usize,

    /// (point, count), ordered by point
    bins: Vec<(u64, u64)>,
}

impl Default for StreamingHistogram {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BINS)
    }
}

impl StreamingHistogram {
    #[must_use]
    pub fn new(max_bins: usize) -> Self {
        Self {
            max_bins: max_bins.max(1),
            bins: Vec::new(),
        }
    }

    /// Records a point.
    pub fn update(&mut self, point: u64) {
        match self.bins.binary_search_by_key(&point, |&(p, _)| p) {
            Ok(idx) => {
                #[allow(clippy::indexing_slicing)]
                {
                    self.bins[idx].1 += 1;
                }
            }
            Err(idx) => {
                self.bins.insert(idx, (point, 1));

                if self.bins.len() > self.max_bins {
                    self.compress();
                }
            }
        }
    }

    /// Merges another histogram into this one.
    pub fn merge(&mut self, other: &Self) {
        for &(point, count) in &other.bins {
            match self.bins.binary_search_by_key(&point, |&(p, _)| p) {
                Ok(idx) =>
                {
                    #[allow(clippy::indexing_slicing)]
                    {
                        self.bins[idx].1 += count;
                    }
                }
                Err(idx) => {
                    self.bins.insert(idx, (point, count));

                    if self.bins.len() > self.max_bins {
                        self.compress();
                    }
                }
            }
        }
    }

    /// Merges the two closest bins into their weighted midpoint.
    fn compress(&mut self) {
        let Some(idx) = self
            .bins
            .windows(2)
            .enumerate()
            .min_by_key(|(_, w)| w[1].0 - w[0].0)
            .map(|(idx, _)| idx)
        else {
            return;
        };

        #[allow(clippy::indexing_slicing)]
        {
            let (p1, m1) = self.bins[idx];
            let (p2, m2) = self.bins[idx + 1];

            let total = m1 + m2;
            let merged = (p1 * m1 + p2 * m2) / total;

            self.bins[idx] = (merged, total);
            self.bins.remove(idx + 1);
        }
    }

    /// Estimates the number of recorded points that are below `b`.
    ///
    /// The bin straddling `b` contributes linearly interpolated mass.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sum(&self, b: u64) -> f64 {
        let mut sum = 0.0;
        let mut prev_point = 0u64;

        for &(point, count) in &self.bins {
            if point < b {
                sum += count as f64;
            } else {
                if point > prev_point && b > prev_point {
                    let fraction = (b - prev_point) as f64 / (point - prev_point) as f64;
                    sum += count as f64 * fraction;
                }
                break;
            }

            prev_point = point;
        }

        sum
    }

    #[must_use]
    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    #[must_use]
    pub fn point_count(&self) -> u64 {
        self.bins.iter().map(|&(_, m)| m).sum()
    }
}

impl Encode for StreamingHistogram {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.max_bins as u32)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.bins.len() as u32)?;

        for &(point, count) in &self.bins {
            writer.write_u64_varint(point)?;
            writer.write_u64_varint(count)?;
        }

        Ok(())
    }
}

impl Decode for StreamingHistogram {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let max_bins = reader.read_u32_varint()? as usize;
        let len = reader.read_u32_varint()? as usize;

        if len > max_bins.max(1) {
            return Err(DecodeError::InvalidLength("StreamingHistogram"));
        }

        let mut bins = Vec::with_capacity(len);
        for _ in 0..len {
            let point = reader.read_u64_varint()?;
            let count = reader.read_u64_varint()?;
            bins.push((point, count));
        }

        Ok(Self { max_bins, bins })
    }
}
