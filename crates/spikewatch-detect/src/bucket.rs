//! Global rank-bucket baseline.
//!
//! Ranked samples of every feed are grouped into buckets of `bucket_size`
//! consecutive ranks (ranks 1-5, 6-10, ... with the default size). Each bucket
//! gets its own robust baseline, which serves as the peer cohort for feeds
//! without a usable history of their own.
//!
//! The baseline is built once per evaluation cycle and shared read-only by
//! every feed evaluated in that cycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use spikewatch_core::constants::MAX_RANK;
use spikewatch_core::types::{Baseline, GlobalRankSample};

use crate::config::DetectConfig;
use crate::stats::baseline_of;

/// How the bucket for a sample was chosen.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketSelection {
    pub bucket: usize,
    /// `true` when the sample had no rank and the bucket was picked by nearest median.
    pub inferred: bool,
}

/// Per-bucket robust baselines over the global lookback window.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GlobalBaseline {
    bucket_size: u32,
    num_buckets: usize,
    /// Only non-empty buckets are present.
    buckets: BTreeMap<usize, Baseline>,
}

impl Default for GlobalBaseline {
    fn default() -> Self {
        Self::from_buckets(&DetectConfig::default(), BTreeMap::new())
    }
}

impl GlobalBaseline {
    /// Group `samples` into rank buckets and compute a baseline per bucket.
    ///
    /// Samples with a rank outside `1..=MAX_RANK` are ignored.
    pub fn compute(samples: &[GlobalRankSample], cfg: &DetectConfig) -> Self {
        let bucket_size = cfg.bucket_size.max(1);
        let mut grouped: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
        for s in samples {
            if s.rank < 1 || s.rank as u32 > MAX_RANK {
                continue;
            }
            let bucket = ((s.rank as u32 - 1) / bucket_size) as usize;
            grouped.entry(bucket).or_default().push(s.listener_count);
        }

        let buckets = grouped
            .into_iter()
            .map(|(bucket, counts)| (bucket, baseline_of(counts)))
            .collect();

        Self {
            bucket_size,
            num_buckets: cfg.num_buckets(),
            buckets,
        }
    }

    /// Build directly from per-bucket baselines.
    pub fn from_buckets(cfg: &DetectConfig, buckets: BTreeMap<usize, Baseline>) -> Self {
        Self {
            bucket_size: cfg.bucket_size.max(1),
            num_buckets: cfg.num_buckets(),
            buckets,
        }
    }

    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    /// Baselines of all non-empty buckets, ascending by bucket index.
    pub fn buckets(&self) -> &BTreeMap<usize, Baseline> {
        &self.buckets
    }

    pub fn get(&self, bucket: usize) -> Option<&Baseline> {
        self.buckets.get(&bucket)
    }

    /// Bucket of a ranked sample, clamped into the valid bucket range.
    pub fn bucket_for_rank(&self, rank: i32) -> usize {
        let rank = rank.clamp(1, MAX_RANK as i32) as u32;
        let bucket = ((rank - 1) / self.bucket_size) as usize;
        bucket.min(self.num_buckets.saturating_sub(1))
    }

    /// Bucket whose median is numerically closest to `listener_count`.
    ///
    /// Ties go to the lowest bucket index. Returns `None` when no bucket has data.
    pub fn infer_bucket(&self, listener_count: u32) -> Option<usize> {
        let x = f64::from(listener_count);
        let mut best: Option<(usize, f64)> = None;
        for (&bucket, baseline) in &self.buckets {
            if baseline.sample_count == 0 {
                continue;
            }
            let distance = (x - baseline.median).abs();
            match best {
                Some((_, d)) if distance >= d => {}
                _ => best = Some((bucket, distance)),
            }
        }
        best.map(|(bucket, _)| bucket)
    }

    /// Select the bucket for the current sample of a feed.
    pub fn select(&self, rank: Option<i32>, listener_count: u32) -> Option<BucketSelection> {
        match rank {
            Some(r) => Some(BucketSelection {
                bucket: self.bucket_for_rank(r),
                inferred: false,
            }),
            None => self.infer_bucket(listener_count).map(|bucket| BucketSelection {
                bucket,
                inferred: true,
            }),
        }
    }

    /// The bucket's baseline if it has enough samples and non-zero spread.
    pub fn usable(&self, bucket: usize, cfg: &DetectConfig) -> Option<&Baseline> {
        self.get(bucket)
            .filter(|b| b.sample_count >= cfg.global_min_samples && b.has_spread())
    }
}
