//! Per-feed baseline estimator.
//!
//! Splits a feed's ascending sample history into a baseline prefix and a
//! recent "persist" suffix of `persist_samples` entries, and derives the
//! robust baseline from the prefix only. The recent samples are then scored
//! against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use spikewatch_core::types::{Baseline, Sample};

use crate::config::DetectConfig;
use crate::stats::{baseline_of, robust_z};

/// Why a feed has no usable per-feed baseline this cycle.
///
/// These are expected outcomes that trigger the global fallback, not errors.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Unusable {
    /// No samples inside the lookback window.
    NoSamples,
    /// The newest sample is older than `max_sample_age`.
    Stale { age_secs: i64 },
    /// Not enough samples overall or in the baseline prefix.
    TooFewSamples { have: usize, need: usize },
    /// The baseline prefix has (near) zero MAD.
    ZeroSpread,
}

/// A usable per-feed baseline with the recent window scored against it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PerFeedBaseline {
    pub baseline: Baseline,
    /// Robust Z of each of the last `persist_samples` samples, oldest first.
    pub recent_z: Vec<f64>,
    /// Robust Z of the newest sample.
    pub current_z: f64,
}

/// Estimate the per-feed baseline of `samples` (ascending by timestamp).
pub fn estimate(
    samples: &[Sample],
    cfg: &DetectConfig,
    now: DateTime<Utc>,
) -> Result<PerFeedBaseline, Unusable> {
    let newest = samples.last().ok_or(Unusable::NoSamples)?;

    let age = now - newest.timestamp;
    if age > cfg.max_sample_age {
        return Err(Unusable::Stale {
            age_secs: age.num_seconds(),
        });
    }

    let n = cfg.persist_samples;
    let need = cfg.min_samples.max(n.saturating_add(2));
    if samples.len() < need {
        return Err(Unusable::TooFewSamples {
            have: samples.len(),
            need,
        });
    }

    let (prefix, recent) = samples.split_at(samples.len() - n);
    if prefix.len() < cfg.min_samples {
        return Err(Unusable::TooFewSamples {
            have: prefix.len(),
            need: cfg.min_samples,
        });
    }

    let baseline = baseline_of(prefix.iter().map(|s| s.listener_count));
    if !baseline.has_spread() {
        return Err(Unusable::ZeroSpread);
    }

    let recent_z: Vec<f64> = recent
        .iter()
        .map(|s| robust_z(f64::from(s.listener_count), baseline.median, baseline.mad))
        .collect();
    let current_z = robust_z(
        f64::from(newest.listener_count),
        baseline.median,
        baseline.mad,
    );

    Ok(PerFeedBaseline {
        baseline,
        recent_z,
        current_z,
    })
}
