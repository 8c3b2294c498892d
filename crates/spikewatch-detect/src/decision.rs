//! Tiered spike/recovery decision.
//!
//! Each feed is judged by the first usable tier, in priority order:
//! 1. [`Tier::PerFeed`]: the feed's own history; every sample of the persist
//!    window must reach `robust_z_threshold`.
//! 2. [`Tier::GlobalBucket`]: the rank-bucket peer cohort; the newest sample
//!    must reach `global_robust_z_threshold` and the absolute listener floor.
//! 3. [`Tier::HardThreshold`]: the listener floor alone. Always available.
//!
//! The decision keeps the tier, why higher tiers were skipped, and the
//! baseline numbers that produced it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use spikewatch_core::types::{Baseline, Sample};

use crate::baseline::{estimate, PerFeedBaseline, Unusable};
use crate::bucket::{BucketSelection, GlobalBaseline};
use crate::config::DetectConfig;
use crate::stats::robust_z;

/// Which tier produced a decision.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    PerFeed,
    GlobalBucket,
    HardThreshold,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerFeed => f.write_str("per_feed"),
            Self::GlobalBucket => f.write_str("global_bucket"),
            Self::HardThreshold => f.write_str("hard_threshold"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PerFeedDecision {
    pub estimate: PerFeedBaseline,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GlobalBucketDecision {
    pub selection: BucketSelection,
    pub baseline: Baseline,
    pub current_z: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HardThresholdDecision {
    pub min_listeners: u32,
}

/// The tier that decided, with the data it decided on.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum Tier {
    PerFeed(PerFeedDecision),
    GlobalBucket(GlobalBucketDecision),
    HardThreshold(HardThresholdDecision),
}

impl Tier {
    pub fn kind(&self) -> TierKind {
        match self {
            Self::PerFeed(_) => TierKind::PerFeed,
            Self::GlobalBucket(_) => TierKind::GlobalBucket,
            Self::HardThreshold(_) => TierKind::HardThreshold,
        }
    }

    /// Baseline behind the decision; `None` for the hard threshold.
    pub fn baseline(&self) -> Option<&Baseline> {
        match self {
            Self::PerFeed(d) => Some(&d.estimate.baseline),
            Self::GlobalBucket(d) => Some(&d.baseline),
            Self::HardThreshold(_) => None,
        }
    }

    /// Robust Z of the newest sample; 0 for the hard threshold.
    pub fn current_z(&self) -> f64 {
        match self {
            Self::PerFeed(d) => d.estimate.current_z,
            Self::GlobalBucket(d) => d.current_z,
            Self::HardThreshold(_) => 0.0,
        }
    }
}

/// Why the global-bucket tier could not decide.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GlobalSkip {
    /// No rank and no bucket data to infer one from.
    NoBucket,
    /// The selected bucket is missing, too small, or has zero spread.
    Unusable {
        selection: BucketSelection,
        sample_count: usize,
        mad: f64,
    },
}

/// Outcome of one tier: the tier data plus both predicates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TierVerdict {
    pub tier: Tier,
    pub is_spike_now: bool,
    pub is_recovered: bool,
}

/// The decision for one feed in one evaluation cycle.
///
/// `is_spike_now` and `is_recovered` are computed independently and may both hold.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Decision {
    #[serde(flatten)]
    pub verdict: TierVerdict,
    /// The newest sample, which any resulting event reports.
    pub current: Sample,
    pub per_feed_skipped: Option<Unusable>,
    pub global_skipped: Option<GlobalSkip>,
}

impl Decision {
    pub fn tier_kind(&self) -> TierKind {
        self.verdict.tier.kind()
    }

    pub fn is_spike_now(&self) -> bool {
        self.verdict.is_spike_now
    }

    pub fn is_recovered(&self) -> bool {
        self.verdict.is_recovered
    }

    pub fn median(&self) -> f64 {
        self.verdict.tier.baseline().map_or(0.0, |b| b.median)
    }

    pub fn mad(&self) -> f64 {
        self.verdict.tier.baseline().map_or(0.0, |b| b.mad)
    }

    pub fn current_z(&self) -> f64 {
        self.verdict.tier.current_z()
    }
}

/// Tier 1: the feed's own history.
pub fn per_feed_tier(
    samples: &[Sample],
    cfg: &DetectConfig,
    now: DateTime<Utc>,
) -> Result<TierVerdict, Unusable> {
    let estimate = estimate(samples, cfg, now)?;
    let is_spike_now = estimate
        .recent_z
        .iter()
        .all(|&z| z >= cfg.robust_z_threshold);
    let is_recovered = estimate.current_z <= cfg.recovery_z_threshold;
    Ok(TierVerdict {
        tier: Tier::PerFeed(PerFeedDecision { estimate }),
        is_spike_now,
        is_recovered,
    })
}

/// Tier 2: the rank-bucket cohort of the newest sample.
pub fn global_bucket_tier(
    current: &Sample,
    global: &GlobalBaseline,
    cfg: &DetectConfig,
) -> Result<TierVerdict, GlobalSkip> {
    let selection = global
        .select(current.rank, current.listener_count)
        .ok_or(GlobalSkip::NoBucket)?;

    let baseline = match global.usable(selection.bucket, cfg) {
        Some(b) => *b,
        None => {
            let b = global.get(selection.bucket).copied().unwrap_or_default();
            return Err(GlobalSkip::Unusable {
                selection,
                sample_count: b.sample_count,
                mad: b.mad,
            });
        }
    };

    let current_z = robust_z(
        f64::from(current.listener_count),
        baseline.median,
        baseline.mad,
    );
    let is_spike_now = current_z >= cfg.global_robust_z_threshold
        && current.listener_count >= cfg.new_feed_min_listeners;
    let is_recovered = current_z <= cfg.recovery_z_threshold;

    Ok(TierVerdict {
        tier: Tier::GlobalBucket(GlobalBucketDecision {
            selection,
            baseline,
            current_z,
        }),
        is_spike_now,
        is_recovered,
    })
}

/// Tier 3: the absolute listener floor.
pub fn hard_threshold_tier(current: &Sample, cfg: &DetectConfig) -> TierVerdict {
    let floor = cfg.new_feed_min_listeners;
    TierVerdict {
        tier: Tier::HardThreshold(HardThresholdDecision {
            min_listeners: floor,
        }),
        is_spike_now: current.listener_count >= floor,
        is_recovered: current.listener_count < floor,
    }
}

/// Decide whether a feed is spiking or recovered.
///
/// `samples` must be the feed's samples inside the lookback window, ascending.
/// Returns `None` when there are no samples at all.
pub fn evaluate(
    samples: &[Sample],
    global: &GlobalBaseline,
    cfg: &DetectConfig,
    now: DateTime<Utc>,
) -> Option<Decision> {
    let current = samples.last()?;

    let mut per_feed_skipped = None;
    let mut global_skipped = None;

    let verdict = match per_feed_tier(samples, cfg, now) {
        Ok(v) => v,
        Err(reason) => {
            per_feed_skipped = Some(reason);
            match global_bucket_tier(current, global, cfg) {
                Ok(v) => v,
                Err(skip) => {
                    global_skipped = Some(skip);
                    hard_threshold_tier(current, cfg)
                }
            }
        }
    };

    Some(Decision {
        verdict,
        current: current.clone(),
        per_feed_skipped,
        global_skipped,
    })
}
