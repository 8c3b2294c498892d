//! Read-only inspection of a feed's decision.
//!
//! [`inspect`] runs the same [`step`] the detector runs and reports everything
//! that went into it. It never persists or publishes anything.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use spikewatch_core::types::{Baseline, Feed, FeedId, GlobalRankSample, Sample, SpikeState};

use crate::bucket::GlobalBaseline;
use crate::config::DetectConfig;
use crate::decision::{Decision, Tier, TierKind};
use crate::engine::{step, FeedStep};
use crate::stats::robust_z;
use crate::state::Transition;

/// One sample scored against the baseline that decided.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ScoredSample {
    pub timestamp: DateTime<Utc>,
    pub listener_count: u32,
    pub rank: Option<i32>,
    /// `None` when the hard threshold decided (no baseline).
    pub robust_z: Option<f64>,
    /// Part of the per-feed persist window.
    pub in_recent_window: bool,
}

/// Full account of one feed's decision.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DecisionTrace {
    pub feed_id: FeedId,
    pub evaluated_at: DateTime<Utc>,
    pub sample_count: usize,
    /// `None` when there were no samples to decide on.
    pub tier: Option<TierKind>,
    pub median: f64,
    pub mad: f64,
    pub current_z: f64,
    pub is_spike_now: bool,
    pub is_recovered: bool,
    pub samples: Vec<ScoredSample>,
    /// Baselines of all non-empty rank buckets in the snapshot used.
    pub global_buckets: BTreeMap<usize, Baseline>,
    pub decision: Option<Decision>,
    pub prior_state: SpikeState,
    /// State the detector would persist.
    pub next_state: SpikeState,
    pub transition: Transition,
}

/// Inspect `feed` from raw inputs, building the global snapshot on the way.
pub fn inspect(
    feed: &Feed,
    samples: &[Sample],
    global_rank_samples: &[GlobalRankSample],
    prior: Option<&SpikeState>,
    cfg: &DetectConfig,
    now: DateTime<Utc>,
) -> DecisionTrace {
    let global = GlobalBaseline::compute(global_rank_samples, cfg);
    inspect_with_global(feed, samples, &global, prior, cfg, now)
}

/// Inspect `feed` against an already computed global snapshot.
pub fn inspect_with_global(
    feed: &Feed,
    samples: &[Sample],
    global: &GlobalBaseline,
    prior: Option<&SpikeState>,
    cfg: &DetectConfig,
    now: DateTime<Utc>,
) -> DecisionTrace {
    let prior_state = prior
        .cloned()
        .unwrap_or_else(|| SpikeState::inactive(feed.feed_id.clone()));

    let Some(FeedStep {
        decision,
        next_state,
        transition,
    }) = step(feed, samples, global, &prior_state, cfg, now)
    else {
        return DecisionTrace {
            feed_id: feed.feed_id.clone(),
            evaluated_at: now,
            sample_count: 0,
            tier: None,
            median: 0.0,
            mad: 0.0,
            current_z: 0.0,
            is_spike_now: false,
            is_recovered: false,
            samples: Vec::new(),
            global_buckets: global.buckets().clone(),
            decision: None,
            next_state: prior_state.clone(),
            prior_state,
            transition: Transition::Unchanged,
        };
    };

    let baseline = decision.verdict.tier.baseline().copied();
    let window_start = match &decision.verdict.tier {
        Tier::PerFeed(_) => samples.len().saturating_sub(cfg.persist_samples),
        _ => samples.len(),
    };
    let scored = samples
        .iter()
        .enumerate()
        .map(|(i, s)| ScoredSample {
            timestamp: s.timestamp,
            listener_count: s.listener_count,
            rank: s.rank,
            robust_z: baseline.map(|b| robust_z(f64::from(s.listener_count), b.median, b.mad)),
            in_recent_window: i >= window_start,
        })
        .collect();

    DecisionTrace {
        feed_id: feed.feed_id.clone(),
        evaluated_at: now,
        sample_count: samples.len(),
        tier: Some(decision.tier_kind()),
        median: decision.median(),
        mad: decision.mad(),
        current_z: decision.current_z(),
        is_spike_now: decision.is_spike_now(),
        is_recovered: decision.is_recovered(),
        samples: scored,
        global_buckets: global.buckets().clone(),
        decision: Some(decision),
        prior_state,
        next_state,
        transition,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn feed() -> Feed {
        Feed {
            feed_id: FeedId::from("31"),
            name: "Valley Fire/EMS".into(),
            url: "https://example.invalid/31".into(),
        }
    }

    fn series(counts: &[u32]) -> Vec<Sample> {
        counts
            .iter()
            .enumerate()
            .map(|(i, &c)| Sample {
                feed_id: FeedId::from("31"),
                timestamp: t0() + Duration::minutes(5 * i as i64),
                listener_count: c,
                rank: Some(12),
            })
            .collect()
    }

    fn spiking() -> Vec<Sample> {
        let mut counts: Vec<u32> = (0..42).map(|i| [100, 95, 105][i % 3]).collect();
        counts.extend([500, 520, 510]);
        series(&counts)
    }

    #[test]
    fn trace_matches_live_step() {
        let cfg = DetectConfig::default();
        let s = spiking();
        let now = s.last().unwrap().timestamp;
        let global = GlobalBaseline::compute(&[], &cfg);
        let prior = SpikeState::inactive(FeedId::from("31"));

        let live = step(&feed(), &s, &global, &prior, &cfg, now).unwrap();
        let trace = inspect(&feed(), &s, &[], None, &cfg, now);

        assert_eq!(trace.decision.as_ref(), Some(&live.decision));
        assert_eq!(trace.next_state, live.next_state);
        assert_eq!(trace.transition, live.transition);
        assert_eq!(trace.tier, Some(TierKind::PerFeed));
        assert_eq!(trace.median, 100.0);
        assert_eq!(trace.mad, 5.0);
        assert!(trace.is_spike_now);
    }

    #[test]
    fn trace_scores_every_sample_and_marks_window() {
        let cfg = DetectConfig::default();
        let s = spiking();
        let trace = inspect(&feed(), &s, &[], None, &cfg, s.last().unwrap().timestamp);
        assert_eq!(trace.sample_count, 45);
        assert_eq!(trace.samples.len(), 45);
        assert_eq!(trace.samples.iter().filter(|x| x.in_recent_window).count(), 3);
        assert!(trace.samples.iter().all(|x| x.robust_z.is_some()));
        assert_eq!(trace.samples[0].robust_z, Some(0.0));
    }

    #[test]
    fn trace_does_not_alter_given_state() {
        let cfg = DetectConfig::default();
        let s = spiking();
        let prior = SpikeState::inactive(FeedId::from("31"));
        let before = prior.clone();
        let trace = inspect(&feed(), &s, &[], Some(&prior), &cfg, s.last().unwrap().timestamp);
        assert_eq!(prior, before);
        assert_eq!(trace.prior_state, before);
        assert!(trace.next_state.is_active());
    }

    #[test]
    fn trace_of_empty_feed() {
        let cfg = DetectConfig::default();
        let trace = inspect(&feed(), &[], &[], None, &cfg, t0());
        assert_eq!(trace.tier, None);
        assert_eq!(trace.transition, Transition::Unchanged);
        assert!(!trace.next_state.is_active());
    }

    #[test]
    fn hard_threshold_trace_has_no_scores() {
        let cfg = DetectConfig::default();
        let s = series(&[150]);
        let trace = inspect(&feed(), &s, &[], None, &cfg, t0());
        assert_eq!(trace.tier, Some(TierKind::HardThreshold));
        assert_eq!(trace.samples[0].robust_z, None);
        assert!(!trace.samples[0].in_recent_window);
    }

    #[test]
    fn trace_reports_global_buckets() {
        let cfg = DetectConfig::default();
        let ranks: Vec<GlobalRankSample> = (0..400)
            .map(|i| GlobalRankSample {
                rank: 12,
                listener_count: 200 + (i % 21),
            })
            .collect();
        let s = series(&[900]);
        let trace = inspect(&feed(), &s, &ranks, None, &cfg, t0());
        assert_eq!(trace.global_buckets.len(), 1);
        assert_eq!(trace.tier, Some(TierKind::GlobalBucket));
        assert!(trace.is_spike_now);
    }

    #[test]
    fn trace_serializes_to_json() {
        let cfg = DetectConfig::default();
        let s = spiking();
        let trace = inspect(&feed(), &s, &[], None, &cfg, s.last().unwrap().timestamp);
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["tier"], "per_feed");
        assert_eq!(json["transition"]["transition"], "activated");
    }
}
