//! Spike hysteresis state machine.
//!
//! Two states, `Inactive` (initial) and `Active`:
//! - `Inactive` + spike now  -> `Active`, one [`SpikeEvent`] emitted.
//! - `Active` + recovered    -> `Inactive`, nothing emitted.
//! - anything else           -> unchanged.
//!
//! An active feed for which both predicates hold is resolved by the
//! configured [`OverlapPolicy`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use spikewatch_core::types::{Feed, SpikeEvent, SpikeState};

use crate::config::OverlapPolicy;
use crate::decision::Decision;

/// Result of advancing one feed's state by one cycle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    /// Inactive -> Active; the event must be published.
    Activated { event: SpikeEvent },
    /// Active -> Inactive.
    Recovered,
    /// No state change.
    Unchanged,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Compute the next state of `feed` from its prior state and this cycle's decision.
///
/// Pure: the caller persists the returned state and publishes any event.
pub fn advance(
    prior: &SpikeState,
    decision: &Decision,
    feed: &Feed,
    policy: OverlapPolicy,
    now: DateTime<Utc>,
) -> (SpikeState, Transition) {
    let spike = decision.is_spike_now();
    let recovered = decision.is_recovered();

    if !prior.is_active() {
        if spike {
            let event = SpikeEvent {
                feed_id: feed.feed_id.clone(),
                name: feed.name.clone(),
                url: feed.url.clone(),
                timestamp: decision.current.timestamp,
                listener_count: decision.current.listener_count,
                median: decision.median(),
                mad: decision.mad(),
                robust_z: decision.current_z(),
            };
            return (
                SpikeState::active(prior.feed_id.clone(), now),
                Transition::Activated { event },
            );
        }
        return (prior.clone(), Transition::Unchanged);
    }

    let recover = match policy {
        OverlapPolicy::FavorActive => recovered && !spike,
        OverlapPolicy::FavorRecovery => recovered,
    };
    if recover {
        (SpikeState::inactive(prior.feed_id.clone()), Transition::Recovered)
    } else {
        (prior.clone(), Transition::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spikewatch_core::types::{Baseline, FeedId, Sample};

    use crate::baseline::PerFeedBaseline;
    use crate::decision::{HardThresholdDecision, PerFeedDecision, Tier, TierVerdict};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 2, 8, 30, 0).unwrap()
    }

    fn feed() -> Feed {
        Feed {
            feed_id: FeedId::from("4242"),
            name: "Metro Police Dispatch".into(),
            url: "https://example.invalid/listen/feed/4242".into(),
        }
    }

    fn current(count: u32) -> Sample {
        Sample {
            feed_id: FeedId::from("4242"),
            timestamp: now(),
            listener_count: count,
            rank: Some(4),
        }
    }

    fn per_feed_decision(spike: bool, recovered: bool) -> Decision {
        Decision {
            verdict: TierVerdict {
                tier: Tier::PerFeed(PerFeedDecision {
                    estimate: PerFeedBaseline {
                        baseline: Baseline { median: 100.0, mad: 5.0, sample_count: 42 },
                        recent_z: vec![53.0, 56.0, 55.0],
                        current_z: 55.0,
                    },
                }),
                is_spike_now: spike,
                is_recovered: recovered,
            },
            current: current(510),
            per_feed_skipped: None,
            global_skipped: None,
        }
    }

    fn hard_decision(spike: bool, recovered: bool) -> Decision {
        Decision {
            verdict: TierVerdict {
                tier: Tier::HardThreshold(HardThresholdDecision { min_listeners: 80 }),
                is_spike_now: spike,
                is_recovered: recovered,
            },
            current: current(95),
            per_feed_skipped: None,
            global_skipped: None,
        }
    }

    fn inactive() -> SpikeState {
        SpikeState::inactive(FeedId::from("4242"))
    }

    fn active() -> SpikeState {
        SpikeState::active(FeedId::from("4242"), now() - chrono::Duration::hours(1))
    }

    #[test]
    fn inactive_spike_activates_and_emits() {
        let (next, t) = advance(&inactive(), &per_feed_decision(true, false), &feed(), OverlapPolicy::default(), now());
        assert_eq!(next, SpikeState::active(FeedId::from("4242"), now()));
        match t {
            Transition::Activated { event } => {
                assert_eq!(event.feed_id, FeedId::from("4242"));
                assert_eq!(event.name, "Metro Police Dispatch");
                assert_eq!(event.listener_count, 510);
                assert_eq!(event.median, 100.0);
                assert_eq!(event.mad, 5.0);
                assert_eq!(event.robust_z, 55.0);
                assert_eq!(event.timestamp, now());
            }
            other => panic!("expected activation, got {other:?}"),
        }
    }

    #[test]
    fn hard_threshold_event_carries_zero_baseline() {
        let (_, t) = advance(&inactive(), &hard_decision(true, false), &feed(), OverlapPolicy::default(), now());
        let Transition::Activated { event } = t else {
            panic!("expected activation");
        };
        assert_eq!((event.median, event.mad, event.robust_z), (0.0, 0.0, 0.0));
    }

    #[test]
    fn inactive_without_spike_is_unchanged() {
        for recovered in [false, true] {
            let (next, t) = advance(&inactive(), &per_feed_decision(false, recovered), &feed(), OverlapPolicy::default(), now());
            assert_eq!(next, inactive());
            assert_eq!(t, Transition::Unchanged);
        }
    }

    #[test]
    fn active_recovers_without_event() {
        let (next, t) = advance(&active(), &per_feed_decision(false, true), &feed(), OverlapPolicy::default(), now());
        assert!(!next.is_active());
        assert!(next.activated_at.is_none());
        assert_eq!(t, Transition::Recovered);
    }

    #[test]
    fn active_still_spiking_does_not_reemit() {
        let prior = active();
        let (next, t) = advance(&prior, &per_feed_decision(true, false), &feed(), OverlapPolicy::default(), now());
        assert_eq!(next, prior);
        assert_eq!(t, Transition::Unchanged);
    }

    #[test]
    fn active_neither_is_unchanged() {
        let prior = active();
        let (next, t) = advance(&prior, &per_feed_decision(false, false), &feed(), OverlapPolicy::default(), now());
        assert_eq!(next, prior);
        assert!(!t.is_change());
    }

    #[test]
    fn overlap_favor_active_stays_active() {
        let prior = active();
        let (next, t) = advance(&prior, &per_feed_decision(true, true), &feed(), OverlapPolicy::FavorActive, now());
        assert_eq!(next, prior);
        assert_eq!(t, Transition::Unchanged);
    }

    #[test]
    fn overlap_favor_recovery_recovers() {
        let (next, t) = advance(&active(), &per_feed_decision(true, true), &feed(), OverlapPolicy::FavorRecovery, now());
        assert!(!next.is_active());
        assert_eq!(t, Transition::Recovered);
    }

    #[test]
    fn overlap_on_inactive_activates_under_either_policy() {
        for policy in [OverlapPolicy::FavorActive, OverlapPolicy::FavorRecovery] {
            let (next, t) = advance(&inactive(), &per_feed_decision(true, true), &feed(), policy, now());
            assert!(next.is_active());
            assert!(matches!(t, Transition::Activated { .. }));
        }
    }

    #[test]
    fn advance_is_idempotent_on_its_own_output() {
        let d = per_feed_decision(true, false);
        let (first, t1) = advance(&inactive(), &d, &feed(), OverlapPolicy::default(), now());
        let (second, t2) = advance(&first, &d, &feed(), OverlapPolicy::default(), now());
        assert!(t1.is_change());
        assert_eq!(first, second);
        assert_eq!(t2, Transition::Unchanged);
    }
}
