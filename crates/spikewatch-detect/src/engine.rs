//! One evaluation step for one feed: decide, then advance the state machine.
//!
//! Both the live detector and the inspection path go through [`step`], so an
//! inspected decision is exactly the decision the detector would make.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use spikewatch_core::types::{Feed, Sample, SpikeState};

use crate::bucket::GlobalBaseline;
use crate::config::DetectConfig;
use crate::decision::{evaluate, Decision};
use crate::state::{advance, Transition};

/// Decision and resulting state change of one feed in one cycle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FeedStep {
    pub decision: Decision,
    pub next_state: SpikeState,
    pub transition: Transition,
}

/// Evaluate `feed` against its own samples and the cycle's global snapshot.
///
/// Returns `None` when the feed has no samples in the lookback window; its
/// state is then left untouched.
pub fn step(
    feed: &Feed,
    samples: &[Sample],
    global: &GlobalBaseline,
    prior: &SpikeState,
    cfg: &DetectConfig,
    now: DateTime<Utc>,
) -> Option<FeedStep> {
    let decision = evaluate(samples, global, cfg, now)?;
    let (next_state, transition) = advance(prior, &decision, feed, cfg.overlap_policy, now);
    Some(FeedStep {
        decision,
        next_state,
        transition,
    })
}
