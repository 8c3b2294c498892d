//! # spikewatch-detect: tiered listener-spike detection engine.
//!
//! Pure and synchronous; nothing here touches storage or the network.
//!
//! The engine decides, per feed and per evaluation cycle, whether the feed is
//! spiking or has recovered:
//! - **Robust statistics**: median, MAD and the robust Z-score
//!   `0.6745 * (x - median) / mad`, resistant to the very outliers being hunted.
//! - **Per-feed baseline**: the feed's own lookback history minus the most
//!   recent persist window, which must exceed the threshold in full.
//! - **Global rank buckets**: peer cohorts by popularity rank, used when a
//!   feed's own history is too short, stale or flat.
//! - **Hard threshold**: an absolute listener floor when nothing else applies.
//! - **Hysteresis**: one event per activation; recovery needs the newest
//!   sample back under a lower threshold.

pub mod baseline;
pub mod bucket;
pub mod config;
pub mod decision;
pub mod engine;
pub mod state;
pub mod stats;
pub mod trace;

pub use baseline::{estimate, PerFeedBaseline, Unusable};
pub use bucket::{BucketSelection, GlobalBaseline};
pub use config::{DetectConfig, OverlapPolicy};
pub use decision::{evaluate, Decision, GlobalSkip, Tier, TierKind, TierVerdict};
pub use engine::{step, FeedStep};
pub use state::{advance, Transition};
pub use trace::{inspect, inspect_with_global, DecisionTrace, ScoredSample};
