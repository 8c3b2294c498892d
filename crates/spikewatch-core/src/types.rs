//! Core data types: feeds, samples, baselines, spike state and events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{EVENT_TYPE_SPIKE, MAD_EPSILON};

/// Stable identifier of a live audio feed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(transparent)]
pub struct FeedId(pub String);

impl FeedId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeedId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FeedId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A feed as known to the ingestion side.
///
/// Identity is [`FeedId`]; `name` and `url` may change without affecting detection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Feed {
    pub feed_id: FeedId,
    pub name: String,
    pub url: String,
}

/// One periodic listener-count observation of a feed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub feed_id: FeedId,
    pub timestamp: DateTime<Utc>,
    pub listener_count: u32,
    /// Position in the top listing, when the feed was on it.
    ///
    /// Signed so that malformed ranks can be carried and then ignored.
    pub rank: Option<i32>,
}

/// A ranked observation of any feed, used for the global rank-bucket baseline.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalRankSample {
    pub rank: i32,
    pub listener_count: u32,
}

/// Robust location and spread of a set of listener counts.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct Baseline {
    pub median: f64,
    pub mad: f64,
    pub sample_count: usize,
}

impl Baseline {
    /// Whether the spread is large enough to compute finite robust Z-scores.
    pub fn has_spread(&self) -> bool {
        self.mad > MAD_EPSILON
    }
}

/// Persistent per-feed hysteresis state.
///
/// `activated_at` is `Some` exactly when the feed is in the active state, so the
/// "timestamp set iff active" invariant holds by construction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SpikeState {
    pub feed_id: FeedId,
    pub activated_at: Option<DateTime<Utc>>,
}

impl SpikeState {
    /// The initial state of every feed.
    pub fn inactive(feed_id: FeedId) -> Self {
        Self {
            feed_id,
            activated_at: None,
        }
    }

    pub fn active(feed_id: FeedId, activated_at: DateTime<Utc>) -> Self {
        Self {
            feed_id,
            activated_at: Some(activated_at),
        }
    }

    pub fn is_active(&self) -> bool {
        self.activated_at.is_some()
    }
}

/// Notification emitted once per Inactive -> Active transition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpikeEvent {
    pub feed_id: FeedId,
    pub name: String,
    pub url: String,
    /// Timestamp of the sample that triggered the spike.
    pub timestamp: DateTime<Utc>,
    pub listener_count: u32,
    pub median: f64,
    pub mad: f64,
    pub robust_z: f64,
}

/// Queue wire form of an event: a type tag plus its JSON payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EventEnvelope {
    pub event_type: String,
    pub payload_json: String,
    pub enqueued_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Wrap a spike event for the queue.
    pub fn spike(event: &SpikeEvent, enqueued_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: EVENT_TYPE_SPIKE.to_string(),
            payload_json: serde_json::to_string(event)?,
            enqueued_at,
        })
    }

    /// Decode the payload as a spike event.
    ///
    /// Returns `None` for other event types.
    pub fn spike_event(&self) -> Option<SpikeEvent> {
        if self.event_type != EVENT_TYPE_SPIKE {
            return None;
        }
        serde_json::from_str(&self.payload_json).ok()
    }
}
