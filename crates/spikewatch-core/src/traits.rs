//! Collaborator contracts of the detection engine.
//!
//! These traits define the boundary between the engine and the outside world:
//! - [`SampleSource`]: feeds and listener-count samples (store implements)
//! - [`StateStore`]: persisted per-feed spike state (store implements)
//! - [`EventSink`]: spike notification delivery (queue / console implements)

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{SinkError, StoreError};
use crate::types::{Feed, FeedId, GlobalRankSample, Sample, SpikeEvent, SpikeState};

/// Read access to feeds and their samples.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// All known feeds.
    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError>;

    /// Samples of one feed with `timestamp >= since`, ascending by timestamp.
    async fn list_samples(
        &self,
        feed_id: &FeedId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Sample>, StoreError>;

    /// Ranked samples of every feed with `timestamp >= since`.
    ///
    /// Samples without a rank are not returned.
    async fn list_global_rank_samples(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<GlobalRankSample>, StoreError>;
}

/// Persistent per-feed spike state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state of a feed. Returns the inactive state if none was stored.
    async fn get_spike_state(&self, feed_id: &FeedId) -> Result<SpikeState, StoreError>;

    /// Insert or replace the state of `state.feed_id`.
    async fn set_spike_state(&self, state: &SpikeState) -> Result<(), StoreError>;
}

/// Destination for spike notifications.
///
/// Delivery guarantees belong to the implementation; the engine publishes and moves on.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &SpikeEvent) -> Result<(), SinkError>;
}
