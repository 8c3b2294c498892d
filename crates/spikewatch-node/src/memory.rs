//! In-memory sample and state storage.
//!
//! Same contract as [`RocksStore`](crate::storage::RocksStore) without
//! persistence. Used by tests and for dry runs over imported data.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use spikewatch_core::error::StoreError;
use spikewatch_core::traits::{SampleSource, StateStore};
use spikewatch_core::types::{Feed, FeedId, GlobalRankSample, Sample, SpikeState};

/// In-memory store implementation.
#[derive(Default)]
pub struct MemoryStore {
    feeds: RwLock<BTreeMap<FeedId, Feed>>,
    /// Per-feed samples keyed by timestamp; one sample per (feed, timestamp).
    samples: RwLock<BTreeMap<FeedId, BTreeMap<DateTime<Utc>, Sample>>>,
    states: DashMap<FeedId, SpikeState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a feed.
    pub fn upsert_feed(&self, feed: Feed) {
        self.feeds.write().insert(feed.feed_id.clone(), feed);
    }

    /// Insert one sample, replacing any sample of the same feed and timestamp.
    pub fn insert_sample(&self, sample: Sample) {
        self.samples
            .write()
            .entry(sample.feed_id.clone())
            .or_default()
            .insert(sample.timestamp, sample);
    }

    pub fn insert_samples(&self, samples: impl IntoIterator<Item = Sample>) {
        let mut guard = self.samples.write();
        for sample in samples {
            guard
                .entry(sample.feed_id.clone())
                .or_default()
                .insert(sample.timestamp, sample);
        }
    }

    /// Number of samples stored for `feed_id`.
    pub fn sample_count(&self, feed_id: &FeedId) -> usize {
        self.samples.read().get(feed_id).map_or(0, BTreeMap::len)
    }

    /// Stored state of `feed_id`, if any was ever written.
    pub fn stored_state(&self, feed_id: &FeedId) -> Option<SpikeState> {
        self.states.get(feed_id).map(|s| s.clone())
    }

    /// Ids of all feeds currently active.
    pub fn active_feeds(&self) -> Vec<FeedId> {
        let mut ids: Vec<FeedId> = self
            .states
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SampleSource for MemoryStore {
    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        Ok(self.feeds.read().values().cloned().collect())
    }

    async fn list_samples(
        &self,
        feed_id: &FeedId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Sample>, StoreError> {
        Ok(self
            .samples
            .read()
            .get(feed_id)
            .map(|by_ts| by_ts.range(since..).map(|(_, s)| s.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_global_rank_samples(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<GlobalRankSample>, StoreError> {
        let guard = self.samples.read();
        let ranked = guard
            .values()
            .flat_map(|by_ts| by_ts.range(since..).map(|(_, s)| s))
            .filter_map(|s| {
                s.rank.map(|rank| GlobalRankSample {
                    rank,
                    listener_count: s.listener_count,
                })
            })
            .collect();
        Ok(ranked)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_spike_state(&self, feed_id: &FeedId) -> Result<SpikeState, StoreError> {
        Ok(self
            .stored_state(feed_id)
            .unwrap_or_else(|| SpikeState::inactive(feed_id.clone())))
    }

    async fn set_spike_state(&self, state: &SpikeState) -> Result<(), StoreError> {
        self.states.insert(state.feed_id.clone(), state.clone());
        Ok(())
    }
}
