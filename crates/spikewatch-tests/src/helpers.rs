//! Shared test helpers for end-to-end detector tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use spikewatch_core::error::{SinkError, StoreError};
use spikewatch_core::traits::{EventSink, SampleSource, StateStore};
use spikewatch_core::types::{Feed, FeedId, GlobalRankSample, Sample, SpikeEvent};
use spikewatch_detect::config::DetectConfig;
use spikewatch_node_lib::config::NodeConfig;
use spikewatch_node_lib::detector::Detector;
use spikewatch_node_lib::memory::MemoryStore;

/// Fixed origin for all test timelines.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

pub fn feed(id: &str) -> Feed {
    Feed {
        feed_id: FeedId::from(id),
        name: format!("Feed {id}"),
        url: format!("https://example.invalid/listen/feed/{id}"),
    }
}

/// `n` counts cycling 100, 95, 105: median 100, MAD 5.
pub fn calm_counts(n: usize) -> Vec<u32> {
    (0..n).map(|i| [100, 95, 105][i % 3]).collect()
}

/// Samples one hour apart starting at `start`.
pub fn hourly(id: &str, start: DateTime<Utc>, counts: &[u32], rank: Option<i32>) -> Vec<Sample> {
    counts
        .iter()
        .enumerate()
        .map(|(i, &c)| Sample {
            feed_id: FeedId::from(id),
            timestamp: start + chrono::Duration::hours(i as i64),
            listener_count: c,
            rank,
        })
        .collect()
}

/// Store holding one feed with the given hourly counts; returns the last timestamp.
pub fn store_with(id: &str, counts: &[u32]) -> (Arc<MemoryStore>, DateTime<Utc>) {
    let store = Arc::new(MemoryStore::new());
    store.upsert_feed(feed(id));
    let samples = hourly(id, t0(), counts, None);
    let last = samples.last().map_or(t0(), |s| s.timestamp);
    store.insert_samples(samples);
    (store, last)
}

/// Append one sample to `id` at `at`.
pub fn append(store: &MemoryStore, id: &str, at: DateTime<Utc>, count: u32) {
    store.insert_sample(Sample {
        feed_id: FeedId::from(id),
        timestamp: at,
        listener_count: count,
        rank: None,
    });
}

pub fn node_config(detect: DetectConfig) -> NodeConfig {
    NodeConfig {
        detect,
        store_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        ..NodeConfig::default()
    }
}

/// Detector over `source` with state kept in `states`.
pub fn detector(
    source: Arc<dyn SampleSource>,
    states: Arc<dyn StateStore>,
    sink: Arc<dyn EventSink>,
    config: &NodeConfig,
) -> Detector {
    Detector::new(source, states, sink, config)
}

/// Sink that records every published event; can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SpikeEvent>>,
    failures_left: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` publishes.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<SpikeEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &SpikeEvent) -> Result<(), SinkError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SinkError::Delivery("injected failure".into()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Source wrapper that injects failures and counts calls.
pub struct FlakySource {
    inner: Arc<MemoryStore>,
    failing: Mutex<HashSet<FeedId>>,
    hanging: Mutex<HashSet<FeedId>>,
    fail_global: Mutex<bool>,
    global_calls: AtomicUsize,
    sample_calls: AtomicUsize,
}

impl FlakySource {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            fail_global: Mutex::new(false),
            global_calls: AtomicUsize::new(0),
            sample_calls: AtomicUsize::new(0),
        })
    }

    /// Make `list_samples` fail for `id`.
    pub fn fail_feed(&self, id: &str) {
        self.failing.lock().insert(FeedId::from(id));
    }

    /// Make `list_samples` never return for `id`.
    pub fn hang_feed(&self, id: &str) {
        self.hanging.lock().insert(FeedId::from(id));
    }

    pub fn fail_global(&self, fail: bool) {
        *self.fail_global.lock() = fail;
    }

    pub fn global_calls(&self) -> usize {
        self.global_calls.load(Ordering::SeqCst)
    }

    pub fn sample_calls(&self) -> usize {
        self.sample_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SampleSource for FlakySource {
    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        self.inner.list_feeds().await
    }

    async fn list_samples(
        &self,
        feed_id: &FeedId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Sample>, StoreError> {
        self.sample_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(feed_id) {
            return Err(StoreError::Unavailable(format!("injected failure for {feed_id}")));
        }
        let hang = self.hanging.lock().contains(feed_id);
        if hang {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        self.inner.list_samples(feed_id, since).await
    }

    async fn list_global_rank_samples(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<GlobalRankSample>, StoreError> {
        self.global_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_global.lock() {
            return Err(StoreError::Unavailable("injected global failure".into()));
        }
        self.inner.list_global_rank_samples(since).await
    }
}
