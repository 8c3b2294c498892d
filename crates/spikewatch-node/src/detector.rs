//! Periodic detection loop.
//!
//! The [`Detector`] owns the collaborators (sample source, state store, event
//! sink) and runs evaluation cycles on a fixed delay. One cycle:
//! 1. Load ranked samples over the global lookback and build the
//!    [`GlobalBaseline`] snapshot once.
//! 2. Load the feed list.
//! 3. For each feed, sequentially: load its samples and state, run
//!    [`step`], publish on activation, persist any state change.
//!
//! A failure in step 1 or 2 aborts the cycle. A failure on one feed skips
//! that feed only. Every store call is bounded by the store timeout.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use spikewatch_core::error::{SinkError, StoreError};
use spikewatch_core::traits::{EventSink, SampleSource, StateStore};
use spikewatch_core::types::{Feed, FeedId, SpikeEvent, SpikeState};
use spikewatch_detect::bucket::GlobalBaseline;
use spikewatch_detect::config::DetectConfig;
use spikewatch_detect::engine::{step, FeedStep};
use spikewatch_detect::state::Transition;
use spikewatch_detect::trace::{inspect_with_global, DecisionTrace};

use crate::config::NodeConfig;

/// Counters of one evaluation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Ranked samples behind this cycle's global baseline.
    pub global_samples: usize,
    pub feeds: usize,
    pub evaluated: usize,
    /// Feeds with no samples in the lookback window.
    pub no_samples: usize,
    /// Feeds skipped because a store call failed or timed out.
    pub failed: usize,
    pub activated: usize,
    pub recovered: usize,
    /// Activations withheld because the event could not be published.
    pub publish_failures: usize,
    /// Set when the cycle stopped early: shutdown, or a failed global load.
    pub aborted: Option<String>,
}

/// Outcome of one feed in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedOutcome {
    NoSamples,
    Unchanged,
    Activated(SpikeEvent),
    Recovered,
    /// Spike detected but not published; the state stays inactive.
    PublishFailed(SinkError),
}

/// The spike detector service.
pub struct Detector {
    source: Arc<dyn SampleSource>,
    states: Arc<dyn StateStore>,
    sink: Arc<dyn EventSink>,
    config: DetectConfig,
    poll_interval: Duration,
    store_timeout: Duration,
    /// Global snapshot of the most recent cycle.
    global: RwLock<Option<Arc<GlobalBaseline>>>,
    last_report: RwLock<Option<CycleReport>>,
    cycles: AtomicU64,
}

impl Detector {
    pub fn new(
        source: Arc<dyn SampleSource>,
        states: Arc<dyn StateStore>,
        sink: Arc<dyn EventSink>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            source,
            states,
            sink,
            config: config.detect.clone(),
            poll_interval: config.poll_interval,
            store_timeout: config.store_timeout,
            global: RwLock::new(None),
            last_report: RwLock::new(None),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DetectConfig {
        &self.config
    }

    /// Number of cycles run so far, aborted ones included.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().clone()
    }

    /// Global baseline of the most recent successful cycle.
    pub fn global_baseline(&self) -> Option<Arc<GlobalBaseline>> {
        self.global.read().clone()
    }

    /// Run cycles until `shutdown` turns true or its sender is dropped.
    pub async fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_secs = self.poll_interval.as_secs(),
            policy = %self.config.overlap_policy,
            "detector started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.cycle(Utc::now(), &shutdown).await {
                warn!("cycle aborted: {e}");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("detector stopped");
    }

    /// Run one cycle as of `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, StoreError> {
        let (_tx, rx) = watch::channel(false);
        self.cycle(now, &rx).await
    }

    async fn cycle(
        &self,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, StoreError> {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let mut report = CycleReport {
            started_at: now,
            finished_at: now,
            ..CycleReport::default()
        };

        let loaded = self.load_cycle_inputs(now).await;
        let (global, feeds) = match loaded {
            Ok(inputs) => inputs,
            Err(e) => {
                report.aborted = Some(e.to_string());
                report.finished_at = Utc::now();
                *self.last_report.write() = Some(report);
                return Err(e);
            }
        };
        report.global_samples = global.buckets().values().map(|b| b.sample_count).sum();
        report.feeds = feeds.len();

        for feed in &feeds {
            if *shutdown.borrow() {
                report.aborted = Some("shutdown".to_string());
                break;
            }
            match self.evaluate_feed(feed, &global, now).await {
                Ok(outcome) => {
                    report.evaluated += 1;
                    match outcome {
                        FeedOutcome::NoSamples => report.no_samples += 1,
                        FeedOutcome::Unchanged => {}
                        FeedOutcome::Activated(_) => report.activated += 1,
                        FeedOutcome::Recovered => report.recovered += 1,
                        FeedOutcome::PublishFailed(_) => report.publish_failures += 1,
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(feed_id = %feed.feed_id, "skipping feed: {e}");
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            feeds = report.feeds,
            evaluated = report.evaluated,
            failed = report.failed,
            activated = report.activated,
            recovered = report.recovered,
            publish_failures = report.publish_failures,
            "cycle complete"
        );
        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    async fn load_cycle_inputs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Arc<GlobalBaseline>, Vec<Feed>), StoreError> {
        let since = self.config.global_lookback_start(now);
        let ranked = self
            .timed(self.source.list_global_rank_samples(since))
            .await?;
        let global = Arc::new(GlobalBaseline::compute(&ranked, &self.config));
        debug!(
            samples = ranked.len(),
            buckets = global.buckets().len(),
            "global baseline computed"
        );
        *self.global.write() = Some(Arc::clone(&global));

        let feeds = self.timed(self.source.list_feeds()).await?;
        Ok((global, feeds))
    }

    /// Evaluate one feed, publish on activation and persist any state change.
    pub async fn evaluate_feed(
        &self,
        feed: &Feed,
        global: &GlobalBaseline,
        now: DateTime<Utc>,
    ) -> Result<FeedOutcome, StoreError> {
        let since = self.config.lookback_start(now);
        let samples = self
            .timed(self.source.list_samples(&feed.feed_id, since))
            .await?;
        let prior = self
            .timed(self.states.get_spike_state(&feed.feed_id))
            .await?;

        let Some(FeedStep {
            decision,
            next_state,
            transition,
        }) = step(feed, &samples, global, &prior, &self.config, now)
        else {
            debug!(feed_id = %feed.feed_id, "no samples in lookback");
            return Ok(FeedOutcome::NoSamples);
        };

        debug!(
            feed_id = %feed.feed_id,
            tier = %decision.tier_kind(),
            listeners = decision.current.listener_count,
            median = decision.median(),
            mad = decision.mad(),
            robust_z = decision.current_z(),
            spike = decision.is_spike_now(),
            recovered = decision.is_recovered(),
            "decision"
        );

        match transition {
            Transition::Unchanged => Ok(FeedOutcome::Unchanged),
            Transition::Activated { event } => {
                if let Err(e) = self.publish(&event).await {
                    warn!(feed_id = %feed.feed_id, "spike not published, will retry: {e}");
                    return Ok(FeedOutcome::PublishFailed(e));
                }
                info!(
                    feed_id = %feed.feed_id,
                    name = %feed.name,
                    tier = %decision.tier_kind(),
                    listeners = event.listener_count,
                    robust_z = event.robust_z,
                    "spike started"
                );
                if let Err(e) = self.timed(self.states.set_spike_state(&next_state)).await {
                    warn!(feed_id = %feed.feed_id, "spike published but state not saved: {e}");
                }
                Ok(FeedOutcome::Activated(event))
            }
            Transition::Recovered => {
                self.timed(self.states.set_spike_state(&next_state)).await?;
                info!(
                    feed_id = %feed.feed_id,
                    listeners = decision.current.listener_count,
                    robust_z = decision.current_z(),
                    "spike ended"
                );
                Ok(FeedOutcome::Recovered)
            }
        }
    }

    /// Read-only trace of one feed as of `now`.
    ///
    /// Uses the last cycle's global snapshot when there is one. Returns
    /// `None` for an unknown feed.
    pub async fn inspect_feed(
        &self,
        feed_id: &FeedId,
        now: DateTime<Utc>,
    ) -> Result<Option<DecisionTrace>, StoreError> {
        let feeds = self.timed(self.source.list_feeds()).await?;
        let Some(feed) = feeds.into_iter().find(|f| &f.feed_id == feed_id) else {
            return Ok(None);
        };

        let global = match self.global_baseline() {
            Some(g) => g,
            None => {
                let since = self.config.global_lookback_start(now);
                let ranked = self
                    .timed(self.source.list_global_rank_samples(since))
                    .await?;
                Arc::new(GlobalBaseline::compute(&ranked, &self.config))
            }
        };

        let samples = self
            .timed(self.source.list_samples(feed_id, self.config.lookback_start(now)))
            .await?;
        let prior = self.timed(self.states.get_spike_state(feed_id)).await?;

        Ok(Some(inspect_with_global(
            &feed,
            &samples,
            &global,
            Some(&prior),
            &self.config,
            now,
        )))
    }

    pub async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        self.timed(self.source.list_feeds()).await
    }

    pub async fn spike_state(&self, feed_id: &FeedId) -> Result<SpikeState, StoreError> {
        self.timed(self.states.get_spike_state(feed_id)).await
    }

    async fn publish(&self, event: &SpikeEvent) -> Result<(), SinkError> {
        match tokio::time::timeout(self.store_timeout, self.sink.publish(event)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Delivery(format!(
                "timed out after {}ms",
                self.store_timeout.as_millis()
            ))),
        }
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout {
                millis: self.store_timeout.as_millis() as u64,
            })?
    }
}
