//! End-to-end detector tests.
//!
//! Each test builds a store, runs one or more full detector cycles, and checks
//! published events and persisted spike state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as Span;
use tokio::sync::watch;

use proptest::prelude::*;

use spikewatch_core::traits::SampleSource;
use spikewatch_core::types::{FeedId, GlobalRankSample, Sample};
use spikewatch_detect::config::{DetectConfig, OverlapPolicy};
use spikewatch_node_lib::memory::MemoryStore;
use spikewatch_node_lib::storage::RocksStore;
use spikewatch_tests::helpers::*;

fn spiking_counts() -> Vec<u32> {
    let mut counts = calm_counts(42);
    counts.extend([500, 520, 510]);
    counts
}

#[tokio::test]
async fn forty_five_samples_activate_once() {
    let (store, now) = store_with("31", &spiking_counts());
    let sink = RecordingSink::new();
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));

    let report = det.run_cycle(now).await.unwrap();
    assert_eq!(report.activated, 1);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.feed_id, FeedId::from("31"));
    assert_eq!(event.name, "Feed 31");
    assert_eq!(event.listener_count, 510);
    assert_eq!(event.timestamp, now);
    assert!((event.median - 100.0).abs() < 1e-9);
    assert!((event.mad - 5.0).abs() < 1e-9);
    assert!(event.robust_z > 3.5);

    let state = store.stored_state(&FeedId::from("31")).unwrap();
    assert_eq!(state.activated_at, Some(now));
}

#[tokio::test]
async fn recovery_near_median_emits_nothing() {
    let (store, now) = store_with("31", &spiking_counts());
    let sink = RecordingSink::new();
    // 44.5h keeps all 45 samples now, and drops the oldest after one more hour.
    let cfg = DetectConfig {
        lookback: Span::minutes(44 * 60 + 30),
        ..DetectConfig::default()
    };
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(cfg));

    det.run_cycle(now).await.unwrap();
    assert_eq!(sink.count(), 1);

    let later = now + Span::hours(1);
    append(&store, "31", later, 105);
    let report = det.run_cycle(later).await.unwrap();

    assert_eq!(report.recovered, 1);
    assert_eq!(sink.count(), 1);
    let state = store.stored_state(&FeedId::from("31")).unwrap();
    assert!(!state.is_active());
    assert!(state.activated_at.is_none());
}

#[tokio::test]
async fn repeated_cycles_do_not_duplicate_events() {
    let (store, now) = store_with("31", &spiking_counts());
    let sink = RecordingSink::new();
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));

    for _ in 0..5 {
        det.run_cycle(now).await.unwrap();
    }
    assert_eq!(sink.count(), 1);
    assert_eq!(det.cycles(), 5);
}

#[tokio::test]
async fn window_never_full_never_activates() {
    let (store, mut now) = store_with("31", &calm_counts(42));
    let sink = RecordingSink::new();
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));

    // N-1 = 2 qualifying samples, then one back at baseline.
    for count in [500, 520, 100, 510, 530, 95] {
        now += Span::hours(1);
        append(&store, "31", now, count);
        det.run_cycle(now).await.unwrap();
    }
    assert_eq!(sink.count(), 0);
    assert!(store.active_feeds().is_empty());
}

#[tokio::test]
async fn single_outlier_does_not_activate() {
    let mut counts = calm_counts(44);
    counts.push(2_000);
    let (store, now) = store_with("31", &counts);
    let sink = RecordingSink::new();
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));

    det.run_cycle(now).await.unwrap();
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn failing_feed_is_skipped_and_others_continue() {
    let (store, now) = store_with("good", &spiking_counts());
    store.upsert_feed(feed("bad"));
    store.insert_samples(hourly("bad", t0(), &spiking_counts(), None));

    let source = FlakySource::new(store.clone());
    source.fail_feed("bad");
    let sink = RecordingSink::new();
    let det = detector(source.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));

    let report = det.run_cycle(now).await.unwrap();
    assert_eq!(report.feeds, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.activated, 1);
    assert_eq!(sink.events()[0].feed_id, FeedId::from("good"));
    assert!(store.stored_state(&FeedId::from("bad")).is_none());
}

#[tokio::test]
async fn store_timeout_skips_feed() {
    let (store, now) = store_with("good", &spiking_counts());
    store.upsert_feed(feed("slow"));

    let source = FlakySource::new(store.clone());
    source.hang_feed("slow");
    let sink = RecordingSink::new();
    let config = spikewatch_node_lib::config::NodeConfig {
        store_timeout: Duration::from_millis(50),
        ..node_config(DetectConfig::default())
    };
    let det = detector(source.clone(), store.clone(), sink.clone(), &config);

    let report = tokio::time::timeout(Duration::from_secs(10), det.run_cycle(now))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.activated, 1);
}

#[tokio::test]
async fn global_load_failure_aborts_cycle() {
    let (store, now) = store_with("31", &spiking_counts());
    let source = FlakySource::new(store.clone());
    source.fail_global(true);
    let sink = RecordingSink::new();
    let det = detector(source.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));

    assert!(det.run_cycle(now).await.is_err());
    assert_eq!(source.sample_calls(), 0);
    assert_eq!(sink.count(), 0);
    assert!(det.last_report().unwrap().aborted.is_some());

    // Next cycle recovers.
    source.fail_global(false);
    det.run_cycle(now).await.unwrap();
    assert_eq!(sink.count(), 1);
}

#[tokio::test]
async fn global_baseline_loaded_once_per_cycle() {
    let store = Arc::new(MemoryStore::new());
    for id in ["1", "2", "3", "4"] {
        store.upsert_feed(feed(id));
        store.insert_samples(hourly(id, t0(), &calm_counts(10), Some(3)));
    }
    let now = t0() + Span::hours(9);
    let source = FlakySource::new(store.clone());
    let det = detector(source.clone(), store.clone(), RecordingSink::new(), &node_config(DetectConfig::default()));

    det.run_cycle(now).await.unwrap();
    assert_eq!(source.global_calls(), 1);
    assert_eq!(source.sample_calls(), 4);

    det.run_cycle(now).await.unwrap();
    assert_eq!(source.global_calls(), 2);

    let global = det.global_baseline().unwrap();
    assert_eq!(global.get(0).unwrap().sample_count, 40);
}

#[tokio::test]
async fn new_feed_judged_against_rank_bucket() {
    let store = Arc::new(MemoryStore::new());
    // Established feeds in ranks 16-20 with ~60 listeners.
    for f in 0..40 {
        let id = format!("peer{f}");
        store.upsert_feed(feed(&id));
        let counts: Vec<u32> = (0..10).map(|i| 55 + ((f + i) % 11) as u32).collect();
        store.insert_samples(hourly(&id, t0(), &counts, Some(18)));
    }
    // A brand-new feed entering the same ranks far above its peers.
    store.upsert_feed(feed("new"));
    let now = t0() + Span::hours(9);
    store.insert_sample(Sample {
        feed_id: FeedId::from("new"),
        timestamp: now,
        listener_count: 400,
        rank: Some(17),
    });

    let sink = RecordingSink::new();
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));
    det.run_cycle(now).await.unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].feed_id, FeedId::from("new"));
    assert_eq!(events[0].median, 60.0);
    assert!(events[0].robust_z > 3.0);
}

#[tokio::test]
async fn hard_threshold_fallback_without_any_baseline() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_feed(feed("lonely"));
    store.upsert_feed(feed("quiet"));
    let now = t0();
    append(&store, "lonely", now, 80);
    append(&store, "quiet", now, 79);

    let sink = RecordingSink::new();
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));
    det.run_cycle(now).await.unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].feed_id, FeedId::from("lonely"));
    assert_eq!((events[0].median, events[0].mad, events[0].robust_z), (0.0, 0.0, 0.0));

    // Dropping under the floor recovers.
    let later = now + Span::minutes(2);
    append(&store, "lonely", later, 30);
    let report = det.run_cycle(later).await.unwrap();
    assert_eq!(report.recovered, 1);
}

#[tokio::test]
async fn feed_without_recent_samples_is_left_alone() {
    let (store, now) = store_with("31", &spiking_counts());
    let sink = RecordingSink::new();
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));

    let report = det.run_cycle(now + Span::days(30)).await.unwrap();
    assert_eq!(report.no_samples, 1);
    assert_eq!(sink.count(), 0);
    assert!(store.stored_state(&FeedId::from("31")).is_none());
}

#[tokio::test]
async fn publish_failure_retries_next_cycle() {
    let (store, now) = store_with("31", &spiking_counts());
    let sink = RecordingSink::new();
    sink.fail_next(1);
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));

    let report = det.run_cycle(now).await.unwrap();
    assert_eq!(report.publish_failures, 1);
    assert!(store.stored_state(&FeedId::from("31")).is_none());

    let report = det.run_cycle(now).await.unwrap();
    assert_eq!(report.activated, 1);
    assert_eq!(sink.count(), 1);
    assert!(store.stored_state(&FeedId::from("31")).unwrap().is_active());
}

#[tokio::test]
async fn overlap_policy_controls_recovery() {
    // Recovery threshold above the spike z makes both predicates hold.
    let cfg = DetectConfig {
        recovery_z_threshold: 1_000.0,
        ..DetectConfig::default()
    };
    for (policy, stays_active) in [
        (OverlapPolicy::FavorActive, true),
        (OverlapPolicy::FavorRecovery, false),
    ] {
        let (store, now) = store_with("31", &spiking_counts());
        let sink = RecordingSink::new();
        let cfg = DetectConfig {
            overlap_policy: policy,
            ..cfg.clone()
        };
        let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(cfg));

        det.run_cycle(now).await.unwrap();
        assert_eq!(sink.count(), 1);
        det.run_cycle(now).await.unwrap();
        assert_eq!(
            store.stored_state(&FeedId::from("31")).unwrap().is_active(),
            stays_active,
            "policy {policy}"
        );
    }
}

#[tokio::test]
async fn inspection_matches_live_decision() {
    let (store, now) = store_with("31", &spiking_counts());
    let sink = RecordingSink::new();
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));

    let trace = det.inspect_feed(&FeedId::from("31"), now).await.unwrap().unwrap();
    assert!(trace.is_spike_now);
    assert_eq!(sink.count(), 0);

    det.run_cycle(now).await.unwrap();
    let state = store.stored_state(&FeedId::from("31")).unwrap();
    assert_eq!(trace.next_state, state);
    assert_eq!(trace.current_z, sink.events()[0].robust_z);
}

#[tokio::test]
async fn run_loop_cycles_until_shutdown() {
    let (store, _) = store_with("31", &spiking_counts());
    let sink = RecordingSink::new();
    // The loop runs on the wall clock; widen the windows so the fixed timeline stays in view.
    let cfg = DetectConfig {
        lookback: Span::days(36_500),
        max_sample_age: Span::days(36_500),
        ..DetectConfig::default()
    };
    let det = Arc::new(detector(store.clone(), store.clone(), sink.clone(), &node_config(cfg)));

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let det = Arc::clone(&det);
        async move { det.run(rx).await }
    });

    tokio::time::timeout(Duration::from_secs(10), async {
        while det.cycles() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sink.count(), 1);
}

#[tokio::test]
async fn rocks_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spikedb");
    let now;
    {
        let store = Arc::new(RocksStore::open(&path).unwrap());
        store.upsert_feed(&feed("31")).unwrap();
        let samples = hourly("31", t0(), &spiking_counts(), Some(9));
        now = samples.last().unwrap().timestamp;
        store.insert_samples(&samples).unwrap();

        let sink = RecordingSink::new();
        let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));
        det.run_cycle(now).await.unwrap();
        assert_eq!(sink.count(), 1);
        store.flush().unwrap();
    }

    // Reopened store remembers the activation: no second event.
    let store = Arc::new(RocksStore::open(&path).unwrap());
    let sink = RecordingSink::new();
    let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));
    det.run_cycle(now).await.unwrap();
    assert_eq!(sink.count(), 0);

    let ranked: Vec<GlobalRankSample> = store.list_global_rank_samples(t0()).await.unwrap();
    assert_eq!(ranked.len(), 45);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// However the tail of a series moves, re-running cycles never repeats an event.
    #[test]
    fn at_most_one_event_per_activation(tail in prop::collection::vec(0u32..2_000, 1..12), repeats in 1usize..4) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (store, mut now) = store_with("31", &calm_counts(42));
            let sink = RecordingSink::new();
            let det = detector(store.clone(), store.clone(), sink.clone(), &node_config(DetectConfig::default()));

            let mut activations = 0;
            for &count in &tail {
                now += Span::hours(1);
                append(&store, "31", now, count);
                activations += det.run_cycle(now).await.unwrap().activated;
                for _ in 1..repeats {
                    prop_assert_eq!(det.run_cycle(now).await.unwrap().activated, 0);
                }
            }
            prop_assert_eq!(sink.count(), activations);
            prop_assert!(activations <= tail.len());
            Ok(())
        })?;
    }
}
