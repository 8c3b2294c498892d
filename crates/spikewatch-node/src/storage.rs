//! RocksDB-backed sample and spike-state storage.
//!
//! Implements [`SampleSource`] and [`StateStore`] using RocksDB column
//! families for feeds, per-feed samples, the time-ordered rank index, and
//! spike state. Sample insertion writes the sample and its rank index entry
//! in one atomic [`WriteBatch`].
//!
//! Key layout:
//! - `feeds`:        `feed_id`
//! - `samples`:      `feed_id ∥ 0x00 ∥ ts_be`
//! - `rank_samples`: `ts_be ∥ feed_id`
//! - `spike_state`:  `feed_id`
//!
//! `ts_be` is the millisecond timestamp with the sign bit flipped, big-endian,
//! so byte order equals time order.
//!
//! The trait methods run on tokio's blocking pool, so a caller's timeout
//! fires even while RocksDB is stuck in a read or write.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};

use spikewatch_core::error::StoreError;
use spikewatch_core::traits::{SampleSource, StateStore};
use spikewatch_core::types::{Feed, FeedId, GlobalRankSample, Sample, SpikeState};

// --- Column family names ---

const CF_FEEDS: &str = "feeds";
const CF_SAMPLES: &str = "samples";
const CF_RANK_SAMPLES: &str = "rank_samples";
const CF_SPIKE_STATE: &str = "spike_state";

/// All column family names.
const ALL_CFS: &[&str] = &[CF_FEEDS, CF_SAMPLES, CF_RANK_SAMPLES, CF_SPIKE_STATE];

const KEY_SEPARATOR: u8 = 0x00;

#[derive(bincode::Encode, bincode::Decode)]
struct FeedRecord {
    name: String,
    url: String,
}

#[derive(bincode::Encode, bincode::Decode)]
struct SampleRecord {
    listener_count: u32,
    rank: Option<i32>,
}

#[derive(bincode::Encode, bincode::Decode)]
struct RankRecord {
    rank: i32,
    listener_count: u32,
}

#[derive(bincode::Encode, bincode::Decode)]
struct StateRecord {
    /// Unix milliseconds; `Some` iff active.
    activated_at_ms: Option<i64>,
}

/// RocksDB-backed persistent sample and state storage.
///
/// Cloning shares the underlying database handle.
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all column families if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert or replace a feed's name and url.
    pub fn upsert_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        check_feed_id(&feed.feed_id)?;
        let cf = self.cf_handle(CF_FEEDS)?;
        let value = encode(&FeedRecord {
            name: feed.name.clone(),
            url: feed.url.clone(),
        })?;
        self.db
            .put_cf(cf, feed.feed_id.as_bytes(), value)
            .map_err(|e| StoreError::Storage(e.to_string()))
    }

    /// Insert one sample, replacing any sample of the same feed and timestamp.
    pub fn insert_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        self.insert_samples(std::slice::from_ref(sample))
    }

    /// Insert samples in one atomic batch.
    pub fn insert_samples(&self, samples: &[Sample]) -> Result<(), StoreError> {
        let cf_samples = self.cf_handle(CF_SAMPLES)?;
        let cf_ranks = self.cf_handle(CF_RANK_SAMPLES)?;
        let mut batch = WriteBatch::default();

        for sample in samples {
            check_feed_id(&sample.feed_id)?;
            let value = encode(&SampleRecord {
                listener_count: sample.listener_count,
                rank: sample.rank,
            })?;
            batch.put_cf(cf_samples, sample_key(&sample.feed_id, sample.timestamp), value);

            let rank_key = rank_key(sample.timestamp, &sample.feed_id);
            match sample.rank {
                Some(rank) => {
                    let value = encode(&RankRecord {
                        rank,
                        listener_count: sample.listener_count,
                    })?;
                    batch.put_cf(cf_ranks, rank_key, value);
                }
                // A replaced sample may have carried a rank.
                None => batch.delete_cf(cf_ranks, rank_key),
            }
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Storage(e.to_string()))
    }

    /// Look up one feed.
    pub fn get_feed(&self, feed_id: &FeedId) -> Result<Option<Feed>, StoreError> {
        let cf = self.cf_handle(CF_FEEDS)?;
        match self
            .db
            .get_cf(cf, feed_id.as_bytes())
            .map_err(|e| StoreError::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let record: FeedRecord = decode(&bytes)?;
                Ok(Some(Feed {
                    feed_id: feed_id.clone(),
                    name: record.name,
                    url: record.url,
                }))
            }
            None => Ok(None),
        }
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Storage(e.to_string()))
    }

    // --- Internal helpers ---

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Storage(format!("missing column family: {name}")))
    }
}

#[async_trait]
impl SampleSource for RocksStore {
    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let store = self.clone();
        blocking(move || store.scan_feeds()).await
    }

    async fn list_samples(
        &self,
        feed_id: &FeedId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Sample>, StoreError> {
        let store = self.clone();
        let feed_id = feed_id.clone();
        blocking(move || store.scan_samples(&feed_id, since)).await
    }

    async fn list_global_rank_samples(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<GlobalRankSample>, StoreError> {
        let store = self.clone();
        blocking(move || store.scan_rank_samples(since)).await
    }
}

#[async_trait]
impl StateStore for RocksStore {
    async fn get_spike_state(&self, feed_id: &FeedId) -> Result<SpikeState, StoreError> {
        let store = self.clone();
        let feed_id = feed_id.clone();
        blocking(move || store.read_state(&feed_id)).await
    }

    async fn set_spike_state(&self, state: &SpikeState) -> Result<(), StoreError> {
        let store = self.clone();
        let state = state.clone();
        blocking(move || store.write_state(&state)).await
    }
}

// --- Blocking reads and writes ---

impl RocksStore {
    fn scan_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let cf = self.cf_handle(CF_FEEDS)?;
        let mut feeds = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Storage(e.to_string()))?;
            let feed_id = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Codec(format!("feed key: {e}")))?;
            let record: FeedRecord = decode(&value)?;
            feeds.push(Feed {
                feed_id: FeedId::from(feed_id),
                name: record.name,
                url: record.url,
            });
        }
        Ok(feeds)
    }

    fn scan_samples(&self, feed_id: &FeedId, since: DateTime<Utc>) -> Result<Vec<Sample>, StoreError> {
        let cf = self.cf_handle(CF_SAMPLES)?;
        let prefix = feed_prefix(feed_id);
        let start = sample_key(feed_id, since);

        let mut samples = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Storage(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let timestamp = decode_ts(&key[prefix.len()..])?;
            let record: SampleRecord = decode(&value)?;
            samples.push(Sample {
                feed_id: feed_id.clone(),
                timestamp,
                listener_count: record.listener_count,
                rank: record.rank,
            });
        }
        Ok(samples)
    }

    fn scan_rank_samples(&self, since: DateTime<Utc>) -> Result<Vec<GlobalRankSample>, StoreError> {
        let cf = self.cf_handle(CF_RANK_SAMPLES)?;
        let start = ts_key(since);

        let mut samples = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (_, value) = item.map_err(|e| StoreError::Storage(e.to_string()))?;
            let record: RankRecord = decode(&value)?;
            samples.push(GlobalRankSample {
                rank: record.rank,
                listener_count: record.listener_count,
            });
        }
        Ok(samples)
    }

    fn read_state(&self, feed_id: &FeedId) -> Result<SpikeState, StoreError> {
        let cf = self.cf_handle(CF_SPIKE_STATE)?;
        let Some(bytes) = self
            .db
            .get_cf(cf, feed_id.as_bytes())
            .map_err(|e| StoreError::Storage(e.to_string()))?
        else {
            return Ok(SpikeState::inactive(feed_id.clone()));
        };

        let record: StateRecord = decode(&bytes)?;
        let activated_at = record
            .activated_at_ms
            .map(|ms| {
                Utc.timestamp_millis_opt(ms)
                    .single()
                    .ok_or_else(|| StoreError::Codec(format!("activation time out of range: {ms}")))
            })
            .transpose()?;
        Ok(SpikeState {
            feed_id: feed_id.clone(),
            activated_at,
        })
    }

    fn write_state(&self, state: &SpikeState) -> Result<(), StoreError> {
        check_feed_id(&state.feed_id)?;
        let cf = self.cf_handle(CF_SPIKE_STATE)?;
        let value = encode(&StateRecord {
            activated_at_ms: state.activated_at.map(|t| t.timestamp_millis()),
        })?;
        self.db
            .put_cf(cf, state.feed_id.as_bytes(), value)
            .map_err(|e| StoreError::Storage(e.to_string()))
    }
}

/// Run a RocksDB call on the blocking pool so callers can time it out.
async fn blocking<T, F>(call: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| StoreError::Storage(format!("store task failed: {e}")))?
}

// --- Keys and codec ---

fn check_feed_id(feed_id: &FeedId) -> Result<(), StoreError> {
    if feed_id.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(StoreError::Codec(format!("feed id contains NUL: {feed_id:?}")));
    }
    Ok(())
}

fn ts_key(ts: DateTime<Utc>) -> [u8; 8] {
    ((ts.timestamp_millis() as u64) ^ (1 << 63)).to_be_bytes()
}

fn decode_ts(bytes: &[u8]) -> Result<DateTime<Utc>, StoreError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Codec(format!("timestamp key of {} bytes", bytes.len())))?;
    let ms = (u64::from_be_bytes(arr) ^ (1 << 63)) as i64;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Codec(format!("timestamp out of range: {ms}")))
}

fn feed_prefix(feed_id: &FeedId) -> Vec<u8> {
    let mut key = Vec::with_capacity(feed_id.as_bytes().len() + 1);
    key.extend_from_slice(feed_id.as_bytes());
    key.push(KEY_SEPARATOR);
    key
}

fn sample_key(feed_id: &FeedId, ts: DateTime<Utc>) -> Vec<u8> {
    let mut key = feed_prefix(feed_id);
    key.extend_from_slice(&ts_key(ts));
    key
}

fn rank_key(ts: DateTime<Utc>, feed_id: &FeedId) -> Vec<u8> {
    let mut key = ts_key(ts).to_vec();
    key.extend_from_slice(feed_id.as_bytes());
    key
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ts_key_orders_like_time() {
        let a = Utc.with_ymd_and_hms(1969, 12, 31, 23, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(1970, 1, 1, 1, 0, 0).unwrap();
        let c = b + Duration::milliseconds(1);
        assert!(ts_key(a) < ts_key(b));
        assert!(ts_key(b) < ts_key(c));
    }

    #[test]
    fn ts_key_decodes_back() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 56).unwrap() + Duration::milliseconds(789);
        assert_eq!(decode_ts(&ts_key(t)).unwrap(), t);
    }

    #[test]
    fn decode_ts_rejects_short_key() {
        assert!(matches!(decode_ts(&[1, 2, 3]), Err(StoreError::Codec(_))));
    }

    #[test]
    fn feed_prefix_does_not_match_longer_id() {
        // "1" must not see samples of "12".
        let one = feed_prefix(&FeedId::from("1"));
        let twelve = sample_key(&FeedId::from("12"), Utc::now());
        assert!(!twelve.starts_with(&one));
    }

    #[test]
    fn nul_in_feed_id_rejected() {
        assert!(check_feed_id(&FeedId::from("a\0b")).is_err());
        assert!(check_feed_id(&FeedId::from("4242")).is_ok());
    }
}
