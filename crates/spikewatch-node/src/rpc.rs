//! JSON-RPC server for the spikewatch daemon.
//!
//! Uses jsonrpsee 0.24 to expose read-only queries: feeds, spike state,
//! decision traces, the global baseline, and cycle status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};

use spikewatch_core::types::{Feed, FeedId, SpikeState};
use spikewatch_detect::bucket::GlobalBaseline;
use spikewatch_detect::config::DetectConfig;
use spikewatch_detect::trace::DecisionTrace;

use crate::detector::{CycleReport, Detector};

/// JSON representation of a feed's spike state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpikeStateJson {
    pub feed_id: String,
    pub active: bool,
    /// RFC 3339, present iff active.
    pub activated_at: Option<DateTime<Utc>>,
}

impl From<SpikeState> for SpikeStateJson {
    fn from(state: SpikeState) -> Self {
        Self {
            active: state.is_active(),
            feed_id: state.feed_id.0,
            activated_at: state.activated_at,
        }
    }
}

/// JSON representation of one rank bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketJson {
    pub bucket: usize,
    pub first_rank: u32,
    pub last_rank: u32,
    pub median: f64,
    pub mad: f64,
    pub sample_count: usize,
    /// Enough samples and non-zero spread to decide on.
    pub usable: bool,
}

/// JSON representation of the global rank-bucket baseline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalBaselineJson {
    pub bucket_size: u32,
    pub num_buckets: usize,
    pub buckets: Vec<BucketJson>,
}

impl GlobalBaselineJson {
    pub fn from_baseline(global: &GlobalBaseline, cfg: &DetectConfig) -> Self {
        let size = global.bucket_size();
        let buckets = global
            .buckets()
            .iter()
            .map(|(&bucket, b)| BucketJson {
                bucket,
                first_rank: bucket as u32 * size + 1,
                last_rank: (bucket as u32 + 1) * size,
                median: b.median,
                mad: b.mad,
                sample_count: b.sample_count,
                usable: global.usable(bucket, cfg).is_some(),
            })
            .collect();
        Self {
            bucket_size: size,
            num_buckets: global.num_buckets(),
            buckets,
        }
    }
}

/// JSON representation of the detector loop status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleStatusJson {
    pub cycles: u64,
    pub last_report: Option<CycleReport>,
}

/// Parse an optional RFC 3339 timestamp; `None` means now.
pub fn parse_at(at: Option<&str>) -> Result<DateTime<Utc>, ErrorObjectOwned> {
    match at {
        None => Ok(Utc::now()),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| rpc_error(-8, "timestamp must be RFC 3339")),
    }
}

/// Create a JSON-RPC error.
fn rpc_error(code: i32, msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, msg.to_string(), None::<()>)
}

/// The spikewatch JSON-RPC interface.
#[rpc(server)]
pub trait SpikewatchRpc {
    /// Returns all known feeds.
    #[method(name = "listfeeds")]
    async fn list_feeds(&self) -> Result<Vec<Feed>, ErrorObjectOwned>;

    /// Returns the stored spike state of a feed.
    #[method(name = "getspikestate")]
    async fn get_spike_state(&self, feed_id: String) -> Result<SpikeStateJson, ErrorObjectOwned>;

    /// Returns the decision trace of a feed, as of `at` (RFC 3339) or now.
    #[method(name = "inspectfeed")]
    async fn inspect_feed(
        &self,
        feed_id: String,
        at: Option<String>,
    ) -> Result<DecisionTrace, ErrorObjectOwned>;

    /// Returns the global baseline of the last cycle.
    #[method(name = "getglobalbaseline")]
    async fn get_global_baseline(&self) -> Result<GlobalBaselineJson, ErrorObjectOwned>;

    /// Returns the cycle count and the last cycle report.
    #[method(name = "getcyclestatus")]
    async fn get_cycle_status(&self) -> Result<CycleStatusJson, ErrorObjectOwned>;
}

/// Implementation of the spikewatch JSON-RPC server.
pub struct RpcServerImpl {
    detector: Arc<Detector>,
}

impl RpcServerImpl {
    pub fn new(detector: Arc<Detector>) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl SpikewatchRpcServer for RpcServerImpl {
    async fn list_feeds(&self) -> Result<Vec<Feed>, ErrorObjectOwned> {
        self.detector
            .list_feeds()
            .await
            .map_err(|e| rpc_error(-1, &e.to_string()))
    }

    async fn get_spike_state(&self, feed_id: String) -> Result<SpikeStateJson, ErrorObjectOwned> {
        let state = self
            .detector
            .spike_state(&FeedId::from(feed_id))
            .await
            .map_err(|e| rpc_error(-1, &e.to_string()))?;
        Ok(state.into())
    }

    async fn inspect_feed(
        &self,
        feed_id: String,
        at: Option<String>,
    ) -> Result<DecisionTrace, ErrorObjectOwned> {
        let now = parse_at(at.as_deref())?;
        self.detector
            .inspect_feed(&FeedId::from(feed_id), now)
            .await
            .map_err(|e| rpc_error(-1, &e.to_string()))?
            .ok_or_else(|| rpc_error(-5, "feed not found"))
    }

    async fn get_global_baseline(&self) -> Result<GlobalBaselineJson, ErrorObjectOwned> {
        let global = self
            .detector
            .global_baseline()
            .ok_or_else(|| rpc_error(-5, "no cycle has completed yet"))?;
        Ok(GlobalBaselineJson::from_baseline(&global, self.detector.config()))
    }

    async fn get_cycle_status(&self) -> Result<CycleStatusJson, ErrorObjectOwned> {
        Ok(CycleStatusJson {
            cycles: self.detector.cycles(),
            last_report: self.detector.last_report(),
        })
    }
}

/// Start the JSON-RPC server on `addr`.
pub async fn start_rpc_server(
    addr: &str,
    detector: Arc<Detector>,
) -> Result<ServerHandle, std::io::Error> {
    let server = Server::builder().build(addr).await?;
    let rpc_impl = RpcServerImpl::new(detector);
    Ok(server.start(rpc_impl.into_rpc()))
}
