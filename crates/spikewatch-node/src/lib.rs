//! # spikewatch-node-lib: detector service, storage, RPC.
//!
//! Composes the detection engine into a running daemon:
//! - [`detector::Detector`]: periodic cycle loop over all feeds
//! - [`storage::RocksStore`]: persistent samples and spike state backed by RocksDB
//! - [`memory::MemoryStore`]: in-memory store with the same contract
//! - [`sink`]: spike event sinks (log, queue channel, fan-out)
//! - [`rpc`]: JSON-RPC server for inspection
//! - [`config::NodeConfig`]: daemon configuration

pub mod config;
pub mod detector;
pub mod memory;
pub mod rpc;
pub mod sink;
pub mod storage;

pub use config::NodeConfig;
pub use detector::{CycleReport, Detector, FeedOutcome};
pub use memory::MemoryStore;
pub use rpc::start_rpc_server;
pub use sink::{ChannelSink, LogSink, MultiSink};
pub use storage::RocksStore;
