//! Daemon configuration.
//!
//! [`NodeConfig`] wraps the engine's [`DetectConfig`] with the service
//! settings: data directory, poll interval, store timeout, RPC binding and
//! logging. Sources are layered, later wins: built-in defaults, an optional
//! TOML file, then `SPIKEWATCH_*` environment variables. Durations are plain
//! integers (`*_secs`, `*_days`) in files and the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use spikewatch_core::constants::*;
use spikewatch_core::error::ConfigError;
use spikewatch_detect::config::{DetectConfig, OverlapPolicy};

/// Prefix of environment overrides, e.g. `SPIKEWATCH_ROBUST_Z_THRESHOLD=4.0`.
pub const ENV_PREFIX: &str = "SPIKEWATCH";

/// Configuration for a detector daemon instance.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub detect: DetectConfig,
    /// Delay between the end of one cycle and the start of the next.
    pub poll_interval: Duration,
    /// Upper bound on any single store call.
    pub store_timeout: Duration,
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// IP address for the JSON-RPC server to bind to.
    pub rpc_bind: String,
    /// Port for the JSON-RPC server.
    pub rpc_port: u16,
    /// Log level filter string (e.g. "info", "spikewatch_node_lib=debug").
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
    /// JSON-lines file receiving every spike event envelope, if set.
    pub events_file: Option<PathBuf>,
    /// Envelopes buffered between the detector and the events file writer.
    pub event_queue_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            detect: DetectConfig::default(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            store_timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
            data_dir: default_data_dir(),
            rpc_bind: "127.0.0.1".to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            events_file: None,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spikewatch")
}

impl NodeConfig {
    /// Load defaults, then `file` if given, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&RawSettings::default()).map_err(source_err)?,
        );

        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true),
        );

        let raw: RawSettings = builder
            .build()
            .map_err(source_err)?
            .try_deserialize()
            .map_err(source_err)?;
        raw.into_config()
    }

    /// Reject unusable settings. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detect.validate()?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::NonPositiveDuration { name: "poll_interval" });
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::NonPositiveDuration { name: "store_timeout" });
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity { name: "event_queue_capacity" });
        }
        match self.log_format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::Source(format!("unknown log format: {other}"))),
        }
    }

    /// Path to the RocksDB sample/state directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("spikedb")
    }

    /// Socket address string for the RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind, self.rpc_port)
    }
}

fn source_err(e: config::ConfigError) -> ConfigError {
    ConfigError::Source(e.to_string())
}

/// Flat, file/env-friendly form of [`NodeConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RawSettings {
    lookback_days: i64,
    persist_samples: usize,
    min_samples: usize,
    robust_z_threshold: f64,
    recovery_z_threshold: f64,
    max_sample_age_days: i64,
    global_lookback_days: i64,
    global_min_samples: usize,
    global_robust_z_threshold: f64,
    new_feed_min_listeners: u32,
    bucket_size: u32,
    overlap_policy: String,
    poll_interval_secs: u64,
    store_timeout_secs: u64,
    data_dir: PathBuf,
    rpc_bind: String,
    rpc_port: u16,
    log_level: String,
    log_format: String,
    events_file: Option<PathBuf>,
    event_queue_capacity: usize,
}

impl Default for RawSettings {
    fn default() -> Self {
        let node = NodeConfig::default();
        Self {
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            persist_samples: DEFAULT_PERSIST_SAMPLES,
            min_samples: DEFAULT_MIN_SAMPLES,
            robust_z_threshold: DEFAULT_ROBUST_Z_THRESHOLD,
            recovery_z_threshold: DEFAULT_RECOVERY_Z_THRESHOLD,
            max_sample_age_days: DEFAULT_MAX_SAMPLE_AGE_DAYS,
            global_lookback_days: DEFAULT_GLOBAL_LOOKBACK_DAYS,
            global_min_samples: DEFAULT_GLOBAL_MIN_SAMPLES,
            global_robust_z_threshold: DEFAULT_GLOBAL_ROBUST_Z_THRESHOLD,
            new_feed_min_listeners: DEFAULT_NEW_FEED_MIN_LISTENERS,
            bucket_size: DEFAULT_BUCKET_SIZE,
            overlap_policy: OverlapPolicy::default().to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            store_timeout_secs: DEFAULT_STORE_TIMEOUT_SECS,
            data_dir: node.data_dir,
            rpc_bind: node.rpc_bind,
            rpc_port: node.rpc_port,
            log_level: node.log_level,
            log_format: node.log_format,
            events_file: node.events_file,
            event_queue_capacity: node.event_queue_capacity,
        }
    }
}

impl RawSettings {
    fn into_config(self) -> Result<NodeConfig, ConfigError> {
        let detect = DetectConfig {
            lookback: days("lookback_days", self.lookback_days)?,
            persist_samples: self.persist_samples,
            min_samples: self.min_samples,
            robust_z_threshold: self.robust_z_threshold,
            recovery_z_threshold: self.recovery_z_threshold,
            max_sample_age: days("max_sample_age_days", self.max_sample_age_days)?,
            global_lookback: days("global_lookback_days", self.global_lookback_days)?,
            global_min_samples: self.global_min_samples,
            global_robust_z_threshold: self.global_robust_z_threshold,
            new_feed_min_listeners: self.new_feed_min_listeners,
            bucket_size: self.bucket_size,
            overlap_policy: self.overlap_policy.parse()?,
        };
        Ok(NodeConfig {
            detect,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            data_dir: self.data_dir,
            rpc_bind: self.rpc_bind,
            rpc_port: self.rpc_port,
            log_level: self.log_level,
            log_format: self.log_format,
            events_file: self.events_file,
            event_queue_capacity: self.event_queue_capacity,
        })
    }
}

fn days(name: &'static str, value: i64) -> Result<chrono::Duration, ConfigError> {
    chrono::Duration::try_days(value).ok_or(ConfigError::DurationTooLong {
        name,
        max_days: MAX_WINDOW_DAYS,
    })
}
