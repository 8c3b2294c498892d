//! Error types for spikewatch.
//!
//! An unusable baseline is not an error; see the detection crate's outcome types.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("bucket size must be in 1..={max}, got {got}")] InvalidBucketSize { got: u32, max: u32 },
    #[error("persist_samples must be at least 1")] ZeroPersistSamples,
    #[error("persist_samples must be at most {max}, got {got}")] PersistSamplesTooLarge { got: usize, max: usize },
    #[error("{name} must be at least 1")] ZeroMinSamples { name: &'static str },
    #[error("{name} must be finite, got {value}")] NonFiniteThreshold { name: &'static str, value: f64 },
    #[error("recovery threshold {recovery} must be below {name} {activation}")] InvertedHysteresis { name: &'static str, recovery: f64, activation: f64 },
    #[error("{name} must be positive")] NonPositiveDuration { name: &'static str },
    #[error("{name} must be at most {max_days} days")] DurationTooLong { name: &'static str, max_days: i64 },
    #[error("{name} must be at least 1")] ZeroCapacity { name: &'static str },
    #[error("unknown overlap policy: {0}")] UnknownOverlapPolicy(String),
    #[error("config source: {0}")] Source(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")] Unavailable(String),
    #[error("store call timed out after {millis}ms")] Timeout { millis: u64 },
    #[error("corrupt record: {0}")] Codec(String),
    #[error("storage: {0}")] Storage(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("event sink closed")] Closed,
    #[error("encode event: {0}")] Encode(String),
    #[error("delivery failed: {0}")] Delivery(String),
}

#[derive(Error, Debug)]
pub enum SpikeError {
    #[error(transparent)] Config(#[from] ConfigError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Sink(#[from] SinkError),
}
