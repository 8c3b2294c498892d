//! Detection constants and configuration defaults.

/// Consistency constant that scales MAD to a standard-normal deviation.
pub const ROBUST_Z_SCALE: f64 = 0.6745;

/// A MAD at or below this value is treated as zero spread (unusable baseline).
pub const MAD_EPSILON: f64 = 1e-9;

/// Highest positional rank published in the top listing.
///
/// Ranks are 1-based; anything outside `1..=MAX_RANK` is ignored when bucketing.
///
/// # Examples
///
/// ```
/// use spikewatch_core::constants::{MAX_RANK, DEFAULT_BUCKET_SIZE};
/// assert_eq!(MAX_RANK / DEFAULT_BUCKET_SIZE, 5);
/// ```
pub const MAX_RANK: u32 = 25;

// --- Per-feed tier ---

/// Per-feed lookback window, in days.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 3;

/// Size of the recent "persist" window excluded from the per-feed baseline.
pub const DEFAULT_PERSIST_SAMPLES: usize = 3;

/// Minimum samples required for a per-feed baseline.
pub const DEFAULT_MIN_SAMPLES: usize = 40;

/// Robust Z every persist-window sample must reach to activate.
pub const DEFAULT_ROBUST_Z_THRESHOLD: f64 = 3.5;

/// Robust Z at or below which an active spike is considered recovered.
pub const DEFAULT_RECOVERY_Z_THRESHOLD: f64 = 1.0;

/// Newest sample older than this disables the per-feed tier, in days.
pub const DEFAULT_MAX_SAMPLE_AGE_DAYS: i64 = 3;

/// Largest accepted persist window.
pub const MAX_PERSIST_SAMPLES: usize = 10_000;

/// Longest accepted lookback or sample age, in days (100 years).
pub const MAX_WINDOW_DAYS: i64 = 36_500;

// --- Global tier ---

/// Global rank-bucket lookback window, in days.
pub const DEFAULT_GLOBAL_LOOKBACK_DAYS: i64 = 180;

/// Minimum samples for a rank bucket to be usable.
pub const DEFAULT_GLOBAL_MIN_SAMPLES: usize = 300;

/// Robust Z a feed must reach against its rank bucket to activate.
pub const DEFAULT_GLOBAL_ROBUST_Z_THRESHOLD: f64 = 3.0;

/// Absolute listener floor for global-bucket and hard-threshold activation.
pub const DEFAULT_NEW_FEED_MIN_LISTENERS: u32 = 80;

/// Number of consecutive ranks grouped into one bucket.
pub const DEFAULT_BUCKET_SIZE: u32 = 5;

// --- Service ---

/// Delay between the end of one evaluation cycle and the start of the next, in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 120;

/// Timeout for a single store call, in seconds.
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

/// Default JSON-RPC port of the detector daemon.
pub const DEFAULT_RPC_PORT: u16 = 18640;

/// Spike envelopes buffered for the events file writer.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1_024;

/// Event type tag for spike notifications on the queue.
pub const EVENT_TYPE_SPIKE: &str = "spike";
