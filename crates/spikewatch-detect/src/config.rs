//! Tunables of the detection engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use spikewatch_core::constants::*;
use spikewatch_core::error::ConfigError;

/// What an active feed does when the spike and recovery predicates both hold.
///
/// The two readings are equally defensible; `FavorActive` is the default.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    /// Stay active: the overlap is a no-op.
    #[default]
    FavorActive,
    /// Recover: the recovery predicate wins.
    FavorRecovery,
}

impl FromStr for OverlapPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "favor-active" | "active" => Ok(Self::FavorActive),
            "favor-recovery" | "recovery" => Ok(Self::FavorRecovery),
            other => Err(ConfigError::UnknownOverlapPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FavorActive => f.write_str("favor-active"),
            Self::FavorRecovery => f.write_str("favor-recovery"),
        }
    }
}

/// Configuration of the tiered decision engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectConfig {
    /// Per-feed sample window.
    pub lookback: Duration,
    /// Size N of the recent window that must all exceed the threshold.
    pub persist_samples: usize,
    /// Minimum samples (total and baseline-only) for a per-feed baseline.
    pub min_samples: usize,
    pub robust_z_threshold: f64,
    pub recovery_z_threshold: f64,
    /// A newest sample older than this disables the per-feed tier.
    pub max_sample_age: Duration,
    /// Window of ranked samples feeding the global baseline.
    pub global_lookback: Duration,
    pub global_min_samples: usize,
    pub global_robust_z_threshold: f64,
    /// Absolute listener floor for the global and hard-threshold tiers.
    pub new_feed_min_listeners: u32,
    /// Consecutive ranks per bucket.
    pub bucket_size: u32,
    pub overlap_policy: OverlapPolicy,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::days(DEFAULT_LOOKBACK_DAYS),
            persist_samples: DEFAULT_PERSIST_SAMPLES,
            min_samples: DEFAULT_MIN_SAMPLES,
            robust_z_threshold: DEFAULT_ROBUST_Z_THRESHOLD,
            recovery_z_threshold: DEFAULT_RECOVERY_Z_THRESHOLD,
            max_sample_age: Duration::days(DEFAULT_MAX_SAMPLE_AGE_DAYS),
            global_lookback: Duration::days(DEFAULT_GLOBAL_LOOKBACK_DAYS),
            global_min_samples: DEFAULT_GLOBAL_MIN_SAMPLES,
            global_robust_z_threshold: DEFAULT_GLOBAL_ROBUST_Z_THRESHOLD,
            new_feed_min_listeners: DEFAULT_NEW_FEED_MIN_LISTENERS,
            bucket_size: DEFAULT_BUCKET_SIZE,
            overlap_policy: OverlapPolicy::default(),
        }
    }
}

impl DetectConfig {
    /// Reject configurations that would produce silently wrong decisions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_size == 0 || self.bucket_size > MAX_RANK {
            return Err(ConfigError::InvalidBucketSize {
                got: self.bucket_size,
                max: MAX_RANK,
            });
        }
        if self.persist_samples == 0 {
            return Err(ConfigError::ZeroPersistSamples);
        }
        if self.persist_samples > MAX_PERSIST_SAMPLES {
            return Err(ConfigError::PersistSamplesTooLarge {
                got: self.persist_samples,
                max: MAX_PERSIST_SAMPLES,
            });
        }
        if self.min_samples == 0 {
            return Err(ConfigError::ZeroMinSamples { name: "min_samples" });
        }
        if self.global_min_samples == 0 {
            return Err(ConfigError::ZeroMinSamples {
                name: "global_min_samples",
            });
        }

        for (name, value) in [
            ("robust_z_threshold", self.robust_z_threshold),
            ("recovery_z_threshold", self.recovery_z_threshold),
            ("global_robust_z_threshold", self.global_robust_z_threshold),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NonFiniteThreshold { name, value });
            }
        }
        for (name, activation) in [
            ("robust_z_threshold", self.robust_z_threshold),
            ("global_robust_z_threshold", self.global_robust_z_threshold),
        ] {
            if self.recovery_z_threshold >= activation {
                return Err(ConfigError::InvertedHysteresis {
                    name,
                    recovery: self.recovery_z_threshold,
                    activation,
                });
            }
        }

        for (name, d) in [
            ("lookback", self.lookback),
            ("max_sample_age", self.max_sample_age),
            ("global_lookback", self.global_lookback),
        ] {
            if d <= Duration::zero() {
                return Err(ConfigError::NonPositiveDuration { name });
            }
            if d > Duration::days(MAX_WINDOW_DAYS) {
                return Err(ConfigError::DurationTooLong {
                    name,
                    max_days: MAX_WINDOW_DAYS,
                });
            }
        }
        Ok(())
    }

    /// Start of the per-feed sample window ending at `now`.
    pub fn lookback_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        window_start(now, self.lookback)
    }

    /// Start of the ranked-sample window ending at `now`.
    pub fn global_lookback_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        window_start(now, self.global_lookback)
    }

    /// Number of rank buckets covering ranks `1..=MAX_RANK`.
    pub fn num_buckets(&self) -> usize {
        MAX_RANK.div_ceil(self.bucket_size.max(1)) as usize
    }
}

/// `now - span`, clamped to the earliest representable time.
fn window_start(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(span)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
