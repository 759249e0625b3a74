use std::time::Duration;

use serde::Deserialize;

/// Fine-tuning for the failure cooldown applied to a key after consecutive
/// retryable upstream failures.
///
/// The cooldown window for the `n`-th consecutive failure is
/// `min(2^n * base_delay, max_delay)`, with `n` capped at `max_failures`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    /// Base delay for the exponential cooldown.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Ceiling for the cooldown window.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Cap for the consecutive failure counter.
    pub max_failures: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            max_failures: 5,
        }
    }
}

/// Configuration for one [`Coordinator`](crate::Coordinator) instance.
///
/// Each cache domain (e.g. "pools", "positions") gets its own coordinator and
/// thus its own name and backoff tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Name of this coordinator, used as the `cache` tag on metrics and log
    /// records.
    pub name: String,

    /// Failure cooldown tuning.
    pub backoff: BackoffConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Per-request options for [`Coordinator::get`](crate::Coordinator::get).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchOptions {
    /// Maximum age after which a cached value is considered stale.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Whether a stale entry may be served when recomputation is suppressed
    /// (backoff window) or fails with a retryable error.
    pub serve_stale: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            serve_stale: true,
        }
    }
}
