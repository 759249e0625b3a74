use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::config::BackoffConfig;

#[derive(Clone, Copy, Debug)]
struct BackoffState {
    consecutive_failures: u32,
    backoff_until: Instant,
}

/// Tracks consecutive retryable failures per key and derives the cooldown
/// window during which recomputation is suppressed.
///
/// The window for the `n`-th consecutive failure is `min(2^n * base_delay,
/// max_delay)`; with the default tuning (30s base, 10m ceiling, counter
/// capped at 5) the ceiling is reached at the fifth failure. The window only
/// ever grows while failures keep coming, and a single success resets the
/// key completely.
#[derive(Debug)]
pub(crate) struct BackoffTracker<K> {
    config: BackoffConfig,
    states: FxHashMap<K, BackoffState>,
}

impl<K: Eq + Hash> BackoffTracker<K> {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            states: FxHashMap::default(),
        }
    }

    /// Records a retryable failure for `key` and returns the cooldown window
    /// applied to it.
    pub fn record_failure(&mut self, key: K) -> Duration {
        let state = self.states.entry(key).or_insert(BackoffState {
            consecutive_failures: 0,
            backoff_until: Instant::now(),
        });

        state.consecutive_failures =
            (state.consecutive_failures + 1).min(self.config.max_failures);
        let delay = self
            .config
            .base_delay
            .saturating_mul(2u32.saturating_pow(state.consecutive_failures))
            .min(self.config.max_delay);
        state.backoff_until = Instant::now() + delay;

        delay
    }

    /// Resets `key` after a successful computation.
    pub fn record_success(&mut self, key: &K) {
        self.states.remove(key);
    }

    /// Time remaining until the backoff window for `key` closes, if one is
    /// active.
    pub fn remaining(&self, key: &K) -> Option<Duration> {
        let state = self.states.get(key)?;
        let now = Instant::now();
        (state.backoff_until > now).then(|| state.backoff_until - now)
    }

    pub fn is_backing_off(&self, key: &K) -> bool {
        self.remaining(key).is_some()
    }

    #[cfg(test)]
    fn consecutive_failures(&self, key: &K) -> u32 {
        self.states
            .get(key)
            .map_or(0, |state| state.consecutive_failures)
    }
}
