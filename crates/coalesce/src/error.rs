use std::time::Duration;

use thiserror::Error;

/// An error returned from [`Coordinator::get`](crate::Coordinator::get).
///
/// `E` is the caller's upstream error type. The coordinator never inspects it
/// beyond the retryability predicate supplied at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GetError<E> {
    /// Recomputation for the key is suppressed by an active backoff window
    /// and no stale entry exists to serve instead.
    #[error("recomputation suppressed for another {retry_after:?}")]
    BackingOff {
        /// Time remaining until the backoff window closes.
        retry_after: Duration,
    },

    /// The in-flight computation panicked or its runtime shut down before it
    /// settled.
    #[error("computation aborted: {0}")]
    Aborted(String),

    /// The computation settled with an upstream error, which is passed
    /// through verbatim.
    #[error("{0}")]
    Upstream(E),
}

impl<E> GetError<E> {
    /// Returns the upstream error, if this is one.
    pub fn upstream(&self) -> Option<&E> {
        match self {
            GetError::Upstream(error) => Some(error),
            _ => None,
        }
    }
}

/// Retryability predicate for upstreams that only expose textual errors.
///
/// Matches the wording used by rate-limiting reverse proxies and JSON-RPC
/// providers: any message mentioning status code 429 or the standard
/// "Too Many Requests" reason phrase, case-insensitively.
pub fn is_rate_limit_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("429") || message.contains("too many requests")
}
