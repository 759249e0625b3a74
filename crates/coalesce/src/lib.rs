//! # Single-flight cache coordination
//!
//! This crate protects slow or rate-limited upstreams (RPC nodes, databases,
//! third-party HTTP APIs) from being hammered by concurrent requests for the
//! same data. It combines three mechanisms behind one entry point, the
//! [`Coordinator`]:
//!
//! - An in-memory entry store that keeps the last-known value per key together
//!   with the time it was stored. Freshness is decided per request against a
//!   caller-supplied TTL, and stale entries stay around until they are
//!   superseded or explicitly invalidated, so they remain available as a
//!   degraded fallback.
//! - An in-flight registry that deduplicates concurrent recomputations
//!   (request coalescing). While a computation for a key is running, every
//!   caller for that key awaits the same shared future and observes the same
//!   outcome, value or error. The computation runs exactly once.
//! - A backoff tracker that suppresses recomputation for a growing cooldown
//!   window after consecutive retryable upstream failures (rate limiting and
//!   the like). While a key is backing off, callers are served the stale entry
//!   if one exists, or fail fast with [`GetError::BackingOff`].
//!
//! A request goes through the following steps:
//! - If the cached entry is younger than the request's TTL, it is returned
//!   without suspending.
//! - If a computation for the key is already in flight, the caller joins it.
//! - If the key is inside a backoff window, the stale entry is served (when
//!   allowed), otherwise the request fails fast.
//! - Otherwise a fresh computation is started. Its result is stored on
//!   success; retryable failures extend the backoff window and are masked by
//!   the stale entry when one is available.
//!
//! Whether a failure counts as retryable is decided by a predicate supplied
//! when constructing the [`Coordinator`], since the shape of upstream errors
//! is outside this crate's control. [`is_rate_limit_message`] covers the
//! common case of upstreams that only expose textual errors.
//!
//! ## Metrics
//!
//! All series are tagged with a `cache` field carrying the coordinator name
//! from [`CoordinatorConfig`]:
//!
//! - `cache.access`: all calls into [`Coordinator::get`].
//! - `cache.fresh_hit`: calls served synchronously from a fresh entry.
//! - `cache.coalesced`: calls that joined an already running computation.
//! - `cache.computation`: computations actually started.
//! - `cache.computation_duration`: a timer over settled computations.
//! - `cache.computation_failure`: settled computations that failed, tagged
//!   with `retryable`.
//! - `cache.in_flight`: a gauge of currently running computations.
//! - `cache.stale_serve`: calls resolved with a stale entry, either during a
//!   backoff window or masking a retryable failure.
//! - `cache.backoff_rejected`: calls failed fast because a backoff window was
//!   active and no stale entry existed.
//!
//! Metrics are sent to statsd via [`metrics::configure_statsd`] and silently
//! dropped until that is called.
//!
//! ## Concurrency
//!
//! A coordinator instance is cheap to clone and safe to share across tasks
//! and threads. All bookkeeping happens in synchronous critical sections
//! under a single coordinator-wide mutex; the lock is never held across a
//! suspension point. The in-flight future for a key is registered inside the
//! same critical section that decides to recompute, so no interleaving of
//! concurrent callers can start a second computation for the same key.
//!
//! Computations run on a spawned task and always run to completion once
//! started; dropping the callers does not cancel them. There is no intrinsic
//! timeout, a timeout enforced inside the computation itself surfaces as a
//! regular failure.

mod backoff;
mod config;
mod coordinator;
mod error;
mod inflight;
pub mod metrics;
mod store;

#[cfg(test)]
mod tests;

pub use config::{BackoffConfig, CoordinatorConfig, FetchOptions};
pub use coordinator::Coordinator;
pub use error::{GetError, is_rate_limit_message};
