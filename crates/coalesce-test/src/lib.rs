//! Helpers for testing the cache coordinator.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - Most tests want a paused tokio clock (`tokio::time::pause`) so that
//!    freshness and backoff windows can be crossed with `time::advance`
//!    instead of real sleeps.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `coalesce`
///    crate and mutes everything else.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalesce=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// An upstream stand-in that plays back a scripted sequence of results and
/// counts how often it was actually invoked.
///
/// The call count is how tests assert the single-flight and freshness
/// properties: serving from cache or coalescing onto a running computation
/// must not consume a scripted result.
///
/// Handles are cheap to clone; clones share the script and the call count.
pub struct ScriptedUpstream<V, E> {
    inner: Arc<Inner<V, E>>,
    latency: Duration,
}

struct Inner<V, E> {
    results: Mutex<VecDeque<Result<V, E>>>,
    calls: AtomicUsize,
}

impl<V, E> Clone for ScriptedUpstream<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            latency: self.latency,
        }
    }
}

impl<V, E> ScriptedUpstream<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    pub fn new(results: impl IntoIterator<Item = Result<V, E>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                results: Mutex::new(results.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }),
            latency: Duration::ZERO,
        }
    }

    /// Makes every fetch take `latency` before it settles, to give
    /// concurrent callers a window to pile up.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Appends another scripted result.
    pub fn push(&self, result: Result<V, E>) {
        self.inner.results.lock().unwrap().push_back(result);
    }

    /// Number of times [`fetch`](Self::fetch) was actually run.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::Relaxed)
    }

    /// One upstream call: consumes and returns the next scripted result.
    ///
    /// # Panics
    ///
    /// The returned future panics if the script has run out of results,
    /// which means the test computed more often than it expected to.
    pub fn fetch(&self) -> impl Future<Output = Result<V, E>> + Send + 'static {
        let this = self.clone();
        async move {
            this.inner.calls.fetch_add(1, Ordering::Relaxed);
            if !this.latency.is_zero() {
                tokio::time::sleep(this.latency).await;
            }
            this.inner
                .results
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted upstream ran out of results")
        }
    }
}
