use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;

use crate::backoff::BackoffTracker;
use crate::config::{CoordinatorConfig, FetchOptions};
use crate::error::GetError;
use crate::inflight::{Flight, FlightMap};
use crate::metric;
use crate::store::EntryStore;

/// The entry point combining freshness, request coalescing and failure
/// backoff for one cache domain.
///
/// A coordinator is constructed once per cache domain (e.g. one for "pools",
/// one for per-user positions) and passed by reference to the request
/// handlers that use it. It is cheap to clone; clones share the same state.
///
/// `K` is the cache key, `V` the cached value, and `E` the upstream error
/// type of the computations handed to [`get`](Self::get). Which upstream
/// errors count as retryable is decided by the predicate given to
/// [`new`](Self::new).
pub struct Coordinator<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for Coordinator<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V, E> {
    config: CoordinatorConfig,
    retryable: Box<dyn Fn(&E) -> bool + Send + Sync>,
    state: Mutex<State<K, V, E>>,
}

/// All bookkeeping lives behind one coordinator-wide mutex.
///
/// The lock is only taken in synchronous sections and never held across a
/// suspension point, so decisions like "is there a flight for this key"
/// cannot interleave with each other.
struct State<K, V, E> {
    entries: EntryStore<K, V>,
    flights: FlightMap<K, V, E>,
    backoff: BackoffTracker<K>,
}

/// Removes the flight ticket for its key when dropped.
///
/// This lives inside the spawned computation task, so the ticket goes away
/// when the computation settles, and also when it panics. A wedged ticket
/// would starve the key forever.
struct FlightGuard<K: Eq + Hash, V, E> {
    inner: Arc<Inner<K, V, E>>,
    key: K,
}

impl<K: Eq + Hash, V, E> Drop for FlightGuard<K, V, E> {
    fn drop(&mut self) {
        self.inner.state.lock().unwrap().flights.remove(&self.key);
    }
}

impl<K, V, E> Coordinator<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a coordinator.
    ///
    /// `retryable` classifies upstream errors: retryable failures (rate
    /// limiting, transient connectivity) feed the backoff tracker and can be
    /// masked by a stale entry, everything else propagates untouched.
    pub fn new<R>(config: CoordinatorConfig, retryable: R) -> Self
    where
        R: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let backoff = BackoffTracker::new(config.backoff);
        Self {
            inner: Arc::new(Inner {
                config,
                retryable: Box::new(retryable),
                state: Mutex::new(State {
                    entries: EntryStore::new(),
                    flights: FlightMap::new(),
                    backoff,
                }),
            }),
        }
    }

    /// Returns the value for `key`, recomputing it through `compute` if the
    /// cached entry is older than `options.ttl`.
    ///
    /// Concurrent calls for the same key share a single computation. The
    /// computation runs on its own task and always runs to completion once
    /// started, even if every caller goes away.
    pub async fn get<F, Fut>(
        &self,
        key: K,
        compute: F,
        options: FetchOptions,
    ) -> Result<V, GetError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let name = &self.inner.config.name;
        metric!(counter("cache.access") += 1, "cache" => name);

        let flight = {
            let mut state = self.inner.state.lock().unwrap();

            if let Some(entry) = state.entries.get(&key) {
                if entry.is_fresh(options.ttl) {
                    metric!(counter("cache.fresh_hit") += 1, "cache" => name);
                    tracing::trace!(cache = %name, age = ?entry.age(), "serving fresh entry");
                    return Ok(entry.value.clone());
                }
            }

            if let Some((flight, running_for)) = state.flights.join(&key) {
                metric!(counter("cache.coalesced") += 1, "cache" => name);
                tracing::trace!(cache = %name, ?running_for, "joining in-flight computation");
                flight
            } else if let Some(retry_after) = state.backoff.remaining(&key) {
                if options.serve_stale {
                    if let Some(entry) = state.entries.get(&key) {
                        metric!(counter("cache.stale_serve") += 1, "cache" => name);
                        tracing::debug!(
                            cache = %name,
                            age = ?entry.age(),
                            "backing off, serving stale entry"
                        );
                        return Ok(entry.value.clone());
                    }
                }
                metric!(counter("cache.backoff_rejected") += 1, "cache" => name);
                return Err(GetError::BackingOff { retry_after });
            } else {
                metric!(counter("cache.computation") += 1, "cache" => name);
                self.start_flight(&mut state, key.clone(), compute())
            }
        };

        match flight.await {
            Ok(value) => Ok(value),
            Err(error) => self.recover_stale(&key, error, options),
        }
    }

    /// Like [`get`](Self::get), but degrades to `fallback` instead of
    /// failing when the upstream is unavailable.
    ///
    /// `BackingOff` and retryable upstream errors resolve to `fallback()`;
    /// non-retryable errors still propagate. This is for callers that prefer
    /// a default value (an empty list, a placeholder quote) over an error
    /// response while the upstream recovers.
    pub async fn get_or_else<F, Fut, D>(
        &self,
        key: K,
        compute: F,
        options: FetchOptions,
        fallback: D,
    ) -> Result<V, GetError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        D: FnOnce() -> V,
    {
        match self.get(key, compute, options).await {
            Err(GetError::BackingOff { .. }) => Ok(fallback()),
            Err(GetError::Upstream(error)) if (self.inner.retryable)(&error) => Ok(fallback()),
            other => other,
        }
    }

    /// Returns the last-known value for `key` regardless of its age.
    pub fn cached(&self, key: &K) -> Option<V> {
        let state = self.inner.state.lock().unwrap();
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Time remaining in the backoff window for `key`, if one is active.
    pub fn backoff_remaining(&self, key: &K) -> Option<Duration> {
        self.inner.state.lock().unwrap().backoff.remaining(key)
    }

    /// Drops the cached entry for `key`; the next [`get`](Self::get)
    /// recomputes it.
    ///
    /// An active backoff window survives invalidation, so invalidating a key
    /// does not defeat the cooldown on a failing upstream.
    pub fn invalidate(&self, key: &K) {
        self.inner.state.lock().unwrap().entries.remove(key);
    }

    /// Drops all cached entries.
    pub fn invalidate_all(&self) {
        self.inner.state.lock().unwrap().entries.clear();
    }

    /// Starts the computation for `key` and registers it in the flight map.
    ///
    /// The ticket is inserted in the caller's critical section, before any
    /// caller suspends on the returned future, so concurrent callers can
    /// never start a second computation for the same key.
    fn start_flight<Fut>(
        &self,
        state: &mut State<K, V, E>,
        key: K,
        computation: Fut,
    ) -> Flight<V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = {
            let key = key.clone();
            async move {
                let _guard = FlightGuard {
                    inner: Arc::clone(&inner),
                    key: key.clone(),
                };

                let started = Instant::now();
                let result = computation.await;
                metric!(
                    timer("cache.computation_duration") = started.elapsed(),
                    "cache" => &inner.config.name,
                );

                let mut state = inner.state.lock().unwrap();
                match &result {
                    Ok(value) => {
                        state.entries.put(key.clone(), value.clone());
                        state.backoff.record_success(&key);
                    }
                    Err(error) if (inner.retryable)(error) => {
                        let delay = state.backoff.record_failure(key.clone());
                        metric!(
                            counter("cache.computation_failure") += 1,
                            "cache" => &inner.config.name,
                            "retryable" => "true",
                        );
                        tracing::warn!(
                            cache = %inner.config.name,
                            backoff = %humantime::format_duration(delay),
                            "computation failed with a retryable error, backing off"
                        );
                    }
                    Err(_) => {
                        metric!(
                            counter("cache.computation_failure") += 1,
                            "cache" => &inner.config.name,
                            "retryable" => "false",
                        );
                    }
                }
                drop(state);

                result.map_err(GetError::Upstream)
            }
        };

        let handle = tokio::spawn(task);
        let flight: Flight<V, E> = async move {
            match handle.await {
                Ok(result) => result,
                // the computation panicked or the runtime is shutting down
                Err(error) => Err(GetError::Aborted(error.to_string())),
            }
        }
        .boxed()
        .shared();

        state.flights.insert(key, flight.clone());
        metric!(
            gauge("cache.in_flight") = state.flights.len() as u64,
            "cache" => &self.inner.config.name,
        );
        flight
    }

    /// Maps a settled failure to a stale entry where policy allows it.
    fn recover_stale(
        &self,
        key: &K,
        error: GetError<E>,
        options: FetchOptions,
    ) -> Result<V, GetError<E>> {
        if !options.serve_stale {
            return Err(error);
        }
        let retryable = match &error {
            GetError::Upstream(upstream) => (self.inner.retryable)(upstream),
            _ => false,
        };
        if !retryable {
            return Err(error);
        }

        let state = self.inner.state.lock().unwrap();
        match state.entries.get(key) {
            Some(entry) => {
                metric!(counter("cache.stale_serve") += 1, "cache" => &self.inner.config.name);
                tracing::debug!(
                    cache = %self.inner.config.name,
                    age = ?entry.age(),
                    "masking retryable failure with stale entry"
                );
                Ok(entry.value.clone())
            }
            None => Err(error),
        }
    }
}

impl<K: Eq + Hash, V, E> fmt::Debug for Coordinator<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.try_lock();
        let entries = state.as_ref().map(|s| s.entries.len()).unwrap_or_default();
        let in_flight = state.as_ref().map(|s| s.flights.len()).unwrap_or_default();
        f.debug_struct("Coordinator")
            .field("name", &self.inner.config.name)
            .field("entries", &entries)
            .field("in-flight", &in_flight)
            .finish()
    }
}
