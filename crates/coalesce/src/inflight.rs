use std::hash::Hash;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::error::GetError;

/// The shared handle to a running computation.
///
/// Every caller for a key clones and awaits the same [`Shared`] future, so
/// all of them observe the identical outcome once the computation settles.
pub(crate) type Flight<V, E> = Shared<BoxFuture<'static, Result<V, GetError<E>>>>;

#[derive(Debug)]
struct Ticket<V, E> {
    flight: Flight<V, E>,
    started_at: Instant,
}

/// At most one running computation per key.
///
/// Tickets are inserted in the same critical section that decides to start a
/// computation, before any caller suspends, and removed when the computation
/// settles. The map never observes two tickets for one key.
#[derive(Debug)]
pub(crate) struct FlightMap<K, V, E> {
    tickets: FxHashMap<K, Ticket<V, E>>,
}

impl<K: Eq + Hash, V, E> FlightMap<K, V, E> {
    pub fn new() -> Self {
        Self {
            tickets: FxHashMap::default(),
        }
    }

    /// Returns the running flight for `key` and its age, if one exists.
    pub fn join(&self, key: &K) -> Option<(Flight<V, E>, Duration)> {
        let ticket = self.tickets.get(key)?;
        Some((ticket.flight.clone(), ticket.started_at.elapsed()))
    }

    pub fn insert(&mut self, key: K, flight: Flight<V, E>) {
        let previous = self.tickets.insert(
            key,
            Ticket {
                flight,
                started_at: Instant::now(),
            },
        );
        debug_assert!(previous.is_none(), "second flight started for a key");
    }

    pub fn remove(&mut self, key: &K) {
        self.tickets.remove(key);
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }
}
