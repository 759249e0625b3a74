use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// A cached value together with the time it was stored.
#[derive(Clone, Debug)]
pub(crate) struct Entry<V> {
    pub value: V,
    pub stored_at: Instant,
}

impl<V> Entry<V> {
    /// Time elapsed since this entry was stored.
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    /// An entry is fresh while its age is strictly below `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// The last-known value per key.
///
/// Entries are written only when a computation completes successfully under
/// coordinator control, which makes `stored_at` monotonically non-decreasing
/// per key. Entries are never expired by age; a stale entry stays retrievable
/// as a degraded fallback until it is superseded by a newer success or
/// explicitly removed.
#[derive(Debug)]
pub(crate) struct EntryStore<K, V> {
    entries: FxHashMap<K, Entry<V>>,
}

impl<K: Eq + Hash, V> EntryStore<K, V> {
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&Entry<V>> {
        self.entries.get(key)
    }

    /// Stores `value` under `key`, stamping it with the current time.
    pub fn put(&mut self, key: K, value: V) {
        let entry = Entry {
            value,
            stored_at: Instant::now(),
        };
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    #[tokio::test]
    async fn test_freshness() {
        time::pause();

        let mut store = EntryStore::new();
        store.put("sol", 4.5);

        let ttl = Duration::from_secs(15);
        assert!(store.get(&"sol").unwrap().is_fresh(ttl));

        time::advance(Duration::from_secs(14)).await;
        assert!(store.get(&"sol").unwrap().is_fresh(ttl));

        time::advance(Duration::from_secs(2)).await;
        let entry = store.get(&"sol").unwrap();
        // stale, but still retrievable as a fallback
        assert!(!entry.is_fresh(ttl));
        assert_eq!(entry.value, 4.5);
    }

    #[tokio::test]
    async fn test_put_refreshes_timestamp() {
        time::pause();

        let mut store = EntryStore::new();
        store.put("sol", 4.5);
        let first = store.get(&"sol").unwrap().stored_at;

        time::advance(Duration::from_secs(30)).await;
        store.put("sol", 5.0);

        let entry = store.get(&"sol").unwrap();
        assert!(entry.stored_at > first);
        assert_eq!(entry.value, 5.0);
        assert!(entry.is_fresh(Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let mut store = EntryStore::new();
        store.put("a", 1);
        store.put("b", 2);
        assert_eq!(store.len(), 2);

        assert_eq!(store.remove(&"a").map(|e| e.value), Some(1));
        assert!(store.get(&"a").is_none());

        store.clear();
        assert_eq!(store.len(), 0);
    }
}
