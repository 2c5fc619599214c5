//! In-memory TTL key-value store.
//!
//! Backs the peer directory and the content store. Every entry carries an
//! absolute expiry; reads check it under the same lock that guards the
//! map, so a reader never sees an entry that is both present and stale.
//! Expired entries are removed lazily on access and periodically by
//! [`TtlStore::spawn_sweeper`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Stand-in expiry for a TTL too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Shared TTL map. Cloning yields another handle to the same store.
pub struct TtlStore<V> {
    name: &'static str,
    entries: Arc<RwLock<HashMap<String, Entry<V>>>>,
}

impl<V> Clone for TtlStore<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TtlStore<V> {
    /// Create an empty store. `name` labels sweep logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert or replace a value, expiring `ttl` from now.
    pub async fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = expiry(Instant::now(), ttl);
        self.entries
            .write()
            .await
            .insert(key.into(), Entry { value, expires_at });
    }

    /// Atomically compute the new value from the live current one (if
    /// any) and store it with a fresh expiry. Returns the stored value.
    pub async fn upsert_with<F>(&self, key: impl Into<String>, ttl: Duration, f: F) -> V
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let key = key.into();
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let current = entries
            .get(&key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| &entry.value);
        let value = f(current);

        entries.insert(
            key,
            Entry {
                value: value.clone(),
                expires_at: expiry(now, ttl),
            },
        );
        value
    }

    /// Get a live value.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Stale: drop it unless a writer refreshed it in between.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        None
    }

    /// Remove an entry only if `predicate` accepts its live value.
    ///
    /// Returns `None` if the key is absent or expired, otherwise whether
    /// the entry was removed.
    pub async fn remove_if<F>(&self, key: &str, predicate: F) -> Option<bool>
    where
        F: FnOnce(&V) -> bool,
    {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let live = match entries.get(key) {
            Some(entry) if entry.is_live(now) => predicate(&entry.value),
            Some(_) => {
                entries.remove(key);
                return None;
            }
            None => return None,
        };
        if live {
            entries.remove(key);
        }
        Some(live)
    }

    /// Remove an entry. Returns whether a live entry was removed.
    pub async fn remove(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .write()
            .await
            .remove(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Keys of all live entries.
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// All live values.
    pub async fn values(&self) -> Vec<V> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether the store holds no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Remove everything.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Spawn a background task purging expired entries every `period`.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = store.purge_expired().await;
                if removed > 0 {
                    debug!(store = store.name, removed, "Swept expired entries");
                }
            }
        })
    }
}
