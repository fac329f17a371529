use crate::error::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimal TTL key/value store the idempotency cache is built on.
///
/// Values are opaque bytes; keys are the compound slot names produced by
/// [`crate::idempotency::IdempotencyCache`]. Implementations must tolerate
/// concurrent calls for unrelated keys.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Returns the value stored under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value, expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Removes `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Stores `value` only if `key` holds no live value. Returns whether it was stored.
    ///
    /// The default is a peek followed by a write and is only race-free when the
    /// backend serializes access per key. Shared or multi-process backends must
    /// override this with a single conditional write.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Upper bound applied to every TTL handed to a provider.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

impl StoredValue {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl.min(MAX_TTL))
            .or_else(|| now.checked_add(Duration::from_secs(24 * 60 * 60)))
            .unwrap_or(now);
        Self { value, expires_at }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process provider backed by a sharded concurrent map.
///
/// Expired entries are dropped lazily on access and by [`InMemoryProvider::purge_expired`].
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, stored| stored.is_live(now));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl CacheProvider for InMemoryProvider {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        if let Some(stored) = self.entries.get(key) {
            if stored.is_live(now) {
                return Ok(Some(stored.value.clone()));
            }
        } else {
            return Ok(None);
        }

        self.entries.remove_if(key, |_, stored| !stored.is_live(Instant::now()));
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        // The entry guard holds the shard write lock, so the check and the insert are atomic.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(Instant::now()) {
                    Ok(false)
                } else {
                    occupied.insert(StoredValue::new(value, ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }
}

/// Background job that purges expired entries from an [`InMemoryProvider`].
pub struct ProviderSweeper {
    provider: Arc<InMemoryProvider>,
    interval: Duration,
}

impl ProviderSweeper {
    pub fn new(provider: Arc<InMemoryProvider>, interval: Duration) -> Self {
        Self { provider, interval }
    }

    /// Runs one sweep.
    pub fn run_once(&self) -> usize {
        self.provider.purge_expired()
    }

    /// Starts the sweeper in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;

                let purged = self.run_once();
                if purged > 0 {
                    tracing::debug!(purged, remaining = self.provider.len(), "Purged expired cache entries");
                }
                crate::observability::get_metrics().set_cache_entries(self.provider.len());
            }
        })
    }
}
