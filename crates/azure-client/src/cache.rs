//! Timed resource cache
//!
//! Each key owns its own async lock, so a slow refresh of one load balancer
//! never blocks readers of another. The map-wide lock is only held while the
//! per-key entry is looked up or removed.
//!
//! A getter that returns `Ok(None)` records a negative result: the resource is
//! known not to exist until the entry expires or is invalidated.

use crate::error::AzureError;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// How a read may use cached data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheReadType {
    /// Use the cached value while it is fresh, refresh it otherwise
    Default,
    /// Always fetch from ARM and replace the cached value
    ForceRefresh,
    /// Use whatever is cached regardless of age; fetch only if nothing is
    Unsafe,
}

/// Boxed future returned by a cache getter
pub type GetterFuture<T> = Pin<Box<dyn Future<Output = Result<Option<T>, AzureError>> + Send>>;

/// Loads the value for a key from the cloud
pub type Getter<T> = Arc<dyn Fn(String) -> GetterFuture<T> + Send + Sync>;

struct CacheEntry<T> {
    data: Option<T>,
    fetched_at: Option<Instant>,
}

/// Cache of cloud resources that expire after a fixed TTL
pub struct TimedCache<T> {
    name: String,
    ttl: Duration,
    getter: Getter<T>,
    entries: Mutex<HashMap<String, Arc<tokio::sync::Mutex<CacheEntry<T>>>>>,
}

impl<T> std::fmt::Debug for TimedCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> TimedCache<T> {
    /// Create a cache with the given TTL and getter
    pub fn new(name: impl Into<String>, ttl: Duration, getter: Getter<T>) -> Self {
        Self {
            name: name.into(),
            ttl,
            getter,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<CacheEntry<T>>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(CacheEntry {
                    data: None,
                    fetched_at: None,
                }))
            })
            .clone()
    }

    /// Read a key, refreshing it according to `read_type`
    pub async fn get(&self, key: &str, read_type: CacheReadType) -> Result<Option<T>, AzureError> {
        let entry = self.entry(key);
        let mut guard = entry.lock().await;

        if let Some(fetched_at) = guard.fetched_at {
            match read_type {
                CacheReadType::Unsafe => return Ok(guard.data.clone()),
                CacheReadType::Default if fetched_at.elapsed() < self.ttl => {
                    return Ok(guard.data.clone());
                }
                _ => {}
            }
        }

        debug!("{} cache: loading {}", self.name, key);
        let data = (self.getter)(key.to_string()).await?;
        guard.data = data.clone();
        guard.fetched_at = Some(Instant::now());
        Ok(data)
    }

    /// Drop a key so the next read goes to the cloud
    pub fn delete(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.remove(key).is_some() {
            debug!("{} cache: invalidated {}", self.name, key);
        }
    }

    /// Store a value fetched elsewhere
    pub async fn set(&self, key: &str, value: Option<T>) {
        let entry = self.entry(key);
        let mut guard = entry.lock().await;
        guard.data = value;
        guard.fetched_at = Some(Instant::now());
    }
}
