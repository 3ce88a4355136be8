// Memoization of recent decisions.
//
// `ResultCache` sits in front of the detector fan-out:
// - fresh entries are served directly
// - concurrent misses for the same key share one computation (single-flight)
// - a failing or slow backend degrades to always-compute, never to an error
// - degraded results (any detector fell back) are never memoized
//
// Expired entries stay in the store until capacity pressure evicts them, so
// they can be served as a last resort while every detector is down.

use super::engine_config::CacheConfig;
use super::engine_errors::ModerationError;
use super::moderation_models::{CacheKey, ModerationResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub result: ModerationResult,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================

/// Bounded backend for cache entries.
///
/// `get` returns entries even after they expire. `insert` must keep the
/// store within `capacity`, evicting the oldest tenth by insertion order
/// when full.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: CacheKey) -> Result<Option<CacheEntry>, ModerationError>;

    async fn insert(&self, entry: CacheEntry, capacity: usize) -> Result<(), ModerationError>;
}

#[async_trait]
impl CacheStore for Box<dyn CacheStore> {
    async fn get(&self, key: CacheKey) -> Result<Option<CacheEntry>, ModerationError> {
        (**self).get(key).await
    }

    async fn insert(&self, entry: CacheEntry, capacity: usize) -> Result<(), ModerationError> {
        (**self).insert(entry, capacity).await
    }
}

// ============================================================================
// CORE SERVICE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Fresh entry from the store.
    Hit,
    /// This caller ran the computation.
    Computed,
    /// Another caller's in-flight computation for the same key.
    Shared,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub result: ModerationResult,
    pub source: CacheSource,
    /// The backend failed or timed out during this lookup.
    pub degraded: bool,
}

pub struct ResultCache<S: CacheStore> {
    store: S,
    in_flight: DashMap<CacheKey, Arc<OnceCell<(ModerationResult, bool)>>>,
}

impl<S: CacheStore> ResultCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            in_flight: DashMap::new(),
        }
    }

    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        config: &CacheConfig,
        backend_timeout: Duration,
        compute: F,
    ) -> CacheLookup
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ModerationResult>,
    {
        let mut degraded = false;

        match tokio::time::timeout(backend_timeout, self.store.get(key)).await {
            Ok(Ok(Some(entry))) if !entry.is_expired(Instant::now()) => {
                return CacheLookup {
                    result: entry.result,
                    source: CacheSource::Hit,
                    degraded: false,
                };
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Cache lookup failed, computing");
                degraded = true;
            }
            Err(_) => {
                tracing::warn!(key = %key, "Cache lookup timed out, computing");
                degraded = true;
            }
        }

        let cell = self
            .in_flight
            .entry(key)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut leader = false;
        let recheck = !degraded;
        let (result, from_store) = cell
            .get_or_init(|| {
                leader = true;
                async move {
                    // A previous leader may have stored the entry after our
                    // lookup missed.
                    if recheck {
                        if let Some(result) = self.fresh(key, backend_timeout).await {
                            return (result, true);
                        }
                    }
                    (compute().await, false)
                }
            })
            .await
            .clone();

        if !leader {
            return CacheLookup {
                result,
                source: CacheSource::Shared,
                degraded,
            };
        }

        if from_store {
            self.release(key, &cell);
            return CacheLookup {
                result,
                source: CacheSource::Hit,
                degraded,
            };
        }

        // The cell stays published until the entry is stored, so late
        // arrivals join it instead of computing again.
        if !degraded && !result.degraded {
            let entry = CacheEntry {
                key,
                result: result.clone(),
                expires_at: Instant::now() + config.ttl(),
            };
            match tokio::time::timeout(backend_timeout, self.store.insert(entry, config.capacity))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(key = %key, error = %e, "Cache insert failed");
                    degraded = true;
                }
                Err(_) => {
                    tracing::warn!(key = %key, "Cache insert timed out");
                    degraded = true;
                }
            }
        }
        self.release(key, &cell);

        CacheLookup {
            result,
            source: CacheSource::Computed,
            degraded,
        }
    }

    async fn fresh(&self, key: CacheKey, backend_timeout: Duration) -> Option<ModerationResult> {
        match tokio::time::timeout(backend_timeout, self.store.get(key)).await {
            Ok(Ok(Some(entry))) if !entry.is_expired(Instant::now()) => Some(entry.result),
            _ => None,
        }
    }

    fn release(&self, key: CacheKey, cell: &Arc<OnceCell<(ModerationResult, bool)>>) {
        self.in_flight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, cell));
    }

    /// Any retained entry for `key`, expired or not. Only meant for
    /// degraded operation while every detector is unavailable.
    pub async fn get_stale(&self, key: CacheKey, backend_timeout: Duration) -> Option<ModerationResult> {
        match tokio::time::timeout(backend_timeout, self.store.get(key)).await {
            Ok(Ok(Some(entry))) => Some(entry.result),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                tracing::debug!(key = %key, error = %e, "Stale lookup failed");
                None
            }
            Err(_) => None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
