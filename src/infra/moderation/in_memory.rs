// In-memory implementations of the moderation engine's storage ports.
//
// DashMap everywhere: each key gets its own shard lock, so two subjects or two
// cache keys never wait on each other.

use crate::core::moderation::{
    ActionLedger, ActionStatus, ActionType, Admission, AuditEvent, AuditSink, CacheEntry,
    CacheKey, CacheStore, ModerationError, RateLimitStore, SlidingWindow,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Idle subjects are swept after this many admissions.
const SWEEP_EVERY: u64 = 1024;

pub struct InMemoryRateLimitStore {
    windows: DashMap<String, SlidingWindow>,
    admissions: AtomicU64,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            admissions: AtomicU64::new(0),
        }
    }

    /// Drop subjects with no hits left in the window. Returns how many went.
    pub fn sweep_idle(&self, now: Instant, window: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_idle(now, window));
        before.saturating_sub(self.windows.len())
    }

    #[allow(dead_code)]
    pub fn tracked_subjects(&self) -> usize {
        self.windows.len()
    }
}

impl Default for InMemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn admit(
        &self,
        subject_id: &str,
        now: Instant,
        window: Duration,
        max_requests: u32,
    ) -> Result<Admission, ModerationError> {
        let admission = self
            .windows
            .entry(subject_id.to_string())
            .or_default()
            .admit(now, window, max_requests);

        if self.admissions.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let swept = self.sweep_idle(now, window);
            if swept > 0 {
                tracing::debug!(swept, "Swept idle rate limit windows");
            }
        }

        Ok(admission)
    }
}

// ============================================================================
// RESULT CACHE
// ============================================================================

struct StoredEntry {
    seq: u64,
    entry: CacheEntry,
}

/// Bounded cache store. When full, the oldest tenth (by insertion) goes, or
/// more if the capacity shrank below the current size.
pub struct InMemoryCacheStore {
    entries: DashMap<CacheKey, StoredEntry>,
    next_seq: AtomicU64,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict_oldest(&self, capacity: usize, excess: usize) {
        let count = excess.max(capacity / 10).max(1);
        let mut by_age: Vec<(u64, CacheKey)> = self
            .entries
            .iter()
            .map(|e| (e.value().seq, *e.key()))
            .collect();
        by_age.sort_unstable();
        for (_, key) in by_age.into_iter().take(count) {
            self.entries.remove(&key);
        }
        tracing::debug!(evicted = count, "Cache full, evicted oldest entries");
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: CacheKey) -> Result<Option<CacheEntry>, ModerationError> {
        Ok(self.entries.get(&key).map(|stored| stored.entry.clone()))
    }

    async fn insert(&self, entry: CacheEntry, capacity: usize) -> Result<(), ModerationError> {
        if capacity == 0 {
            return Ok(());
        }
        let incoming = usize::from(!self.entries.contains_key(&entry.key));
        let wanted = self.entries.len() + incoming;
        if wanted > capacity {
            self.evict_oldest(capacity, wanted - capacity);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(entry.key, StoredEntry { seq, entry });
        Ok(())
    }
}

// ============================================================================
// ACTION LEDGER
// ============================================================================

#[derive(Debug, Clone)]
struct LedgerEntry {
    #[allow(dead_code)]
    action_type: ActionType,
    status: ActionStatus,
    attempts: u32,
    last_error: Option<String>,
}

pub struct InMemoryActionLedger {
    entries: DashMap<String, LedgerEntry>,
}

impl InMemoryActionLedger {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    #[allow(dead_code)]
    pub fn last_error(&self, key: &str) -> Option<String> {
        self.entries.get(key).and_then(|e| e.last_error.clone())
    }

    #[allow(dead_code)]
    pub fn attempts(&self, key: &str) -> Option<u32> {
        self.entries.get(key).map(|e| e.attempts)
    }
}

impl Default for InMemoryActionLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionLedger for InMemoryActionLedger {
    async fn claim(&self, key: &str, action_type: ActionType) -> anyhow::Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(LedgerEntry {
                    action_type,
                    status: ActionStatus::Claimed,
                    attempts: 0,
                    last_error: None,
                });
                Ok(true)
            }
        }
    }

    async fn mark_executed(&self, key: &str, attempts: u32) -> anyhow::Result<()> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| anyhow::anyhow!("unknown idempotency key {}", key))?;
        entry.status = ActionStatus::Executed;
        entry.attempts = attempts;
        Ok(())
    }

    async fn mark_failed(&self, key: &str, attempts: u32, error: &str) -> anyhow::Result<()> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| anyhow::anyhow!("unknown idempotency key {}", key))?;
        entry.status = ActionStatus::Failed;
        entry.attempts = attempts;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn status(&self, key: &str) -> anyhow::Result<Option<ActionStatus>> {
        Ok(self.entries.get(key).map(|e| e.status))
    }
}

// ============================================================================
// AUDIT
// ============================================================================

/// Keeps every audit event in memory. For tests and local runs.
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    #[allow(dead_code)]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::moderation_models::{ModerationResult, RiskLevel, Timings};
    use chrono::Utc;

    fn entry(key: u64, expires_at: Instant) -> CacheEntry {
        CacheEntry {
            key: CacheKey(key),
            result: ModerationResult {
                request_id: format!("r{}", key),
                overall_risk: 0.0,
                risk_level: RiskLevel::Safe,
                confidence: 1.0,
                per_detector: Vec::new(),
                actions: Vec::new(),
                degraded: false,
                cached: false,
                stale: false,
                timings: Timings::default(),
            },
            expires_at,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_window_per_subject() {
        let store = InMemoryRateLimitStore::new();
        let window = Duration::from_secs(60);
        let now = Instant::now();

        for _ in 0..3 {
            assert_eq!(
                store.admit("alice", now, window, 3).await.unwrap(),
                Admission::Allowed
            );
        }
        assert!(matches!(
            store.admit("alice", now, window, 3).await.unwrap(),
            Admission::Denied { .. }
        ));
        // Other subjects are unaffected.
        assert_eq!(
            store.admit("bob", now, window, 3).await.unwrap(),
            Admission::Allowed
        );

        let later = now + window;
        assert_eq!(
            store.admit("alice", later, window, 3).await.unwrap(),
            Admission::Allowed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_idle_subjects() {
        let store = InMemoryRateLimitStore::new();
        let window = Duration::from_secs(10);
        let now = Instant::now();

        store.admit("a", now, window, 5).await.unwrap();
        store.admit("b", now + Duration::from_secs(8), window, 5).await.unwrap();

        let swept = store.sweep_idle(now + Duration::from_secs(12), window);
        assert_eq!(swept, 1);
        assert_eq!(store.tracked_subjects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_evicts_oldest_tenth_when_full() {
        let store = InMemoryCacheStore::new();
        let expires = Instant::now() + Duration::from_secs(300);

        for key in 0..20 {
            store.insert(entry(key, expires), 20).await.unwrap();
        }
        assert_eq!(store.len(), 20);

        store.insert(entry(100, expires), 20).await.unwrap();

        assert_eq!(store.len(), 19);
        assert!(store.get(CacheKey(0)).await.unwrap().is_none());
        assert!(store.get(CacheKey(1)).await.unwrap().is_none());
        assert!(store.get(CacheKey(2)).await.unwrap().is_some());
        assert!(store.get(CacheKey(100)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cache_shrinks_to_a_lowered_capacity() {
        let store = InMemoryCacheStore::new();
        let expires = Instant::now() + Duration::from_secs(300);

        for key in 0..1000 {
            store.insert(entry(key, expires), 1000).await.unwrap();
        }
        assert_eq!(store.len(), 1000);

        store.insert(entry(5000, expires), 100).await.unwrap();
        assert_eq!(store.len(), 100);
        assert!(store.get(CacheKey(900)).await.unwrap().is_none());
        assert!(store.get(CacheKey(901)).await.unwrap().is_some());
        assert!(store.get(CacheKey(5000)).await.unwrap().is_some());

        // Back within bounds, a full store drops its oldest tenth again.
        store.insert(entry(5001, expires), 100).await.unwrap();
        assert_eq!(store.len(), 91);
        assert!(store.get(CacheKey(5001)).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_keeps_expired_entries() {
        let store = InMemoryCacheStore::new();
        store
            .insert(entry(1, Instant::now()), 10)
            .await
            .unwrap();

        let found = store.get(CacheKey(1)).await.unwrap().unwrap();
        assert!(found.is_expired(Instant::now()));
    }

    #[tokio::test]
    async fn test_ledger_claim_is_exclusive() {
        let ledger = InMemoryActionLedger::new();

        assert!(ledger.claim("r1:block_content", ActionType::BlockContent).await.unwrap());
        assert!(!ledger.claim("r1:block_content", ActionType::BlockContent).await.unwrap());
        assert_eq!(
            ledger.status("r1:block_content").await.unwrap(),
            Some(ActionStatus::Claimed)
        );

        ledger.mark_failed("r1:block_content", 4, "gateway timeout").await.unwrap();
        assert_eq!(
            ledger.status("r1:block_content").await.unwrap(),
            Some(ActionStatus::Failed)
        );
        assert_eq!(ledger.attempts("r1:block_content"), Some(4));
        assert_eq!(
            ledger.last_error("r1:block_content").as_deref(),
            Some("gateway timeout")
        );

        assert!(ledger.mark_executed("never-claimed", 1).await.is_err());
        assert_eq!(ledger.status("never-claimed").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_audit_sink_keeps_events_in_order() {
        let sink = InMemoryAuditSink::new();
        for i in 0..3 {
            sink.record(&AuditEvent::RateLimited {
                request_id: format!("r{}", i),
                subject_user_id: "u".to_string(),
                retry_after_ms: 10,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let keys: Vec<String> = sink
            .events()
            .iter()
            .map(|e| e.subject_key().to_string())
            .collect();
        assert_eq!(keys, vec!["r0", "r1", "r2"]);
    }
}
