// Per-subject admission control.
//
// Sliding-window counter: each subject keeps the timestamps of its admitted
// requests, pruned to the window on every check. The window logic is pure
// (`SlidingWindow`); the store only has to apply it atomically per subject.
// A store outage never rejects traffic - the request goes through flagged
// as degraded.

use super::engine_config::RateLimitConfig;
use super::engine_errors::ModerationError;
use super::moderation_models::RateDecision;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// SLIDING WINDOW
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

/// Admitted-request timestamps for a single subject, oldest first.
#[derive(Debug, Default, Clone)]
pub struct SlidingWindow {
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prune, test and (when allowed) record one request at `now`.
    pub fn admit(&mut self, now: Instant, window: Duration, max_requests: u32) -> Admission {
        self.prune(now, window);

        if self.hits.len() >= max_requests as usize {
            // Room frees up when the oldest hit leaves the window.
            let retry_after = self
                .hits
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            return Admission::Denied { retry_after };
        }

        self.hits.push_back(now);
        Admission::Allowed
    }

    /// True when no hit is left inside the window; the subject can be dropped.
    pub fn is_idle(&mut self, now: Instant, window: Duration) -> bool {
        self.prune(now, window);
        self.hits.is_empty()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================

/// Backend holding one sliding window per subject.
///
/// `admit` must be atomic per subject; different subjects must not contend.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn admit(
        &self,
        subject_id: &str,
        now: Instant,
        window: Duration,
        max_requests: u32,
    ) -> Result<Admission, ModerationError>;
}

#[async_trait]
impl RateLimitStore for Box<dyn RateLimitStore> {
    async fn admit(
        &self,
        subject_id: &str,
        now: Instant,
        window: Duration,
        max_requests: u32,
    ) -> Result<Admission, ModerationError> {
        (**self).admit(subject_id, now, window, max_requests).await
    }
}

// ============================================================================
// CORE SERVICE
// ============================================================================

pub struct RateLimiter<S: RateLimitStore> {
    store: S,
}

impl<S: RateLimitStore> RateLimiter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Check whether `subject_id` may submit another request.
    ///
    /// Never fails: backend errors and backend timeouts admit the request
    /// with `degraded = true`.
    pub async fn allow(
        &self,
        subject_id: &str,
        config: &RateLimitConfig,
        backend_timeout: Duration,
    ) -> RateDecision {
        let now = Instant::now();
        let outcome = tokio::time::timeout(
            backend_timeout,
            self.store
                .admit(subject_id, now, config.window(), config.max_requests),
        )
        .await;

        match outcome {
            Ok(Ok(Admission::Allowed)) => RateDecision {
                allowed: true,
                retry_after_ms: 0,
                degraded: false,
            },
            Ok(Ok(Admission::Denied { retry_after })) => RateDecision {
                allowed: false,
                retry_after_ms: retry_after.as_millis() as u64,
                degraded: false,
            },
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Rate limiter backend failed, admitting request");
                Self::degraded()
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = backend_timeout.as_millis() as u64,
                    "Rate limiter backend timed out, admitting request"
                );
                Self::degraded()
            }
        }
    }

    fn degraded() -> RateDecision {
        RateDecision {
            allowed: true,
            retry_after_ms: 0,
            degraded: true,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
