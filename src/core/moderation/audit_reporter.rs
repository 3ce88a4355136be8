// Metrics and audit trail.
//
// `MetricsReporter` keeps in-process counters and produces health snapshots.
// `AuditTrail` forwards sanitized audit events to an `AuditSink` through a
// bounded queue; when the queue is full the event is dropped, so a slow sink
// can never hold up a decision.

use super::engine_config::BreakerConfig;
use super::health_monitor::{CircuitState, ServiceHealthRegistry};
use super::moderation_models::{
    ActionType, ModerationRequest, ModerationResult, RequestKind, RiskLevel,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// AUDIT EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorAuditEntry {
    pub detector: String,
    pub score: f64,
    pub confidence: f64,
    pub used_fallback: bool,
    pub latency_ms: u64,
    pub circuit_state: CircuitState,
}

/// Audit trail entry. Never carries raw content: only fingerprints and counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Decision {
        request_id: String,
        kind: RequestKind,
        subject_user_id: String,
        content_fingerprint: String,
        attachment_count: usize,
        overall_risk: f64,
        risk_level: RiskLevel,
        confidence: f64,
        degraded: bool,
        cached: bool,
        stale: bool,
        detectors: Vec<DetectorAuditEntry>,
        actions: Vec<String>,
        total_latency_ms: u64,
        recorded_at: DateTime<Utc>,
    },
    RateLimited {
        request_id: String,
        subject_user_id: String,
        retry_after_ms: u64,
        recorded_at: DateTime<Utc>,
    },
    ActionExecuted {
        idempotency_key: String,
        action_type: ActionType,
        attempts: u32,
        recorded_at: DateTime<Utc>,
    },
    ActionFailed {
        idempotency_key: String,
        action_type: ActionType,
        attempts: u32,
        error: String,
        recorded_at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn decision(request: &ModerationRequest, result: &ModerationResult) -> Self {
        AuditEvent::Decision {
            request_id: result.request_id.clone(),
            kind: request.kind,
            subject_user_id: request.subject_user_id.clone(),
            content_fingerprint: request.content_fingerprint(),
            attachment_count: request.attachments.len(),
            overall_risk: result.overall_risk,
            risk_level: result.risk_level,
            confidence: result.confidence,
            degraded: result.degraded,
            cached: result.cached,
            stale: result.stale,
            detectors: result
                .per_detector
                .iter()
                .map(|d| DetectorAuditEntry {
                    detector: d.detector_name.clone(),
                    score: d.score,
                    confidence: d.confidence,
                    used_fallback: d.used_fallback,
                    latency_ms: d.latency_ms,
                    circuit_state: d.circuit_state,
                })
                .collect(),
            actions: result
                .actions
                .iter()
                .map(|a| a.idempotency_key.clone())
                .collect(),
            total_latency_ms: result.timings.total_ms,
            recorded_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::Decision { .. } => "decision",
            AuditEvent::RateLimited { .. } => "rate_limited",
            AuditEvent::ActionExecuted { .. } => "action_executed",
            AuditEvent::ActionFailed { .. } => "action_failed",
        }
    }

    /// Request or idempotency key the event belongs to.
    pub fn subject_key(&self) -> &str {
        match self {
            AuditEvent::Decision { request_id, .. } => request_id,
            AuditEvent::RateLimited { request_id, .. } => request_id,
            AuditEvent::ActionExecuted {
                idempotency_key, ..
            } => idempotency_key,
            AuditEvent::ActionFailed {
                idempotency_key, ..
            } => idempotency_key,
        }
    }
}

// ============================================================================
// AUDIT SINK (PORT)
// ============================================================================

/// Append-only, best-effort audit storage.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

const AUDIT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Non-blocking front for an `AuditSink`.
#[derive(Clone)]
pub struct AuditTrail {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditTrail {
    /// Spawn the background writer. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match tokio::time::timeout(AUDIT_WRITE_TIMEOUT, sink.record(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(
                        event = event.kind(),
                        key = event.subject_key(),
                        error = %e,
                        "Audit write failed"
                    ),
                    Err(_) => tracing::warn!(
                        event = event.kind(),
                        key = event.subject_key(),
                        "Audit write timed out"
                    ),
                }
            }
            tracing::debug!("Audit writer stopped");
        });

        Self { tx }
    }

    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => tracing::warn!(
                    event = event.kind(),
                    key = event.subject_key(),
                    "Audit queue full, dropping event"
                ),
                mpsc::error::TrySendError::Closed(event) => tracing::error!(
                    event = event.kind(),
                    "Audit writer gone, dropping event"
                ),
            }
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Default)]
struct DetectorCounters {
    calls: u64,
    successes: u64,
    fallbacks: u64,
    total_latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorHealth {
    pub detector: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub rolling_latency_ms: Option<f64>,
    pub calls: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub short_circuited: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub taken_at: DateTime<Utc>,
    pub requests: u64,
    pub rate_limited: u64,
    pub degraded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    /// Answers served from an expired entry while every detector was down.
    pub stale_served: u64,
    pub avg_latency_ms: f64,
    pub actions_dispatched: u64,
    pub actions_executed: u64,
    pub actions_failed: u64,
    pub detectors: Vec<DetectorHealth>,
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[derive(Default)]
pub struct MetricsReporter {
    detectors: DashMap<String, DetectorCounters>,
    requests: AtomicU64,
    rate_limited: AtomicU64,
    degraded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    stale_served: AtomicU64,
    total_latency_ms: AtomicU64,
    actions_dispatched: AtomicU64,
    actions_executed: AtomicU64,
    actions_failed: AtomicU64,
}

impl MetricsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Book one completed request. `served` is what the caller got back;
    /// `evaluated` is the fresh evaluation when the detectors ran for this
    /// request, and `None` when it was answered from the cache.
    pub fn record_request(&self, served: &ModerationResult, evaluated: Option<&ModerationResult>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(served.timings.total_ms, Ordering::Relaxed);
        if served.degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
        if served.stale {
            self.stale_served.fetch_add(1, Ordering::Relaxed);
        }
        let Some(evaluated) = evaluated else {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.actions_dispatched
            .fetch_add(evaluated.actions.len() as u64, Ordering::Relaxed);

        for detector in &evaluated.per_detector {
            let mut counters = self
                .detectors
                .entry(detector.detector_name.clone())
                .or_default();
            counters.calls += 1;
            counters.total_latency_ms += detector.latency_ms;
            if detector.used_fallback {
                counters.fallbacks += 1;
            } else {
                counters.successes += 1;
            }
        }
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_action_executed(&self) {
        self.actions_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_action_failed(&self) {
        self.actions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn health_snapshot(
        &self,
        health: &ServiceHealthRegistry,
        breaker: &BreakerConfig,
    ) -> HealthSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);

        let detectors = health
            .snapshot(breaker)
            .into_iter()
            .map(|record| {
                let (calls, successes, fallbacks, latency) = self
                    .detectors
                    .get(&record.detector_name)
                    .map(|c| (c.calls, c.successes, c.fallbacks, c.total_latency_ms))
                    .unwrap_or((0, 0, 0, 0));
                DetectorHealth {
                    detector: record.detector_name,
                    state: record.state,
                    consecutive_failures: record.consecutive_failures,
                    rolling_latency_ms: record.rolling_latency_ms,
                    calls,
                    success_rate: ratio(successes, calls),
                    error_rate: ratio(fallbacks, calls),
                    avg_latency_ms: ratio(latency, calls),
                    short_circuited: record.short_circuited,
                }
            })
            .collect();

        HealthSnapshot {
            taken_at: Utc::now(),
            requests,
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_hit_rate: ratio(cache_hits, cache_hits + cache_misses),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            avg_latency_ms: ratio(self.total_latency_ms.load(Ordering::Relaxed), requests),
            actions_dispatched: self.actions_dispatched.load(Ordering::Relaxed),
            actions_executed: self.actions_executed.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            detectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::detector_adapter::tests::sample_request;
    use crate::core::moderation::engine_errors::ModerationError;
    use crate::core::moderation::moderation_models::{
        ActionRecord, DetectorCategory, DetectorResult, Timings,
    };
    use std::sync::Mutex;

    struct VecSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl AuditSink for VecSink {
        async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct StuckSink;

    #[async_trait]
    impl AuditSink for StuckSink {
        async fn record(&self, _event: &AuditEvent) -> anyhow::Result<()> {
            std::future::pending().await
        }
    }

    fn result(cached: bool) -> ModerationResult {
        ModerationResult {
            request_id: "r1".to_string(),
            overall_risk: 0.7,
            risk_level: RiskLevel::High,
            confidence: 0.85,
            per_detector: vec![
                DetectorResult {
                    detector_name: "toxicity".to_string(),
                    category: DetectorCategory::Toxicity,
                    score: 0.9,
                    confidence: 0.9,
                    categories: vec!["insult".to_string()],
                    latency_ms: 40,
                    used_fallback: false,
                    error: None,
                    circuit_state: CircuitState::Closed,
                },
                DetectorResult::fallback(
                    "spam",
                    DetectorCategory::Spam,
                    0,
                    CircuitState::Open,
                    &ModerationError::CircuitOpen("spam".to_string()),
                ),
            ],
            actions: vec![ActionRecord {
                request_id: "r1".to_string(),
                action_type: ActionType::QueueReview,
                dispatched_at: Utc::now(),
                executed: false,
                idempotency_key: "r1:queue_review".to_string(),
            }],
            degraded: true,
            cached,
            stale: false,
            timings: Timings {
                total_ms: 50,
                detection_ms: 45,
            },
        }
    }

    #[test]
    fn test_decision_event_never_contains_content() {
        let request = sample_request("r1");
        let event = AuditEvent::decision(&request, &result(false));
        let json = serde_json::to_string(&event).unwrap();

        assert!(!json.contains(&request.content));
        assert!(json.contains(&request.content_fingerprint()));
        assert!(json.contains("\"event\":\"decision\""));
        assert!(json.contains("r1:queue_review"));
    }

    #[tokio::test]
    async fn test_trail_delivers_to_sink() {
        let sink = Arc::new(VecSink {
            events: Mutex::new(Vec::new()),
        });
        let trail = AuditTrail::spawn(sink.clone(), 16);

        trail.record(AuditEvent::RateLimited {
            request_id: "r9".to_string(),
            subject_user_id: "u".to_string(),
            retry_after_ms: 100,
            recorded_at: Utc::now(),
        });

        for _ in 0..50 {
            if !sink.events.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "rate_limited");
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let trail = AuditTrail::spawn(Arc::new(StuckSink), 1);
        let request = sample_request("r1");

        // Writer holds one event forever; the queue holds one more; the rest drop.
        for _ in 0..10 {
            trail.record(AuditEvent::decision(&request, &result(false)));
        }
    }

    #[tokio::test]
    async fn test_snapshot_rates() {
        let metrics = MetricsReporter::new();
        let health = ServiceHealthRegistry::new();
        health.monitor_for("toxicity");
        health.monitor_for("spam");

        metrics.record_request(&result(false), Some(&result(false)));
        metrics.record_request(&result(false), Some(&result(false)));
        metrics.record_request(&result(true), None);
        metrics.record_rate_limited();
        metrics.record_action_executed();

        let snapshot = metrics.health_snapshot(&health, &BreakerConfig::default());
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 2);
        assert!((snapshot.cache_hit_rate - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(snapshot.actions_dispatched, 2);
        assert_eq!(snapshot.actions_executed, 1);
        assert_eq!(snapshot.degraded, 3);

        let spam = snapshot
            .detectors
            .iter()
            .find(|d| d.detector == "spam")
            .unwrap();
        assert_eq!(spam.calls, 2);
        assert_eq!(spam.error_rate, 1.0);

        let toxicity = snapshot
            .detectors
            .iter()
            .find(|d| d.detector == "toxicity")
            .unwrap();
        assert_eq!(toxicity.success_rate, 1.0);
        assert_eq!(toxicity.avg_latency_ms, 40.0);
    }

    #[test]
    fn test_stale_answer_books_the_failed_evaluation() {
        let metrics = MetricsReporter::new();
        let health = ServiceHealthRegistry::new();
        health.monitor_for("toxicity");

        let mut served = result(true);
        served.stale = true;
        let evaluated = ModerationResult {
            per_detector: vec![DetectorResult::fallback(
                "toxicity",
                DetectorCategory::Toxicity,
                10,
                CircuitState::Open,
                &ModerationError::CircuitOpen("toxicity".to_string()),
            )],
            actions: Vec::new(),
            ..result(false)
        };

        metrics.record_request(&served, Some(&evaluated));

        let snapshot = metrics.health_snapshot(&health, &BreakerConfig::default());
        assert_eq!(snapshot.cache_hits, 0);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.stale_served, 1);
        assert_eq!(snapshot.actions_dispatched, 0);
        let toxicity = &snapshot.detectors[0];
        assert_eq!(toxicity.calls, 1);
        assert_eq!(toxicity.error_rate, 1.0);
    }
}
