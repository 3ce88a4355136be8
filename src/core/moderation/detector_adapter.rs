// Detector port and the adapter that guards each call.
//
// A detector is an external capability that scores one risk category. The
// adapter wraps it with:
// - the detector's circuit breaker (short-circuit while open)
// - a per-detector in-flight semaphore
// - a per-call timeout
// - output validation
// and turns every failure into a zero-contribution fallback result.

use super::engine_config::BreakerConfig;
use super::engine_errors::ModerationError;
use super::health_monitor::{CircuitState, ServiceHealthMonitor};
use super::moderation_models::{DetectorCategory, DetectorResult, ModerationRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

// ============================================================================
// DETECTOR TRAIT (PORT)
// ============================================================================

/// Raw answer from a detector, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorVerdict {
    pub score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
}

impl DetectorVerdict {
    /// Scores and confidences must be finite and inside [0, 1].
    pub fn validate(&self, detector: &str) -> Result<(), ModerationError> {
        let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_range(self.score) {
            return Err(ModerationError::AggregationInputInvalid {
                detector: detector.to_string(),
                message: format!("score {} outside [0,1]", self.score),
            });
        }
        if !in_range(self.confidence) {
            return Err(ModerationError::AggregationInputInvalid {
                detector: detector.to_string(),
                message: format!("confidence {} outside [0,1]", self.confidence),
            });
        }
        Ok(())
    }
}

/// One risk detector (toxicity model, spam classifier, fraud service, ...).
///
/// Implementations may fail in any way they like; the adapter treats every
/// error as a detector failure.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> DetectorCategory;

    async fn analyze(&self, request: &ModerationRequest) -> anyhow::Result<DetectorVerdict>;
}

// ============================================================================
// ADAPTER
// ============================================================================

/// Per-call knobs, taken from the request's config snapshot.
#[derive(Debug, Clone, Copy)]
pub struct AdapterSettings {
    pub timeout: Duration,
    pub breaker: BreakerConfig,
}

/// Set by the orchestrator when it stops waiting for a call. A call that
/// completes after being abandoned counts as a failure for health purposes;
/// its latency is still recorded.
#[derive(Debug, Clone, Default)]
pub struct AbandonFlag(Arc<AtomicBool>);

impl AbandonFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct DetectorAdapter {
    detector: Arc<dyn Detector>,
    monitor: Arc<ServiceHealthMonitor>,
    in_flight: Arc<Semaphore>,
}

impl DetectorAdapter {
    pub fn new(
        detector: Arc<dyn Detector>,
        monitor: Arc<ServiceHealthMonitor>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            detector,
            monitor,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    pub fn name(&self) -> &str {
        self.detector.name()
    }

    pub fn category(&self) -> DetectorCategory {
        self.detector.category()
    }

    pub fn monitor(&self) -> &Arc<ServiceHealthMonitor> {
        &self.monitor
    }

    #[allow(dead_code)]
    pub async fn call(&self, request: &ModerationRequest, settings: &AdapterSettings) -> DetectorResult {
        self.call_tracked(request, settings, &AbandonFlag::default())
            .await
    }

    /// Run one guarded detector call. Never fails; failures come back as
    /// fallback results.
    pub async fn call_tracked(
        &self,
        request: &ModerationRequest,
        settings: &AdapterSettings,
        abandoned: &AbandonFlag,
    ) -> DetectorResult {
        let name = self.detector.name();
        let category = self.detector.category();

        let admitted_state = match self.monitor.try_acquire(&settings.breaker) {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!(detector = name, request_id = %request.id, "Short-circuited");
                return DetectorResult::fallback(name, category, 0, CircuitState::Open, &e);
            }
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(settings.timeout, async {
            // Waiting for a permit counts against the call's timeout.
            let _permit = self
                .in_flight
                .acquire()
                .await
                .map_err(|e| anyhow::anyhow!("in-flight limiter closed: {}", e))?;
            self.detector.analyze(request).await
        })
        .await;
        let elapsed = started.elapsed();
        let latency_ms = elapsed.as_millis() as u64;

        let verdict = match outcome {
            Ok(Ok(verdict)) => verdict.validate(name).map(|_| verdict),
            Ok(Err(e)) => Err(ModerationError::DetectorError {
                detector: name.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ModerationError::DetectorTimeout {
                detector: name.to_string(),
                timeout_ms: settings.timeout.as_millis() as u64,
            }),
        };

        match verdict {
            Ok(verdict) => {
                if abandoned.is_set() {
                    self.monitor.record_latency(elapsed);
                    self.monitor.report_failure(&settings.breaker);
                } else {
                    self.monitor.report_success(elapsed, &settings.breaker);
                }
                DetectorResult {
                    detector_name: name.to_string(),
                    category,
                    score: verdict.score,
                    confidence: verdict.confidence,
                    categories: verdict.categories,
                    latency_ms,
                    used_fallback: false,
                    error: None,
                    circuit_state: admitted_state,
                }
            }
            Err(e) => {
                tracing::warn!(
                    detector = name,
                    request_id = %request.id,
                    error = %e,
                    "Detector call failed, using fallback"
                );
                self.monitor.report_failure(&settings.breaker);
                DetectorResult::fallback(name, category, latency_ms, admitted_state, &e)
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
