// Moderation engine - core entry point for scoring requests.
//
// One call to `moderate` walks the whole pipeline:
// rate limit -> cache (single-flight) -> detector fan-out -> aggregation ->
// action dispatch -> metrics and audit.
//
// NO transport dependencies here. Callers hand in a request and get back a
// result or a structured denial.

use super::action_dispatcher::{ActionDispatcher, ActionExecutor, ActionLedger, ActionRunner};
use super::audit_reporter::{AuditEvent, AuditSink, AuditTrail, HealthSnapshot, MetricsReporter};
use super::detector_adapter::Detector;
use super::engine_config::{ConfigPatch, EngineConfig};
use super::engine_errors::ModerationError;
use super::health_monitor::ServiceHealthRegistry;
use super::moderation_models::{ModerationRequest, ModerationResult, Timings};
use super::orchestrator::{DetectorRegistry, Orchestrator};
use super::rate_limiter::{RateLimitStore, RateLimiter};
use super::result_cache::{CacheSource, CacheStore, ResultCache};
use super::risk_aggregator::aggregate;
use chrono::Utc;
use std::sync::{Arc, RwLock};
use tokio::time::Instant;

const AUDIT_QUEUE_CAPACITY: usize = 1024;

/// Everything the engine needs from the outside world.
pub struct EngineComponents {
    pub detectors: Vec<Arc<dyn Detector>>,
    pub rate_limit_store: Box<dyn RateLimitStore>,
    pub cache_store: Box<dyn CacheStore>,
    pub executor: Arc<dyn ActionExecutor>,
    pub ledger: Arc<dyn ActionLedger>,
    pub audit_sink: Arc<dyn AuditSink>,
}

pub struct ModerationEngine {
    config: RwLock<Arc<EngineConfig>>,
    health: Arc<ServiceHealthRegistry>,
    orchestrator: Orchestrator,
    rate_limiter: RateLimiter<Box<dyn RateLimitStore>>,
    cache: ResultCache<Box<dyn CacheStore>>,
    dispatcher: ActionDispatcher,
    audit: AuditTrail,
    metrics: Arc<MetricsReporter>,
}

impl ModerationEngine {
    /// Build the engine and start its background workers. Must be called
    /// inside a tokio runtime.
    pub fn new(config: EngineConfig, components: EngineComponents) -> Result<Self, ModerationError> {
        config.validate()?;

        let health = Arc::new(ServiceHealthRegistry::new());
        let mut registry = DetectorRegistry::new();
        for detector in components.detectors {
            registry.register(detector, &health, config.max_in_flight_per_detector);
        }
        if registry.is_empty() {
            tracing::warn!("No detectors registered; every request will score as safe");
        }

        let metrics = Arc::new(MetricsReporter::new());
        let audit = AuditTrail::spawn(components.audit_sink, AUDIT_QUEUE_CAPACITY);
        let dispatcher = ActionDispatcher::spawn(
            ActionRunner::new(
                components.executor,
                components.ledger,
                audit.clone(),
                Arc::clone(&metrics),
            ),
            config.max_concurrent_actions,
        );

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            health,
            orchestrator: Orchestrator::new(registry),
            rate_limiter: RateLimiter::new(components.rate_limit_store),
            cache: ResultCache::new(components.cache_store),
            dispatcher,
            audit,
            metrics,
        })
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<EngineConfig> {
        let guard = self.config.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*guard)
    }

    /// Merge `patch` into the live configuration. Requests already running
    /// keep the snapshot they started with.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<Arc<EngineConfig>, ModerationError> {
        let mut guard = self.config.write().unwrap_or_else(|e| e.into_inner());
        let next = patch.apply(&guard);
        next.validate()?;
        if next.max_in_flight_per_detector != guard.max_in_flight_per_detector {
            tracing::warn!("max_in_flight_per_detector only takes effect on restart");
        }
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        tracing::info!("Engine configuration updated");
        Ok(next)
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.metrics
            .health_snapshot(&self.health, &self.config().breaker)
    }

    /// Score one request.
    ///
    /// Only `RateLimitExceeded` and `InvalidRequest` come back as errors.
    /// Every other failure is absorbed into a (possibly degraded) result.
    pub async fn moderate(&self, request: ModerationRequest) -> Result<ModerationResult, ModerationError> {
        let started = Instant::now();
        request.validate()?;

        let config = self.config();
        let request = Arc::new(request);

        let admission = self
            .rate_limiter
            .allow(
                &request.subject_user_id,
                &config.rate_limit,
                config.backend_timeout(),
            )
            .await;
        if !admission.allowed {
            tracing::info!(
                request_id = %request.id,
                subject = %request.subject_user_id,
                retry_after_ms = admission.retry_after_ms,
                "Request rate limited"
            );
            self.metrics.record_rate_limited();
            self.audit.record(AuditEvent::RateLimited {
                request_id: request.id.clone(),
                subject_user_id: request.subject_user_id.clone(),
                retry_after_ms: admission.retry_after_ms,
                recorded_at: Utc::now(),
            });
            return Err(ModerationError::RateLimitExceeded {
                retry_after_ms: admission.retry_after_ms,
            });
        }

        let key = request.cache_key();
        let lookup = self
            .cache
            .get_or_compute(key, &config.cache, config.backend_timeout(), || {
                self.evaluate(Arc::clone(&request), &config)
            })
            .await;

        let mut result = match lookup.source {
            CacheSource::Computed => lookup.result,
            CacheSource::Hit => {
                let mut reissued = lookup.result.reissue(&request.id);
                reissued.timings.detection_ms = 0;
                reissued
            }
            CacheSource::Shared => lookup.result.reissue(&request.id),
        };

        // The evaluation this request triggered, when it differs from what is served.
        let mut evaluated: Option<ModerationResult> = None;
        if lookup.source == CacheSource::Computed && result.all_detectors_failed() {
            if let Some(stale) = self.cache.get_stale(key, config.backend_timeout()).await {
                tracing::warn!(
                    request_id = %request.id,
                    key = %key,
                    "All detectors unavailable, serving stale cached decision"
                );
                let mut served = stale.reissue(&request.id);
                served.stale = true;
                served.degraded = true;
                served.timings.detection_ms = 0;
                evaluated = Some(std::mem::replace(&mut result, served));
            }
        }

        if admission.degraded || lookup.degraded {
            result.degraded = true;
        }
        result.timings.total_ms = started.elapsed().as_millis() as u64;

        let ran = match lookup.source {
            CacheSource::Computed => Some(evaluated.as_ref().unwrap_or(&result)),
            CacheSource::Hit | CacheSource::Shared => None,
        };
        self.metrics.record_request(&result, ran);
        self.audit.record(AuditEvent::decision(&request, &result));

        tracing::debug!(
            request_id = %result.request_id,
            risk = result.overall_risk,
            level = %result.risk_level,
            degraded = result.degraded,
            cached = result.cached,
            actions = result.actions.len(),
            "Moderation decision"
        );

        Ok(result)
    }

    /// Run detectors, aggregate and dispatch. Only reached on a cache miss,
    /// and only by the single-flight leader.
    async fn evaluate(&self, request: Arc<ModerationRequest>, config: &EngineConfig) -> ModerationResult {
        let started = Instant::now();
        let per_detector = self.orchestrator.run(Arc::clone(&request), config).await;
        let detection_ms = started.elapsed().as_millis() as u64;

        let assessment = aggregate(&per_detector, config);
        let degraded = per_detector.iter().any(|d| d.used_fallback);
        let actions = self
            .dispatcher
            .dispatch(&request, &assessment, &per_detector, &config.dispatch);

        ModerationResult {
            request_id: request.id.clone(),
            overall_risk: assessment.overall_risk,
            risk_level: assessment.risk_level,
            confidence: assessment.confidence,
            per_detector,
            actions,
            degraded,
            cached: false,
            stale: false,
            timings: Timings {
                total_ms: detection_ms,
                detection_ms,
            },
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
