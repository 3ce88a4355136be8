// Detector fan-out.
//
// For each request the orchestrator picks the detectors that apply to the
// request kind, calls them all concurrently and collects whatever comes back
// before the hard deadline. Calls still running at the deadline are left to
// finish on their own: their results are discarded and only feed health
// bookkeeping.

use super::detector_adapter::{AbandonFlag, AdapterSettings, Detector, DetectorAdapter};
use super::engine_config::EngineConfig;
use super::engine_errors::ModerationError;
use super::health_monitor::ServiceHealthRegistry;
use super::moderation_models::{DetectorCategory, DetectorResult, ModerationRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

// ============================================================================
// REGISTRY
// ============================================================================

/// One adapter per detector category, resolved once at startup.
#[derive(Default)]
pub struct DetectorRegistry {
    adapters: BTreeMap<DetectorCategory, Arc<DetectorAdapter>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a detector. A second detector for the same category
    /// replaces the first.
    pub fn register(
        &mut self,
        detector: Arc<dyn Detector>,
        health: &ServiceHealthRegistry,
        max_in_flight: usize,
    ) {
        let category = detector.category();
        let monitor = health.monitor_for(detector.name());
        if let Some(previous) = self.adapters.get(&category) {
            tracing::warn!(
                category = %category,
                replaced = previous.name(),
                "Replacing registered detector"
            );
        }
        tracing::info!(category = %category, detector = detector.name(), "Detector registered");
        self.adapters.insert(
            category,
            Arc::new(DetectorAdapter::new(detector, monitor, max_in_flight)),
        );
    }

    pub fn get(&self, category: DetectorCategory) -> Option<&Arc<DetectorAdapter>> {
        self.adapters.get(&category)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct Orchestrator {
    registry: DetectorRegistry,
}

impl Orchestrator {
    pub fn new(registry: DetectorRegistry) -> Self {
        Self { registry }
    }

    /// Registered adapters enabled for this request kind, without duplicates.
    pub fn applicable(
        &self,
        request: &ModerationRequest,
        config: &EngineConfig,
    ) -> Vec<Arc<DetectorAdapter>> {
        let mut seen = Vec::new();
        let mut adapters = Vec::new();
        for category in config.detectors_for(request.kind) {
            if seen.contains(category) {
                continue;
            }
            seen.push(*category);
            if let Some(adapter) = self.registry.get(*category) {
                adapters.push(Arc::clone(adapter));
            }
        }
        adapters
    }

    /// Call every applicable detector and collect one result per detector.
    ///
    /// The returned order is unspecified.
    pub async fn run(
        &self,
        request: Arc<ModerationRequest>,
        config: &EngineConfig,
    ) -> Vec<DetectorResult> {
        let adapters = self.applicable(&request, config);
        if adapters.is_empty() {
            tracing::debug!(request_id = %request.id, kind = %request.kind, "No applicable detectors");
            return Vec::new();
        }

        let deadline = Instant::now() + config.hard_deadline();
        let settings = AdapterSettings {
            timeout: config.adapter_timeout(),
            breaker: config.breaker,
        };

        let (tx, mut rx) = mpsc::channel(adapters.len());
        let mut flags = Vec::with_capacity(adapters.len());

        for (index, adapter) in adapters.iter().enumerate() {
            let flag = AbandonFlag::default();
            flags.push(flag.clone());

            let call_adapter = Arc::clone(adapter);
            let call_request = Arc::clone(&request);
            let call = tokio::spawn(async move {
                call_adapter
                    .call_tracked(&call_request, &settings, &flag)
                    .await
            });

            // Supervisor: turns a panicking detector into a failure too.
            let adapter = Arc::clone(adapter);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = match call.await {
                    Ok(result) => result,
                    Err(join_error) => {
                        adapter.monitor().report_failure(&settings.breaker);
                        DetectorResult::fallback(
                            adapter.name(),
                            adapter.category(),
                            0,
                            adapter.monitor().state(&settings.breaker),
                            &ModerationError::DetectorError {
                                detector: adapter.name().to_string(),
                                message: format!("detector task aborted: {}", join_error),
                            },
                        )
                    }
                };
                // The receiver is gone once the deadline fired; late results are dropped.
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut slots: Vec<Option<DetectorResult>> = vec![None; adapters.len()];
        let mut received = 0;
        while received < adapters.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((index, result))) => {
                    slots[index] = Some(result);
                    received += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        request_id = %request.id,
                        outstanding = adapters.len() - received,
                        deadline_ms = config.hard_deadline_ms,
                        "Hard deadline reached, abandoning outstanding detector calls"
                    );
                    break;
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                Some(result) => result,
                None => {
                    flags[index].set();
                    let adapter = &adapters[index];
                    DetectorResult::fallback(
                        adapter.name(),
                        adapter.category(),
                        config.hard_deadline_ms,
                        adapter.monitor().state(&config.breaker),
                        &ModerationError::DetectorTimeout {
                            detector: adapter.name().to_string(),
                            timeout_ms: config.hard_deadline_ms,
                        },
                    )
                }
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::detector_adapter::tests::{sample_request, StubDetector};
    use crate::core::moderation::detector_adapter::DetectorVerdict;
    use crate::core::moderation::health_monitor::CircuitState;
    use crate::core::moderation::moderation_models::RequestKind;
    use async_trait::async_trait;
    use std::time::Duration;

    struct PanickingDetector;

    #[async_trait]
    impl Detector for PanickingDetector {
        fn name(&self) -> &str {
            "toxicity"
        }

        fn category(&self) -> DetectorCategory {
            DetectorCategory::Toxicity
        }

        async fn analyze(&self, _request: &ModerationRequest) -> anyhow::Result<DetectorVerdict> {
            panic!("detector bug");
        }
    }

    fn orchestrator(detectors: Vec<Arc<StubDetector>>) -> (Orchestrator, Arc<ServiceHealthRegistry>) {
        let health = Arc::new(ServiceHealthRegistry::new());
        let mut registry = DetectorRegistry::new();
        for detector in detectors {
            registry.register(detector, &health, 50);
        }
        (Orchestrator::new(registry), health)
    }

    #[tokio::test]
    async fn test_only_applicable_detectors_run() {
        let toxicity = Arc::new(StubDetector::scoring(DetectorCategory::Toxicity, 0.5, 0.9));
        let fraud = Arc::new(StubDetector::scoring(DetectorCategory::Fraud, 0.5, 0.9));
        let (orchestrator, _) = orchestrator(vec![toxicity.clone(), fraud.clone()]);

        let results = orchestrator
            .run(Arc::new(sample_request("r1")), &EngineConfig::default())
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].category, DetectorCategory::Toxicity);
        assert_eq!(fraud.calls(), 0);

        let mut transaction = sample_request("r2");
        transaction.kind = RequestKind::Transaction;
        let results = orchestrator
            .run(Arc::new(transaction), &EngineConfig::default())
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].category, DetectorCategory::Fraud);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_rest() {
        let (orchestrator, _) = orchestrator(vec![
            Arc::new(StubDetector::failing(DetectorCategory::Toxicity)),
            Arc::new(StubDetector::scoring(DetectorCategory::Spam, 0.4, 0.8)),
            Arc::new(StubDetector::scoring(DetectorCategory::ThreatPattern, 0.2, 0.6)),
        ]);

        let results = orchestrator
            .run(Arc::new(sample_request("r1")), &EngineConfig::default())
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.used_fallback).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_timeout_inside_deadline() {
        let (orchestrator, _) = orchestrator(vec![
            Arc::new(
                StubDetector::scoring(DetectorCategory::Toxicity, 0.9, 0.9)
                    .with_delay(Duration::from_secs(60)),
            ),
            Arc::new(StubDetector::scoring(DetectorCategory::Spam, 0.4, 0.8)),
        ]);

        let started = Instant::now();
        let results = orchestrator
            .run(Arc::new(sample_request("r1")), &EngineConfig::default())
            .await;

        assert!(started.elapsed() < Duration::from_secs(15));
        let slow = results
            .iter()
            .find(|r| r.category == DetectorCategory::Toxicity)
            .unwrap();
        assert!(slow.used_fallback);
        assert!(slow.error.as_ref().unwrap().contains("10000ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_deadline_preempts_slow_calls() {
        let slow = Arc::new(
            StubDetector::scoring(DetectorCategory::Toxicity, 0.9, 0.9)
                .with_delay(Duration::from_secs(20)),
        );
        let (orchestrator, health) = orchestrator(vec![
            slow.clone(),
            Arc::new(StubDetector::scoring(DetectorCategory::Spam, 0.4, 0.8)),
        ]);

        let mut config = EngineConfig::default();
        config.adapter_timeout_ms = 30_000;

        let started = Instant::now();
        let results = orchestrator
            .run(Arc::new(sample_request("r1")), &config)
            .await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
        assert_eq!(results.len(), 2);
        let abandoned = results
            .iter()
            .find(|r| r.category == DetectorCategory::Toxicity)
            .unwrap();
        assert!(abandoned.used_fallback);

        // The abandoned call finishes later and is booked as a failure.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let record = health
            .get("toxicity")
            .unwrap()
            .snapshot(&config.breaker);
        assert_eq!(record.total_failures, 1);
        assert_eq!(record.total_successes, 0);
    }

    #[tokio::test]
    async fn test_no_registered_detectors_yields_empty() {
        let (orchestrator, _) = orchestrator(Vec::new());
        let results = orchestrator
            .run(Arc::new(sample_request("r1")), &EngineConfig::default())
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_detector_reports_observed_circuit_state() {
        let health = Arc::new(ServiceHealthRegistry::new());
        let mut registry = DetectorRegistry::new();
        registry.register(Arc::new(PanickingDetector), &health, 50);
        let orchestrator = Orchestrator::new(registry);

        let mut config = EngineConfig::default();
        config.breaker.failure_threshold = 1;

        let results = orchestrator
            .run(Arc::new(sample_request("r1")), &config)
            .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].used_fallback);
        assert!(results[0].error.as_ref().unwrap().contains("aborted"));
        assert_eq!(results[0].circuit_state, CircuitState::Open);
    }
}
