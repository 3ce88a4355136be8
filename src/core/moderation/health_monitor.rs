//! Per-detector circuit breaker.
//!
//! Stops calling a failing detector for a cooldown period:
//! - Closed: normal operation, calls flow through
//! - Open: too many consecutive failures, calls short-circuit
//! - Half-open: cooldown elapsed, trial calls decide whether to close again
//!
//! All counters and the state live behind one mutex per detector, so a
//! transition and the counter reset that goes with it are never observed
//! half-applied by concurrent reporters.

use super::engine_config::BreakerConfig;
use super::engine_errors::ModerationError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Smoothing factor for the rolling latency average.
const LATENCY_EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Externally visible health of one detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealthRecord {
    pub detector_name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_transition_at: DateTime<Utc>,
    pub rolling_latency_ms: Option<f64>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub short_circuited: u64,
}

struct BreakerState {
    record: ServiceHealthRecord,
    opened_at: Option<Instant>,
}

pub struct ServiceHealthMonitor {
    state: Mutex<BreakerState>,
}

impl ServiceHealthMonitor {
    pub fn new(detector_name: &str) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                record: ServiceHealthRecord {
                    detector_name: detector_name.to_string(),
                    state: CircuitState::Closed,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    last_transition_at: Utc::now(),
                    rolling_latency_ms: None,
                    total_successes: 0,
                    total_failures: 0,
                    short_circuited: 0,
                },
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // A panic while holding the lock cannot leave the record torn:
        // every mutation below is a handful of plain field writes.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a call. Returns the state the call was admitted under, or
    /// `CircuitOpen` when the call must be short-circuited.
    pub fn try_acquire(&self, config: &BreakerConfig) -> Result<CircuitState, ModerationError> {
        let mut guard = self.lock();
        Self::check_cooldown(&mut guard, config.cooldown());

        match guard.record.state {
            CircuitState::Open => {
                guard.record.short_circuited += 1;
                Err(ModerationError::CircuitOpen(
                    guard.record.detector_name.clone(),
                ))
            }
            state => Ok(state),
        }
    }

    /// Current state, applying any due open -> half-open transition.
    pub fn state(&self, config: &BreakerConfig) -> CircuitState {
        let mut guard = self.lock();
        Self::check_cooldown(&mut guard, config.cooldown());
        guard.record.state
    }

    pub fn report_success(&self, latency: Duration, config: &BreakerConfig) {
        let mut guard = self.lock();
        Self::update_latency(&mut guard, latency);
        guard.record.total_successes += 1;

        match guard.record.state {
            CircuitState::Closed => {
                guard.record.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                guard.record.consecutive_successes += 1;
                if guard.record.consecutive_successes >= config.success_threshold {
                    info!(
                        detector = %guard.record.detector_name,
                        successes = guard.record.consecutive_successes,
                        "Circuit closing after successful trial calls"
                    );
                    Self::transition_to(&mut guard, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // Late result from a call admitted before the circuit opened.
                debug!(
                    detector = %guard.record.detector_name,
                    "Success reported while circuit open"
                );
            }
        }
    }

    pub fn report_failure(&self, config: &BreakerConfig) {
        let mut guard = self.lock();
        guard.record.total_failures += 1;

        match guard.record.state {
            CircuitState::Closed => {
                guard.record.consecutive_failures += 1;
                if guard.record.consecutive_failures >= config.failure_threshold {
                    warn!(
                        detector = %guard.record.detector_name,
                        failures = guard.record.consecutive_failures,
                        "Circuit opening due to consecutive failures"
                    );
                    Self::transition_to(&mut guard, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    detector = %guard.record.detector_name,
                    "Circuit re-opening after failed trial call"
                );
                Self::transition_to(&mut guard, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Fold a latency sample into the rolling average without touching
    /// the success/failure bookkeeping.
    pub fn record_latency(&self, latency: Duration) {
        let mut guard = self.lock();
        Self::update_latency(&mut guard, latency);
    }

    pub fn snapshot(&self, config: &BreakerConfig) -> ServiceHealthRecord {
        let mut guard = self.lock();
        Self::check_cooldown(&mut guard, config.cooldown());
        guard.record.clone()
    }

    fn check_cooldown(guard: &mut BreakerState, cooldown: Duration) {
        if guard.record.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = guard.opened_at {
            if opened_at.elapsed() >= cooldown {
                info!(
                    detector = %guard.record.detector_name,
                    "Circuit half-open after cooldown"
                );
                Self::transition_to(guard, CircuitState::HalfOpen);
            }
        }
    }

    fn update_latency(guard: &mut BreakerState, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        guard.record.rolling_latency_ms = Some(match guard.record.rolling_latency_ms {
            Some(prev) => prev * (1.0 - LATENCY_EMA_ALPHA) + sample * LATENCY_EMA_ALPHA,
            None => sample,
        });
    }

    fn transition_to(guard: &mut BreakerState, next: CircuitState) {
        guard.record.state = next;
        guard.record.last_transition_at = Utc::now();
        guard.record.consecutive_failures = 0;
        guard.record.consecutive_successes = 0;
        guard.opened_at = match next {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };
    }
}

/// All monitors, keyed by detector name. Adapters hold their own `Arc`;
/// the registry exists for snapshots.
#[derive(Default)]
pub struct ServiceHealthRegistry {
    monitors: DashMap<String, Arc<ServiceHealthMonitor>>,
}

impl ServiceHealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn monitor_for(&self, detector_name: &str) -> Arc<ServiceHealthMonitor> {
        self.monitors
            .entry(detector_name.to_string())
            .or_insert_with(|| Arc::new(ServiceHealthMonitor::new(detector_name)))
            .clone()
    }

    pub fn get(&self, detector_name: &str) -> Option<Arc<ServiceHealthMonitor>> {
        self.monitors.get(detector_name).map(|m| Arc::clone(m.value()))
    }

    /// Records for every detector, sorted by name.
    pub fn snapshot(&self, config: &BreakerConfig) -> Vec<ServiceHealthRecord> {
        let mut records: Vec<ServiceHealthRecord> = self
            .monitors
            .iter()
            .map(|entry| entry.value().snapshot(config))
            .collect();
        records.sort_by(|a, b| a.detector_name.cmp(&b.detector_name));
        records
    }
}
