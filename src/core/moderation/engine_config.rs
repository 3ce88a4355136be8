// Engine configuration.
//
// Loaded once at startup (defaults -> optional JSON file -> MODERATION_* env
// vars) and replaced wholesale at runtime through `ConfigPatch`. Requests
// read a single `Arc<EngineConfig>` snapshot for their whole lifetime.

use super::engine_errors::ModerationError;
use super::moderation_models::{DetectorCategory, RequestKind, RiskLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Risk-level lower bounds. A risk equal to a bound falls into that level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical: 0.8,
            high: 0.6,
            medium: 0.3,
            low: 0.1,
        }
    }
}

impl RiskThresholds {
    pub fn classify(&self, overall_risk: f64) -> RiskLevel {
        if overall_risk >= self.critical {
            RiskLevel::Critical
        } else if overall_risk >= self.high {
            RiskLevel::High
        } else if overall_risk >= self.medium {
            RiskLevel::Medium
        } else if overall_risk >= self.low {
            RiskLevel::Low
        } else {
            RiskLevel::Safe
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive trial successes that close a half-open circuit.
    pub success_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            cooldown_ms: 60_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
            capacity: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    /// Per-attempt bound on an executor call.
    pub action_timeout_ms: u64,
    /// Also issue a punishment for critical verdicts.
    pub auto_punish_critical: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 200,
            action_timeout_ms: 5_000,
            auto_punish_critical: false,
        }
    }
}

impl DispatchConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub detectors_by_kind: BTreeMap<RequestKind, Vec<DetectorCategory>>,
    pub weights: BTreeMap<DetectorCategory, f64>,
    pub thresholds: RiskThresholds,
    pub adapter_timeout_ms: u64,
    pub hard_deadline_ms: u64,
    /// Applied when detectors are registered; not hot-reloadable.
    pub max_in_flight_per_detector: usize,
    /// Action jobs executing at once. Applied at startup; not hot-reloadable.
    pub max_concurrent_actions: usize,
    /// Bound on every cache and rate-limiter backend call.
    pub backend_timeout_ms: u64,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub dispatch: DispatchConfig,
    pub health_snapshot_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        use DetectorCategory::*;

        let detectors_by_kind = BTreeMap::from([
            (
                RequestKind::Message,
                vec![Toxicity, Spam, ThreatPattern, Behavioral],
            ),
            (RequestKind::Upload, vec![Nsfw, Spam, Toxicity]),
            (RequestKind::Transaction, vec![Fraud, Behavioral]),
            (RequestKind::UserJoin, vec![Fraud, Spam, Behavioral]),
            (RequestKind::ProfileUpdate, vec![Toxicity, Nsfw, Spam]),
        ]);

        let weights = BTreeMap::from([
            (Toxicity, 0.30),
            (Spam, 0.25),
            (Nsfw, 0.25),
            (Fraud, 0.40),
            (ThreatPattern, 0.35),
            (Behavioral, 0.15),
        ]);

        Self {
            detectors_by_kind,
            weights,
            thresholds: RiskThresholds::default(),
            adapter_timeout_ms: 10_000,
            hard_deadline_ms: 15_000,
            max_in_flight_per_detector: 50,
            max_concurrent_actions: 32,
            backend_timeout_ms: 250,
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            dispatch: DispatchConfig::default(),
            health_snapshot_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Defaults, then `MODERATION_CONFIG_FILE` (JSON), then `MODERATION_*` env vars.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("MODERATION_CONFIG_FILE") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config = ConfigPatch::from_env().apply(&config);
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path, e))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {}", path, e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ModerationError> {
        let invalid =
            |msg: String| -> Result<(), ModerationError> { Err(ModerationError::InvalidConfig(msg)) };

        for (category, weight) in &self.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return invalid(format!("weight for {} must be >= 0", category));
            }
        }

        let t = &self.thresholds;
        let ordered = [t.critical, t.high, t.medium, t.low];
        if ordered.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0)
            || ordered.windows(2).any(|w| w[0] < w[1])
        {
            return invalid(
                "thresholds must lie in [0,1] with critical >= high >= medium >= low".to_string(),
            );
        }

        if self.adapter_timeout_ms == 0 || self.hard_deadline_ms == 0 {
            return invalid("adapter timeout and hard deadline must be positive".to_string());
        }
        if self.max_in_flight_per_detector == 0 {
            return invalid("max_in_flight_per_detector must be positive".to_string());
        }
        if self.max_concurrent_actions == 0 {
            return invalid("max_concurrent_actions must be positive".to_string());
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return invalid("circuit breaker thresholds must be positive".to_string());
        }
        if self.rate_limit.window_ms == 0 {
            return invalid("rate limit window must be positive".to_string());
        }
        if self.cache.capacity == 0 {
            return invalid("cache capacity must be positive".to_string());
        }
        Ok(())
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn hard_deadline(&self) -> Duration {
        Duration::from_millis(self.hard_deadline_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn detectors_for(&self, kind: RequestKind) -> &[DetectorCategory] {
        self.detectors_by_kind
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn weight_for(&self, category: DetectorCategory) -> f64 {
        self.weights.get(&category).copied().unwrap_or(0.0)
    }
}

// ============================================================================
// PARTIAL UPDATES
// ============================================================================

/// Partial configuration. Unset fields keep their current value; map fields
/// are merged entry by entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub detectors_by_kind: Option<BTreeMap<RequestKind, Vec<DetectorCategory>>>,
    pub weights: Option<BTreeMap<DetectorCategory, f64>>,
    pub thresholds: Option<RiskThresholds>,
    pub adapter_timeout_ms: Option<u64>,
    pub hard_deadline_ms: Option<u64>,
    pub backend_timeout_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub cooldown_ms: Option<u64>,
    pub rate_limit_window_ms: Option<u64>,
    pub rate_limit_max_requests: Option<u32>,
    pub cache_ttl_ms: Option<u64>,
    pub cache_capacity: Option<usize>,
    pub max_retries: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub auto_punish_critical: Option<bool>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl ConfigPatch {
    /// Scalar overrides from `MODERATION_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            adapter_timeout_ms: env_parse("MODERATION_ADAPTER_TIMEOUT_MS"),
            hard_deadline_ms: env_parse("MODERATION_HARD_DEADLINE_MS"),
            backend_timeout_ms: env_parse("MODERATION_BACKEND_TIMEOUT_MS"),
            failure_threshold: env_parse("MODERATION_BREAKER_FAILURE_THRESHOLD"),
            success_threshold: env_parse("MODERATION_BREAKER_SUCCESS_THRESHOLD"),
            cooldown_ms: env_parse("MODERATION_BREAKER_COOLDOWN_MS"),
            rate_limit_window_ms: env_parse("MODERATION_RATE_LIMIT_WINDOW_MS"),
            rate_limit_max_requests: env_parse("MODERATION_RATE_LIMIT_MAX"),
            cache_ttl_ms: env_parse("MODERATION_CACHE_TTL_MS"),
            cache_capacity: env_parse("MODERATION_CACHE_CAPACITY"),
            max_retries: env_parse("MODERATION_ACTION_MAX_RETRIES"),
            base_backoff_ms: env_parse("MODERATION_ACTION_BACKOFF_MS"),
            auto_punish_critical: env_parse("MODERATION_AUTO_PUNISH_CRITICAL"),
            ..Default::default()
        }
    }

    pub fn apply(&self, base: &EngineConfig) -> EngineConfig {
        let mut next = base.clone();

        if let Some(kinds) = &self.detectors_by_kind {
            for (kind, detectors) in kinds {
                next.detectors_by_kind.insert(*kind, detectors.clone());
            }
        }
        if let Some(weights) = &self.weights {
            for (category, weight) in weights {
                next.weights.insert(*category, *weight);
            }
        }
        if let Some(thresholds) = self.thresholds {
            next.thresholds = thresholds;
        }

        let set = |slot: &mut u64, value: Option<u64>| {
            if let Some(v) = value {
                *slot = v;
            }
        };
        set(&mut next.adapter_timeout_ms, self.adapter_timeout_ms);
        set(&mut next.hard_deadline_ms, self.hard_deadline_ms);
        set(&mut next.backend_timeout_ms, self.backend_timeout_ms);
        set(&mut next.breaker.cooldown_ms, self.cooldown_ms);
        set(&mut next.rate_limit.window_ms, self.rate_limit_window_ms);
        set(&mut next.cache.ttl_ms, self.cache_ttl_ms);
        set(&mut next.dispatch.base_backoff_ms, self.base_backoff_ms);

        if let Some(v) = self.failure_threshold {
            next.breaker.failure_threshold = v;
        }
        if let Some(v) = self.success_threshold {
            next.breaker.success_threshold = v;
        }
        if let Some(v) = self.rate_limit_max_requests {
            next.rate_limit.max_requests = v;
        }
        if let Some(v) = self.cache_capacity {
            next.cache.capacity = v;
        }
        if let Some(v) = self.max_retries {
            next.dispatch.max_retries = v;
        }
        if let Some(v) = self.auto_punish_critical {
            next.dispatch.auto_punish_critical = v;
        }

        next
    }
}
