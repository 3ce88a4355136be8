// Core moderation module - the decision engine and the ports it consumes.
// Each pipeline stage lives in its own file; `moderation_service` ties them together.

pub mod action_dispatcher;
pub mod audit_reporter;
pub mod detector_adapter;
pub mod engine_config;
pub mod engine_errors;
pub mod health_monitor;
pub mod moderation_models;
pub mod moderation_service;
pub mod orchestrator;
pub mod rate_limiter;
pub mod result_cache;
pub mod risk_aggregator;

pub use action_dispatcher::{ActionExecutor, ActionLedger, ActionStatus, ReviewPayload};
pub use audit_reporter::{AuditEvent, AuditSink};
pub use detector_adapter::{Detector, DetectorVerdict};
pub use engine_config::{ConfigPatch, EngineConfig};
pub use engine_errors::ModerationError;
pub use moderation_models::{ActionType, CacheKey, DetectorCategory, ModerationRequest, RiskLevel};
pub use moderation_service::{EngineComponents, ModerationEngine};
pub use rate_limiter::{Admission, RateLimitStore, SlidingWindow};
pub use result_cache::{CacheEntry, CacheStore};
