// Moderation domain models - the data that flows through the decision engine.
//
// These are pure domain types with no transport or storage dependencies.
// Requests come in, detector results and a verdict go out.

use super::engine_errors::ModerationError;
use super::health_monitor::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

// ============================================================================
// REQUESTS
// ============================================================================

/// What kind of event is being moderated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Message,
    Transaction,
    UserJoin,
    Upload,
    ProfileUpdate,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Message => "message",
            RequestKind::Transaction => "transaction",
            RequestKind::UserJoin => "user_join",
            RequestKind::Upload => "upload",
            RequestKind::ProfileUpdate => "profile_update",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling hint supplied by the caller. Carried through to detectors
/// and review payloads; it does not change aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Where the event happened (server/channel).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextIds {
    pub server_id: Option<String>,
    pub channel_id: Option<String>,
    /// Platform id of the message, upload or profile being judged.
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// One incoming content or account event.
///
/// The engine wraps requests in an `Arc` as soon as they are admitted and
/// never hands out a mutable reference afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationRequest {
    pub id: String,
    pub kind: RequestKind,
    pub subject_user_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub context: ContextIds,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Key under which a decision is memoized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(pub u64);

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Hash content for fingerprinting. Whitespace and case are normalized so
/// trivially re-typed content maps to the same fingerprint.
pub fn fingerprint(content: &str) -> u64 {
    let normalized = content.trim().to_lowercase();
    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    hasher.finish()
}

impl ModerationRequest {
    /// Hex fingerprint of the content. This is what leaves the engine in
    /// audit entries and review payloads instead of the raw text.
    pub fn content_fingerprint(&self) -> String {
        format!("{:016x}", fingerprint(&self.content))
    }

    /// Cache key: kind + subject + content fingerprint + attachment count.
    pub fn cache_key(&self) -> CacheKey {
        let mut hasher = DefaultHasher::new();
        self.kind.hash(&mut hasher);
        self.subject_user_id.hash(&mut hasher);
        fingerprint(&self.content).hash(&mut hasher);
        self.attachments.len().hash(&mut hasher);
        CacheKey(hasher.finish())
    }

    /// Reject requests the engine cannot meaningfully score.
    pub fn validate(&self) -> Result<(), ModerationError> {
        if self.id.trim().is_empty() {
            return Err(ModerationError::InvalidRequest(
                "request id must not be empty".to_string(),
            ));
        }
        if self.subject_user_id.trim().is_empty() {
            return Err(ModerationError::InvalidRequest(
                "subject_user_id must not be empty".to_string(),
            ));
        }
        if self.kind != RequestKind::UserJoin
            && self.content.trim().is_empty()
            && self.attachments.is_empty()
        {
            return Err(ModerationError::InvalidRequest(format!(
                "{} request carries neither content nor attachments",
                self.kind
            )));
        }
        Ok(())
    }
}

// ============================================================================
// DETECTOR OUTPUT
// ============================================================================

/// Risk category a detector scores along. One registered detector per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorCategory {
    Toxicity,
    Spam,
    Nsfw,
    Fraud,
    ThreatPattern,
    Behavioral,
}

impl DetectorCategory {
    pub const ALL: [DetectorCategory; 6] = [
        DetectorCategory::Toxicity,
        DetectorCategory::Spam,
        DetectorCategory::Nsfw,
        DetectorCategory::Fraud,
        DetectorCategory::ThreatPattern,
        DetectorCategory::Behavioral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorCategory::Toxicity => "toxicity",
            DetectorCategory::Spam => "spam",
            DetectorCategory::Nsfw => "nsfw",
            DetectorCategory::Fraud => "fraud",
            DetectorCategory::ThreatPattern => "threat_pattern",
            DetectorCategory::Behavioral => "behavioral",
        }
    }
}

impl fmt::Display for DetectorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one adapter call. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorResult {
    pub detector_name: String,
    pub category: DetectorCategory,
    pub score: f64,
    pub confidence: f64,
    pub categories: Vec<String>,
    pub latency_ms: u64,
    pub used_fallback: bool,
    pub error: Option<String>,
    /// Circuit state observed when the call was admitted.
    pub circuit_state: CircuitState,
}

impl DetectorResult {
    /// Zero-contribution entry standing in for a failed call.
    pub fn fallback(
        detector_name: &str,
        category: DetectorCategory,
        latency_ms: u64,
        circuit_state: CircuitState,
        error: &ModerationError,
    ) -> Self {
        Self {
            detector_name: detector_name.to_string(),
            category,
            score: 0.0,
            confidence: 0.0,
            categories: Vec::new(),
            latency_ms,
            used_fallback: true,
            error: Some(error.to_string()),
            circuit_state,
        }
    }
}

// ============================================================================
// VERDICT
// ============================================================================

/// Discretized bucket derived from the overall risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Side effect that a verdict can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    BlockContent,
    EscalateReview,
    QueueReview,
    NotifyModerators,
    IssuePunishment,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::BlockContent => "block_content",
            ActionType::EscalateReview => "escalate_review",
            ActionType::QueueReview => "queue_review",
            ActionType::NotifyModerators => "notify_moderators",
            ActionType::IssuePunishment => "issue_punishment",
        };
        f.write_str(s)
    }
}

/// Tracking record of a dispatched action.
///
/// `executed` is always false in a returned result: execution happens on
/// the action queue after the decision has been handed back. The ledger
/// is the source of truth for execution status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub request_id: String,
    pub action_type: ActionType,
    pub dispatched_at: DateTime<Utc>,
    pub executed: bool,
    pub idempotency_key: String,
}

impl ActionRecord {
    pub fn idempotency_key_for(request_id: &str, action_type: ActionType) -> String {
        format!("{}:{}", request_id, action_type)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    pub total_ms: u64,
    pub detection_ms: u64,
}

/// The engine's answer for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationResult {
    pub request_id: String,
    pub overall_risk: f64,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub per_detector: Vec<DetectorResult>,
    pub actions: Vec<ActionRecord>,
    pub degraded: bool,
    /// Served from the result cache (or a concurrent identical computation).
    pub cached: bool,
    /// Served from an expired cache entry because every detector was down.
    pub stale: bool,
    pub timings: Timings,
}

impl ModerationResult {
    /// True when detectors were invoked and every single one fell back.
    pub fn all_detectors_failed(&self) -> bool {
        !self.per_detector.is_empty() && self.per_detector.iter().all(|d| d.used_fallback)
    }

    /// Re-issue a memoized decision for a different request id.
    pub fn reissue(&self, request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            cached: true,
            ..self.clone()
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_ms: u64,
    /// The limiter backend was unreachable and the request was let through.
    pub degraded: bool,
}
