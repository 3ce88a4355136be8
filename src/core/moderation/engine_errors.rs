// Error taxonomy for the decision engine.
//
// Only `RateLimitExceeded` and `InvalidRequest` ever reach a caller of
// `ModerationEngine::moderate`. Everything else is absorbed where it happens
// and surfaces as a fallback detector entry, a degraded flag, or an audit
// record.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModerationError {
    #[error("detector {detector} timed out after {timeout_ms}ms")]
    DetectorTimeout { detector: String, timeout_ms: u64 },

    #[error("detector {detector} failed: {message}")]
    DetectorError { detector: String, message: String },

    #[error("circuit open for detector {0}")]
    CircuitOpen(String),

    // Raised by networked cache and limiter stores.
    #[allow(dead_code)]
    #[error("result cache unavailable: {0}")]
    CacheUnavailable(String),

    #[allow(dead_code)]
    #[error("rate limiter unavailable: {0}")]
    RateLimiterUnavailable(String),

    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimitExceeded { retry_after_ms: u64 },

    #[error("dispatch of {idempotency_key} failed: {message}")]
    ActionDispatchFailure {
        idempotency_key: String,
        message: String,
    },

    #[error("invalid output from detector {detector}: {message}")]
    AggregationInputInvalid { detector: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ModerationError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ModerationError::DetectorTimeout { .. } => "detector_timeout",
            ModerationError::DetectorError { .. } => "detector_error",
            ModerationError::CircuitOpen(_) => "circuit_open",
            ModerationError::CacheUnavailable(_) => "cache_unavailable",
            ModerationError::RateLimiterUnavailable(_) => "rate_limiter_unavailable",
            ModerationError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ModerationError::ActionDispatchFailure { .. } => "action_dispatch_failure",
            ModerationError::AggregationInputInvalid { .. } => "aggregation_input_invalid",
            ModerationError::InvalidRequest(_) => "invalid_request",
            ModerationError::InvalidConfig(_) => "invalid_config",
        }
    }

    /// Structured denial handed back to callers.
    pub fn denial(&self) -> Denial {
        let retry_after_ms = match self {
            ModerationError::RateLimitExceeded { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        Denial {
            code: self.code(),
            message: self.to_string(),
            retry_after_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Denial {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_denial_carries_retry_hint() {
        let denial = ModerationError::RateLimitExceeded {
            retry_after_ms: 1500,
        }
        .denial();
        assert_eq!(denial.code, "rate_limit_exceeded");
        assert_eq!(denial.retry_after_ms, Some(1500));

        let json = serde_json::to_value(&denial).unwrap();
        assert_eq!(json["retry_after_ms"], 1500);
    }

    #[test]
    fn test_invalid_request_denial_omits_retry_hint() {
        let denial = ModerationError::InvalidRequest("empty id".to_string()).denial();
        let json = serde_json::to_value(&denial).unwrap();
        assert!(json.get("retry_after_ms").is_none());
        assert_eq!(json["code"], "invalid_request");
    }
}
