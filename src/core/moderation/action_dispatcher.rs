// Action dispatch - maps a verdict to side effects and runs them off the
// decision path.
//
// `dispatch` plans the actions for a verdict, hands one job per action to the
// work queue and returns the tracking records immediately. The queue worker
// claims each job's idempotency key in the ledger before touching the
// executor, so the same (request, action) pair runs at most once no matter
// how often it is dispatched.

use super::audit_reporter::{AuditEvent, AuditTrail, MetricsReporter};
use super::engine_config::DispatchConfig;
use super::engine_errors::ModerationError;
use super::moderation_models::{
    ActionRecord, ActionType, ContextIds, DetectorResult, ModerationRequest, Priority,
    RequestKind, RiskLevel,
};
use super::risk_aggregator::RiskAssessment;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

// ============================================================================
// ACTION PLAN
// ============================================================================

/// Which actions a verdict calls for.
pub fn plan_actions(level: RiskLevel, confidence: f64, auto_punish_critical: bool) -> Vec<ActionType> {
    match level {
        RiskLevel::Critical => {
            let mut actions = vec![
                ActionType::BlockContent,
                ActionType::EscalateReview,
                ActionType::NotifyModerators,
            ];
            if auto_punish_critical {
                actions.push(ActionType::IssuePunishment);
            }
            actions
        }
        RiskLevel::High if confidence > 0.8 => {
            vec![ActionType::BlockContent, ActionType::QueueReview]
        }
        RiskLevel::High => vec![ActionType::QueueReview],
        RiskLevel::Medium if confidence > 0.7 => vec![ActionType::QueueReview],
        RiskLevel::Medium | RiskLevel::Low | RiskLevel::Safe => Vec::new(),
    }
}

/// What executors get to see about a request. Content is fingerprinted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub request_id: String,
    pub kind: RequestKind,
    pub subject_user_id: String,
    pub content_fingerprint: String,
    pub attachment_count: usize,
    pub context: ContextIds,
    pub priority: Priority,
    pub risk_level: RiskLevel,
    pub overall_risk: f64,
    pub confidence: f64,
    /// Labels reported by detectors that contributed.
    pub flagged_categories: Vec<String>,
    /// Set for escalations to human review.
    #[serde(default)]
    pub escalated: bool,
}

impl ReviewPayload {
    pub fn new(
        request: &ModerationRequest,
        assessment: &RiskAssessment,
        per_detector: &[DetectorResult],
    ) -> Self {
        let mut flagged_categories: Vec<String> = per_detector
            .iter()
            .filter(|d| !d.used_fallback)
            .flat_map(|d| d.categories.iter().cloned())
            .collect();
        flagged_categories.sort();
        flagged_categories.dedup();

        Self {
            request_id: request.id.clone(),
            kind: request.kind,
            subject_user_id: request.subject_user_id.clone(),
            content_fingerprint: request.content_fingerprint(),
            attachment_count: request.attachments.len(),
            context: request.context.clone(),
            priority: request.priority,
            risk_level: assessment.risk_level,
            overall_risk: assessment.overall_risk,
            confidence: assessment.confidence,
            flagged_categories,
            escalated: false,
        }
    }

    /// What a block removes: the platform content id, or the request id
    /// when the caller did not supply one.
    pub fn content_ref(&self) -> &str {
        self.context
            .content_id
            .as_deref()
            .unwrap_or(&self.request_id)
    }
}

// ============================================================================
// PORTS
// ============================================================================

/// Downstream effects. Implementations are called at most once per
/// idempotency key per attempt and may fail freely; the dispatcher retries.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn delete_content(&self, content_id: &str, reason: &str) -> anyhow::Result<()>;

    async fn queue_review(&self, request_id: &str, payload: &ReviewPayload) -> anyhow::Result<()>;

    async fn notify_moderators(&self, payload: &ReviewPayload) -> anyhow::Result<()>;

    async fn issue_punishment(
        &self,
        user_id: &str,
        severity: RiskLevel,
        evidence: &ReviewPayload,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Claimed,
    Executed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Claimed => "claimed",
            ActionStatus::Executed => "executed",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claimed" => Some(ActionStatus::Claimed),
            "executed" => Some(ActionStatus::Executed),
            "failed" => Some(ActionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of which idempotency keys have been taken.
#[async_trait]
pub trait ActionLedger: Send + Sync {
    /// Atomically take `key`. Returns false if it was claimed before.
    async fn claim(&self, key: &str, action_type: ActionType) -> anyhow::Result<bool>;

    async fn mark_executed(&self, key: &str, attempts: u32) -> anyhow::Result<()>;

    async fn mark_failed(&self, key: &str, attempts: u32, error: &str) -> anyhow::Result<()>;

    async fn status(&self, key: &str) -> anyhow::Result<Option<ActionStatus>>;
}

// ============================================================================
// JOBS
// ============================================================================

#[derive(Debug, Clone)]
pub struct ActionJob {
    pub record: ActionRecord,
    pub payload: ReviewPayload,
    pub policy: DispatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Executed { attempts: u32 },
    Failed { attempts: u32 },
    /// The key had been claimed before; nothing ran.
    Duplicate,
    /// The ledger could not be reached; nothing ran.
    Unclaimed,
}

/// Spread applied to each retry delay, as a fraction of the delay.
const BACKOFF_RANDOMIZATION: f64 = 0.25;

/// Delays between attempts: `base`, then doubling, each randomized by
/// +/- 25%. The retry count is capped by the caller, not by elapsed time.
pub fn retry_schedule(base: Duration, max_retries: u32) -> ExponentialBackoff {
    let max_interval = base.saturating_mul(1u32 << max_retries.min(16));
    ExponentialBackoffBuilder::new()
        .with_initial_interval(base)
        .with_multiplier(2.0)
        .with_randomization_factor(BACKOFF_RANDOMIZATION)
        .with_max_interval(max_interval)
        .with_max_elapsed_time(None)
        .build()
}

/// Executes jobs against the executor, with ledger and audit bookkeeping.
pub struct ActionRunner {
    executor: Arc<dyn ActionExecutor>,
    ledger: Arc<dyn ActionLedger>,
    audit: AuditTrail,
    metrics: Arc<MetricsReporter>,
}

impl ActionRunner {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        ledger: Arc<dyn ActionLedger>,
        audit: AuditTrail,
        metrics: Arc<MetricsReporter>,
    ) -> Self {
        Self {
            executor,
            ledger,
            audit,
            metrics,
        }
    }

    async fn execute(&self, job: &ActionJob) -> anyhow::Result<()> {
        let payload = &job.payload;
        match job.record.action_type {
            ActionType::BlockContent => {
                let reason = format!(
                    "{} risk ({:.2})",
                    payload.risk_level, payload.overall_risk
                );
                self.executor
                    .delete_content(payload.content_ref(), &reason)
                    .await
            }
            ActionType::EscalateReview => {
                let escalated = ReviewPayload {
                    escalated: true,
                    ..payload.clone()
                };
                self.executor
                    .queue_review(&job.record.request_id, &escalated)
                    .await
            }
            ActionType::QueueReview => {
                self.executor
                    .queue_review(&job.record.request_id, payload)
                    .await
            }
            ActionType::NotifyModerators => self.executor.notify_moderators(payload).await,
            ActionType::IssuePunishment => {
                self.executor
                    .issue_punishment(&payload.subject_user_id, payload.risk_level, payload)
                    .await
            }
        }
    }

    pub async fn run_job(&self, job: ActionJob) -> JobOutcome {
        let key = job.record.idempotency_key.as_str();
        let action_type = job.record.action_type;

        match self.ledger.claim(key, action_type).await {
            Ok(true) => {}
            Ok(false) => {
                let status = match self.ledger.status(key).await {
                    Ok(Some(status)) => status.as_str(),
                    Ok(None) => "unknown",
                    Err(e) => {
                        tracing::debug!(idempotency_key = key, error = %e, "Ledger status lookup failed");
                        "unknown"
                    }
                };
                tracing::info!(idempotency_key = key, status, "Action already claimed, skipping");
                return JobOutcome::Duplicate;
            }
            Err(e) => {
                // Without a claim there is no at-most-once guarantee; don't run.
                tracing::error!(idempotency_key = key, error = %e, "Action ledger unavailable, dropping action");
                self.metrics.record_action_failed();
                return JobOutcome::Unclaimed;
            }
        }

        let max_attempts = job.policy.max_retries.saturating_add(1);
        let mut schedule = retry_schedule(job.policy.base_backoff(), job.policy.max_retries);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let error = match tokio::time::timeout(job.policy.action_timeout(), self.execute(&job))
                .await
            {
                Ok(Ok(())) => {
                    if let Err(e) = self.ledger.mark_executed(key, attempts).await {
                        tracing::warn!(idempotency_key = key, error = %e, "Failed to mark action executed");
                    }
                    self.metrics.record_action_executed();
                    self.audit.record(AuditEvent::ActionExecuted {
                        idempotency_key: key.to_string(),
                        action_type,
                        attempts,
                        recorded_at: Utc::now(),
                    });
                    tracing::info!(idempotency_key = key, attempts, "Action executed");
                    return JobOutcome::Executed { attempts };
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", job.policy.action_timeout_ms),
            };

            if attempts >= max_attempts {
                let failure = ModerationError::ActionDispatchFailure {
                    idempotency_key: key.to_string(),
                    message: error,
                };
                tracing::error!(idempotency_key = key, attempts, error = %failure, "Action failed, giving up");
                if let Err(e) = self.ledger.mark_failed(key, attempts, &failure.to_string()).await {
                    tracing::warn!(idempotency_key = key, error = %e, "Failed to mark action failed");
                }
                self.metrics.record_action_failed();
                self.audit.record(AuditEvent::ActionFailed {
                    idempotency_key: key.to_string(),
                    action_type,
                    attempts,
                    error: failure.to_string(),
                    recorded_at: Utc::now(),
                });
                return JobOutcome::Failed { attempts };
            }

            let delay = schedule
                .next_backoff()
                .unwrap_or_else(|| job.policy.base_backoff());
            tracing::warn!(
                idempotency_key = key,
                attempt = attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Action attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

pub struct ActionDispatcher {
    tx: mpsc::UnboundedSender<ActionJob>,
}

impl ActionDispatcher {
    /// Start the queue worker. At most `max_concurrent` jobs run at once;
    /// the rest wait in the queue. Must be called inside a tokio runtime.
    pub fn spawn(runner: ActionRunner, max_concurrent: usize) -> Self {
        let runner = Arc::new(runner);
        let limit = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<ActionJob>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                    break;
                };
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    runner.run_job(job).await;
                    drop(permit);
                });
            }
            tracing::debug!("Action queue closed");
        });

        Self { tx }
    }

    /// Enqueue the actions a verdict calls for and return their records.
    /// Never waits on an executor.
    pub fn dispatch(
        &self,
        request: &ModerationRequest,
        assessment: &RiskAssessment,
        per_detector: &[DetectorResult],
        policy: &DispatchConfig,
    ) -> Vec<ActionRecord> {
        let planned = plan_actions(
            assessment.risk_level,
            assessment.confidence,
            policy.auto_punish_critical,
        );
        if planned.is_empty() {
            return Vec::new();
        }

        let payload = ReviewPayload::new(request, assessment, per_detector);
        let dispatched_at = Utc::now();

        planned
            .into_iter()
            .map(|action_type| {
                let record = ActionRecord {
                    request_id: request.id.clone(),
                    action_type,
                    dispatched_at,
                    executed: false,
                    idempotency_key: ActionRecord::idempotency_key_for(&request.id, action_type),
                };
                let job = ActionJob {
                    record: record.clone(),
                    payload: payload.clone(),
                    policy: *policy,
                };
                if self.tx.send(job).is_err() {
                    tracing::error!(
                        idempotency_key = %record.idempotency_key,
                        "Action queue is closed, action not enqueued"
                    );
                }
                record
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
