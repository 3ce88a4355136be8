use crate::core::moderation::{ActionExecutor, ReviewPayload, RiskLevel};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

/// Posts every action to one webhook as `{"action": ..., ...}`.
pub struct WebhookActionExecutor {
    client: Client,
    url: String,
}

impl WebhookActionExecutor {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    async fn post(&self, body: serde_json::Value) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            anyhow::bail!("action webhook error: {} - {}", status, text);
        }
        Ok(())
    }
}

#[async_trait]
impl ActionExecutor for WebhookActionExecutor {
    async fn delete_content(&self, content_id: &str, reason: &str) -> anyhow::Result<()> {
        self.post(json!({
            "action": "delete_content",
            "content_id": content_id,
            "reason": reason,
        }))
        .await
    }

    async fn queue_review(&self, request_id: &str, payload: &ReviewPayload) -> anyhow::Result<()> {
        self.post(json!({
            "action": "queue_review",
            "request_id": request_id,
            "payload": payload,
        }))
        .await
    }

    async fn notify_moderators(&self, payload: &ReviewPayload) -> anyhow::Result<()> {
        self.post(json!({
            "action": "notify_moderators",
            "payload": payload,
        }))
        .await
    }

    async fn issue_punishment(
        &self,
        user_id: &str,
        severity: RiskLevel,
        evidence: &ReviewPayload,
    ) -> anyhow::Result<()> {
        self.post(json!({
            "action": "issue_punishment",
            "user_id": user_id,
            "severity": severity,
            "evidence": evidence,
        }))
        .await
    }
}

/// Log-only executor, used when no webhook is configured.
pub struct TracingActionExecutor;

#[async_trait]
impl ActionExecutor for TracingActionExecutor {
    async fn delete_content(&self, content_id: &str, reason: &str) -> anyhow::Result<()> {
        tracing::info!(content_id, reason, "Action: delete content");
        Ok(())
    }

    async fn queue_review(&self, request_id: &str, payload: &ReviewPayload) -> anyhow::Result<()> {
        tracing::info!(
            request_id,
            escalated = payload.escalated,
            level = %payload.risk_level,
            fingerprint = %payload.content_fingerprint,
            "Action: queue review"
        );
        Ok(())
    }

    async fn notify_moderators(&self, payload: &ReviewPayload) -> anyhow::Result<()> {
        tracing::info!(
            request_id = %payload.request_id,
            level = %payload.risk_level,
            categories = ?payload.flagged_categories,
            "Action: notify moderators"
        );
        Ok(())
    }

    async fn issue_punishment(
        &self,
        user_id: &str,
        severity: RiskLevel,
        evidence: &ReviewPayload,
    ) -> anyhow::Result<()> {
        tracing::info!(
            user_id,
            severity = %severity,
            request_id = %evidence.request_id,
            "Action: issue punishment"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::moderation_models::{ContextIds, Priority, RequestKind};

    fn payload() -> ReviewPayload {
        ReviewPayload {
            request_id: "r1".to_string(),
            kind: RequestKind::Message,
            subject_user_id: "u1".to_string(),
            content_fingerprint: "00000000deadbeef".to_string(),
            attachment_count: 0,
            context: ContextIds::default(),
            priority: Priority::Normal,
            risk_level: RiskLevel::High,
            overall_risk: 0.7,
            confidence: 0.9,
            flagged_categories: vec!["insult".to_string()],
            escalated: false,
        }
    }

    #[tokio::test]
    async fn test_tracing_executor_always_succeeds() {
        let executor = TracingActionExecutor;
        assert!(executor.delete_content("r1", "high risk").await.is_ok());
        assert!(executor.queue_review("r1", &payload()).await.is_ok());
        assert!(executor.notify_moderators(&payload()).await.is_ok());
        assert!(executor
            .issue_punishment("u1", RiskLevel::Critical, &payload())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_webhook_failure_surfaces_as_error() {
        let executor = WebhookActionExecutor::new("http://127.0.0.1:9/actions".to_string());
        assert!(executor.notify_moderators(&payload()).await.is_err());
    }
}
