// SQLite-backed audit trail and action ledger.
//
// Tables:
// - audit_events: Append-only decision / rate-limit / action events (JSON payload)
// - action_ledger: One row per idempotency key with its execution status

use crate::core::moderation::{ActionLedger, ActionStatus, ActionType, AuditEvent, AuditSink};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};

pub struct SqliteAuditStore {
    pool: Pool<Sqlite>,
}

impl SqliteAuditStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event TEXT NOT NULL,
                subject_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_events_subject
                ON audit_events(subject_key);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS action_ledger (
                idempotency_key TEXT PRIMARY KEY,
                action_type TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                claimed_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent audit events, newest first.
    #[allow(dead_code)]
    pub async fn recent_events(&self, limit: i64) -> anyhow::Result<Vec<AuditEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT payload
            FROM audit_events
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            events.push(serde_json::from_str(&payload)?);
        }
        Ok(events)
    }

    async fn set_outcome(
        &self,
        key: &str,
        status: ActionStatus,
        attempts: u32,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE action_ledger
            SET status = ?, attempts = ?, last_error = ?, updated_at = ?
            WHERE idempotency_key = ?
            "#,
        )
        .bind(status.as_str())
        .bind(attempts as i64)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("unknown idempotency key {}", key);
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for SqliteAuditStore {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        sqlx::query(
            r#"
            INSERT INTO audit_events (event, subject_key, payload, recorded_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(event.kind())
        .bind(event.subject_key())
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ActionLedger for SqliteAuditStore {
    async fn claim(&self, key: &str, action_type: ActionType) -> anyhow::Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO action_ledger (idempotency_key, action_type, status, attempts, claimed_at, updated_at)
            VALUES (?, ?, ?, 0, ?, ?)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(action_type.to_string())
        .bind(ActionStatus::Claimed.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_executed(&self, key: &str, attempts: u32) -> anyhow::Result<()> {
        self.set_outcome(key, ActionStatus::Executed, attempts, None)
            .await
    }

    async fn mark_failed(&self, key: &str, attempts: u32, error: &str) -> anyhow::Result<()> {
        self.set_outcome(key, ActionStatus::Failed, attempts, Some(error))
            .await
    }

    async fn status(&self, key: &str) -> anyhow::Result<Option<ActionStatus>> {
        let row = sqlx::query("SELECT status FROM action_ledger WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                let parsed = ActionStatus::parse(&status)
                    .ok_or_else(|| anyhow::anyhow!("unknown ledger status {}", status))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteAuditStore {
        // One connection: every new connection to :memory: is a fresh database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteAuditStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = store().await;
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let store = store().await;

        assert!(store.claim("r1:queue_review", ActionType::QueueReview).await.unwrap());
        assert!(!store.claim("r1:queue_review", ActionType::QueueReview).await.unwrap());
        assert!(store.claim("r2:queue_review", ActionType::QueueReview).await.unwrap());
        assert_eq!(
            store.status("r1:queue_review").await.unwrap(),
            Some(ActionStatus::Claimed)
        );
    }

    #[tokio::test]
    async fn test_outcomes_are_recorded() {
        let store = store().await;
        store.claim("r1:block_content", ActionType::BlockContent).await.unwrap();
        store.claim("r1:notify_moderators", ActionType::NotifyModerators).await.unwrap();

        store.mark_executed("r1:block_content", 2).await.unwrap();
        store
            .mark_failed("r1:notify_moderators", 4, "webhook returned 500")
            .await
            .unwrap();

        assert_eq!(
            store.status("r1:block_content").await.unwrap(),
            Some(ActionStatus::Executed)
        );
        assert_eq!(
            store.status("r1:notify_moderators").await.unwrap(),
            Some(ActionStatus::Failed)
        );
        assert_eq!(store.status("missing").await.unwrap(), None);
        assert!(store.mark_executed("missing", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_audit_events_round_trip_newest_first() {
        let store = store().await;
        for (i, action) in [ActionType::BlockContent, ActionType::QueueReview]
            .into_iter()
            .enumerate()
        {
            store
                .record(&AuditEvent::ActionFailed {
                    idempotency_key: format!("r{}:{}", i, action),
                    action_type: action,
                    attempts: 4,
                    error: "boom".to_string(),
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let events = store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].subject_key(), "r1:queue_review");
        assert_eq!(events[1].kind(), "action_failed");
    }
}
