// This is the entry point of the moderation engine.
//
// **Architecture Overview:**
// - `core/` = Decision engine and the ports it consumes (transport-agnostic)
// - `infra/` = Implementations of core traits (in-memory stores, SQLite, HTTP)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Feed newline-delimited JSON requests from stdin through the engine
// 4. Write one JSON line per request to stdout

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;

use crate::core::moderation::{
    ActionExecutor, ActionLedger, AuditSink, ConfigPatch, Detector, EngineComponents,
    EngineConfig, ModerationEngine, ModerationError, ModerationRequest,
};
use crate::infra::moderation::{
    HttpDetector, InMemoryActionLedger, InMemoryAuditSink, InMemoryCacheStore,
    InMemoryRateLimitStore, SqliteAuditStore, TracingActionExecutor, WebhookActionExecutor,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

const DEFAULT_AUDIT_DB: &str = "data/moderation_audit.db";
const IN_MEMORY_AUDIT: &str = "memory";
/// Requests scored at once; reading stdin pauses while this many are running.
const MAX_IN_FLIGHT_REQUESTS: usize = 256;

/// One line of input: a request, or `{"config_patch": {...}}` for a live
/// configuration change.
enum InputLine {
    ConfigUpdate(ConfigPatch),
    Request(Box<ModerationRequest>),
}

fn parse_line(line: &str) -> Result<InputLine, serde_json::Error> {
    let mut value: serde_json::Value = serde_json::from_str(line)?;
    if let Some(patch) = value.get_mut("config_patch") {
        let patch = ConfigPatch::deserialize(patch.take())?;
        return Ok(InputLine::ConfigUpdate(patch));
    }
    let request = ModerationRequest::deserialize(value)?;
    Ok(InputLine::Request(Box::new(request)))
}

fn to_line(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        format!(r#"{{"error":{{"code":"serialization","message":"{}"}}}}"#, e)
    })
}

async fn handle_request(engine: &ModerationEngine, request: ModerationRequest) -> String {
    let request_id = request.id.clone();
    match engine.moderate(request).await {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(value) => to_line(&value),
            Err(e) => to_line(&json!({
                "request_id": request_id,
                "error": { "code": "serialization", "message": e.to_string() },
            })),
        },
        Err(e) => to_line(&json!({
            "request_id": request_id,
            "error": e.denial(),
        })),
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Request task failed");
    }
}

/// Feed every input line through the engine and send one output line per
/// input line. At most `max_in_flight` requests run at once. Returns once the
/// input is exhausted and every request has answered.
async fn drive<R>(
    engine: Arc<ModerationEngine>,
    input: R,
    out_tx: mpsc::Sender<String>,
    max_in_flight: usize,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut in_flight = JoinSet::new();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        while let Some(joined) = in_flight.try_join_next() {
            log_join(joined);
        }

        match parse_line(line) {
            Ok(InputLine::Request(request)) => {
                while in_flight.len() >= max_in_flight.max(1) {
                    if let Some(joined) = in_flight.join_next().await {
                        log_join(joined);
                    }
                }
                let engine = Arc::clone(&engine);
                let out_tx = out_tx.clone();
                in_flight.spawn(async move {
                    let output = handle_request(&engine, *request).await;
                    let _ = out_tx.send(output).await;
                });
            }
            Ok(InputLine::ConfigUpdate(config_patch)) => {
                let output = match engine.update_config(&config_patch) {
                    Ok(_) => to_line(&json!({ "config_updated": true })),
                    Err(e) => to_line(&json!({ "error": e.denial() })),
                };
                let _ = out_tx.send(output).await;
            }
            Err(e) => {
                let denial = ModerationError::InvalidRequest(format!("malformed input: {}", e)).denial();
                let _ = out_tx.send(to_line(&json!({ "error": denial }))).await;
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // Logs go to stderr; stdout carries results only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::load()?;

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // This is the "composition root" where we wire everything together.

    // MODERATION_AUDIT_DB=memory keeps the ledger and audit trail in process.
    let audit_db_path =
        std::env::var("MODERATION_AUDIT_DB").unwrap_or_else(|_| DEFAULT_AUDIT_DB.to_string());
    let (ledger, audit_sink): (Arc<dyn ActionLedger>, Arc<dyn AuditSink>) =
        if audit_db_path == IN_MEMORY_AUDIT {
            tracing::warn!("Action ledger and audit trail are in memory and lost on exit");
            (
                Arc::new(InMemoryActionLedger::new()),
                Arc::new(InMemoryAuditSink::new()),
            )
        } else {
            if let Some(parent) = std::path::Path::new(&audit_db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let audit_pool = sqlx::sqlite::SqlitePoolOptions::new()
                .connect(&format!("sqlite://{}?mode=rwc", audit_db_path))
                .await?;
            let audit_store = Arc::new(SqliteAuditStore::new(audit_pool));
            audit_store.migrate().await?;
            tracing::info!(path = %audit_db_path, "Audit store ready");
            (audit_store.clone(), audit_store)
        };

    let detectors: Vec<Arc<dyn Detector>> = HttpDetector::from_env()
        .into_iter()
        .map(|d| Arc::new(d) as Arc<dyn Detector>)
        .collect();
    tracing::info!(count = detectors.len(), "Detectors configured");

    let executor: Arc<dyn ActionExecutor> = match std::env::var("MODERATION_ACTION_WEBHOOK_URL") {
        Ok(url) if !url.trim().is_empty() => {
            tracing::info!("Dispatching actions to webhook");
            Arc::new(WebhookActionExecutor::new(url))
        }
        _ => {
            tracing::info!("No action webhook configured, actions are only logged");
            Arc::new(TracingActionExecutor)
        }
    };

    let snapshot_every = Duration::from_secs(config.health_snapshot_interval_secs.max(1));

    let engine = Arc::new(ModerationEngine::new(
        config,
        EngineComponents {
            detectors,
            rate_limit_store: Box::new(InMemoryRateLimitStore::new()),
            cache_store: Box::new(InMemoryCacheStore::new()),
            executor,
            ledger,
            audit_sink,
        },
    )?);

    // Periodic health snapshot for external monitoring.
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(snapshot_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match serde_json::to_string(&engine.health_snapshot()) {
                    Ok(snapshot) => tracing::info!(snapshot = %snapshot, "Health snapshot"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize health snapshot"),
                }
            }
        });
    }

    // Single writer so concurrent results never interleave mid-line.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if let Err(e) = stdout.write_all(format!("{}\n", line).as_bytes()).await {
                tracing::error!(error = %e, "Failed to write result");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    tracing::info!("Moderation engine ready, reading requests from stdin");

    drive(
        engine,
        BufReader::new(tokio::io::stdin()),
        out_tx,
        MAX_IN_FLIGHT_REQUESTS,
    )
    .await?;
    let _ = writer.await;

    tracing::info!("Input closed, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::detector_adapter::tests::{sample_request, StubDetector};
    use crate::core::moderation::DetectorCategory;

    fn engine() -> Arc<ModerationEngine> {
        let detector = StubDetector::scoring(DetectorCategory::Toxicity, 0.2, 0.9)
            .with_delay(Duration::from_millis(10));
        let engine = ModerationEngine::new(
            EngineConfig::default(),
            EngineComponents {
                detectors: vec![Arc::new(detector)],
                rate_limit_store: Box::new(InMemoryRateLimitStore::new()),
                cache_store: Box::new(InMemoryCacheStore::new()),
                executor: Arc::new(TracingActionExecutor),
                ledger: Arc::new(InMemoryActionLedger::new()),
                audit_sink: Arc::new(InMemoryAuditSink::new()),
            },
        )
        .unwrap();
        Arc::new(engine)
    }

    fn request_line(id: &str) -> String {
        let mut request = sample_request(id);
        request.content = format!("message number {id}");
        serde_json::to_string(&request).unwrap()
    }

    async fn run(input: &str, max_in_flight: usize) -> Vec<serde_json::Value> {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        drive(engine(), input.as_bytes(), tx, max_in_flight)
            .await
            .unwrap();

        let mut outputs = Vec::new();
        while let Some(line) = rx.recv().await {
            outputs.push(serde_json::from_str(&line).unwrap());
        }
        outputs
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_of_one_runs_requests_one_at_a_time() {
        let input = [
            request_line("r1"),
            "{not json".to_string(),
            String::new(),
            r#"{"config_patch": {"cache_ttl_ms": 1000}}"#.to_string(),
            request_line("r2"),
            request_line("r3"),
        ]
        .join("
");

        let outputs = run(&input, 1).await;

        // Non-request lines answer right away; requests finish in input order.
        assert_eq!(outputs.len(), 5);
        assert_eq!(outputs[0]["error"]["code"], "invalid_request");
        assert_eq!(outputs[1]["config_updated"], true);
        assert_eq!(outputs[2]["request_id"], "r1");
        assert_eq!(outputs[3]["request_id"], "r2");
        assert_eq!(outputs[4]["request_id"], "r3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_request_answers_under_a_small_cap() {
        let input = (0..40)
            .map(|i| request_line(&format!("r{i}")))
            .collect::<Vec<_>>()
            .join("\n");

        let outputs = run(&input, 3).await;

        assert_eq!(outputs.len(), 40);
        let mut ids: Vec<String> = outputs
            .iter()
            .map(|o| o["request_id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 40);
    }
}
