// Moderation infra - implementations of the engine's ports.

pub mod http_action_executor;
pub mod http_detector;
pub mod in_memory;
pub mod sqlite_audit_store;

pub use http_action_executor::{TracingActionExecutor, WebhookActionExecutor};
pub use http_detector::HttpDetector;
pub use in_memory::{
    InMemoryActionLedger, InMemoryAuditSink, InMemoryCacheStore, InMemoryRateLimitStore,
};
pub use sqlite_audit_store::SqliteAuditStore;
