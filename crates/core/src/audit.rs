//! Audit event sink.

use serde::Serialize;
use time::OffsetDateTime;

/// What happened to which object. One event per mutating operation.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    /// Name of the acting user; empty for janitor-initiated actions.
    pub user_name: String,
    pub action: AuditAction,
    pub account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Type of the affected object ("blob", "manifest", "tag", "account").
    pub target_type: &'static str,
    /// Digest, tag name, or account name of the affected object.
    pub target_id: String,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

/// Fire-and-forget event sink. Implementations must not block the caller
/// on delivery; dropping events under pressure is acceptable.
pub trait Auditor: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Auditor that writes events to the log.
#[derive(Debug, Default)]
pub struct LogAuditor;

impl Auditor for LogAuditor {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "audit", "{json}"),
            Err(err) => tracing::error!("could not serialize audit event: {err}"),
        }
    }
}

/// Auditor that discards all events.
#[derive(Debug, Default)]
pub struct NullAuditor;

impl Auditor for NullAuditor {
    fn record(&self, _event: AuditEvent) {}
}
