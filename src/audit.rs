//! Audit-event interface (SPEC_FULL.md §3 ADDED). Full audit logging is out
//! of scope; this crate only needs to *emit* an event for an external audit
//! subsystem to consume on the two paths that require one: env var reveal
//! (I6) and domain verification. `AuditSink` is a one-method trait in the
//! same narrow-swap-point shape as `ObjectStore`/`RegistryProvider`; the
//! shipped implementation is a `tracing::info!` line, matching how the rest
//! of the ambient stack treats collaborators whose real backend is out of
//! scope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub action: String,
    pub actor: Option<String>,
    pub resource_type: String,
    pub resource_id: Uuid,
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, resource_type: impl Into<String>, resource_id: Uuid) -> Self {
        Self {
            action: action.into(),
            actor: None,
            resource_type: resource_type.into(),
            resource_id,
            metadata: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Default sink: emits a structured `tracing::info!` line. A real audit
/// subsystem (persisted, queryable) is out of scope.
#[derive(Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        tracing::info!(
            action = %event.action,
            actor = event.actor.as_deref().unwrap_or("unknown"),
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            metadata = %event.metadata,
            "audit event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracing_sink_accepts_event_without_panicking() {
        let sink = TracingAuditSink;
        let event = AuditEvent::new("env_var.reveal", "env_var", Uuid::new_v4()).with_actor("user-1");
        sink.record(event).await;
    }
}
