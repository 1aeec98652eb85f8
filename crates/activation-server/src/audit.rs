//! Append-only audit trail of activation attempts.
//!
//! Recording an event never fails the caller: sinks swallow their own
//! errors. Events carry a redacted subject id, never the raw token.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Kinds of audit events emitted by the activation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ActivationAttempted,
    ActivationFailed,
    ActivationSucceeded,
    RateLimitExceeded,
    ActivationRolledBack,
    ActivationRollbackFailed,
    CredentialIssuanceDegraded,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ActivationAttempted => "activation_attempted",
            AuditEventType::ActivationFailed => "activation_failed",
            AuditEventType::ActivationSucceeded => "activation_succeeded",
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
            AuditEventType::ActivationRolledBack => "activation_rolled_back",
            AuditEventType::ActivationRollbackFailed => "activation_rollback_failed",
            AuditEventType::CredentialIssuanceDegraded => "credential_issuance_degraded",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,

    /// Redacted registration id, when the attempt resolved to one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    pub metadata: Value,

    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            subject_id: None,
            ip_address: None,
            user_agent: None,
            metadata: Value::Object(Default::default()),
            timestamp,
        }
    }

    /// Attach a registration id, redacted.
    pub fn subject(mut self, registration_id: &str) -> Self {
        self.subject_id = Some(redact_subject(registration_id));
        self
    }

    pub fn client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Stable, non-reversible stand-in for a registration id.
pub fn redact_subject(registration_id: &str) -> String {
    let digest = Sha256::digest(registration_id.as_bytes());
    format!("reg:{}", &hex::encode(digest)[..16])
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes each event as a JSON line on the `audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "audit", event_type = %event.event_type, "{}", json),
            Err(e) => warn!(target: "audit", event_type = %event.event_type, error = %e, "Failed to serialize audit event"),
        }
    }
}

/// Keeps events in memory, for tests and inspection.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn event_types(&self) -> Vec<AuditEventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }

    pub fn count(&self, event_type: AuditEventType) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Handle used by the activation pipeline to emit audit events.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Audit log backed by structured logging.
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }

    pub fn record(&self, event: AuditEvent) {
        self.sink.record(&event);
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::tracing()
    }
}
