//! Audit events for indexing operations.
//!
//! The core produces events; storing them is the job of an [`AuditSink`].
//! Sink failures are logged by the caller and never fail the operation.

use crate::process::OutcomeKind;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    IndexStart,
    IndexComplete,
    IndexFailed,
    SubprocessComplete,
    SubprocessError,
    SubprocessTimeout,
    FailedRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failed,
}

/// One append-only audit row.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub session_id: String,
    pub operation: &'static str,
    pub action: AuditAction,
    pub status: AuditStatus,
    /// Classification of the subprocess run this event reports on.
    pub outcome: Option<OutcomeKind>,
    pub duration_ms: Option<u64>,
    pub elapsed_seconds: Option<f64>,
    /// Machine-readable code for failures.
    pub code: Option<&'static str>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(session_id: impl Into<String>, action: AuditAction) -> Self {
        Self {
            session_id: session_id.into(),
            operation: "index",
            action,
            status: AuditStatus::Success,
            outcome: None,
            duration_ms: None,
            elapsed_seconds: None,
            code: None,
            error: None,
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(mut self, code: &'static str, error: impl Into<String>) -> Self {
        self.status = AuditStatus::Failed;
        self.code = Some(code);
        self.error = Some(error.into());
        self
    }

    pub fn with_outcome(mut self, outcome: OutcomeKind) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(elapsed.as_millis() as u64);
        self.elapsed_seconds = Some((elapsed.as_secs_f64() * 1000.0).round() / 1000.0);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Where audit events go.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Emits each event as a structured log line on the `audit` target.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        let metadata = serde_json::to_string(&event.metadata)?;
        tracing::info!(
            target: "audit",
            session_id = %event.session_id,
            operation = event.operation,
            action = ?event.action,
            status = ?event.status,
            outcome = event.outcome.map(|outcome| outcome.as_str()),
            duration_ms = event.duration_ms,
            code = event.code,
            error = event.error.as_deref(),
            metadata = %metadata,
            "audit"
        );
        Ok(())
    }
}

/// Appends events as JSON lines to a file.
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        use anyhow::Context as _;

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("failed to append to audit log {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.events.lock().iter().map(|event| event.action).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
