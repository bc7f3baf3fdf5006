//! Indexing orchestration for sessions.
//!
//! Per workspace the service moves `Idle -> Running -> Idle`: it enters
//! `Running` only by acquiring the workspace lock and always leaves it once
//! the indexer returns, whatever the outcome. Failed phases are never
//! retried; a retry is a new request.

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::config::IndexerConfig;
use crate::indexer::lock::WorkspaceLocks;
use crate::indexer::tool::{PhaseTimeouts, WorkspaceIndexer};
use crate::indexer::types::{
    FailureReason, IndexPhase, IndexResult, IndexStatus, IndexStatusReport,
};
use crate::isolation::{
    DenyReason, IndexingState, IsolationDecision, SessionIsolationGuard, SessionStore,
};
use crate::process::{OutcomeKind, SubprocessOutcome, SubprocessRunner};
use crate::sandbox::{PathError, PathValidator, ResolvedPath, WorkspaceRoot};
use crate::{Error, Result};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Characters of tool output kept in audit metadata.
const AUDIT_SUMMARY_CHARS: usize = 500;

/// Parameters of one index request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRequest {
    /// Re-initialise and rebuild from scratch.
    pub force: bool,
    /// Index-phase deadline; the configured default when `None`.
    pub timeout: Option<Duration>,
}

impl Default for IndexRequest {
    fn default() -> Self {
        Self {
            force: true,
            timeout: None,
        }
    }
}

impl IndexRequest {
    pub fn with_timeout_secs(mut self, seconds: u64) -> Self {
        self.timeout = Some(Duration::from_secs(seconds));
        self
    }
}

pub struct IndexingService {
    config: Arc<IndexerConfig>,
    guard: SessionIsolationGuard,
    sessions: Arc<dyn SessionStore>,
    indexer: WorkspaceIndexer,
    locks: WorkspaceLocks,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for IndexingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingService")
            .field("workspace_root", &self.config.workspace_root)
            .field("tool", &self.indexer.tool().program)
            .finish_non_exhaustive()
    }
}

impl IndexingService {
    /// Build a service with its own lock table. Fails if the configuration
    /// is invalid or the sandbox root doesn't exist.
    pub fn new(
        config: IndexerConfig,
        sessions: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;
        let root = WorkspaceRoot::new(&config.workspace_root)?;
        let runner = SubprocessRunner::new(config.max_output_bytes)
            .with_scrubbed_env(config.scrubbed_env.clone());

        let sandbox = PathValidator::new(root).with_hidden_paths(config.allow_hidden_paths);

        Ok(Self {
            guard: SessionIsolationGuard::new(sessions.clone())
                .within(sandbox)
                .with_hidden_paths(config.allow_hidden_paths),
            sessions,
            indexer: WorkspaceIndexer::new(runner, config.tool.clone()),
            locks: WorkspaceLocks::new(),
            audit,
            config: Arc::new(config),
        })
    }

    /// Share an existing lock table, e.g. between services over one sandbox.
    pub fn with_locks(mut self, locks: WorkspaceLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &WorkspaceLocks {
        &self.locks
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Isolation decision for any other workspace-touching operation. The
    /// session's workspace must itself be a real directory in the sandbox.
    pub async fn check_path(&self, session_id: &str, path: &str) -> IsolationDecision {
        self.guard.check(session_id, path).await
    }

    /// Whether the session's workspace carries the tool's marker directory.
    pub async fn status_of(&self, session_id: &str) -> Result<IndexStatus> {
        let workspace = self.guard.check(session_id, ".").await.into_result()?;
        Ok(self.indexer.status_of(workspace.as_path()))
    }

    /// Status with a human-readable message; a vanished workspace is a
    /// status rather than an error.
    pub async fn status(&self, session_id: &str) -> Result<IndexStatusReport> {
        match self.status_of(session_id).await {
            Ok(status) => Ok(IndexStatusReport::from_status(session_id, status)),
            Err(Error::Denied(DenyReason::Path(PathError::WorkspaceNotFound { .. }))) => {
                Ok(IndexStatusReport::workspace_not_found(session_id))
            }
            Err(error) => Err(error),
        }
    }

    /// Initialise and index a session's workspace.
    ///
    /// Returns `Err` when the request is refused before any process runs
    /// (denied, busy, bad timeout). Tool failures come back as a failed
    /// [`IndexResult`].
    pub async fn index_workspace(&self, session_id: &str, request: IndexRequest) -> Result<IndexResult> {
        let (workspace, index_timeout) = match self.prepare(session_id, request).await {
            Ok(prepared) => prepared,
            Err(error) => {
                self.reject(session_id, &error).await;
                return Err(error);
            }
        };

        let operation_id = Uuid::new_v4();
        let lock = match self.locks.try_acquire(workspace.as_path(), operation_id) {
            Ok(lock) => lock,
            Err(busy) => {
                let error = Error::from(busy);
                self.reject(session_id, &error).await;
                return Err(error);
            }
        };

        tracing::info!(
            session_id,
            %operation_id,
            workspace = %workspace.as_path().display(),
            force = request.force,
            index_timeout_secs = index_timeout.as_secs_f64(),
            "indexing started"
        );
        self.update_session(session_id, IndexingState::Running).await;
        self.record(
            AuditEvent::new(session_id, AuditAction::IndexStart).with_metadata(serde_json::json!({
                "operation_id": operation_id,
                "workspace_path": workspace.as_path(),
                "force": request.force,
                "index_timeout_secs": index_timeout.as_secs(),
            })),
        )
        .await;

        let timeouts = PhaseTimeouts {
            init: self.config.init_timeout,
            index: index_timeout,
        };
        let result = self
            .indexer
            .index_workspace(&workspace, request.force, timeouts)
            .await;

        // Terminal state is recorded before the lock is released.
        let final_state = match &result {
            Ok(result) if result.is_completed() => IndexingState::Completed { at: Utc::now() },
            Ok(result) => IndexingState::Failed {
                at: Utc::now(),
                code: failure_code(result).to_string(),
            },
            Err(error) => IndexingState::Failed {
                at: Utc::now(),
                code: error.code().to_string(),
            },
        };
        self.update_session(session_id, final_state).await;
        self.locks.release(lock);

        let result = result?;
        self.report(session_id, &workspace, timeouts, &result).await;
        Ok(result)
    }

    /// Everything that must pass before the lock is taken. Touches nothing
    /// but the session lookup and path resolution. The returned workspace is
    /// canonical and doubles as the lock key.
    async fn prepare(&self, session_id: &str, request: IndexRequest) -> Result<(ResolvedPath, Duration)> {
        let index_timeout = self.config.index_timeout_for(request.timeout)?;
        let workspace = self.guard.check(session_id, ".").await.into_result()?;
        Ok((workspace, index_timeout))
    }

    async fn report(
        &self,
        session_id: &str,
        workspace: &ResolvedPath,
        timeouts: PhaseTimeouts,
        result: &IndexResult,
    ) {
        self.record_phase(session_id, workspace, IndexPhase::Init, timeouts.init, &result.init)
            .await;
        if let Some(index) = &result.index {
            self.record_phase(session_id, workspace, IndexPhase::Index, timeouts.index, index)
                .await;
        }

        let last = result.last_outcome();
        match result.failure_reason {
            None if result.is_completed() => {
                tracing::info!(
                    session_id,
                    elapsed_secs = result.elapsed.as_secs_f64(),
                    "indexing completed"
                );
                self.record(
                    AuditEvent::new(session_id, AuditAction::IndexComplete)
                        .with_outcome(last.kind)
                        .with_duration(result.elapsed)
                        .with_metadata(serde_json::json!({
                            "stdout_summary": summarize(&last.stdout),
                        })),
                )
                .await;
            }
            _ => {
                let code = failure_code(result);
                tracing::warn!(
                    session_id,
                    code,
                    failed_phase = ?result.failed_phase,
                    elapsed_secs = result.elapsed.as_secs_f64(),
                    "indexing failed"
                );
                self.record(
                    AuditEvent::new(session_id, AuditAction::IndexFailed)
                        .failed(code, summarize(&last.stderr))
                        .with_outcome(last.kind)
                        .with_duration(result.elapsed)
                        .with_metadata(serde_json::json!({
                            "failed_phase": result.failed_phase,
                            "stdout_summary": summarize(&last.stdout),
                        })),
                )
                .await;
            }
        }
    }

    async fn record_phase(
        &self,
        session_id: &str,
        workspace: &ResolvedPath,
        phase: IndexPhase,
        timeout: Duration,
        outcome: &SubprocessOutcome,
    ) {
        if outcome.is_success() && !outcome.spawned {
            return;
        }

        let event = match outcome.kind {
            OutcomeKind::Success => AuditEvent::new(session_id, AuditAction::SubprocessComplete)
                .with_metadata(serde_json::json!({
                    "phase": phase,
                    "command": outcome.command_line(),
                    "exit_code": outcome.exit_code,
                    "stdout_summary": summarize(&outcome.stdout),
                })),
            OutcomeKind::TimedOut => AuditEvent::new(session_id, AuditAction::SubprocessTimeout)
                .failed(
                    "INDEXING_TIMEOUT",
                    format!("Subprocess timed out after {}s", timeout.as_secs_f64()),
                )
                .with_metadata(serde_json::json!({
                    "phase": phase,
                    "command": outcome.command_line(),
                    "timeout_seconds": timeout.as_secs_f64(),
                    "workspace_path": workspace.as_path(),
                })),
            kind => {
                let code = FailureReason::from_outcome(kind)
                    .map_or("INDEXING_FAILED", |reason| reason.code());
                AuditEvent::new(session_id, AuditAction::SubprocessError)
                    .failed(code, summarize(&outcome.stderr))
                    .with_metadata(serde_json::json!({
                        "phase": phase,
                        "command": outcome.command_line(),
                        "exit_code": outcome.exit_code,
                        "spawned": outcome.spawned,
                    }))
            }
        };

        self.record(event.with_outcome(outcome.kind).with_duration(outcome.elapsed))
            .await;
    }

    async fn reject(&self, session_id: &str, error: &Error) {
        tracing::warn!(session_id, code = error.code(), %error, "index request rejected");
        self.record(
            AuditEvent::new(session_id, AuditAction::FailedRequest)
                .failed(error.code(), error.to_string())
                .with_metadata(serde_json::json!({ "requested_action": "index" })),
        )
        .await;
    }

    async fn record(&self, event: AuditEvent) {
        let action = event.action;
        if let Err(error) = self.audit.record(event).await {
            tracing::warn!(?action, %error, "failed to write audit event");
        }
    }

    async fn update_session(&self, session_id: &str, state: IndexingState) {
        if let Err(error) = self.sessions.record_indexing(session_id, state).await {
            tracing::warn!(session_id, %error, "failed to update session indexing state");
        }
    }
}

fn failure_code(result: &IndexResult) -> &'static str {
    result
        .failure_reason
        .map_or("INDEXING_FAILED", |reason| reason.code())
}

fn summarize(text: &str) -> String {
    text.trim().chars().take(AUDIT_SUMMARY_CHARS).collect()
}
