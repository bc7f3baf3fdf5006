//! Types for indexing phases, results and status.

use crate::process::{OutcomeKind, SubprocessOutcome, serialize_secs};

use serde::Serialize;
use std::time::Duration;

/// One step of the two-phase tool invocation. `Init` always precedes `Index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPhase {
    Init,
    Index,
}

impl IndexPhase {
    /// The tool subcommand for this phase.
    pub fn subcommand(&self) -> &'static str {
        match self {
            IndexPhase::Init => "init",
            IndexPhase::Index => "index",
        }
    }
}

impl std::fmt::Display for IndexPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.subcommand())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Indexed,
    NotIndexed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexResultStatus {
    Completed,
    Failed,
}

/// Why a phase failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ToolNotFound,
    LaunchFailed,
    TimedOut,
    NonZeroExit,
}

impl FailureReason {
    /// `None` for a successful outcome.
    pub fn from_outcome(kind: OutcomeKind) -> Option<Self> {
        match kind {
            OutcomeKind::Success => None,
            OutcomeKind::ToolNotFound => Some(FailureReason::ToolNotFound),
            OutcomeKind::LaunchFailed => Some(FailureReason::LaunchFailed),
            OutcomeKind::TimedOut => Some(FailureReason::TimedOut),
            OutcomeKind::NonZeroExit => Some(FailureReason::NonZeroExit),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::ToolNotFound => "TOOL_NOT_FOUND",
            FailureReason::LaunchFailed => "INDEXING_LAUNCH_FAILED",
            FailureReason::TimedOut => "INDEXING_TIMEOUT",
            FailureReason::NonZeroExit => "INDEXING_FAILED",
        }
    }
}

/// Outcome of a full init + index run.
#[derive(Debug, Clone)]
pub struct IndexResult {
    pub status: IndexResultStatus,
    pub init: SubprocessOutcome,
    /// `None` when init failed and the index phase never ran.
    pub index: Option<SubprocessOutcome>,
    pub failed_phase: Option<IndexPhase>,
    pub failure_reason: Option<FailureReason>,
    pub elapsed: Duration,
}

impl IndexResult {
    /// Aggregate phase outcomes. `Completed` only if every phase that ran
    /// succeeded and the index phase ran.
    pub fn from_phases(init: SubprocessOutcome, index: Option<SubprocessOutcome>) -> Self {
        let elapsed = init.elapsed + index.as_ref().map_or(Duration::ZERO, |outcome| outcome.elapsed);

        let failure = match FailureReason::from_outcome(init.kind) {
            Some(reason) => Some((IndexPhase::Init, reason)),
            None => index
                .as_ref()
                .and_then(|outcome| FailureReason::from_outcome(outcome.kind))
                .map(|reason| (IndexPhase::Index, reason)),
        };

        let status = if failure.is_none() && index.is_some() {
            IndexResultStatus::Completed
        } else {
            IndexResultStatus::Failed
        };

        Self {
            status,
            init,
            index,
            failed_phase: failure.map(|(phase, _)| phase),
            failure_reason: failure.map(|(_, reason)| reason),
            elapsed,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == IndexResultStatus::Completed
    }

    /// The outcome of the last phase that ran.
    pub fn last_outcome(&self) -> &SubprocessOutcome {
        self.index.as_ref().unwrap_or(&self.init)
    }

    pub fn summary(&self, session_id: &str) -> IndexResultSummary {
        let last = self.last_outcome();
        IndexResultSummary {
            session_id: session_id.to_string(),
            success: self.is_completed(),
            status: self.status,
            elapsed: self.elapsed,
            stdout: non_empty(&last.stdout),
            stderr: non_empty(&last.stderr),
            failed_phase: self.failed_phase,
            failure_reason: self.failure_reason,
            error_code: self.failure_reason.map(|reason| reason.code()),
        }
    }
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Wire shape of an [`IndexResult`] for the HTTP/persistence layer.
#[derive(Debug, Clone, Serialize)]
pub struct IndexResultSummary {
    pub session_id: String,
    pub success: bool,
    pub status: IndexResultStatus,
    #[serde(rename = "elapsed_seconds", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub failed_phase: Option<IndexPhase>,
    pub failure_reason: Option<FailureReason>,
    pub error_code: Option<&'static str>,
}

/// Index status of a session's workspace, with a human message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStatusReport {
    pub session_id: String,
    pub is_indexed: bool,
    /// `indexed`, `not_initialized` or `workspace_not_found`.
    pub status: &'static str,
    pub message: String,
}

impl IndexStatusReport {
    pub fn from_status(session_id: &str, status: IndexStatus) -> Self {
        match status {
            IndexStatus::Indexed => Self {
                session_id: session_id.to_string(),
                is_indexed: true,
                status: "indexed",
                message: "Workspace index is available.".to_string(),
            },
            IndexStatus::NotIndexed => Self {
                session_id: session_id.to_string(),
                is_indexed: false,
                status: "not_initialized",
                message: "Workspace has not been indexed yet.".to_string(),
            },
        }
    }

    pub fn workspace_not_found(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            is_indexed: false,
            status: "workspace_not_found",
            message: format!("Workspace directory does not exist for session '{session_id}'."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(kind: OutcomeKind, elapsed_ms: u64) -> SubprocessOutcome {
        SubprocessOutcome {
            command: vec!["tool".into()],
            kind,
            exit_code: Some(if kind == OutcomeKind::Success { 0 } else { 1 }),
            stdout: "out".into(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed: Duration::from_millis(elapsed_ms),
            spawned: true,
        }
    }

    #[test]
    fn completed_only_when_both_phases_succeed() {
        let result = IndexResult::from_phases(
            outcome(OutcomeKind::Success, 100),
            Some(outcome(OutcomeKind::Success, 250)),
        );
        assert!(result.is_completed());
        assert_eq!(result.failure_reason, None);
        assert_eq!(result.elapsed, Duration::from_millis(350));
    }

    #[test]
    fn init_failure_short_circuits() {
        let result = IndexResult::from_phases(outcome(OutcomeKind::NonZeroExit, 100), None);
        assert_eq!(result.status, IndexResultStatus::Failed);
        assert_eq!(result.failed_phase, Some(IndexPhase::Init));
        assert_eq!(result.failure_reason, Some(FailureReason::NonZeroExit));
        assert_eq!(result.last_outcome().kind, OutcomeKind::NonZeroExit);
    }

    #[test]
    fn index_failure_is_attributed_to_index_phase() {
        let result = IndexResult::from_phases(
            outcome(OutcomeKind::Success, 10),
            Some(outcome(OutcomeKind::TimedOut, 60_000)),
        );
        assert_eq!(result.failed_phase, Some(IndexPhase::Index));
        assert_eq!(result.failure_reason, Some(FailureReason::TimedOut));

        let summary = result.summary("w2");
        assert!(!summary.success);
        assert_eq!(summary.error_code, Some("INDEXING_TIMEOUT"));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failure_reason"], "timed_out");
        assert_eq!(json["elapsed_seconds"], 60.01);
        assert!(json["stderr"].is_null());
    }

    #[test]
    fn successful_init_without_index_is_not_completed() {
        let result = IndexResult::from_phases(outcome(OutcomeKind::Success, 10), None);
        assert_eq!(result.status, IndexResultStatus::Failed);
        assert_eq!(result.failure_reason, None);
    }

    #[test]
    fn status_report_messages() {
        let report = IndexStatusReport::from_status("s1", IndexStatus::NotIndexed);
        assert!(!report.is_indexed);
        assert_eq!(report.status, "not_initialized");
        assert_eq!(IndexStatusReport::workspace_not_found("s1").status, "workspace_not_found");
    }
}
