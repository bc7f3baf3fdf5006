//! Workspace indexing with per-session isolation.
//!
//! Each session owns one workspace directory under a sandbox root. Every
//! path a session touches is resolved and confined to that workspace, the
//! external indexing tool runs under a deadline with its whole process
//! group killed on timeout, and at most one index operation runs per
//! workspace at a time.

pub mod audit;
pub mod config;
pub mod error;
pub mod indexer;
pub mod isolation;
pub mod process;
pub mod sandbox;

pub use error::{Error, Result};

pub use audit::{AuditAction, AuditEvent, AuditSink, JsonlAuditSink, TracingAuditSink};
pub use config::{IndexerConfig, ToolConfig};
pub use indexer::{IndexRequest, IndexResult, IndexStatus, IndexingService};
pub use isolation::{
    DenyReason, IsolationDecision, SandboxSessionStore, SessionIsolationGuard, SessionStore,
};
pub use process::{OutcomeKind, SubprocessOutcome, SubprocessRunner};
pub use sandbox::{PathError, PathValidator, ResolvedPath, WorkspaceRoot};
