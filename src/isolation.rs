//! Session isolation at the request boundary.
//!
//! Every operation that touches a session's workspace goes through
//! [`SessionIsolationGuard::check`] before any filesystem or subprocess work.
//! Decisions are computed per request and never cached, since workspaces and
//! session state can change between calls.

use crate::sandbox::{PathError, PathValidator, ResolvedPath, WorkspaceRoot};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Lifecycle state owned by the session collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Archived,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    /// Absolute workspace directory, fixed at session creation.
    pub workspace_path: PathBuf,
    pub state: SessionState,
}

/// Indexing progress reported back to the session collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IndexingState {
    Running,
    Completed { at: DateTime<Utc> },
    Failed { at: DateTime<Utc>, code: String },
}

/// The external session lifecycle collaborator.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>>;

    async fn record_indexing(&self, session_id: &str, state: IndexingState) -> anyhow::Result<()>;
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DenyReason {
    #[error("session not found")]
    SessionNotFound,

    #[error("session is archived or expired")]
    SessionExpired,

    #[error("session lookup failed: {0}")]
    SessionLookupFailed(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::SessionNotFound => "SESSION_NOT_FOUND",
            DenyReason::SessionExpired => "SESSION_EXPIRED",
            DenyReason::SessionLookupFailed(_) => "SESSION_LOOKUP_FAILED",
            DenyReason::Path(error) => error.code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationDecision {
    /// The requested path, resolved inside the session's workspace.
    Allow(ResolvedPath),
    Deny(DenyReason),
}

impl IsolationDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, IsolationDecision::Allow(_))
    }

    pub fn into_result(self) -> Result<ResolvedPath, DenyReason> {
        match self {
            IsolationDecision::Allow(path) => Ok(path),
            IsolationDecision::Deny(reason) => Err(reason),
        }
    }
}

#[derive(Clone)]
pub struct SessionIsolationGuard {
    sessions: Arc<dyn SessionStore>,
    /// When set, every session workspace must be a real directory inside it.
    sandbox: Option<PathValidator>,
    allow_hidden: bool,
}

impl std::fmt::Debug for SessionIsolationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIsolationGuard")
            .field(
                "sandbox",
                &self.sandbox.as_ref().map(|sandbox| sandbox.root().path()),
            )
            .field("allow_hidden", &self.allow_hidden)
            .finish_non_exhaustive()
    }
}

impl SessionIsolationGuard {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            sessions,
            sandbox: None,
            allow_hidden: false,
        }
    }

    /// Confine session workspaces to `sandbox`. A workspace that resolves
    /// outside it, or is reached through a symlink below it, is denied.
    pub fn within(mut self, sandbox: PathValidator) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_hidden_paths(mut self, allow: bool) -> Self {
        self.allow_hidden = allow;
        self
    }

    /// Decide whether `session_id` may act on `requested_path`.
    ///
    /// Order: session lookup, then the workspace itself against the sandbox,
    /// then path validation against the workspace, then session lifecycle
    /// state.
    pub async fn check(&self, session_id: &str, requested_path: &str) -> IsolationDecision {
        let decision = self.decide(session_id, requested_path).await;
        if let IsolationDecision::Deny(reason) = &decision {
            tracing::warn!(
                session_id,
                requested = requested_path,
                code = reason.code(),
                %reason,
                "request denied"
            );
        }
        decision
    }

    async fn decide(&self, session_id: &str, requested_path: &str) -> IsolationDecision {
        let record = match self.sessions.session(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return IsolationDecision::Deny(DenyReason::SessionNotFound),
            Err(error) => {
                return IsolationDecision::Deny(DenyReason::SessionLookupFailed(format!(
                    "{error:#}"
                )));
            }
        };

        let resolved = match self.workspace_root(&record).and_then(|root| {
            PathValidator::new(root)
                .with_hidden_paths(self.allow_hidden)
                .validate(requested_path)
        }) {
            Ok(resolved) => resolved,
            Err(error) => return IsolationDecision::Deny(error.into()),
        };

        if record.state != SessionState::Active {
            return IsolationDecision::Deny(DenyReason::SessionExpired);
        }

        IsolationDecision::Allow(resolved)
    }

    fn workspace_root(&self, record: &SessionRecord) -> Result<WorkspaceRoot, PathError> {
        match &self.sandbox {
            Some(sandbox) => {
                let workspace = sandbox.validate_working_dir(&record.workspace_path)?;
                WorkspaceRoot::new(workspace.as_path())
            }
            None => WorkspaceRoot::new(&record.workspace_path),
        }
    }
}

/// In-process session table.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    indexing: RwLock<HashMap<String, IndexingState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: SessionRecord) {
        self.sessions
            .write()
            .insert(record.session_id.clone(), record);
    }

    pub fn set_state(&self, session_id: &str, state: SessionState) {
        if let Some(record) = self.sessions.write().get_mut(session_id) {
            record.state = state;
        }
    }

    /// Last indexing state reported for a session.
    pub fn indexing_state(&self, session_id: &str) -> Option<IndexingState> {
        self.indexing.read().get(session_id).cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn record_indexing(&self, session_id: &str, state: IndexingState) -> anyhow::Result<()> {
        self.indexing.write().insert(session_id.to_string(), state);
        Ok(())
    }
}

/// Sessions backed by the sandbox layout: session `id` owns `{root}/{id}`.
///
/// Every existing directory is an active session. Indexing state is only
/// logged; persisting it belongs to the caller's database.
#[derive(Debug, Clone)]
pub struct SandboxSessionStore {
    root: PathBuf,
}

impl SandboxSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SessionStore for SandboxSessionStore {
    async fn session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let mut components = Path::new(session_id).components();
        let single_name = matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none();
        if !single_name || session_id.starts_with('.') {
            return Ok(None);
        }

        let workspace_path = self.root.join(session_id);
        // A symlinked entry is not a session, wherever it points.
        if !tokio::fs::symlink_metadata(&workspace_path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
        {
            return Ok(None);
        }

        Ok(Some(SessionRecord {
            session_id: session_id.to_string(),
            workspace_path,
            state: SessionState::Active,
        }))
    }

    async fn record_indexing(&self, session_id: &str, state: IndexingState) -> anyhow::Result<()> {
        tracing::debug!(session_id, state = ?state, "indexing state changed");
        Ok(())
    }
}
