//! Workspace indexing: the two-phase tool driver, the per-workspace lock
//! table and the service that ties them to sessions and audit.

pub mod lock;
pub mod service;
pub mod tool;
pub mod types;

pub use lock::{WorkspaceBusy, WorkspaceGuard, WorkspaceLocks};
pub use service::{IndexRequest, IndexingService};
pub use tool::{PhaseTimeouts, WorkspaceIndexer};
pub use types::{
    FailureReason, IndexPhase, IndexResult, IndexResultStatus, IndexResultSummary, IndexStatus,
    IndexStatusReport,
};
