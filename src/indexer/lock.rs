//! Per-workspace mutual exclusion for index operations.
//!
//! The table is an explicit value: build one per service and share it by
//! reference (cloning shares the same table). Keys are canonical workspace
//! directories, so two sessions resolving to one directory contend for the
//! same entry. Acquisition never waits; a held workspace reports
//! [`WorkspaceBusy`] straight away. Entries are created on first use and
//! kept for the table's lifetime.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The workspace already has an operation in flight.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("workspace {} is already being indexed (operation {holder})", workspace.display())]
pub struct WorkspaceBusy {
    pub workspace: PathBuf,
    pub holder: Uuid,
}

#[derive(Debug, Default)]
struct LockEntry {
    /// Operation currently holding the lock, and since when.
    holder: Option<(Uuid, Instant)>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceLocks {
    entries: Arc<Mutex<HashMap<PathBuf, LockEntry>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `workspace` on behalf of `operation_id`, or report
    /// who holds it. Callers pass the canonical directory.
    pub fn try_acquire(
        &self,
        workspace: &Path,
        operation_id: Uuid,
    ) -> Result<WorkspaceGuard, WorkspaceBusy> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(workspace.to_path_buf()).or_default();

        if let Some((holder, _)) = entry.holder {
            return Err(WorkspaceBusy {
                workspace: workspace.to_path_buf(),
                holder,
            });
        }
        entry.holder = Some((operation_id, Instant::now()));

        tracing::debug!(workspace = %workspace.display(), %operation_id, "workspace lock acquired");
        Ok(WorkspaceGuard {
            entries: self.entries.clone(),
            workspace: workspace.to_path_buf(),
            operation_id,
        })
    }

    /// Release a guard explicitly. Dropping it has the same effect.
    pub fn release(&self, guard: WorkspaceGuard) {
        drop(guard);
    }

    /// The operation holding `workspace` and for how long, if any.
    pub fn holder(&self, workspace: &Path) -> Option<(Uuid, Duration)> {
        self.entries
            .lock()
            .get(workspace)
            .and_then(|entry| entry.holder)
            .map(|(holder, since)| (holder, since.elapsed()))
    }

    /// Number of workspaces seen so far, held or free.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Proof of exclusive access to one workspace. Releases on drop, so every
/// exit path (error, timeout, panic unwinding) frees the workspace.
#[derive(Debug)]
pub struct WorkspaceGuard {
    entries: Arc<Mutex<HashMap<PathBuf, LockEntry>>>,
    workspace: PathBuf,
    operation_id: Uuid,
}

impl WorkspaceGuard {
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&self.workspace) {
            if matches!(entry.holder, Some((holder, _)) if holder == self.operation_id) {
                entry.holder = None;
            }
        }
        tracing::debug!(
            workspace = %self.workspace.display(),
            operation_id = %self.operation_id,
            "workspace lock released"
        );
    }
}
