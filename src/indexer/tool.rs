//! Drives the external indexing tool through its two phases.
//!
//! ```text
//! <program> [args..] init  [--force]   creates the marker directory
//! <program> [args..] index [--force]   builds the index
//! ```
//!
//! The tool is opaque: this layer only spawns it, bounds each phase with its
//! own deadline and reads the marker directory to answer status queries.

use crate::config::ToolConfig;
use crate::indexer::types::{IndexPhase, IndexResult, IndexStatus};
use crate::process::{SubprocessOutcome, SubprocessRunner};
use crate::sandbox::ResolvedPath;

use std::path::Path;
use std::time::Duration;

/// Deadlines for one init + index run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub init: Duration,
    pub index: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkspaceIndexer {
    runner: SubprocessRunner,
    tool: ToolConfig,
}

impl WorkspaceIndexer {
    pub fn new(runner: SubprocessRunner, tool: ToolConfig) -> Self {
        Self { runner, tool }
    }

    pub fn tool(&self) -> &ToolConfig {
        &self.tool
    }

    /// Run `init`, unless the workspace is already initialised and `force`
    /// is false, in which case no process is spawned.
    pub async fn ensure_initialized(
        &self,
        workspace: &ResolvedPath,
        force: bool,
        timeout: Duration,
    ) -> crate::Result<SubprocessOutcome> {
        let command = self.command(IndexPhase::Init, force);

        if !force && self.status_of(workspace.as_path()) == IndexStatus::Indexed {
            tracing::debug!(
                workspace = %workspace.as_path().display(),
                "workspace already initialized, skipping init"
            );
            return Ok(SubprocessOutcome::skipped(
                command,
                "Workspace already initialized; init skipped.",
            ));
        }

        self.runner.run(&command, workspace, timeout).await
    }

    /// Always spawns `index`; rebuilding is idempotent at the tool level.
    pub async fn build_index(
        &self,
        workspace: &ResolvedPath,
        force: bool,
        timeout: Duration,
    ) -> crate::Result<SubprocessOutcome> {
        let command = self.command(IndexPhase::Index, force);
        self.runner.run(&command, workspace, timeout).await
    }

    /// Init then index. A failed init returns immediately without running
    /// the index phase.
    pub async fn index_workspace(
        &self,
        workspace: &ResolvedPath,
        force: bool,
        timeouts: PhaseTimeouts,
    ) -> crate::Result<IndexResult> {
        let init = self.ensure_initialized(workspace, force, timeouts.init).await?;
        if !init.is_success() {
            tracing::warn!(
                workspace = %workspace.as_path().display(),
                outcome = %init.kind,
                "init phase failed, skipping index phase"
            );
            return Ok(IndexResult::from_phases(init, None));
        }

        let index = self.build_index(workspace, force, timeouts.index).await?;
        Ok(IndexResult::from_phases(init, Some(index)))
    }

    /// Whether the tool's marker directory exists. No subprocess involved.
    pub fn status_of(&self, workspace: &Path) -> IndexStatus {
        if workspace.join(&self.tool.marker_dir).is_dir() {
            IndexStatus::Indexed
        } else {
            IndexStatus::NotIndexed
        }
    }

    fn command(&self, phase: IndexPhase, force: bool) -> Vec<String> {
        let mut command = Vec::with_capacity(self.tool.args.len() + 3);
        command.push(self.tool.program.clone());
        command.extend(self.tool.args.iter().cloned());
        command.push(phase.subcommand().to_string());
        if force {
            command.push("--force".to_string());
        }
        command
    }
}
