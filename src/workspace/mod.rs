//! Isolated per-task workspaces on top of git worktrees or jj workspaces.
//!
//! A workspace is a directory plus a branch (git) or bookmark (jj) named
//! `agent/task-<id>`. Both back ends implement `WorkspaceManager`; the kind is
//! chosen once at startup by `detect_repository`.
//!
//! Per-workspace operations touch only the task's own directory and are not
//! serialized. `merge_to_main` works in the shared root checkout and holds the
//! manager's merge lock for its whole sequence.

pub mod git;
pub mod jj;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::error::WorkspaceError;

pub use git::GitWorkspaceManager;
pub use jj::JjWorkspaceManager;
pub use runner::{CommandRunner, ProcessRunner};

/// Supported version-control back ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsKind {
    Git,
    Jujutsu,
}

impl VcsKind {
    /// Directory that marks a repository root.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Git => ".git",
            Self::Jujutsu => ".jj",
        }
    }
}

impl std::fmt::Display for VcsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git => f.write_str("git"),
            Self::Jujutsu => f.write_str("jj"),
        }
    }
}

/// Branch (git) or bookmark and workspace name (jj) for a task.
pub fn branch_name(task_id: Uuid) -> String {
    format!("agent/task-{task_id}")
}

/// Lifecycle of per-task workspaces, keyed by task id.
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    fn kind(&self) -> VcsKind;

    /// Root of the shared repository checkout.
    fn root(&self) -> &Path;

    /// Directory a task's workspace lives in (whether or not it exists).
    fn workspace_path(&self, task_id: Uuid) -> PathBuf;

    /// Create the workspace, or return the existing one unchanged.
    async fn create_workspace(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<PathBuf, WorkspaceError>;

    async fn remove_workspace(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError>;

    /// Commit all changes. Returns `false` when there was nothing to commit.
    async fn commit(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
        message: &str,
    ) -> Result<bool, WorkspaceError>;

    /// Stage resolved files and record the merge.
    async fn commit_merge_resolution(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
        message: &str,
    ) -> Result<(), WorkspaceError>;

    /// Abandon an in-progress merge in the workspace.
    async fn abort_merge(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError>;

    async fn current_branch(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<String, WorkspaceError>;

    async fn push_branch(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError>;

    /// Diff of the task's work against the main line. Empty when the
    /// workspace no longer exists.
    async fn diff(&self, cancel: &CancellationToken, task_id: Uuid)
    -> Result<String, WorkspaceError>;

    /// Merge the task into the main line and clean up. A conflict is returned
    /// as `WorkspaceError::MergeConflict`.
    async fn merge_to_main(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError>;
}

/// Where a manager keeps task workspaces.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
    workspaces_dir: PathBuf,
}

impl WorkspaceLayout {
    /// `workspaces_dir` defaults to `<root>-workspaces` next to the root.
    pub fn new(root: impl Into<PathBuf>, workspaces_dir: Option<PathBuf>) -> Self {
        let root = root.into();
        let workspaces_dir = workspaces_dir.unwrap_or_else(|| default_workspaces_dir(&root));
        Self {
            root,
            workspaces_dir,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspaces_dir(&self) -> &Path {
        &self.workspaces_dir
    }

    pub fn path_for(&self, task_id: Uuid) -> PathBuf {
        self.workspaces_dir.join(format!("task-{task_id}"))
    }
}

fn default_workspaces_dir(root: &Path) -> PathBuf {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());
    let parent = root.parent().unwrap_or(root);
    parent.join(format!("{name}-workspaces"))
}

/// Find the repository containing `start`: a `.jj` marker anywhere above
/// wins over `.git`.
pub fn detect_repository(start: &Path) -> Option<(VcsKind, PathBuf)> {
    [VcsKind::Jujutsu, VcsKind::Git].into_iter().find_map(|kind| {
        start
            .ancestors()
            .find(|dir| dir.join(kind.marker()).exists())
            .map(|dir| (kind, dir.to_path_buf()))
    })
}

/// Build the manager for a detected repository.
pub fn create_manager(
    kind: VcsKind,
    root: PathBuf,
    workspaces_dir: Option<PathBuf>,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn WorkspaceManager> {
    let layout = WorkspaceLayout::new(root, workspaces_dir);
    match kind {
        VcsKind::Git => Arc::new(GitWorkspaceManager::new(layout, runner)),
        VcsKind::Jujutsu => Arc::new(JjWorkspaceManager::new(layout, runner)),
    }
}

pub(crate) async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Run a cleanup command whose failure must not fail the caller.
pub(crate) async fn best_effort(
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
    dir: &Path,
    program: &str,
    args: &[&str],
) {
    if let Err(e) = runner.run(cancel, dir, program, args).await {
        warn!(
            command = %runner::command_line(program, args),
            error = %e,
            "Cleanup step failed"
        );
    }
}

/// Paths from `-z` output. Each path ends in NUL; anything after the last NUL
/// is stderr noise from the combined output.
pub(crate) fn nul_terminated_paths(output: &str) -> Vec<String> {
    let mut parts: Vec<&str> = output.split('\0').collect();
    parts.pop();
    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
