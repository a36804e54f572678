//! Git worktree back end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::WorkspaceError;
use crate::workspace::runner::CommandRunner;
use crate::workspace::{
    VcsKind, WorkspaceLayout, WorkspaceManager, best_effort, branch_name,
    nul_terminated_paths, path_exists,
};

/// Candidate names for the main line, in preference order.
const MAIN_BRANCHES: [&str; 2] = ["main", "master"];

/// Whether a file still carries `<<<<<<<` or `>>>>>>>` conflict markers.
/// Unreadable or deleted files count as resolved.
async fn has_conflict_markers(file: &Path) -> bool {
    match tokio::fs::read(file).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .lines()
            .any(|line| line.starts_with("<<<<<<<") || line.starts_with(">>>>>>>")),
        Err(_) => false,
    }
}

/// One git worktree per task on branch `agent/task-<id>`.
pub struct GitWorkspaceManager {
    layout: WorkspaceLayout,
    runner: Arc<dyn CommandRunner>,
    merge_lock: Mutex<()>,
}

impl GitWorkspaceManager {
    pub fn new(layout: WorkspaceLayout, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            layout,
            runner,
            merge_lock: Mutex::new(()),
        }
    }

    async fn git(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        args: &[&str],
    ) -> Result<String, WorkspaceError> {
        self.runner.run(cancel, dir, "git", args).await
    }

    async fn has_remote(&self, cancel: &CancellationToken) -> bool {
        match self.git(cancel, self.layout.root(), &["remote"]).await {
            Ok(out) => !out.trim().is_empty(),
            Err(e) => {
                debug!(error = %e, "Could not list remotes");
                false
            }
        }
    }

    async fn unmerged_files(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
    ) -> Result<Vec<String>, WorkspaceError> {
        let out = self
            .git(cancel, dir, &["diff", "--name-only", "--diff-filter=U", "-z"])
            .await?;
        Ok(nul_terminated_paths(&out))
    }

    /// Check out the main line in the root, falling back to `master`.
    async fn checkout_main(&self, cancel: &CancellationToken) -> Result<&'static str, WorkspaceError> {
        let mut last_error = String::new();
        for branch in MAIN_BRANCHES {
            match self.git(cancel, self.layout.root(), &["checkout", branch]).await {
                Ok(_) => return Ok(branch),
                Err(WorkspaceError::Cancelled) => return Err(WorkspaceError::Cancelled),
                Err(e) => {
                    debug!(branch, error = %e, "Main branch candidate unavailable");
                    last_error = e.to_string();
                }
            }
        }
        Err(WorkspaceError::NoMainBranch(last_error))
    }

    /// Name of the main line without touching the checkout.
    async fn main_branch(&self, cancel: &CancellationToken) -> &'static str {
        for branch in MAIN_BRANCHES {
            let reference = format!("refs/heads/{branch}");
            if self
                .git(cancel, self.layout.root(), &["rev-parse", "--verify", "--quiet", &reference])
                .await
                .is_ok()
            {
                return branch;
            }
        }
        MAIN_BRANCHES[0]
    }

    async fn require_workspace(&self, task_id: Uuid) -> Result<PathBuf, WorkspaceError> {
        let path = self.layout.path_for(task_id);
        if path_exists(&path).await {
            Ok(path)
        } else {
            Err(WorkspaceError::NotFound { task_id })
        }
    }

    /// Undo the failed merge in the root and reproduce the conflict inside
    /// the task's workspace, where it can be resolved.
    async fn move_conflict_to_workspace(
        &self,
        cancel: &CancellationToken,
        main: &str,
        workspace: &Path,
    ) {
        best_effort(self.runner.as_ref(), cancel, self.layout.root(), "git", &["merge", "--abort"])
            .await;

        if !path_exists(workspace).await {
            warn!(workspace = %workspace.display(), "Workspace missing, conflict not replayed");
            return;
        }
        // Expected to stop on the same conflict.
        if let Err(e) = self.git(cancel, workspace, &["merge", "--no-edit", main]).await {
            debug!(error = %e, "Conflict replayed in workspace");
        }
    }

    async fn cleanup_after_merge(
        &self,
        cancel: &CancellationToken,
        branch: &str,
        workspace: &Path,
        remote: bool,
    ) {
        let runner = self.runner.as_ref();
        let root = self.layout.root();

        if remote {
            best_effort(runner, cancel, root, "git", &["push", "origin", "--delete", branch]).await;
        }
        if path_exists(workspace).await {
            let path = workspace.to_string_lossy();
            best_effort(runner, cancel, root, "git", &["worktree", "remove", "--force", &path])
                .await;
        }
        // The branch can only be deleted once no worktree has it checked out.
        best_effort(runner, cancel, root, "git", &["branch", "-D", branch]).await;
        best_effort(runner, cancel, root, "git", &["worktree", "prune"]).await;
    }
}

#[async_trait]
impl WorkspaceManager for GitWorkspaceManager {
    fn kind(&self) -> VcsKind {
        VcsKind::Git
    }

    fn root(&self) -> &Path {
        self.layout.root()
    }

    fn workspace_path(&self, task_id: Uuid) -> PathBuf {
        self.layout.path_for(task_id)
    }

    async fn create_workspace(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = self.layout.path_for(task_id);
        if path_exists(&path).await {
            debug!(task_id = %task_id, path = %path.display(), "Reusing existing worktree");
            return Ok(path);
        }

        tokio::fs::create_dir_all(self.layout.workspaces_dir()).await?;

        let branch = branch_name(task_id);
        let reference = format!("refs/heads/{branch}");
        let path_arg = path.to_string_lossy().into_owned();
        let branch_exists = self
            .git(cancel, self.layout.root(), &["rev-parse", "--verify", "--quiet", &reference])
            .await
            .is_ok();

        if branch_exists {
            self.git(cancel, self.layout.root(), &["worktree", "add", &path_arg, &branch])
                .await?;
        } else {
            self.git(cancel, self.layout.root(), &["worktree", "add", "-b", &branch, &path_arg])
                .await?;
        }

        info!(task_id = %task_id, branch = %branch, path = %path.display(), "Created worktree");
        Ok(path)
    }

    async fn remove_workspace(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        let path = self.layout.path_for(task_id);
        if path_exists(&path).await {
            let path_arg = path.to_string_lossy().into_owned();
            self.git(cancel, self.layout.root(), &["worktree", "remove", "--force", &path_arg])
                .await?;
            info!(task_id = %task_id, "Removed worktree");
        }
        best_effort(self.runner.as_ref(), cancel, self.layout.root(), "git", &["worktree", "prune"])
            .await;
        Ok(())
    }

    async fn commit(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
        message: &str,
    ) -> Result<bool, WorkspaceError> {
        let path = self.require_workspace(task_id).await?;

        self.git(cancel, &path, &["add", "-A"]).await?;
        let status = self.git(cancel, &path, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            debug!(task_id = %task_id, "Nothing to commit");
            return Ok(false);
        }

        self.git(cancel, &path, &["commit", "-m", message]).await?;
        info!(task_id = %task_id, "Committed workspace changes");
        Ok(true)
    }

    async fn commit_merge_resolution(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
        message: &str,
    ) -> Result<(), WorkspaceError> {
        let path = self.require_workspace(task_id).await?;

        // Staging clears the unmerged state, so inspect before `add`.
        let mut remaining = Vec::new();
        for file in self.unmerged_files(cancel, &path).await? {
            if has_conflict_markers(&path.join(&file)).await {
                remaining.push(file);
            }
        }
        if !remaining.is_empty() {
            warn!(task_id = %task_id, files = ?remaining, "Conflict markers remain");
            return Err(WorkspaceError::MergeConflict {
                files: remaining,
                workspace_path: path,
            });
        }

        self.git(cancel, &path, &["add", "-A"]).await?;
        self.git(cancel, &path, &["commit", "--no-edit", "-m", message]).await?;
        info!(task_id = %task_id, "Committed merge resolution");
        Ok(())
    }

    async fn abort_merge(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        let path = self.require_workspace(task_id).await?;
        self.git(cancel, &path, &["merge", "--abort"]).await?;
        info!(task_id = %task_id, "Aborted merge in workspace");
        Ok(())
    }

    async fn current_branch(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<String, WorkspaceError> {
        let path = self.require_workspace(task_id).await?;
        let out = self
            .git(cancel, &path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(out.trim().to_string())
    }

    async fn push_branch(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        let path = self.require_workspace(task_id).await?;
        let branch = branch_name(task_id);
        self.git(cancel, &path, &["push", "-u", "origin", &branch]).await?;
        info!(task_id = %task_id, branch = %branch, "Pushed branch");
        Ok(())
    }

    async fn diff(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<String, WorkspaceError> {
        let path = self.layout.path_for(task_id);
        if !path_exists(&path).await {
            return Ok(String::new());
        }

        let main = self.main_branch(cancel).await;
        let base = self.git(cancel, &path, &["merge-base", main, "HEAD"]).await?;
        self.git(cancel, &path, &["diff", base.trim()]).await
    }

    async fn merge_to_main(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        let _guard = self.merge_lock.lock().await;

        let root = self.layout.root();
        let branch = branch_name(task_id);
        let workspace = self.layout.path_for(task_id);

        let main = self.checkout_main(cancel).await?;
        let remote = self.has_remote(cancel).await;
        if remote {
            self.git(cancel, root, &["pull", "--ff-only", "origin", main]).await?;
        }

        if let Err(e) = self.git(cancel, root, &["merge", "--no-edit", &branch]).await {
            if !matches!(e, WorkspaceError::CommandFailed { .. }) {
                return Err(e);
            }
            let files = self.unmerged_files(cancel, root).await.unwrap_or_default();
            if files.is_empty() {
                return Err(e);
            }

            warn!(task_id = %task_id, files = ?files, "Merge conflict");
            self.move_conflict_to_workspace(cancel, main, &workspace).await;
            return Err(WorkspaceError::MergeConflict {
                files,
                workspace_path: workspace,
            });
        }

        if remote {
            self.git(cancel, root, &["push", "origin", main]).await?;
        }

        self.cleanup_after_merge(cancel, &branch, &workspace, remote).await;
        info!(task_id = %task_id, main, "Merged task into main");
        Ok(())
    }
}
