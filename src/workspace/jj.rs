//! Jujutsu workspace back end.
//!
//! Each task gets a jj workspace named after its bookmark. jj records
//! conflicts in commits instead of stopping, so a conflicted merge is
//! detected after the fact and undone from the operation log.

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
    VcsKind, WorkspaceLayout, WorkspaceManager, best_effort, branch_name, path_exists,
};

const MAIN_BOOKMARK: &str = "main";
const BOOKMARKS_TEMPLATE: &str = r#"local_bookmarks.map(|b| b.name()).join(" ")"#;
const CONFLICT_TEMPLATE: &str = r#"if(conflict, "conflict")"#;

/// Path part of a `jj resolve --list` line, e.g.
/// `my notes.md    2-sided conflict including 1 deletion`.
fn conflict_path(line: &str) -> Option<&str> {
    let line = line.trim_end();
    let path = match line.find("-sided conflict") {
        Some(idx) => line[..idx]
            .trim_end_matches(|c: char| c.is_ascii_digit())
            .trim_end(),
        None => line,
    };
    let path = path.trim_start();
    (!path.is_empty()).then_some(path)
}

pub struct JjWorkspaceManager {
    layout: WorkspaceLayout,
    runner: Arc<dyn CommandRunner>,
    merge_lock: Mutex<()>,
}

impl JjWorkspaceManager {
    pub fn new(layout: WorkspaceLayout, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            layout,
            runner,
            merge_lock: Mutex::new(()),
        }
    }

    async fn jj(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        args: &[&str],
    ) -> Result<String, WorkspaceError> {
        self.runner.run(cancel, dir, "jj", args).await
    }

    async fn require_workspace(&self, task_id: Uuid) -> Result<PathBuf, WorkspaceError> {
        let path = self.layout.path_for(task_id);
        if path_exists(&path).await {
            Ok(path)
        } else {
            Err(WorkspaceError::NotFound { task_id })
        }
    }

    async fn has_remote(&self, cancel: &CancellationToken) -> bool {
        self.jj(cancel, self.layout.root(), &["git", "remote", "list"])
            .await
            .map(|out| !out.trim().is_empty())
            .unwrap_or(false)
    }

    /// Conflicted paths at `@` in `dir`. `jj resolve --list` exits non-zero
    /// when there are none.
    async fn conflicted_files(&self, cancel: &CancellationToken, dir: &Path) -> Vec<String> {
        match self.jj(cancel, dir, &["resolve", "--list"]).await {
            Ok(out) => out
                .lines()
                .filter_map(conflict_path)
                .map(str::to_string)
                .collect(),
            Err(e) => {
                debug!(error = %e, "No conflicts listed");
                Vec::new()
            }
        }
    }

    /// Id of the latest operation in the root's operation log.
    async fn current_operation(&self, cancel: &CancellationToken, root: &Path) -> Option<String> {
        match self
            .jj(cancel, root, &["op", "log", "--no-graph", "--limit", "1", "-T", "id"])
            .await
        {
            Ok(out) => {
                let id = out.trim();
                (!id.is_empty()).then(|| id.to_string())
            }
            Err(e) => {
                debug!(error = %e, "Operation id unavailable");
                None
            }
        }
    }

    /// Restore the repository to `operation`, or undo the last operation
    /// when its id is unknown. Runs even after cancellation.
    async fn roll_back(&self, root: &Path, operation: Option<&str>) {
        let cancel = CancellationToken::new();
        let runner = self.runner.as_ref();
        match operation {
            Some(id) => best_effort(runner, &cancel, root, "jj", &["op", "restore", id]).await,
            None => best_effort(runner, &cancel, root, "jj", &["undo"]).await,
        }
    }

    /// Everything between creating the merge commit and cleanup. An error
    /// here leaves the merge commit for the caller to undo.
    async fn publish_merge(
        &self,
        cancel: &CancellationToken,
        root: &Path,
        task_id: Uuid,
        workspace: &Path,
    ) -> Result<(), WorkspaceError> {
        if self.is_conflicted(cancel, root).await? {
            let files = self.conflicted_files(cancel, root).await;
            return Err(WorkspaceError::MergeConflict {
                files,
                workspace_path: workspace.to_path_buf(),
            });
        }

        self.jj(cancel, root, &["bookmark", "set", MAIN_BOOKMARK, "-r", "@"])
            .await?;
        self.jj(cancel, root, &["new"]).await?;

        if self.has_remote(cancel).await {
            self.jj(cancel, root, &["git", "push", "--bookmark", MAIN_BOOKMARK])
                .await?;
        }
        debug!(task_id = %task_id, "Main bookmark moved to merge commit");
        Ok(())
    }

    async fn is_conflicted(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
    ) -> Result<bool, WorkspaceError> {
        let out = self
            .jj(cancel, dir, &["log", "-r", "@", "--no-graph", "-T", CONFLICT_TEMPLATE])
            .await?;
        Ok(out.contains("conflict"))
    }
}

#[async_trait]
impl WorkspaceManager for JjWorkspaceManager {
    fn kind(&self) -> VcsKind {
        VcsKind::Jujutsu
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
            debug!(task_id = %task_id, path = %path.display(), "Reusing existing jj workspace");
            return Ok(path);
        }

        tokio::fs::create_dir_all(self.layout.workspaces_dir()).await?;

        let bookmark = branch_name(task_id);
        let path_arg = path.to_string_lossy().into_owned();
        self.jj(
            cancel,
            self.layout.root(),
            &["workspace", "add", "--name", &bookmark, &path_arg],
        )
        .await?;
        self.jj(cancel, &path, &["bookmark", "create", &bookmark, "-r", "@"])
            .await?;

        info!(task_id = %task_id, bookmark = %bookmark, path = %path.display(), "Created jj workspace");
        Ok(path)
    }

    async fn remove_workspace(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        let path = self.layout.path_for(task_id);
        if !path_exists(&path).await {
            return Ok(());
        }
        let name = branch_name(task_id);
        self.jj(cancel, self.layout.root(), &["workspace", "forget", &name])
            .await?;
        tokio::fs::remove_dir_all(&path).await?;
        info!(task_id = %task_id, "Removed jj workspace");
        Ok(())
    }

    async fn commit(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
        message: &str,
    ) -> Result<bool, WorkspaceError> {
        let path = self.require_workspace(task_id).await?;

        let summary = self.jj(cancel, &path, &["diff", "--summary"]).await?;
        if summary.trim().is_empty() {
            debug!(task_id = %task_id, "Nothing to commit");
            return Ok(false);
        }

        let bookmark = branch_name(task_id);
        self.jj(cancel, &path, &["commit", "-m", message]).await?;
        self.jj(cancel, &path, &["bookmark", "set", &bookmark, "-r", "@-"])
            .await?;
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

        let remaining = self.conflicted_files(cancel, &path).await;
        if !remaining.is_empty() {
            return Err(WorkspaceError::MergeConflict {
                files: remaining,
                workspace_path: path,
            });
        }

        self.commit(cancel, task_id, message).await?;
        Ok(())
    }

    async fn abort_merge(
        &self,
        _cancel: &CancellationToken,
        _task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        Err(WorkspaceError::Unsupported {
            operation: "abort_merge".to_string(),
            vcs: VcsKind::Jujutsu.to_string(),
        })
    }

    async fn current_branch(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<String, WorkspaceError> {
        let path = self.require_workspace(task_id).await?;

        // The working copy is usually an empty child of the bookmarked commit.
        for revision in ["@", "@-"] {
            let out = self
                .jj(cancel, &path, &["log", "-r", revision, "--no-graph", "-T", BOOKMARKS_TEMPLATE])
                .await?;
            if let Some(name) = out.split_whitespace().next() {
                return Ok(name.to_string());
            }
        }

        let change = self
            .jj(cancel, &path, &["log", "-r", "@", "--no-graph", "-T", "change_id.short()"])
            .await?;
        Ok(change.trim().to_string())
    }

    async fn push_branch(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        let path = self.require_workspace(task_id).await?;
        let bookmark = branch_name(task_id);
        self.jj(cancel, &path, &["git", "push", "--bookmark", &bookmark])
            .await?;
        info!(task_id = %task_id, bookmark = %bookmark, "Pushed bookmark");
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
        self.jj(cancel, &path, &["diff", "--git", "--from", MAIN_BOOKMARK, "--to", "@"])
            .await
    }

    async fn merge_to_main(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        let _guard = self.merge_lock.lock().await;

        let root = self.layout.root();
        let bookmark = branch_name(task_id);
        let workspace = self.layout.path_for(task_id);
        let message = format!("Merge {bookmark}");

        let before = self.current_operation(cancel, root).await;
        self.jj(cancel, root, &["new", MAIN_BOOKMARK, &bookmark, "-m", &message])
            .await?;

        if let Err(e) = self.publish_merge(cancel, root, task_id, &workspace).await {
            warn!(task_id = %task_id, error = %e, "Merge failed, rolling back");
            self.roll_back(root, before.as_deref()).await;
            return Err(e);
        }

        let runner = self.runner.as_ref();
        best_effort(runner, cancel, root, "jj", &["bookmark", "delete", &bookmark]).await;
        best_effort(runner, cancel, root, "jj", &["workspace", "forget", &bookmark]).await;
        if path_exists(&workspace).await {
            if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
                warn!(task_id = %task_id, error = %e, "Failed to remove workspace directory");
            }
        }

        info!(task_id = %task_id, "Merged task into main");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::workspace::testing::RecordingRunner;

    fn manager(runner: Arc<RecordingRunner>) -> (tempfile::TempDir, JjWorkspaceManager) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        let layout = WorkspaceLayout::new(root, Some(tmp.path().join("ws")));
        (tmp, JjWorkspaceManager::new(layout, runner))
    }

    #[tokio::test]
    async fn abort_merge_is_unsupported_without_running_anything() {
        let runner = Arc::new(RecordingRunner::new());
        let (_tmp, jj) = manager(runner.clone());
        let err = jj
            .abort_merge(&CancellationToken::new(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Unsupported { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn create_adds_workspace_and_bookmark() {
        let runner = Arc::new(RecordingRunner::new());
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();
        let bookmark = branch_name(id);

        let path = jj.create_workspace(&CancellationToken::new(), id).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].dir, jj.root());
        assert_eq!(
            calls[0].command,
            format!("jj workspace add --name {bookmark} {}", path.display())
        );
        assert_eq!(calls[1].dir, path);
        assert_eq!(calls[1].command, format!("jj bookmark create {bookmark} -r @"));
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let runner = Arc::new(RecordingRunner::new());
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();
        std::fs::create_dir_all(jj.workspace_path(id)).unwrap();

        let path = jj.create_workspace(&CancellationToken::new(), id).await.unwrap();
        assert_eq!(path, jj.workspace_path(id));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn commit_skips_empty_change() {
        let runner = Arc::new(RecordingRunner::new());
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();
        std::fs::create_dir_all(jj.workspace_path(id)).unwrap();

        assert!(!jj.commit(&CancellationToken::new(), id, "work").await.unwrap());
        assert_eq!(runner.commands(), vec!["jj diff --summary"]);
    }

    #[tokio::test]
    async fn commit_moves_bookmark_to_parent() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("diff --summary", "M src/lib.rs\n");
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();
        std::fs::create_dir_all(jj.workspace_path(id)).unwrap();

        assert!(jj.commit(&CancellationToken::new(), id, "work").await.unwrap());
        let commands = runner.commands();
        assert_eq!(commands[1], "jj commit -m work");
        assert_eq!(commands[2], format!("jj bookmark set {} -r @-", branch_name(id)));
    }

    #[tokio::test]
    async fn current_branch_prefers_bookmarks() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("-r @- --no-graph", "agent/task-x\n");
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();
        std::fs::create_dir_all(jj.workspace_path(id)).unwrap();

        let branch = jj.current_branch(&CancellationToken::new(), id).await.unwrap();
        assert_eq!(branch, "agent/task-x");
    }

    #[tokio::test]
    async fn current_branch_falls_back_to_change_id() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("change_id.short()", "kxqyzpwm\n");
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();
        std::fs::create_dir_all(jj.workspace_path(id)).unwrap();

        let branch = jj.current_branch(&CancellationToken::new(), id).await.unwrap();
        assert_eq!(branch, "kxqyzpwm");
    }

    #[tokio::test]
    async fn diff_against_main() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("jj diff --git", "diff --git a/x b/x\n");
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();

        assert_eq!(jj.diff(&CancellationToken::new(), id).await.unwrap(), "");
        assert!(runner.calls().is_empty());

        std::fs::create_dir_all(jj.workspace_path(id)).unwrap();
        let diff = jj.diff(&CancellationToken::new(), id).await.unwrap();
        assert!(diff.starts_with("diff --git"));
        assert_eq!(runner.commands(), vec!["jj diff --git --from main --to @"]);
    }

    #[tokio::test]
    async fn merge_success_moves_main_and_cleans_up() {
        let runner = Arc::new(RecordingRunner::new());
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();
        let bookmark = branch_name(id);
        let workspace = jj.workspace_path(id);
        std::fs::create_dir_all(&workspace).unwrap();

        jj.merge_to_main(&CancellationToken::new(), id).await.unwrap();

        let commands = runner.commands();
        assert!(commands.contains(&format!("jj new main {bookmark} -m Merge {bookmark}")));
        assert!(commands.contains(&"jj bookmark set main -r @".to_string()));
        assert!(commands.contains(&format!("jj bookmark delete {bookmark}")));
        assert!(commands.contains(&format!("jj workspace forget {bookmark}")));
        assert!(!commands.iter().any(|c| c.starts_with("jj git push")));
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn merge_conflict_is_undone_and_reported() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("op log", "3f2a1b9c\n");
        runner.respond("if(conflict", "conflict");
        runner.respond("resolve --list", "src/lib.rs    2-sided conflict\n");
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();

        let err = jj
            .merge_to_main(&CancellationToken::new(), id)
            .await
            .unwrap_err();
        match err {
            WorkspaceError::MergeConflict {
                files,
                workspace_path,
            } => {
                assert_eq!(files, vec!["src/lib.rs"]);
                assert_eq!(workspace_path, jj.workspace_path(id));
            }
            other => panic!("expected MergeConflict, got {other:?}"),
        }
        assert!(runner.ran("jj op restore 3f2a1b9c"));
        assert!(!runner.ran("bookmark set main"));
    }

    #[tokio::test]
    async fn failure_after_merge_commit_is_undone() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_once("bookmark set main", "bookmark is conflicted");
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();
        let workspace = jj.workspace_path(id);
        std::fs::create_dir_all(&workspace).unwrap();

        let err = jj
            .merge_to_main(&CancellationToken::new(), id)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::CommandFailed { .. }), "{err:?}");

        let commands = runner.commands();
        let set = commands.iter().position(|c| c.starts_with("jj bookmark set main")).unwrap();
        // Without a recorded operation id the single merge operation is undone.
        let undo = commands.iter().position(|c| c == "jj undo").unwrap();
        assert!(set < undo);
        assert!(!runner.ran("workspace forget"));
        assert!(workspace.exists());
    }

    #[tokio::test]
    async fn failed_push_of_main_restores_prior_operation() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("op log", "3f2a1b9c\n");
        runner.respond("git remote list", "origin https://example.invalid/repo.git\n");
        runner.fail("git push --bookmark main", "rejected");
        let (_tmp, jj) = manager(runner.clone());
        let id = Uuid::new_v4();

        assert!(jj.merge_to_main(&CancellationToken::new(), id).await.is_err());

        // The merge commit, the main bookmark and the fresh change are all
        // reverted in one step, not just the last of them.
        let commands = runner.commands();
        let recorded = commands.iter().position(|c| c.starts_with("jj op log")).unwrap();
        let merged = commands.iter().position(|c| c.starts_with("jj new main")).unwrap();
        assert!(recorded < merged);
        assert_eq!(commands.last().unwrap(), "jj op restore 3f2a1b9c");
        assert!(!runner.ran("jj undo"));
        assert!(!runner.ran("bookmark delete"));
    }

    #[test]
    fn conflict_lines_keep_paths_with_spaces() {
        assert_eq!(conflict_path("src/lib.rs    2-sided conflict"), Some("src/lib.rs"));
        assert_eq!(
            conflict_path("My Notes.md    2-sided conflict including 1 deletion"),
            Some("My Notes.md")
        );
        assert_eq!(conflict_path("docs/a b/c.md 3-sided conflict\n"), Some("docs/a b/c.md"));
        assert_eq!(conflict_path("   "), None);
    }

    #[tokio::test]
    async fn concurrent_merges_are_serialized() {
        let runner = Arc::new(RecordingRunner::new().with_delay(Duration::from_millis(5)));
        let (_tmp, jj) = manager(runner.clone());
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            jj.merge_to_main(&cancel, Uuid::new_v4()),
            jj.merge_to_main(&cancel, Uuid::new_v4())
        );
        a.unwrap();
        b.unwrap();

        let commands = runner.commands();
        let starts: Vec<usize> = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| c.starts_with("jj new main"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(starts.len(), 2);
        // The second merge starts only after the first forgot its workspace.
        let first_forget = commands
            .iter()
            .position(|c| c.starts_with("jj workspace forget"))
            .unwrap();
        assert!(first_forget < starts[1]);
    }
}
