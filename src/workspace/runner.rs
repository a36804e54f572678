//! Subprocess seam for VCS commands.
//!
//! Every git/jj invocation goes through a `CommandRunner`, so the workspace
//! state machines can be exercised with a recording double. The process
//! runner kills the child when the cancellation token fires.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::WorkspaceError;

/// Runs a program in a directory and returns its combined output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program args...` in `dir`.
    ///
    /// Implementations must terminate the child process when `cancel` fires
    /// and return `WorkspaceError::Cancelled`. A non-zero exit status is a
    /// `WorkspaceError::CommandFailed` carrying stdout and stderr.
    async fn run(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        program: &str,
        args: &[&str],
    ) -> Result<String, WorkspaceError>;
}

/// `CommandRunner` backed by real child processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        program: &str,
        args: &[&str],
    ) -> Result<String, WorkspaceError> {
        let rendered = command_line(program, args);
        if cancel.is_cancelled() {
            return Err(WorkspaceError::Cancelled);
        }

        debug!(dir = %dir.display(), command = %rendered, "Running command");

        let child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkspaceError::SpawnFailed {
                command: rendered.clone(),
                reason: e.to_string(),
            })?;

        // Dropping the wait future on cancellation drops the child, which
        // kills it (kill_on_drop).
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => {
                debug!(command = %rendered, "Command cancelled, child killed");
                return Err(WorkspaceError::Cancelled);
            }
        };

        let combined = combine_output(&output.stdout, &output.stderr);
        if output.status.success() {
            Ok(combined)
        } else {
            Err(WorkspaceError::CommandFailed {
                command: rendered,
                code: output.status.code(),
                output: combined,
            })
        }
    }
}

/// Render a command for logs and errors.
pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if stderr.trim().is_empty() {
        stdout.into_owned()
    } else if stdout.trim().is_empty() {
        stderr.into_owned()
    } else {
        format!("{stdout}\n{stderr}")
    }
}
