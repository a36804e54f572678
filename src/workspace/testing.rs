//! Scripted `CommandRunner` for workspace tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::WorkspaceError;
use crate::workspace::runner::{CommandRunner, command_line};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedCall {
    pub dir: PathBuf,
    pub command: String,
}

struct Rule {
    pattern: String,
    result: Result<String, String>,
    remaining: Option<usize>,
}

/// Records every invocation. Commands matching no rule succeed with empty
/// output.
#[derive(Default)]
pub(crate) struct RecordingRunner {
    calls: Mutex<Vec<RecordedCall>>,
    rules: Mutex<Vec<Rule>>,
    delay: Option<Duration>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Commands containing `pattern` print `output`.
    pub fn respond(&self, pattern: &str, output: &str) -> &Self {
        self.push(pattern, Ok(output.to_string()), None)
    }

    /// Commands containing `pattern` exit 1 with `output`.
    pub fn fail(&self, pattern: &str, output: &str) -> &Self {
        self.push(pattern, Err(output.to_string()), None)
    }

    /// The next command containing `pattern` exits 1; later ones fall through.
    pub fn fail_once(&self, pattern: &str, output: &str) -> &Self {
        self.push(pattern, Err(output.to_string()), Some(1))
    }

    fn push(&self, pattern: &str, result: Result<String, String>, remaining: Option<usize>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            result,
            remaining,
        });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    /// Whether any recorded command contains `pattern`.
    pub fn ran(&self, pattern: &str) -> bool {
        self.commands().iter().any(|c| c.contains(pattern))
    }

    fn answer(&self, command: &str) -> Result<String, String> {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if !command.contains(&rule.pattern) || rule.remaining == Some(0) {
                continue;
            }
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return rule.result.clone();
        }
        Ok(String::new())
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        program: &str,
        args: &[&str],
    ) -> Result<String, WorkspaceError> {
        if cancel.is_cancelled() {
            return Err(WorkspaceError::Cancelled);
        }
        let command = command_line(program, args);
        self.calls.lock().unwrap().push(RecordedCall {
            dir: dir.to_path_buf(),
            command: command.clone(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer(&command)
            .map_err(|output| WorkspaceError::CommandFailed {
                command,
                code: Some(1),
                output,
            })
    }
}
