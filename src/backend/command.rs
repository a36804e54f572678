//! Subprocess agent speaking JSON lines.
//!
//! The agent program is started in the task workspace. It receives one
//! request line on stdin:
//!
//! ```json
//! {"prompt": "...", "history": [...], "session_id": null, "model": null}
//! ```
//!
//! and writes one `StreamEvent` per line on stdout. Lines that do not parse
//! are logged and skipped. A non-zero exit fails the run with its stderr.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{AgentBackend, BackendInput};
use crate::error::BackendError;
use crate::stream::{StreamEvent, StreamEventKind};
use crate::task::{BlockType, Role, Usage};

const NAME: &str = "command";

#[derive(Serialize)]
struct AgentRequest<'a> {
    prompt: &'a str,
    history: Option<&'a Value>,
    session_id: Option<&'a str>,
    model: Option<&'a str>,
}

/// Runs an external agent program per turn.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    history: Option<Value>,
    final_message: Option<String>,
    current_text: String,
    in_assistant_message: bool,
    usage: Usage,
}

impl CommandBackend {
    /// `command` is the program followed by its arguments.
    pub fn new(command: Vec<String>) -> Result<Self, BackendError> {
        let mut parts = command.into_iter();
        let program = parts.next().filter(|p| !p.trim().is_empty()).ok_or_else(|| {
            BackendError::NotConfigured {
                backend: NAME.to_string(),
                reason: "no agent command configured (set AGENT_FOUNDRY_AGENT_CMD)".to_string(),
            }
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
            history: None,
            final_message: None,
            current_text: String::new(),
            in_assistant_message: false,
            usage: Usage::default(),
        })
    }

    fn failed(&self, reason: impl Into<String>) -> BackendError {
        BackendError::Failed {
            backend: NAME.to_string(),
            reason: reason.into(),
        }
    }

    /// Track the final assistant text and token usage.
    fn observe(&mut self, event: &StreamEvent) {
        if let Some(usage) = event.usage {
            self.usage.add(usage);
        }
        match event.kind {
            StreamEventKind::MessageStart => {
                self.current_text.clear();
                self.in_assistant_message = event.role.unwrap_or_default() == Role::Assistant;
            }
            StreamEventKind::ContentDelta if self.in_assistant_message => {
                if event.block_type == Some(BlockType::Text) {
                    if let Some(delta) = &event.delta {
                        self.current_text.push_str(delta);
                    }
                }
            }
            StreamEventKind::MessageEnd if self.in_assistant_message => {
                if !self.current_text.is_empty() {
                    self.final_message = Some(std::mem::take(&mut self.current_text));
                }
                self.in_assistant_message = false;
            }
            _ => {}
        }
    }

    async fn send_request(&self, child: &mut Child, input: &BackendInput) -> Result<(), BackendError> {
        let request = AgentRequest {
            prompt: &input.prompt,
            history: self.history.as_ref(),
            session_id: input.resume_session.as_deref(),
            model: input.model.as_deref(),
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        // Dropping stdin afterwards signals end of input.
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => {}
                // The agent exited without reading; its exit status says why.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("Agent closed stdin before reading the request");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentBackend for CommandBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(
        &mut self,
        cancel: &CancellationToken,
        input: BackendInput,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        info!(
            program = %self.program,
            workspace = %input.workspace_path.display(),
            "Starting agent process"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&input.workspace_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.failed(format!("failed to start {}: {e}", self.program)))?;

        self.send_request(&mut child, &input).await?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.failed("agent stdout was not captured"))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut receiver_open = true;
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    info!("Agent process killed on cancellation");
                    return Err(BackendError::Cancelled);
                }
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            let event: StreamEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, line = %line, "Skipping malformed agent output");
                    continue;
                }
            };
            self.observe(&event);
            if receiver_open && events.send(event).await.is_err() {
                debug!("Stream receiver dropped, discarding further events");
                receiver_open = false;
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(BackendError::Cancelled);
            }
        };
        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(self.failed(format!("agent exited with {status}: {}", stderr.trim())));
        }
        if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim(), "Agent stderr");
        }
        Ok(())
    }

    fn final_message(&self) -> Option<String> {
        self.final_message.clone()
    }

    fn restore_state(&mut self, history: &str) -> Result<(), BackendError> {
        if history.trim().is_empty() {
            self.history = None;
            return Ok(());
        }
        let value: Value =
            serde_json::from_str(history).map_err(|e| BackendError::InvalidHistory {
                backend: NAME.to_string(),
                reason: e.to_string(),
            })?;
        if !value.is_array() {
            return Err(BackendError::InvalidHistory {
                backend: NAME.to_string(),
                reason: "history must be a JSON array".to_string(),
            });
        }
        self.history = Some(value);
        Ok(())
    }

    async fn close(&mut self) {
        self.history = None;
        self.current_text.clear();
    }

    fn usage(&self) -> Usage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_not_configured() {
        assert!(matches!(
            CommandBackend::new(Vec::new()),
            Err(BackendError::NotConfigured { .. })
        ));
        assert!(matches!(
            CommandBackend::new(vec!["  ".to_string()]),
            Err(BackendError::NotConfigured { .. })
        ));
    }

    #[test]
    fn history_must_be_an_array() {
        let mut backend = CommandBackend::new(vec!["agent".to_string()]).unwrap();
        assert!(backend.restore_state(r#"[{"role":"user","content":"hi"}]"#).is_ok());
        assert!(matches!(
            backend.restore_state(r#"{"role":"user"}"#),
            Err(BackendError::InvalidHistory { .. })
        ));
        assert!(matches!(
            backend.restore_state("not json"),
            Err(BackendError::InvalidHistory { .. })
        ));
        assert!(backend.restore_state("").is_ok());
    }

    #[test]
    fn observes_final_text_and_usage() {
        let mut backend = CommandBackend::new(vec!["agent".to_string()]).unwrap();
        let events = [
            StreamEvent::message_start("m1", Role::Assistant),
            StreamEvent::content_start("m1", BlockType::Thinking),
            StreamEvent::content_delta("m1", BlockType::Thinking, "hmm"),
            StreamEvent::content_end("m1"),
            StreamEvent::content_start("m1", BlockType::Text),
            StreamEvent::content_delta("m1", BlockType::Text, "all "),
            StreamEvent::content_delta("m1", BlockType::Text, "done"),
            StreamEvent::content_end("m1"),
            StreamEvent::message_end("m1").with_usage(Usage {
                input_tokens: 10,
                output_tokens: 4,
            }),
        ];
        for event in &events {
            backend.observe(event);
        }
        assert_eq!(backend.final_message().as_deref(), Some("all done"));
        assert_eq!(backend.usage().total(), 14);
    }

    #[cfg(unix)]
    mod process {
        use std::time::Duration;

        use super::*;

        fn sh(script: &str) -> CommandBackend {
            CommandBackend::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
                .unwrap()
        }

        fn input(dir: &std::path::Path) -> BackendInput {
            BackendInput {
                prompt: "add a readme".to_string(),
                workspace_path: dir.to_path_buf(),
                model: Some("small".to_string()),
                resume_session: Some("s-0".to_string()),
            }
        }

        #[tokio::test]
        async fn streams_events_and_sends_request() {
            let tmp = tempfile::tempdir().unwrap();
            let script = r#"read req; printf '%s' "$req" > request.json
echo '{"type":"message_start","message_id":"m1","role":"assistant","session_id":"s-1"}'
echo 'not json'
echo '{"type":"content_start","message_id":"m1","block_type":"text"}'
echo '{"type":"content_delta","message_id":"m1","block_type":"text","delta":"hello"}'
echo '{"type":"content_end","message_id":"m1"}'
echo '{"type":"message_end","message_id":"m1","usage":{"input_tokens":3,"output_tokens":5}}'"#;
            let mut backend = sh(script);
            backend
                .restore_state(r#"[{"role":"user","content":"earlier"}]"#)
                .unwrap();

            let (tx, mut rx) = mpsc::channel(16);
            backend
                .run(&CancellationToken::new(), input(tmp.path()), tx)
                .await
                .unwrap();

            let mut received = Vec::new();
            while let Some(event) = rx.recv().await {
                received.push(event);
            }
            assert_eq!(received.len(), 5);
            assert_eq!(received[0].session_id.as_deref(), Some("s-1"));
            assert_eq!(backend.final_message().as_deref(), Some("hello"));
            assert_eq!(backend.usage().total(), 8);

            let request: Value =
                serde_json::from_str(&std::fs::read_to_string(tmp.path().join("request.json")).unwrap())
                    .unwrap();
            assert_eq!(request["prompt"], "add a readme");
            assert_eq!(request["session_id"], "s-0");
            assert_eq!(request["model"], "small");
            assert_eq!(request["history"][0]["content"], "earlier");
        }

        #[tokio::test]
        async fn non_zero_exit_reports_stderr() {
            let tmp = tempfile::tempdir().unwrap();
            let mut backend = sh("read req; echo boom >&2; exit 2");
            let (tx, _rx) = mpsc::channel(4);
            let err = backend
                .run(&CancellationToken::new(), input(tmp.path()), tx)
                .await
                .unwrap_err();
            match err {
                BackendError::Failed { reason, .. } => assert!(reason.contains("boom")),
                other => panic!("expected Failed, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn cancellation_kills_agent() {
            let tmp = tempfile::tempdir().unwrap();
            let mut backend = sh("read req; sleep 30");
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let (tx, _rx) = mpsc::channel(4);
            let result = tokio::time::timeout(
                Duration::from_secs(10),
                backend.run(&cancel, input(tmp.path()), tx),
            )
            .await
            .expect("run did not stop after cancellation");
            assert!(matches!(result, Err(BackendError::Cancelled)));
        }
    }
}
