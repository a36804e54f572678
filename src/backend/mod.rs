//! AI backend capability.
//!
//! A backend runs one agent turn inside a task workspace and streams
//! `StreamEvent`s back to the worker. Backends are constructed per run from
//! a `BackendRegistry`, so any conversational state they hold lives only for
//! that run; continuations rebuild it from persisted history with
//! `restore_state`.

pub mod command;
pub mod registry;

pub use command::CommandBackend;
pub use registry::{BackendFactory, BackendRegistry};

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;
use crate::stream::StreamEvent;
use crate::task::{Message, Usage};

/// Everything a backend needs to run one turn.
#[derive(Debug, Clone)]
pub struct BackendInput {
    pub prompt: String,
    /// Working directory for the agent.
    pub workspace_path: PathBuf,
    pub model: Option<String>,
    /// Native session to resume, when the backend reported one earlier.
    pub resume_session: Option<String>,
}

/// Parameters handed to a backend factory.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub name: String,
    pub model: Option<String>,
}

/// A pluggable AI agent.
#[async_trait]
pub trait AgentBackend: Send {
    fn name(&self) -> &str;

    /// Run one turn, sending stream events as they arrive. Must stop promptly
    /// and return `BackendError::Cancelled` once `cancel` fires.
    async fn run(
        &mut self,
        cancel: &CancellationToken,
        input: BackendInput,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError>;

    /// Text of the last assistant message of the latest run.
    fn final_message(&self) -> Option<String>;

    /// Load conversation history produced by `encode_history`.
    fn restore_state(&mut self, history: &str) -> Result<(), BackendError>;

    /// Encode stored messages into this backend's history format. The
    /// default keeps the flat text and every content block, so tool calls
    /// and their results survive a continuation.
    fn encode_history(&self, messages: &[Message]) -> Result<String, BackendError> {
        let entries: Vec<_> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "content": m.text,
                    "blocks": m.blocks,
                })
            })
            .collect();
        Ok(serde_json::to_string(&entries)?)
    }

    /// Release any resources. Called once per run, on every exit path.
    async fn close(&mut self);

    /// Token usage accumulated so far.
    fn usage(&self) -> Usage;
}
