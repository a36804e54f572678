//! Task and agent-run records plus the task status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Note attached to a task whose run was stopped through `cancel`.
pub const CANCELLED_NOTE: &str = "cancelled";

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, waiting for a worker.
    Pending,
    /// Reserved for a planning pass before execution.
    Planning,
    /// An agent run is executing in the task's workspace.
    InProgress,
    /// The run ended; work is waiting to be merged or continued.
    Review,
    /// Work was merged into the main line.
    Done,
    /// The run failed.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Planning) | (Pending, InProgress) |
            (Planning, InProgress) | (Planning, Failed) |
            (InProgress, Review) | (InProgress, Failed) |
            // Merge, or continue with another run
            (Review, Done) | (Review, InProgress) |
            (Failed, InProgress)
        )
    }

    /// Whether a run is no longer executing in this status.
    pub fn ends_run(&self) -> bool {
        matches!(self, Self::Review | Self::Done | Self::Failed)
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "planning" => Some(Self::Planning),
            "in_progress" => Some(Self::InProgress),
            "review" => Some(Self::Review),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of agent work against one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Repository the task works against.
    pub repo: String,
    /// Free-text intent handed to the agent.
    pub intent: String,
    pub status: TaskStatus,
    /// Annotation for the current status (`cancelled`, or a failure reason).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_note: Option<String>,
    /// Ordering position within the repository's task list.
    pub position: i64,
    /// Backend requested at submission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a pending task from validated submission input.
    pub fn new(input: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repo: input.repo,
            intent: input.intent,
            status: TaskStatus::Pending,
            status_note: None,
            position: 0,
            backend: input.backend,
            model: input.model,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the last run of this task was cancelled.
    pub fn was_cancelled(&self) -> bool {
        self.status_note.as_deref() == Some(CANCELLED_NOTE)
    }
}

/// Submission input for a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub repo: String,
    pub intent: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl NewTask {
    pub fn new(repo: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            intent: intent.into(),
            backend: None,
            model: None,
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.repo.trim().is_empty() {
            return Err(TaskError::Validation("repo is required".to_string()));
        }
        if self.intent.trim().is_empty() {
            return Err(TaskError::Validation("intent is required".to_string()));
        }
        Ok(())
    }
}

/// Token counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub prompt: String,
    pub backend: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Backend-native session id used to resume conversational state.
    pub session_id: Option<String>,
    pub usage: Usage,
    pub final_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    pub fn new(task_id: Uuid, prompt: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            prompt: prompt.into(),
            backend: backend.into(),
            provider: None,
            model: None,
            session_id: None,
            usage: Usage::default(),
            final_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

/// Backend-native session bound to a task, used to resume a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSession {
    pub task_id: Uuid,
    pub backend: String,
    pub native_session_id: String,
    pub updated_at: DateTime<Utc>,
}
