//! `Store` trait, the async interface for task persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::task::{AgentRun, BackendSession, Message, Role, Task, TaskStatus, Usage};

/// Backend-agnostic persistence for tasks, runs, transcripts and sessions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a task and return its assigned position within the repo.
    async fn create_task(&self, task: &Task) -> Result<i64, DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Tasks ordered by position, optionally for one repo.
    async fn list_tasks(&self, repo: Option<&str>) -> Result<Vec<Task>, DatabaseError>;

    /// Set status and note. Fails with `NotFound` for unknown tasks.
    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        note: Option<&str>,
    ) -> Result<(), DatabaseError>;

    // ── Agent runs ──────────────────────────────────────────────────

    async fn create_agent_run(&self, run: &AgentRun) -> Result<(), DatabaseError>;

    /// Insert a task with its first run and prompt in one transaction and
    /// return the task's position. Nothing is kept if any insert fails.
    async fn create_task_with_run(
        &self,
        task: &Task,
        run: &AgentRun,
        message: &Message,
    ) -> Result<i64, DatabaseError>;

    /// Insert a follow-up run and its prompt in one transaction.
    async fn create_run_with_message(
        &self,
        run: &AgentRun,
        message: &Message,
    ) -> Result<(), DatabaseError>;

    async fn set_agent_run_session(&self, run_id: Uuid, session_id: &str)
    -> Result<(), DatabaseError>;

    async fn complete_agent_run(
        &self,
        run_id: Uuid,
        final_message: Option<&str>,
        usage: Usage,
    ) -> Result<(), DatabaseError>;

    /// Most recently created run of a task.
    async fn latest_agent_run(&self, task_id: Uuid) -> Result<Option<AgentRun>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn create_message(&self, message: &Message) -> Result<(), DatabaseError>;

    /// Store a plain-text message.
    async fn create_text_message(
        &self,
        task_id: Uuid,
        run_id: Option<Uuid>,
        role: Role,
        text: &str,
    ) -> Result<Message, DatabaseError> {
        let message = Message::text(task_id, run_id, role, text);
        self.create_message(&message).await?;
        Ok(message)
    }

    /// A task's transcript in insertion order.
    async fn list_messages(&self, task_id: Uuid) -> Result<Vec<Message>, DatabaseError>;

    // ── Backend sessions ────────────────────────────────────────────

    async fn upsert_session(&self, session: &BackendSession) -> Result<(), DatabaseError>;

    async fn get_session(
        &self,
        task_id: Uuid,
        backend: &str,
    ) -> Result<Option<BackendSession>, DatabaseError>;

    /// Returns whether a session was deleted.
    async fn delete_session(&self, task_id: Uuid, backend: &str) -> Result<bool, DatabaseError>;
}
