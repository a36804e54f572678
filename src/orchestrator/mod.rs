//! Task orchestrator.
//!
//! Accepts tasks, dispatches runs onto a fixed worker pool, and exposes the
//! review operations (merge, resolve, push, cleanup) over the workspace
//! manager. All persistence during operation goes through the single result
//! writer; the store is read directly.

pub mod pool;
pub mod registry;
#[cfg(test)]
pub(crate) mod testing;
pub mod worker;
pub mod writer;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::BackendRegistry;
use crate::config::Config;
use crate::error::{BackendError, DatabaseError, Result, TaskError, WorkspaceError};
use crate::events::{EventBus, LogPayload, Subscription};
use crate::store::Store;
use crate::task::{AgentRun, Message, NewTask, Role, Task, TaskStatus};
use crate::workspace::WorkspaceManager;

use pool::WorkerPool;
use registry::RunningTasks;
use worker::{RunJob, WorkerDeps};
use writer::{ResultWriter, WriteOp, WriteResult};

/// Collaborators the orchestrator is built from.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Arc<dyn Store>,
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub backends: Arc<BackendRegistry>,
    pub bus: Arc<EventBus>,
}

pub struct Orchestrator {
    deps: WorkerDeps,
    pool: WorkerPool,
    running: Arc<RunningTasks>,
    writer: Mutex<Option<ResultWriter>>,
    /// Parent token for review operations; cancelled on shutdown.
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Orchestrator {
    /// Start the result writer and size the worker pool. Must be called
    /// within a tokio runtime.
    pub fn new(config: &Config, deps: OrchestratorDeps) -> Self {
        let (writer, handle) = ResultWriter::spawn(
            Arc::clone(&deps.store),
            Arc::clone(&deps.bus),
            config.result_queue_capacity,
        );
        info!(
            max_workers = config.max_workers,
            vcs = %deps.workspaces.kind(),
            "Orchestrator started"
        );
        Self {
            deps: WorkerDeps {
                store: deps.store,
                workspaces: deps.workspaces,
                backends: deps.backends,
                bus: deps.bus,
                writer: handle,
                stream_capacity: config.subscriber_capacity,
            },
            pool: WorkerPool::new(config.max_workers),
            running: Arc::new(RunningTasks::new()),
            writer: Mutex::new(Some(writer)),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TaskError::ShuttingDown.into());
        }
        Ok(())
    }

    async fn load_task(&self, task_id: Uuid) -> Result<Task> {
        self.deps
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id: task_id }.into())
    }

    async fn dispatch(&self, job: RunJob) -> Result<()> {
        let deps = self.deps.clone();
        self.pool.spawn(worker::execute(deps, job)).await?;
        Ok(())
    }

    /// Persist a new task and queue its first run. Waits for a free worker
    /// when the pool is saturated.
    pub async fn submit(&self, input: NewTask) -> Result<Task> {
        self.ensure_open()?;
        input.validate()?;

        let backend = self
            .deps
            .backends
            .resolve_name(input.backend.as_deref())
            .to_string();
        if !self.deps.backends.has(&backend) {
            return Err(BackendError::UnknownBackend(backend).into());
        }

        let mut task = Task::new(input);
        let run = AgentRun::new(task.id, task.intent.clone(), backend).with_model(task.model.clone());
        let message = Message::text(task.id, Some(run.id), Role::User, task.intent.clone());

        let result = self
            .deps
            .writer
            .submit(WriteOp::CreateTask {
                task: task.clone(),
                run: run.clone(),
                message,
            })
            .await?;
        if let WriteResult::Created { position } = result {
            task.position = position;
        }

        let guard = self.running.reserve(task.id)?;
        info!(task_id = %task.id, repo = %task.repo, backend = %run.backend, "Task submitted");
        self.dispatch(RunJob {
            task: task.clone(),
            run,
            history: None,
            guard,
        })
        .await?;
        Ok(task)
    }

    /// Start a follow-up run on a task that is not running, with the prior
    /// transcript restored into the backend.
    pub async fn continue_task(&self, task_id: Uuid, message: &str) -> Result<AgentRun> {
        if message.trim().is_empty() {
            return Err(TaskError::Validation("message is required".to_string()).into());
        }
        self.ensure_open()?;

        // Held across the status check so a concurrent merge cannot finish
        // the task in between.
        let guard = self.running.reserve(task_id)?;
        let task = self.load_task(task_id).await?;
        if !task.status.can_transition_to(TaskStatus::InProgress) {
            return Err(TaskError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: TaskStatus::InProgress,
            }
            .into());
        }

        let history = self.deps.store.list_messages(task_id).await?;
        let backend = self
            .deps
            .backends
            .resolve_name(task.backend.as_deref())
            .to_string();
        let run = AgentRun::new(task_id, message, backend).with_model(task.model.clone());
        let user = Message::text(task_id, Some(run.id), Role::User, message);

        self.deps
            .writer
            .submit(WriteOp::CreateRun {
                run: run.clone(),
                message: user,
            })
            .await?;

        info!(task_id = %task_id, run_id = %run.id, history = history.len(), "Task continued");
        self.dispatch(RunJob {
            task,
            run: run.clone(),
            history: Some(history),
            guard,
        })
        .await?;
        Ok(run)
    }

    /// Trigger the task's cancellation handle. Returns `false` when the task
    /// is not running.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let cancelled = self.running.cancel(task_id);
        if cancelled {
            info!(task_id = %task_id, "Cancellation requested");
        }
        cancelled
    }

    /// Merge a reviewed task into the main line and mark it done. The task's
    /// handle is held for the duration, so no run can start meanwhile.
    pub async fn merge(&self, task_id: Uuid) -> Result<()> {
        let _guard = self.running.reserve(task_id)?;
        let task = self.load_task(task_id).await?;
        if !task.status.can_transition_to(TaskStatus::Done) {
            return Err(TaskError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: TaskStatus::Done,
            }
            .into());
        }

        let cancel = self.shutdown.child_token();
        match self.deps.workspaces.merge_to_main(&cancel, task_id).await {
            Ok(()) => {
                self.deps
                    .writer
                    .submit(WriteOp::Transition {
                        task_id,
                        status: TaskStatus::Done,
                        note: None,
                    })
                    .await?;
                self.log(task_id, LogPayload::info("Merged into main")).await;
                info!(task_id = %task_id, "Task merged");
                Ok(())
            }
            Err(e) => {
                let payload = match &e {
                    WorkspaceError::MergeConflict { files, .. } => LogPayload::warn(format!(
                        "Merge conflict in {} file(s): {}",
                        files.len(),
                        files.join(", ")
                    )),
                    other => LogPayload::error(format!("Merge failed: {other}")),
                };
                warn!(task_id = %task_id, error = %e, "Merge did not complete");
                self.log(task_id, payload).await;
                Err(e.into())
            }
        }
    }

    /// Abandon a conflicted merge left in the task's workspace.
    pub async fn abort_merge(&self, task_id: Uuid) -> Result<()> {
        let _guard = self.running.reserve(task_id)?;
        self.load_task(task_id).await?;
        let cancel = self.shutdown.child_token();
        self.deps.workspaces.abort_merge(&cancel, task_id).await?;
        self.log(task_id, LogPayload::info("Merge aborted")).await;
        Ok(())
    }

    /// Record a manual conflict resolution. The task stays in review so it
    /// can be merged again.
    pub async fn resolve_merge(&self, task_id: Uuid, message: &str) -> Result<()> {
        if message.trim().is_empty() {
            return Err(TaskError::Validation("message is required".to_string()).into());
        }
        let _guard = self.running.reserve(task_id)?;
        self.load_task(task_id).await?;
        let cancel = self.shutdown.child_token();
        self.deps
            .workspaces
            .commit_merge_resolution(&cancel, task_id, message)
            .await?;
        self.log(task_id, LogPayload::info("Merge resolution committed"))
            .await;
        Ok(())
    }

    /// The task's diff against the main line.
    pub async fn diff(&self, task_id: Uuid) -> Result<String> {
        self.load_task(task_id).await?;
        let cancel = self.shutdown.child_token();
        Ok(self.deps.workspaces.diff(&cancel, task_id).await?)
    }

    /// Publish the task's branch to the remote.
    pub async fn push(&self, task_id: Uuid) -> Result<()> {
        let _guard = self.running.reserve(task_id)?;
        self.load_task(task_id).await?;
        let cancel = self.shutdown.child_token();
        self.deps.workspaces.push_branch(&cancel, task_id).await?;
        self.log(task_id, LogPayload::info("Branch pushed")).await;
        Ok(())
    }

    /// Remove the task's workspace and drop its buffered events.
    pub async fn cleanup(&self, task_id: Uuid) -> Result<()> {
        let _guard = self.running.reserve(task_id)?;
        self.load_task(task_id).await?;
        let cancel = self.shutdown.child_token();
        self.deps.workspaces.remove_workspace(&cancel, task_id).await?;
        self.deps.bus.forget(task_id);
        info!(task_id = %task_id, "Workspace cleaned up");
        Ok(())
    }

    async fn log(&self, task_id: Uuid, payload: LogPayload) {
        self.deps.writer.send(WriteOp::Log { task_id, payload }).await;
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.deps.store.get_task(task_id).await?)
    }

    pub async fn list_tasks(&self, repo: Option<&str>) -> Result<Vec<Task>> {
        Ok(self.deps.store.list_tasks(repo).await?)
    }

    /// Full transcript of a task across all runs.
    pub async fn messages(&self, task_id: Uuid) -> Result<Vec<Message>> {
        self.load_task(task_id).await?;
        Ok(self.deps.store.list_messages(task_id).await?)
    }

    pub async fn latest_run(&self, task_id: Uuid) -> Result<AgentRun> {
        self.deps
            .store
            .latest_agent_run(task_id)
            .await?
            .ok_or_else(|| {
                DatabaseError::NotFound {
                    entity: "agent_run".to_string(),
                    id: task_id.to_string(),
                }
                .into()
            })
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.running.is_running(task_id)
    }

    pub fn running_tasks(&self) -> Vec<Uuid> {
        self.running.list()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.deps.bus
    }

    pub fn subscribe(&self) -> Subscription {
        self.deps.bus.subscribe()
    }

    pub fn workspaces(&self) -> &Arc<dyn WorkspaceManager> {
        &self.deps.workspaces
    }

    /// Cancel every run, wait for workers to record their outcomes, flush
    /// the result queue and close subscriber streams. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(running = self.running.len(), "Orchestrator shutting down");
        self.running.cancel_all();
        self.shutdown.cancel();
        self.pool.close().await;
        if let Some(writer) = self.writer.lock().await.take() {
            writer.close().await;
        }
        self.deps.bus.shutdown();
        info!("Orchestrator stopped");
    }
}
