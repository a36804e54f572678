//! Single result writer.
//!
//! Workers never touch the store directly once the orchestrator is running:
//! every write goes through this task's queue and is applied in order. Each
//! applied write is followed by the matching event on the bus.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{Error, TaskError};
use crate::events::{EventBus, EventType, LogPayload, StatusPayload};
use crate::store::Store;
use crate::task::{AgentRun, BackendSession, Message, Task, TaskStatus, Usage};

/// How a run ended, as recorded by `WriteOp::Finish`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub status: TaskStatus,
    pub note: Option<String>,
    pub final_message: Option<String>,
    pub usage: Usage,
    /// Published as a `log` event after the status change.
    pub log: Option<LogPayload>,
}

#[derive(Debug)]
pub enum WriteOp {
    CreateTask {
        task: Task,
        run: AgentRun,
        message: Message,
    },
    CreateRun {
        run: AgentRun,
        message: Message,
    },
    AppendMessage(Message),
    Transition {
        task_id: Uuid,
        status: TaskStatus,
        note: Option<String>,
    },
    RecordSession {
        run_id: Uuid,
        session: BackendSession,
    },
    Finish(RunOutcome),
    Log {
        task_id: Uuid,
        payload: LogPayload,
    },
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            Self::CreateTask { .. } => "create_task",
            Self::CreateRun { .. } => "create_run",
            Self::AppendMessage(_) => "append_message",
            Self::Transition { .. } => "transition",
            Self::RecordSession { .. } => "record_session",
            Self::Finish(_) => "finish",
            Self::Log { .. } => "log",
        }
    }
}

/// Result of an applied write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResult {
    /// A task was created at this position.
    Created { position: i64 },
    Applied,
}

struct WriteRequest {
    op: WriteOp,
    ack: Option<oneshot::Sender<Result<WriteResult, Error>>>,
}

/// Sending side of the writer queue.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Queue a write and wait until it has been applied.
    pub async fn submit(&self, op: WriteOp) -> Result<WriteResult, Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                op,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| TaskError::ShuttingDown)?;
        ack_rx.await.map_err(|_| TaskError::ShuttingDown)?
    }

    /// Queue a write without waiting for it. Failures are logged by the writer.
    pub async fn send(&self, op: WriteOp) {
        let name = op.name();
        if self.tx.send(WriteRequest { op, ack: None }).await.is_err() {
            warn!(op = name, "Result writer closed, write dropped");
        }
    }
}

/// Running writer task.
pub struct ResultWriter {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl ResultWriter {
    /// Spawn the writer. It runs until `close` is called.
    pub fn spawn(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        capacity: usize,
    ) -> (Self, WriterHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shutdown = CancellationToken::new();
        let writer = WriterLoop { store, bus };
        let handle = tokio::spawn(writer.run(rx, shutdown.clone()));
        (Self { shutdown, handle }, WriterHandle { tx })
    }

    /// Apply everything already queued, then stop.
    pub async fn close(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Result writer task failed");
        }
    }
}

struct WriterLoop {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
}

impl WriterLoop {
    async fn run(self, mut rx: mpsc::Receiver<WriteRequest>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                request = rx.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    rx.close();
                    while let Some(request) = rx.recv().await {
                        self.handle(request).await;
                    }
                    break;
                }
            }
        }
        debug!("Result writer stopped");
    }

    async fn handle(&self, request: WriteRequest) {
        let name = request.op.name();
        let result = self.apply(request.op).await;
        match request.ack {
            Some(ack) => {
                // The requester may have gone away; the write stands either way.
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    error!(op = name, error = %e, "Queued write failed");
                }
            }
        }
    }

    async fn apply(&self, op: WriteOp) -> Result<WriteResult, Error> {
        match op {
            WriteOp::CreateTask {
                mut task,
                run,
                message,
            } => {
                let position = self
                    .store
                    .create_task_with_run(&task, &run, &message)
                    .await?;
                task.position = position;
                let data = serde_json::to_string(&task).unwrap_or_default();
                self.bus.publish(task.id, EventType::TaskCreated, data);
                Ok(WriteResult::Created { position })
            }
            WriteOp::CreateRun { run, message } => {
                self.store.create_run_with_message(&run, &message).await?;
                Ok(WriteResult::Applied)
            }
            WriteOp::AppendMessage(message) => {
                self.store.create_message(&message).await?;
                Ok(WriteResult::Applied)
            }
            WriteOp::Transition {
                task_id,
                status,
                note,
            } => {
                self.transition(task_id, status, note).await?;
                Ok(WriteResult::Applied)
            }
            WriteOp::RecordSession { run_id, session } => {
                self.store
                    .set_agent_run_session(run_id, &session.native_session_id)
                    .await?;
                self.store.upsert_session(&session).await?;
                Ok(WriteResult::Applied)
            }
            WriteOp::Finish(outcome) => {
                self.store
                    .complete_agent_run(
                        outcome.run_id,
                        outcome.final_message.as_deref(),
                        outcome.usage,
                    )
                    .await?;
                self.transition(outcome.task_id, outcome.status, outcome.note)
                    .await?;
                if let Some(log) = outcome.log {
                    self.bus
                        .publish(outcome.task_id, EventType::Log, log.to_data());
                }
                Ok(WriteResult::Applied)
            }
            WriteOp::Log { task_id, payload } => {
                self.bus.publish(task_id, EventType::Log, payload.to_data());
                Ok(WriteResult::Applied)
            }
        }
    }

    async fn transition(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        note: Option<String>,
    ) -> Result<(), Error> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;

        if !task.status.can_transition_to(status) {
            return Err(TaskError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: status,
            }
            .into());
        }

        self.store
            .update_task_status(task_id, status, note.as_deref())
            .await?;
        debug!(task_id = %task_id, from = %task.status, to = %status, "Task status changed");
        self.bus.publish(
            task_id,
            EventType::StatusChange,
            StatusPayload::new(status, note).to_data(),
        );
        Ok(())
    }
}
