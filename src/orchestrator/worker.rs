//! Execution of one agent run.
//!
//! The worker moves the task to `in_progress`, prepares the workspace, runs
//! the backend while draining its stream, commits the result and reports
//! the outcome to the result writer. The reservation guard is dropped only
//! after the outcome has been applied.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{AgentBackend, BackendInput, BackendRegistry};
use crate::error::{BackendError, Error, WorkspaceError};
use crate::events::{EventBus, EventType, LogPayload};
use crate::orchestrator::registry::RunGuard;
use crate::orchestrator::writer::{RunOutcome, WriteOp, WriterHandle};
use crate::store::Store;
use crate::stream::{StreamAssembler, StreamEvent};
use crate::task::{AgentRun, BackendSession, CANCELLED_NOTE, Message, Task, TaskStatus, Usage};
use crate::workspace::WorkspaceManager;

/// Shared dependencies handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn Store>,
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub backends: Arc<BackendRegistry>,
    pub bus: Arc<EventBus>,
    pub writer: WriterHandle,
    pub stream_capacity: usize,
}

/// A dispatched run.
pub struct RunJob {
    pub task: Task,
    pub run: AgentRun,
    /// Prior transcript, present for continuations.
    pub history: Option<Vec<Message>>,
    pub guard: RunGuard,
}

enum RunEnd {
    Completed { committed: bool, diff: String },
    Cancelled,
    Failed(String),
}

struct RunReport {
    end: RunEnd,
    final_message: Option<String>,
    usage: Usage,
}

/// Execute a run to completion and record its outcome.
pub async fn execute(deps: WorkerDeps, job: RunJob) {
    let RunJob {
        task,
        run,
        history,
        guard,
    } = job;
    let cancel = guard.token().clone();

    info!(task_id = %task.id, run_id = %run.id, "Run started");

    if let Err(e) = deps
        .writer
        .submit(WriteOp::Transition {
            task_id: task.id,
            status: TaskStatus::InProgress,
            note: None,
        })
        .await
    {
        error!(task_id = %task.id, error = %e, "Could not start run");
        deps.writer
            .send(WriteOp::Log {
                task_id: task.id,
                payload: LogPayload::error(format!("Could not start run: {e}")),
            })
            .await;
        return;
    }

    let report = run_agent(&deps, &task, &run, history, &cancel).await;
    let outcome = outcome_for(&task, &run, report);
    let status = outcome.status;

    if let Err(e) = deps.writer.submit(WriteOp::Finish(outcome)).await {
        error!(task_id = %task.id, error = %e, "Failed to record run outcome");
    }
    info!(task_id = %task.id, status = %status, "Run finished");
    drop(guard);
}

fn outcome_for(task: &Task, run: &AgentRun, report: RunReport) -> RunOutcome {
    let (status, note, log) = match report.end {
        RunEnd::Completed { committed, diff } => {
            let files = changed_files(&diff);
            let message = if committed {
                format!("Run completed, {files} file(s) changed")
            } else {
                "Run completed without changes".to_string()
            };
            (TaskStatus::Review, None, LogPayload::info(message))
        }
        RunEnd::Cancelled => (
            TaskStatus::Review,
            Some(CANCELLED_NOTE.to_string()),
            LogPayload::warn("Run cancelled"),
        ),
        RunEnd::Failed(reason) => (
            TaskStatus::Failed,
            Some(reason.clone()),
            LogPayload::error(format!("Run failed: {reason}")),
        ),
    };
    RunOutcome {
        task_id: task.id,
        run_id: run.id,
        status,
        note,
        final_message: report.final_message,
        usage: report.usage,
        log: Some(log),
    }
}

fn changed_files(diff: &str) -> usize {
    diff.lines().filter(|l| l.starts_with("diff --git ")).count()
}

fn workspace_end(e: WorkspaceError) -> RunEnd {
    match e {
        WorkspaceError::Cancelled => RunEnd::Cancelled,
        other => RunEnd::Failed(other.to_string()),
    }
}

async fn run_agent(
    deps: &WorkerDeps,
    task: &Task,
    run: &AgentRun,
    history: Option<Vec<Message>>,
    cancel: &CancellationToken,
) -> RunReport {
    let empty = |end| RunReport {
        end,
        final_message: None,
        usage: Usage::default(),
    };

    let workspace_path = match deps.workspaces.create_workspace(cancel, task.id).await {
        Ok(path) => path,
        Err(e) => return empty(workspace_end(e)),
    };

    let mut backend = match deps.backends.create(Some(run.backend.as_str()), run.model.clone()) {
        Ok(backend) => backend,
        Err(e) => return empty(RunEnd::Failed(e.to_string())),
    };

    let resume_session = match &history {
        Some(messages) => match prepare_continuation(deps, backend.as_mut(), task.id, messages).await {
            Ok(session) => session,
            Err(e) => {
                backend.close().await;
                return empty(RunEnd::Failed(e.to_string()));
            }
        },
        None => None,
    };

    let input = BackendInput {
        prompt: run.prompt.clone(),
        workspace_path,
        model: run.model.clone(),
        resume_session,
    };

    let (tx, rx) = mpsc::channel(deps.stream_capacity.max(1));
    let mut assembler = StreamAssembler::new();
    let (result, ()) = tokio::join!(
        backend.run(cancel, input, tx),
        drain_stream(deps, task.id, run, rx, &mut assembler),
    );

    let final_message = backend.final_message();
    let usage = backend.usage();
    backend.close().await;

    let end = match result {
        _ if cancel.is_cancelled() => RunEnd::Cancelled,
        Err(BackendError::Cancelled) => RunEnd::Cancelled,
        Err(e) => RunEnd::Failed(e.to_string()),
        Ok(()) => finish_workspace(deps, task, cancel).await,
    };

    if !matches!(end, RunEnd::Completed { .. }) {
        let dropped = assembler.abort();
        if dropped > 0 {
            debug!(task_id = %task.id, dropped, "Discarded partial messages");
        }
    }

    RunReport {
        end,
        final_message,
        usage,
    }
}

/// Restore the backend's conversation and find the session to resume.
async fn prepare_continuation(
    deps: &WorkerDeps,
    backend: &mut dyn AgentBackend,
    task_id: Uuid,
    messages: &[Message],
) -> Result<Option<String>, Error> {
    let encoded = backend.encode_history(messages)?;
    backend.restore_state(&encoded)?;

    let session = deps.store.get_session(task_id, backend.name()).await?;
    Ok(session.map(|s| s.native_session_id))
}

/// Commit the run's changes and compute the diff for review.
async fn finish_workspace(deps: &WorkerDeps, task: &Task, cancel: &CancellationToken) -> RunEnd {
    let committed = match deps
        .workspaces
        .commit(cancel, task.id, &commit_message(task))
        .await
    {
        Ok(committed) => committed,
        Err(e) => return workspace_end(e),
    };
    match deps.workspaces.diff(cancel, task.id).await {
        Ok(diff) => RunEnd::Completed { committed, diff },
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Diff unavailable after commit");
            RunEnd::Completed {
                committed,
                diff: String::new(),
            }
        }
    }
}

fn commit_message(task: &Task) -> String {
    let summary: String = task
        .intent
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(72)
        .collect();
    format!("agent: {summary}\n\nTask: {}", task.id)
}

/// Forward stream events to observers and persist finished messages.
async fn drain_stream(
    deps: &WorkerDeps,
    task_id: Uuid,
    run: &AgentRun,
    mut rx: mpsc::Receiver<StreamEvent>,
    assembler: &mut StreamAssembler,
) {
    let mut last_session: Option<String> = None;

    while let Some(event) = rx.recv().await {
        if let Some(session_id) = &event.session_id {
            if last_session.as_ref() != Some(session_id) {
                last_session = Some(session_id.clone());
                deps.writer
                    .send(WriteOp::RecordSession {
                        run_id: run.id,
                        session: BackendSession {
                            task_id,
                            backend: run.backend.clone(),
                            native_session_id: session_id.clone(),
                            updated_at: Utc::now(),
                        },
                    })
                    .await;
            }
        }

        match serde_json::to_string(&event) {
            Ok(data) => {
                deps.bus.publish(task_id, EventType::AgentUpdate, data);
            }
            Err(e) => warn!(error = %e, "Unserializable stream event"),
        }

        if let Some(message) = assembler.apply(&event) {
            deps.writer
                .send(WriteOp::AppendMessage(Message::new(
                    task_id,
                    Some(run.id),
                    message.role,
                    message.blocks,
                )))
                .await;
        }
    }
}
