//! In-memory workspace manager and scripted backend for orchestrator tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{AgentBackend, BackendInput, BackendRegistry, BackendSpec};
use crate::config::Config;
use crate::error::{BackendError, WorkspaceError};
use crate::events::EventBus;
use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::store::{LibSqlStore, Store};
use crate::stream::StreamEvent;
use crate::task::{BlockType, Role, Usage};
use crate::workspace::{VcsKind, WorkspaceManager};

pub(crate) const SESSION_ID: &str = "sess-1";

/// Records every call; workspaces are plain directories under a tempdir.
pub(crate) struct FakeWorkspace {
    dir: tempfile::TempDir,
    calls: Mutex<Vec<String>>,
    merge_failure: Mutex<Option<WorkspaceError>>,
    merge_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeWorkspace {
    pub(crate) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            calls: Mutex::new(Vec::new()),
            merge_failure: Mutex::new(None),
            merge_gate: Mutex::new(None),
        }
    }

    pub(crate) fn fail_next_merge(&self, error: WorkspaceError) {
        *self.merge_failure.lock().unwrap() = Some(error);
    }

    /// Later merges wait for a permit from `gate` before finishing.
    pub(crate) fn hold_merges(&self, gate: Arc<Semaphore>) {
        *self.merge_gate.lock().unwrap() = Some(gate);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str, task_id: Uuid) {
        self.calls.lock().unwrap().push(format!("{call} {task_id}"));
    }
}

#[async_trait]
impl WorkspaceManager for FakeWorkspace {
    fn kind(&self) -> VcsKind {
        VcsKind::Git
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn workspace_path(&self, task_id: Uuid) -> PathBuf {
        self.dir.path().join(format!("task-{task_id}"))
    }

    async fn create_workspace(
        &self,
        _cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<PathBuf, WorkspaceError> {
        self.record("create", task_id);
        let path = self.workspace_path(task_id);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    async fn remove_workspace(
        &self,
        _cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        self.record("remove", task_id);
        let _ = std::fs::remove_dir_all(self.workspace_path(task_id));
        Ok(())
    }

    async fn commit(
        &self,
        _cancel: &CancellationToken,
        task_id: Uuid,
        _message: &str,
    ) -> Result<bool, WorkspaceError> {
        self.record("commit", task_id);
        Ok(true)
    }

    async fn commit_merge_resolution(
        &self,
        _cancel: &CancellationToken,
        task_id: Uuid,
        _message: &str,
    ) -> Result<(), WorkspaceError> {
        self.record("resolve", task_id);
        Ok(())
    }

    async fn abort_merge(
        &self,
        _cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        self.record("abort", task_id);
        Ok(())
    }

    async fn current_branch(
        &self,
        _cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<String, WorkspaceError> {
        Ok(crate::workspace::branch_name(task_id))
    }

    async fn push_branch(
        &self,
        _cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        self.record("push", task_id);
        Ok(())
    }

    async fn diff(
        &self,
        _cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<String, WorkspaceError> {
        self.record("diff", task_id);
        Ok("diff --git a/README.md b/README.md\n+hello\n".to_string())
    }

    async fn merge_to_main(
        &self,
        _cancel: &CancellationToken,
        task_id: Uuid,
    ) -> Result<(), WorkspaceError> {
        self.record("merge", task_id);
        let gate = self.merge_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        match self.merge_failure.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// What a scripted backend does when run.
#[derive(Clone)]
pub(crate) enum Script {
    /// Stream one assistant message with this text.
    Reply(String),
    /// Stream a partial message, then wait for cancellation.
    Hang,
    /// Fail without streaming anything.
    Fail(String),
    /// Wait for a permit from the gate, then reply.
    Gated(Arc<Semaphore>, String),
}

/// Observations shared by every backend a registry creates.
#[derive(Default)]
pub(crate) struct Observed {
    pub created: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub restored: Mutex<Vec<String>>,
    pub resumed: Mutex<Vec<Option<String>>>,
}

impl Observed {
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedBackend {
    script: Script,
    observed: Arc<Observed>,
    final_message: Option<String>,
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(
        &mut self,
        cancel: &CancellationToken,
        input: BackendInput,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError> {
        self.observed.prompts.lock().unwrap().push(input.prompt.clone());
        self.observed.resumed.lock().unwrap().push(input.resume_session.clone());

        let text = match &self.script {
            Script::Reply(text) => text.clone(),
            Script::Fail(reason) => {
                return Err(BackendError::Failed {
                    backend: "scripted".into(),
                    reason: reason.clone(),
                });
            }
            Script::Hang => {
                let id = Uuid::new_v4().to_string();
                let _ = events
                    .send(StreamEvent::message_start(&id, Role::Assistant).with_session(SESSION_ID))
                    .await;
                let _ = events.send(StreamEvent::content_start(&id, BlockType::Text)).await;
                let _ = events.send(StreamEvent::content_delta(&id, BlockType::Text, "partial")).await;
                cancel.cancelled().await;
                return Err(BackendError::Cancelled);
            }
            Script::Gated(gate, text) => {
                tokio::select! {
                    permit = gate.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                    }
                    _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                }
                text.clone()
            }
        };

        let id = Uuid::new_v4().to_string();
        let stream = [
            StreamEvent::message_start(&id, Role::Assistant).with_session(SESSION_ID),
            StreamEvent::content_start(&id, BlockType::Text),
            StreamEvent::content_delta(&id, BlockType::Text, text.clone()),
            StreamEvent::content_end(&id),
            StreamEvent::message_end(&id).with_usage(Usage {
                input_tokens: 10,
                output_tokens: 5,
            }),
        ];
        for event in stream {
            if events.send(event).await.is_err() {
                break;
            }
        }
        self.final_message = Some(text);
        Ok(())
    }

    fn final_message(&self) -> Option<String> {
        self.final_message.clone()
    }

    fn restore_state(&mut self, history: &str) -> Result<(), BackendError> {
        self.observed.restored.lock().unwrap().push(history.to_string());
        Ok(())
    }

    async fn close(&mut self) {}

    fn usage(&self) -> Usage {
        Usage {
            input_tokens: 10,
            output_tokens: 5,
        }
    }
}

pub(crate) fn scripted_registry(script: Script, observed: Arc<Observed>) -> BackendRegistry {
    let registry = BackendRegistry::new("scripted");
    registry.register("scripted", move |_spec: &BackendSpec| {
        observed.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedBackend {
            script: script.clone(),
            observed: Arc::clone(&observed),
            final_message: None,
        }) as Box<dyn AgentBackend>)
    });
    registry
}

pub(crate) struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn Store>,
    pub bus: Arc<EventBus>,
    pub workspace: Arc<FakeWorkspace>,
    pub observed: Arc<Observed>,
}

pub(crate) async fn harness(script: Script, max_workers: usize) -> Harness {
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let bus = Arc::new(EventBus::new(100, 256));
    let workspace = Arc::new(FakeWorkspace::new());
    let observed = Arc::new(Observed::default());
    let config = Config {
        max_workers,
        default_backend: "scripted".to_string(),
        ..Config::default()
    };
    let orchestrator = Orchestrator::new(
        &config,
        OrchestratorDeps {
            store: Arc::clone(&store),
            workspaces: Arc::clone(&workspace) as Arc<dyn WorkspaceManager>,
            backends: Arc::new(scripted_registry(script, Arc::clone(&observed))),
            bus: Arc::clone(&bus),
        },
    );
    Harness {
        orchestrator,
        store,
        bus,
        workspace,
        observed,
    }
}

/// Wait until the task no longer holds a run handle.
pub(crate) async fn wait_idle(orchestrator: &Orchestrator, task_id: Uuid) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.is_running(task_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not finish in time");
}
