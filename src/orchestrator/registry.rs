//! Registry of running tasks and their cancellation handles.
//!
//! A handle is reserved before a run is dispatched and released when the
//! worker has recorded the outcome, so a task has at most one live handle
//! and can be cancelled while it is still queued for a worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::TaskError;

pub struct RunningTasks {
    tasks: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Parent of every run token; cancelling it cancels all runs.
    root: CancellationToken,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reserve the handle for a run. The reservation is released when the
    /// returned guard is dropped.
    pub fn reserve(self: &Arc<Self>, task_id: Uuid) -> Result<RunGuard, TaskError> {
        let mut tasks = self.tasks();
        if tasks.contains_key(&task_id) {
            return Err(TaskError::AlreadyRunning { id: task_id });
        }
        let token = self.root.child_token();
        tasks.insert(task_id, token.clone());
        debug!(task_id = %task_id, "Run handle reserved");
        Ok(RunGuard {
            registry: Arc::clone(self),
            task_id,
            token,
        })
    }

    /// Trigger a task's handle. Returns `false` if it is not running.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.tasks().get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.tasks().contains_key(&task_id)
    }

    pub fn list(&self) -> Vec<Uuid> {
        self.tasks().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every current and future run.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    fn release(&self, task_id: Uuid) {
        if self.tasks().remove(&task_id).is_some() {
            debug!(task_id = %task_id, "Run handle released");
        }
    }
}

impl Default for RunningTasks {
    fn default() -> Self {
        Self::new()
    }
}

/// Reservation of a task's run handle.
pub struct RunGuard {
    registry: Arc<RunningTasks>,
    task_id: Uuid,
    token: CancellationToken,
}

impl RunGuard {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.release(self.task_id);
    }
}
