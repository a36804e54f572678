//! Fixed-size worker pool.
//!
//! `spawn` waits for a free worker before starting the job, so callers are
//! back-pressured when every worker is busy.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::TaskError;

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    jobs: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            jobs: Mutex::new(JoinSet::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on a worker, waiting for one to become free.
    pub async fn spawn<F>(&self, job: F) -> Result<(), TaskError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TaskError::ShuttingDown)?;
        self.launch(permit, job).await
    }

    /// Start `job` on the worker `permit` stands for. `close` may have run
    /// since the permit was granted; once it has drained the set, nothing
    /// would wait for a late job, so it is refused.
    async fn launch<F>(&self, permit: OwnedSemaphorePermit, job: F) -> Result<(), TaskError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut jobs = self.jobs.lock().await;
        if self.permits.is_closed() {
            debug!("Pool closed while waiting for a worker");
            return Err(TaskError::ShuttingDown);
        }
        while let Some(finished) = jobs.try_join_next() {
            if let Err(e) = finished {
                warn!(error = %e, "Worker job panicked");
            }
        }
        jobs.spawn(async move {
            let _permit = permit;
            job.await;
        });
        debug!(busy = self.size - self.available(), "Job dispatched");
        Ok(())
    }

    /// Refuse new jobs and wait for running ones to finish.
    pub async fn close(&self) {
        self.permits.close();
        let mut jobs = self.jobs.lock().await;
        while let Some(finished) = jobs.join_next().await {
            if let Err(e) = finished {
                warn!(error = %e, "Worker job panicked");
            }
        }
    }
}
