//! Bounded worker pool.
//!
//! Tasks are spawned onto the tokio runtime immediately but each waits for
//! a permit from a shared [`Semaphore`] before running, so at most `limit`
//! run at once. Results come back in completion order.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

pub struct WorkerPool<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(limit: usize) -> Self {
        Self::with_permits(Arc::new(Semaphore::new(limit.max(1))))
    }

    /// A pool drawing on permits shared with other pools.
    pub fn with_permits(permits: Arc<Semaphore>) -> Self {
        Self {
            permits,
            tasks: JoinSet::new(),
        }
    }

    pub fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            // the semaphore is never closed, so a permit always arrives
            let _permit = permits.acquire_owned().await.ok();
            task.await
        });
    }

    /// Waits for the next task to finish, in completion order. `None` once
    /// the pool is drained.
    pub async fn next_completed(&mut self) -> Option<Result<T, JoinError>> {
        self.tasks.join_next().await
    }

    /// Aborts every queued or running task.
    pub fn cancel(&mut self) {
        self.tasks.abort_all();
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
