//! Bounded worker pool for non-blocking handlers.
//!
//! ```text
//! submit() → [queue permit] → spawn → [worker permit] → job → oneshot → JobHandle
//! ```
//!
//! At most `workers` jobs run at once. At most `workers + queue_capacity`
//! jobs are outstanding; beyond that [`WorkerPool::submit`] waits for a slot
//! instead of dropping the job.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{Semaphore, oneshot};
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::handler::callback::panic_message;

/// The pool no longer accepts jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

/// Why a job produced no output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The pool shut down before the job could run.
    #[error("job was cancelled")]
    Cancelled,
}

/// Completion channel of one submitted job.
pub struct JobHandle<T> {
    label: String,
    rx: oneshot::Receiver<Result<T, JobError>>,
}

impl<T> JobHandle<T> {
    /// Label given at submission.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits for the job to finish.
    pub async fn wait(self) -> Result<T, JobError> {
        self.rx.await.unwrap_or(Err(JobError::Cancelled))
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// A semaphore-bounded pool of tokio tasks.
pub struct WorkerPool {
    workers: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    size: usize,
    queue_capacity: usize,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Creates a pool running at most `size` jobs at once.
    ///
    /// A `size` of zero is raised to one.
    pub fn new(size: usize, queue_capacity: usize) -> Self {
        let size = size.max(1);
        Self {
            workers: Arc::new(Semaphore::new(size)),
            queue: Arc::new(Semaphore::new(size + queue_capacity)),
            size,
            queue_capacity,
            tracker: TaskTracker::new(),
        }
    }

    /// Submits a job, waiting while the pool is saturated.
    pub async fn submit<F, T>(&self, label: impl Into<String>, job: F) -> Result<JobHandle<T>, PoolClosed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(PoolClosed);
        }
        let slot = Arc::clone(&self.queue)
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed)?;

        let label = label.into();
        let workers = Arc::clone(&self.workers);
        let (tx, rx) = oneshot::channel();
        let job_label = label.clone();

        self.tracker.spawn(async move {
            let _slot = slot;
            let outcome = match workers.acquire_owned().await {
                Ok(_permit) => {
                    debug!(job = %job_label, "Job started");
                    AssertUnwindSafe(job).catch_unwind().await.map_err(|payload| {
                        let message = panic_message(payload.as_ref());
                        error!(job = %job_label, panic = %message, "Job panicked");
                        JobError::Panicked(message)
                    })
                }
                Err(_) => Err(JobError::Cancelled),
            };
            let _ = tx.send(outcome);
        });

        Ok(JobHandle { label, rx })
    }

    /// Maximum number of jobs running at once.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Jobs submitted but not finished, running or waiting.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Workers not currently running a job.
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Stops accepting jobs and waits for the outstanding ones.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.queue.close();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("queue_capacity", &self.queue_capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_single_worker_runs_jobs_serially() {
        let pool = WorkerPool::new(1, 8);
        let spans = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..2 {
            let spans = spans.clone();
            let handle = pool
                .submit(format!("job-{i}"), async move {
                    let start = Instant::now();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    spans.lock().push((start, Instant::now()));
                    i
                })
                .await
                .unwrap();
            handles.push(handle);
        }
        assert_eq!(pool.in_flight(), 2);

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().await, Ok(i));
        }
        let spans = spans.lock();
        assert!(spans[1].0 >= spans[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_waits_when_full() {
        let pool = WorkerPool::new(1, 0);
        let first = pool
            .submit("first", tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();

        let mut second = tokio_test::task::spawn(pool.submit("second", async { 2 }));
        tokio_test::assert_pending!(second.poll());

        first.wait().await.unwrap();
        assert!(second.is_woken());
        let second = tokio_test::assert_ready_ok!(second.poll());
        assert_eq!(second.wait().await, Ok(2));
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let pool = WorkerPool::new(2, 2);
        let handle = pool
            .submit("boom", async {
                if true {
                    panic!("worker exploded");
                }
            })
            .await
            .unwrap();
        assert_eq!(
            handle.wait().await,
            Err(JobError::Panicked("worker exploded".to_string()))
        );
        assert_eq!(pool.idle_workers(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_closes() {
        let pool = WorkerPool::new(2, 2);
        let done = Arc::new(Mutex::new(false));
        let flag = done.clone();
        pool.submit("last", async move {
            tokio::task::yield_now().await;
            *flag.lock() = true;
        })
        .await
        .unwrap();

        pool.shutdown().await;
        assert!(*done.lock());
        assert_eq!(pool.submit("late", async {}).await.unwrap_err(), PoolClosed);
    }
}
