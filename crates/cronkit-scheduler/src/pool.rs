//! Bounded worker pool used to cap global execution parallelism.
//!
//! ```text
//! try_submit(job) ──► [bounded queue] ──► worker 1..N ──► job.await
//!        │
//!        └── queue full → SubmitError::Full (job dropped by the caller)
//! ```
//!
//! Submission never blocks, so the scheduler clock cannot be stalled by a
//! saturated pool.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Unit of work accepted by the pool.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker pool queue is full")]
    Full,
    #[error("worker pool is closed")]
    Closed,
}

pub struct WorkerPool {
    /// `None` once closed.
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` Tokio tasks sharing one queue of `queue_size` slots.
    ///
    /// Must be called from within a Tokio runtime. Both sizes are clamped to
    /// at least 1.
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // Lock only while waiting for the next job, not while running it.
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!(worker = id, "pool job panicked");
                        }
                    }
                    debug!(worker = id, "pool worker exiting");
                })
            })
            .collect();

        Self { tx: Some(tx), workers }
    }

    /// Queue `job` without waiting for space.
    pub fn try_submit(&self, job: Job) -> Result<(), SubmitError> {
        let tx = self.tx.as_ref().ok_or(SubmitError::Closed)?;
        tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Jobs waiting in the queue (not counting ones being run).
    pub fn queued(&self) -> usize {
        self.tx
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Stop accepting jobs. Queued jobs still run; workers exit afterwards.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Close, then wait until every queued job has run and the workers exited.
    pub async fn shutdown(mut self) {
        self.close();
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("queued", &self.queued())
            .finish()
    }
}
