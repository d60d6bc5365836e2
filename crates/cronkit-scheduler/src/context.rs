use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Future returned by a task handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// The work a task performs. Invoked once per attempt.
pub type Handler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

/// Called after every failed attempt that is going to be retried.
pub type RetryCallback = dyn Fn(&JobContext, &crate::error::ExecError) + Send + Sync;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Per-execution context handed to every handler attempt.
///
/// Cheap to clone; clones of one execution share the metadata slot, so a
/// value set on the first attempt is visible to its retries.
#[derive(Clone)]
pub struct JobContext {
    task_name: Arc<str>,
    execution_id: Uuid,
    scheduled_at: Option<DateTime<Utc>>,
    attempt: u32,
    cancel: CancellationToken,
    meta: Arc<Mutex<Option<serde_json::Value>>>,
}

impl JobContext {
    pub fn new(
        task_name: &str,
        scheduled_at: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_name: Arc::from(task_name),
            execution_id: Uuid::new_v4(),
            scheduled_at,
            attempt: 0,
            cancel,
            meta: Arc::new(Mutex::new(None)),
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// The fire time this execution was dispatched for; `None` when fired manually.
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    /// 0 for the first attempt, incremented per retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn meta(&self) -> Option<serde_json::Value> {
        self.meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_meta(&self, value: serde_json::Value) {
        *self.meta.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    pub(crate) fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("task_name", &self.task_name)
            .field("execution_id", &self.execution_id)
            .field("scheduled_at", &self.scheduled_at)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}
