//! Per-task execution policy: concurrency cap plus retry with a fixed interval.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::Notify;

use crate::context::{Handler, JobContext, RetryCallback};
use crate::error::ExecError;

/// Runs a task's handler under its concurrency cap and retry policy.
///
/// Admission is not queued: when `max_concurrent` executions are already in
/// flight, [`Executor::execute`] fails immediately with
/// [`ExecError::OverConcurrencyLimit`].
pub struct Executor {
    /// 0 means unlimited.
    max_concurrent: usize,
    running: AtomicUsize,
    rejected: AtomicU64,
    max_retries: u32,
    retry_interval: Duration,
    idle: Notify,
}

impl Executor {
    pub fn new(max_retries: u32, retry_interval: Duration, max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            running: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            max_retries,
            retry_interval,
            idle: Notify::new(),
        }
    }

    /// Run one execution cycle: the first attempt plus up to `max_retries`
    /// retries. `on_retry` fires only for attempts that will be retried.
    pub async fn execute(
        &self,
        ctx: &JobContext,
        handler: &Handler,
        on_retry: Option<&RetryCallback>,
    ) -> Result<(), ExecError> {
        let _guard = self.admit()?;

        let mut attempt = 0;
        loop {
            let attempt_ctx = ctx.with_attempt(attempt);
            let err = match invoke(handler, attempt_ctx.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if attempt >= self.max_retries || ctx.is_cancelled() {
                return Err(err);
            }

            if let Some(callback) = on_retry {
                callback(&attempt_ctx, &err);
            }
            attempt += 1;

            if !self.retry_interval.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_interval) => {}
                    _ = ctx.cancellation().cancelled() => return Err(err),
                }
            }
        }
    }

    /// Resolves once no execution is in flight.
    pub async fn wait(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent decrement cannot be missed.
            notified.as_mut().enable();
            if self.running.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running() > 0
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Executions turned away at the concurrency cap since creation.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    fn admit(&self) -> Result<RunningGuard<'_>, ExecError> {
        let cap = self.max_concurrent;
        self.running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (cap == 0 || n < cap).then_some(n + 1)
            })
            .map_err(|_| {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                ExecError::OverConcurrencyLimit
            })?;
        Ok(RunningGuard { executor: self })
    }
}

impl Default for Executor {
    /// No retries, one execution at a time.
    fn default() -> Self {
        Self::new(0, Duration::ZERO, 1)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("max_concurrent", &self.max_concurrent)
            .field("running", &self.running())
            .field("rejected", &self.rejected())
            .field("max_retries", &self.max_retries)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

/// Releases an admission slot on drop, including when the execution future
/// is dropped mid-flight.
struct RunningGuard<'a> {
    executor: &'a Executor,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.executor.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.executor.idle.notify_waiters();
        }
    }
}

/// Call the handler once, turning panics (while building or polling the
/// future) into [`ExecError::Panicked`].
async fn invoke(handler: &Handler, ctx: JobContext) -> Result<(), ExecError> {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx))) {
        Ok(fut) => fut,
        Err(payload) => return Err(ExecError::Panicked(panic_message(payload.as_ref()))),
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ExecError::Failed(e)),
        Err(payload) => Err(ExecError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
