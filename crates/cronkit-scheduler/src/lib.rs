//! `cronkit-scheduler` — sharded, in-process periodic task scheduler on Tokio.
//!
//! # Overview
//!
//! A [`Scheduler`] owns a registry of named [`Task`]s and a fixed number of
//! time-ordered shards ([`heap::TaskHeap`]). A task lives in the shard
//! `epoch_seconds(trigger_time) % shard_count`; a one-second clock drains
//! the shard for the current second, hands due tasks to dispatch (a Tokio
//! task per fire, or a bounded [`pool::WorkerPool`]) and reinserts each with
//! its next fire time.
//!
//! Every execution goes through the task's [`Executor`], which enforces a
//! per-task concurrency cap and retries failed attempts.
//!
//! # Triggers
//!
//! | Trigger           | Source                       | Behaviour                                  |
//! |-------------------|------------------------------|--------------------------------------------|
//! | `CronTrigger`     | `"0 */5 * * * *"`, 5 or 6 fields | Next matching calendar second          |
//! | `IntervalTrigger` | `"@every 1m30s"`             | Fixed period, re-anchored on resume        |
//! | `OnceTrigger`     | absolute UTC instant         | Fires once, then never again               |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cronkit_scheduler::{handler_fn, Scheduler, Task};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let scheduler = Scheduler::default();
//! scheduler.add_task(Arc::new(Task::cron(
//!     "heartbeat",
//!     "@every 10s",
//!     true,
//!     handler_fn(|ctx| async move {
//!         tracing::info!(task = %ctx.task_name(), "alive");
//!         Ok(())
//!     }),
//! )?));
//! scheduler.start()?;
//! // ...
//! scheduler.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod heap;
pub mod pool;
pub mod service;
pub mod task;
pub mod trigger;
pub mod types;

#[cfg(test)]
mod test_support;

pub use context::{handler_fn, Handler, HandlerFuture, JobContext};
pub use engine::{PoolOptions, Scheduler, SchedulerOptions};
pub use error::{ExecError, Result, SchedulerError};
pub use executor::Executor;
pub use service::CronService;
pub use task::{Task, TaskConfig};
pub use trigger::{CronTrigger, IntervalTrigger, OnceTrigger, Trigger};
pub use types::{RunState, ScheduledEntry};
