use std::sync::Arc;
use std::time::Duration;

use cronkit_core::{CronkitConfig, TaskSpec};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::Handler;
use crate::engine::{Scheduler, SchedulerOptions};
use crate::error::{Result, SchedulerError};
use crate::executor::Executor;
use crate::task::{Task, TaskConfig};
use crate::trigger::{parse_expression, OnceTrigger, Trigger};

/// Host-facing entry point: a [`Scheduler`] built from [`CronkitConfig`],
/// with tasks declared under `[tasks.<name>]` bound to handlers by name.
pub struct CronService {
    config: CronkitConfig,
    scheduler: Scheduler,
}

impl CronService {
    pub fn new(config: CronkitConfig) -> Result<Self> {
        Self::with_cancellation(config, CancellationToken::new())
    }

    pub fn with_cancellation(config: CronkitConfig, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;
        let options = SchedulerOptions::from(&config.scheduler);
        info!(
            shards = options.shard_count,
            workers = ?options.pool.map(|p| p.workers),
            tasks = config.tasks.len(),
            "cron service configured"
        );
        Ok(Self {
            scheduler: Scheduler::with_cancellation(options, cancel),
            config,
        })
    }

    /// Add a pre-built task. A name clash is an error here, unlike
    /// [`Scheduler::add_task`].
    pub fn inject(&self, task: Arc<Task>) -> Result<()> {
        let name = task.name().to_string();
        if !self.scheduler.add_task(task) {
            return Err(SchedulerError::DuplicateTask { name });
        }
        Ok(())
    }

    /// Bind `handler` to the configured task `name` and register it.
    pub fn register(&self, name: &str, handler: Handler) -> Result<Arc<Task>> {
        let spec = self
            .config
            .tasks
            .get(name)
            .ok_or_else(|| SchedulerError::TaskNotFound {
                name: name.to_string(),
            })?;
        let task = Arc::new(build_task(name, spec, handler)?);
        self.inject(task.clone())?;
        info!(task = %name, enabled = task.is_enabled(), "task registered");
        Ok(task)
    }

    /// Configured task names that have no registered handler yet.
    pub fn unregistered(&self) -> Vec<&str> {
        self.config
            .tasks
            .keys()
            .filter(|name| self.scheduler.get_task(name).is_none())
            .map(String::as_str)
            .collect()
    }

    pub fn start(&self) -> Result<()> {
        for name in self.unregistered() {
            warn!(task = %name, "configured task has no handler; it will not run");
        }
        self.scheduler.start()
    }

    pub async fn close(&self) -> Result<()> {
        self.scheduler.close().await
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &CronkitConfig {
        &self.config
    }
}

/// Turn a declarative task definition into a [`Task`].
///
/// `expression` wins over `once_at` when both are set.
pub fn build_task(name: &str, spec: &TaskSpec, handler: Handler) -> Result<Task> {
    let trigger: Box<dyn Trigger> = match (&spec.expression, spec.once_at) {
        (Some(expression), _) => parse_expression(expression)?,
        (None, Some(at)) => Box::new(OnceTrigger::new(at)),
        (None, None) => {
            return Err(SchedulerError::InvalidTaskSpec(format!(
                "task {name:?} needs an expression or once_at"
            )))
        }
    };
    Ok(Task::with_config(
        name,
        TaskConfig {
            trigger,
            executor: Executor::new(
                spec.retry_count,
                Duration::from_millis(spec.retry_interval_ms),
                spec.max_concurrent,
            ),
            handler,
            enabled: spec.enabled,
        },
    ))
}
