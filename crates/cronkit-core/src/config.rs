use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_THREAD_COUNT: i64 = -1; // -1: one worker per logical CPU
pub const DEFAULT_MAX_TASK_QUEUE_SIZE: usize = 10_000;
pub const DEFAULT_SHARD_COUNT: usize = 64;
pub const DEFAULT_MAX_CONCURRENT: usize = 1;

/// Top-level config (cronkit.toml + CRONKIT_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronkitConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Declarative task definitions keyed by task name. Handlers are bound
    /// to them at runtime by name.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskSpec>,
}

/// Scheduler engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global number of worker tasks executing fired tasks.
    ///
    /// `-1` uses the number of logical CPUs, `0` spawns a fresh Tokio task
    /// for every fire (no pool, no queue).
    #[serde(default = "default_thread_count")]
    pub thread_count: i64,
    /// Capacity of the worker pool queue. Only used when `thread_count != 0`.
    /// Fires arriving while the queue is full are dropped.
    #[serde(default = "default_max_task_queue_size")]
    pub max_task_queue_size: usize,
    /// Number of time-ordered heap shards.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            max_task_queue_size: DEFAULT_MAX_TASK_QUEUE_SIZE,
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

impl SchedulerConfig {
    /// Number of pool workers to spawn, or `None` for spawn-per-fire.
    pub fn worker_count(&self) -> Option<usize> {
        match self.thread_count {
            0 => None,
            n if n < 0 => Some(
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
            ),
            n => Some(n as usize),
        }
    }

    /// Queue capacity with `0` mapped back to the default.
    pub fn queue_size(&self) -> usize {
        if self.max_task_queue_size == 0 {
            DEFAULT_MAX_TASK_QUEUE_SIZE
        } else {
            self.max_task_queue_size
        }
    }
}

/// Declarative definition of one task.
///
/// `expression` wins over `once_at` when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Cron expression (seconds field first) or `@every <duration>`.
    pub expression: Option<String>,
    /// One-shot fire instant, RFC 3339 string.
    pub once_at: Option<DateTime<Utc>>,
    /// Retries after a failed attempt.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_interval_ms: u64,
    /// Executions of this task allowed to overlap. 0 means unlimited.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            expression: None,
            once_at: None,
            retry_count: 0,
            retry_interval_ms: 0,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            enabled: true,
        }
    }
}

fn default_thread_count() -> i64 {
    DEFAULT_THREAD_COUNT
}
fn default_max_task_queue_size() -> usize {
    DEFAULT_MAX_TASK_QUEUE_SIZE
}
fn default_shard_count() -> usize {
    DEFAULT_SHARD_COUNT
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}
fn bool_true() -> bool {
    true
}

impl CronkitConfig {
    /// Load config from a TOML file with CRONKIT_* env var overrides.
    ///
    /// A missing file is not an error: figment simply contributes nothing
    /// for it and the serde defaults apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CronkitConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CRONKIT_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        tracing::debug!(path = %path, tasks = config.tasks.len(), "config loaded");
        Ok(config)
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.scheduler.shard_count == 0 {
            return Err(crate::error::CoreError::Config(
                "scheduler.shard_count must be greater than zero".to_string(),
            ));
        }
        for (name, spec) in &self.tasks {
            if spec.expression.is_none() && spec.once_at.is_none() {
                return Err(crate::error::CoreError::Config(format!(
                    "task {name}: either expression or once_at is required"
                )));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronkit/cronkit.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_without_file() {
        Jail::expect_with(|_jail| {
            let config = CronkitConfig::load(Some("missing.toml")).expect("defaults");
            assert_eq!(config.scheduler.thread_count, DEFAULT_THREAD_COUNT);
            assert_eq!(config.scheduler.max_task_queue_size, DEFAULT_MAX_TASK_QUEUE_SIZE);
            assert_eq!(config.scheduler.shard_count, DEFAULT_SHARD_COUNT);
            assert!(config.tasks.is_empty());
            Ok(())
        });
    }

    #[test]
    fn file_and_env_are_merged() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cronkit.toml",
                r#"
                [scheduler]
                thread_count = 2

                [tasks.cleanup]
                expression = "0 */5 * * * *"
                retry_count = 3
                retry_interval_ms = 250

                [tasks.launch]
                once_at = "2030-01-01T00:00:00Z"
                enabled = false
                "#,
            )?;
            jail.set_env("CRONKIT_SCHEDULER__THREAD_COUNT", "8");

            let config = CronkitConfig::load(Some("cronkit.toml")).expect("config");
            assert_eq!(config.scheduler.thread_count, 8);

            let cleanup = &config.tasks["cleanup"];
            assert_eq!(cleanup.expression.as_deref(), Some("0 */5 * * * *"));
            assert_eq!(cleanup.retry_count, 3);
            assert_eq!(cleanup.retry_interval_ms, 250);
            assert_eq!(cleanup.max_concurrent, DEFAULT_MAX_CONCURRENT);
            assert!(cleanup.enabled);

            let launch = &config.tasks["launch"];
            assert!(launch.once_at.is_some());
            assert!(!launch.enabled);
            Ok(())
        });
    }

    #[test]
    fn zero_shards_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("cronkit.toml", "[scheduler]\nshard_count = 0\n")?;
            let err = CronkitConfig::load(Some("cronkit.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }

    #[test]
    fn task_without_schedule_rejected() {
        let mut config = CronkitConfig::default();
        config.tasks.insert("broken".to_string(), TaskSpec::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn worker_count_resolution() {
        let mut sched = SchedulerConfig::default();
        assert!(sched.worker_count().unwrap() >= 1);

        sched.thread_count = 0;
        assert_eq!(sched.worker_count(), None);

        sched.thread_count = 3;
        assert_eq!(sched.worker_count(), Some(3));

        sched.max_task_queue_size = 0;
        assert_eq!(sched.queue_size(), DEFAULT_MAX_TASK_QUEUE_SIZE);
    }
}
