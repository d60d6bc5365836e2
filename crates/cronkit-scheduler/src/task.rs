use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::context::{Handler, JobContext, RetryCallback};
use crate::error::{ExecError, Result};
use crate::executor::Executor;
use crate::trigger::{parse_expression, OnceTrigger, Trigger};

/// `heap_index` value of a task that sits in no shard.
pub(crate) const NOT_SCHEDULED: usize = usize::MAX;

/// Explicit parts of a task, for custom retry / concurrency policies.
pub struct TaskConfig {
    pub trigger: Box<dyn Trigger>,
    pub executor: Executor,
    pub handler: Handler,
    pub enabled: bool,
}

/// A named unit of recurring or one-shot work.
///
/// Shared as `Arc<Task>` between the caller and the scheduler. The
/// scheduler identifies tasks by name but checks identity with
/// `Arc::ptr_eq`, so a stale handle to a replaced task is harmless.
pub struct Task {
    name: String,
    handler: Handler,
    executor: Arc<Executor>,
    enabled: AtomicBool,
    state: Mutex<TriggerState>,
    /// Position inside the owning shard; only touched under the scheduler lock.
    heap_index: AtomicUsize,
}

struct TriggerState {
    trigger_time: Option<DateTime<Utc>>,
    trigger: Box<dyn Trigger>,
}

impl Task {
    /// Recurring task from a cron or `@every` expression, default executor
    /// (no retries, one execution at a time).
    pub fn cron(
        name: impl Into<String>,
        expression: &str,
        enabled: bool,
        handler: Handler,
    ) -> Result<Self> {
        let trigger = parse_expression(expression)?;
        Ok(Self::with_config(
            name,
            TaskConfig {
                trigger,
                executor: Executor::default(),
                handler,
                enabled,
            },
        ))
    }

    /// One-shot task firing at `at`, default executor.
    pub fn once(
        name: impl Into<String>,
        at: DateTime<Utc>,
        enabled: bool,
        handler: Handler,
    ) -> Self {
        Self::with_config(
            name,
            TaskConfig {
                trigger: Box::new(OnceTrigger::new(at)),
                executor: Executor::default(),
                handler,
                enabled,
            },
        )
    }

    pub fn with_config(name: impl Into<String>, config: TaskConfig) -> Self {
        Self {
            name: name.into(),
            handler: config.handler,
            executor: Arc::new(config.executor),
            enabled: AtomicBool::new(config.enabled),
            state: Mutex::new(TriggerState {
                trigger_time: None,
                trigger: config.trigger,
            }),
            heap_index: AtomicUsize::new(NOT_SCHEDULED),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Last computed fire time.
    pub fn trigger_time(&self) -> Option<DateTime<Utc>> {
        self.state().trigger_time
    }

    /// Whether the task currently sits in one of the scheduler's shards.
    pub fn is_scheduled(&self) -> bool {
        self.heap_index().is_some()
    }

    /// Compute and record the next fire time after `t`.
    ///
    /// A disabled task never schedules itself. The scheduler clock ticks on
    /// whole seconds, so the recorded time is rounded up to the next whole
    /// second: never earlier than the trigger asked for, and always after `t`.
    /// `None` also covers a fire time that cannot be represented.
    pub fn make_next_trigger_time(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.state();
        let recorded = ceil_to_second(state.trigger.next_after(t)?)?;
        state.trigger_time = Some(recorded);
        Some(recorded)
    }

    /// Run one execution cycle through the executor and wait for it.
    pub async fn trigger(
        &self,
        ctx: &JobContext,
        on_retry: Option<&RetryCallback>,
    ) -> std::result::Result<(), ExecError> {
        self.executor.execute(ctx, &self.handler, on_retry).await
    }

    pub(crate) fn reset_clock(&self) {
        self.state().trigger.reset_clock();
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn heap_index(&self) -> Option<usize> {
        match self.heap_index.load(Ordering::Acquire) {
            NOT_SCHEDULED => None,
            i => Some(i),
        }
    }

    pub(crate) fn set_heap_index(&self, index: usize) {
        self.heap_index.store(index, Ordering::Release);
    }

    fn state(&self) -> MutexGuard<'_, TriggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .field("trigger_time", &self.trigger_time())
            .field("scheduled", &self.is_scheduled())
            .field("executor", &self.executor)
            .finish()
    }
}

fn ceil_to_second(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let whole = DateTime::from_timestamp(t.timestamp(), 0)?;
    if whole == t {
        Some(t)
    } else {
        whole.checked_add_signed(Duration::seconds(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::handler_fn;
    use crate::test_support::RecordingTrigger;
    use chrono::TimeZone;
    use tokio_util::sync::CancellationToken;

    fn noop() -> Handler {
        handler_fn(|_ctx| async { Ok(()) })
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn disabled_task_never_schedules() {
        let (trigger, recorder) = RecordingTrigger::every_secs(1);
        let task = Task::with_config(
            "off",
            TaskConfig {
                trigger: Box::new(trigger),
                executor: Executor::default(),
                handler: noop(),
                enabled: false,
            },
        );
        assert_eq!(task.make_next_trigger_time(base()), None);
        assert_eq!(task.trigger_time(), None);
        assert_eq!(recorder.next_calls(), 0);
    }

    #[test]
    fn next_time_is_rounded_up_to_the_second() {
        let task = Task::cron("tick", "@every 1500ms", true, noop()).unwrap();
        let next = task.make_next_trigger_time(base()).unwrap();
        assert_eq!(next, base() + Duration::seconds(2));
        assert_eq!(task.trigger_time(), Some(next));
    }

    #[test]
    fn late_in_the_second_never_rounds_early() {
        let at = base() + Duration::milliseconds(2_900);
        let task = Task::once("late", at, true, noop());
        let next = task.make_next_trigger_time(base()).unwrap();
        assert!(next >= at);
        assert_eq!(next, base() + Duration::seconds(3));
    }

    #[test]
    fn fire_time_never_shares_the_current_second() {
        let task = Task::once("soon", base() + Duration::milliseconds(300), true, noop());
        let next = task.make_next_trigger_time(base() + Duration::milliseconds(100));
        assert_eq!(next, Some(base() + Duration::seconds(1)));
    }

    #[test]
    fn once_task_exhausts_after_its_instant() {
        let at = base() + Duration::seconds(30);
        let task = Task::once("launch", at, true, noop());
        assert_eq!(task.make_next_trigger_time(base()), Some(at));
        assert_eq!(task.make_next_trigger_time(at), None);
        // The last known fire time is kept for shard lookups.
        assert_eq!(task.trigger_time(), Some(at));
    }

    #[test]
    fn reset_clock_reaches_trigger() {
        let (trigger, recorder) = RecordingTrigger::every_secs(5);
        let task = Task::with_config(
            "recorded",
            TaskConfig {
                trigger: Box::new(trigger),
                executor: Executor::default(),
                handler: noop(),
                enabled: true,
            },
        );
        task.reset_clock();
        task.reset_clock();
        assert_eq!(recorder.resets(), 2);
    }

    #[test]
    fn invalid_expression_fails_construction() {
        assert!(Task::cron("bad", "every tuesday", true, noop()).is_err());
    }

    #[test]
    fn heap_index_bookkeeping() {
        let task = Task::once("idx", base(), true, noop());
        assert!(!task.is_scheduled());
        task.set_heap_index(3);
        assert_eq!(task.heap_index(), Some(3));
        task.set_heap_index(NOT_SCHEDULED);
        assert!(!task.is_scheduled());
    }

    #[tokio::test]
    async fn manual_trigger_runs_handler() {
        let task = Task::cron(
            "manual",
            "0 0 * * * *",
            true,
            handler_fn(|ctx| async move {
                anyhow::ensure!(ctx.task_name() == "manual", "wrong context");
                Ok(())
            }),
        )
        .unwrap();
        let ctx = JobContext::new(task.name(), None, CancellationToken::new());
        task.trigger(&ctx, None).await.unwrap();
        assert!(!task.executor().is_running());
    }
}
