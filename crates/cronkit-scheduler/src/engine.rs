use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cronkit_core::config::{SchedulerConfig, DEFAULT_SHARD_COUNT};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::context::JobContext;
use crate::error::{ExecError, Result, SchedulerError};
use crate::executor::Executor;
use crate::heap::TaskHeap;
use crate::pool::WorkerPool;
use crate::task::Task;
use crate::types::{RunState, ScheduledEntry};

/// Ticks land this far after each wall-clock second so that `Utc::now()`
/// inside the tick already reads the new second.
const TICK_SKEW: Duration = Duration::from_millis(2);

/// Runtime shape of a [`Scheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Number of shards; clamped to at least 1.
    pub shard_count: usize,
    /// Bounded pool for executions. `None` spawns one Tokio task per fire.
    pub pool: Option<PoolOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub workers: usize,
    pub queue_size: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            pool: None,
        }
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            shard_count: config.shard_count,
            pool: config.worker_count().map(|workers| PoolOptions {
                workers,
                queue_size: config.queue_size(),
            }),
        }
    }
}

/// Sharded in-process task scheduler driven by a clock that ticks on every
/// wall-clock second.
///
/// Cheap to clone; every clone controls the same registry. Tasks are kept in
/// `shard_count` min-heaps keyed by `epoch_seconds(trigger_time) % shard_count`
/// and every tick drains only the shard for the current second.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    options: SchedulerOptions,
    run_state: AtomicU8,
    registry: Mutex<Registry>,
    driver: Mutex<Option<oneshot::Sender<oneshot::Sender<()>>>>,
    cancel: CancellationToken,
}

/// Everything guarded by the one scheduler lock.
struct Registry {
    tasks: HashMap<String, Arc<Task>>,
    heaps: Vec<TaskHeap>,
    pool: Option<WorkerPool>,
    /// Closed pools whose queued jobs have not been awaited yet.
    draining: Vec<WorkerPool>,
}

impl Registry {
    fn shard_of(&self, at: DateTime<Utc>) -> usize {
        // heaps.len() >= 1, so both the cast and the remainder are in range.
        at.timestamp().rem_euclid(self.heaps.len() as i64) as usize
    }

    /// Compute the next fire time of `task` after `t` and push it into its shard.
    fn schedule(&mut self, task: &Arc<Task>, t: DateTime<Utc>) {
        if let Some(next) = task.make_next_trigger_time(t) {
            let shard = self.shard_of(next);
            self.heaps[shard].push(task.clone());
        }
    }

    fn evict(&mut self, task: &Arc<Task>) {
        if !task.is_scheduled() {
            return;
        }
        if let Some(at) = task.trigger_time() {
            let shard = self.shard_of(at);
            if self.heaps[shard].remove(task) {
                return;
            }
        }
        // The recorded time moved after the push (manual recompute); look everywhere.
        for heap in &mut self.heaps {
            if heap.remove(task) {
                return;
            }
        }
    }

    fn sorted_tasks(&self) -> Vec<Arc<Task>> {
        let mut tasks: Vec<_> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.name().cmp(b.name()));
        tasks
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerOptions::default())
    }
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self::with_cancellation(options, CancellationToken::new())
    }

    /// Like [`new`](Self::new), with every execution's cancellation token
    /// derived from `cancel`.
    pub fn with_cancellation(mut options: SchedulerOptions, cancel: CancellationToken) -> Self {
        options.shard_count = options.shard_count.max(1);
        let heaps = (0..options.shard_count).map(|_| TaskHeap::new()).collect();
        Self {
            inner: Arc::new(Inner {
                options,
                run_state: AtomicU8::new(RunState::Stopped as u8),
                registry: Mutex::new(Registry {
                    tasks: HashMap::new(),
                    heaps,
                    pool: None,
                    draining: Vec::new(),
                }),
                driver: Mutex::new(None),
                cancel,
            }),
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.inner.options
    }

    pub fn run_state(&self) -> RunState {
        self.inner.run_state()
    }

    // --- registry ----------------------------------------------------------

    /// Register `task`. Returns `false` (and leaves the existing task
    /// untouched) when the name is already taken.
    pub fn add_task(&self, task: Arc<Task>) -> bool {
        let mut reg = self.inner.registry();
        if reg.tasks.contains_key(task.name()) {
            warn!(task = %task.name(), "task already registered");
            return false;
        }
        reg.tasks.insert(task.name().to_string(), task.clone());
        if task.is_enabled() && self.run_state() == RunState::Started {
            task.reset_clock();
            reg.schedule(&task, Utc::now());
        }
        debug!(task = %task.name(), trigger_time = ?task.trigger_time(), "task added");
        true
    }

    /// Unregister `name`, evicting it from its shard. Idempotent.
    pub fn remove_task(&self, name: &str) -> Option<Arc<Task>> {
        let mut reg = self.inner.registry();
        let task = reg.tasks.remove(name)?;
        reg.evict(&task);
        debug!(task = %name, "task removed");
        Some(task)
    }

    /// Enable or disable a registered task.
    ///
    /// `task` must be the handle that was registered; a stale handle to a
    /// task that was since replaced under the same name is ignored and
    /// `false` is returned.
    pub fn enable_task(&self, task: &Arc<Task>, enabled: bool) -> bool {
        let mut reg = self.inner.registry();
        match reg.tasks.get(task.name()) {
            Some(current) if Arc::ptr_eq(current, task) => {}
            _ => {
                debug!(task = %task.name(), "ignoring enable on unregistered handle");
                return false;
            }
        }
        reg.evict(task);
        task.set_enabled(enabled);
        if enabled && self.run_state() == RunState::Started {
            task.reset_clock();
            reg.schedule(task, Utc::now());
        }
        info!(task = %task.name(), enabled, "task toggled");
        true
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let reg = self.inner.registry();
        let mut names: Vec<_> = reg.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered tasks, sorted by name.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.inner.registry().sorted_tasks()
    }

    pub fn get_task(&self, name: &str) -> Option<Arc<Task>> {
        self.inner.registry().tasks.get(name).cloned()
    }

    /// Every task currently waiting in a shard, earliest first.
    pub fn scheduled(&self) -> Vec<ScheduledEntry> {
        let reg = self.inner.registry();
        let mut entries: Vec<_> = reg
            .heaps
            .iter()
            .enumerate()
            .flat_map(|(shard, heap)| {
                heap.entries().map(move |(at, task)| ScheduledEntry {
                    name: task.name().to_string(),
                    trigger_time: at,
                    shard,
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.trigger_time
                .cmp(&b.trigger_time)
                .then_with(|| a.name.cmp(&b.name))
        });
        entries
    }

    /// Fire `name` once right now, bypassing its schedule, and wait for the
    /// outcome. The execution still goes through the task's executor, so
    /// the concurrency cap and retry policy apply.
    pub async fn trigger_task(&self, name: &str) -> Result<()> {
        let task = self
            .get_task(name)
            .ok_or_else(|| SchedulerError::TaskNotFound {
                name: name.to_string(),
            })?;
        let ctx = JobContext::new(task.name(), None, self.inner.cancel.child_token());
        let span = info_span!("cron_task", task = %task.name(), execution_id = %ctx.execution_id(), manual = true);
        async {
            info!("manual trigger");
            task.trigger(&ctx, Some(&log_retry)).await.map_err(|e| {
                warn!(error = %e, "manual trigger failed");
                SchedulerError::from(e)
            })
        }
        .instrument(span)
        .await
    }

    /// Resolve once every registered task's executor is idle.
    ///
    /// After [`close`](Self::close) this also runs out the jobs that were
    /// still queued in the worker pool.
    pub async fn wait_idle(&self) {
        let (pools, executors) = {
            let mut reg = self.inner.registry();
            let pools = std::mem::take(&mut reg.draining);
            let executors: Vec<Arc<Executor>> =
                reg.tasks.values().map(|t| t.executor().clone()).collect();
            (pools, executors)
        };
        for pool in pools {
            pool.shutdown().await;
        }
        for executor in executors {
            executor.wait().await;
        }
    }

    // --- lifecycle ---------------------------------------------------------

    /// Build the shards and start the one-second clock.
    ///
    /// Must be called from within a Tokio runtime. A no-op unless the
    /// scheduler is `Stopped`.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        if !self.inner.transition(RunState::Stopped, RunState::Starting) {
            debug!(state = %self.run_state(), "start ignored");
            return Ok(());
        }

        let pool = self
            .inner
            .options
            .pool
            .map(|p| WorkerPool::new(p.workers, p.queue_size));
        self.inner.registry().pool = pool;

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.inner.driver() = Some(stop_tx);
        let scheduled = self.inner.rebuild(RunState::Starting);
        runtime.spawn(drive(Arc::downgrade(&self.inner), stop_rx));

        info!(
            shards = self.inner.options.shard_count,
            pool = ?self.inner.options.pool,
            scheduled,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop the clock and release the worker pool.
    ///
    /// Waits for the driver loop to acknowledge, but not for executions that
    /// are already running; use [`wait_idle`](Self::wait_idle) for that.
    /// Accepted from `Started` and `Paused`; otherwise a no-op.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.transition(RunState::Started, RunState::Stopping)
            && !self.inner.transition(RunState::Paused, RunState::Stopping)
        {
            debug!(state = %self.run_state(), "close ignored");
            return Ok(());
        }

        let stop_tx = self.inner.driver().take();
        if let Some(stop_tx) = stop_tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if stop_tx.send(ack_tx).is_ok() {
                // An Err here means the loop already exited; nothing to wait for.
                let _ = ack_rx.await;
            }
        }

        {
            let mut reg = self.inner.registry();
            for heap in &mut reg.heaps {
                heap.clear();
            }
            if let Some(mut pool) = reg.pool.take() {
                debug!(queued = pool.queued(), "closing worker pool");
                pool.close();
                reg.draining.push(pool);
            }
        }
        self.inner.store(RunState::Stopped);
        info!("scheduler stopped");
        Ok(())
    }

    /// Suspend dispatching. The clock keeps ticking. Returns whether the
    /// scheduler was `Started`.
    pub fn pause(&self) -> bool {
        let paused = self.inner.transition(RunState::Started, RunState::Paused);
        if paused {
            info!("scheduler paused");
        }
        paused
    }

    /// Resume dispatching after [`pause`](Self::pause). Every schedule is
    /// re-anchored at the current instant, so the paused interval is not
    /// replayed as a burst of catch-up fires.
    pub fn resume(&self) -> bool {
        if !self.inner.transition(RunState::Paused, RunState::Resuming) {
            return false;
        }
        let scheduled = self.inner.rebuild(RunState::Resuming);
        info!(scheduled, "scheduler resumed");
        true
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.run_state())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn driver(&self) -> MutexGuard<'_, Option<oneshot::Sender<oneshot::Sender<()>>>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_state(&self) -> RunState {
        RunState::from_u8(self.run_state.load(Ordering::Acquire))
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.run_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn store(&self, state: RunState) {
        self.run_state.store(state as u8, Ordering::Release);
    }

    /// Clear every shard and reschedule each enabled task from now, then
    /// move `from` to `Started`. Both happen under the registry lock so a
    /// concurrent `add_task` sees either the old state or the rebuilt shards.
    fn rebuild(&self, from: RunState) -> usize {
        let mut reg = self.registry();
        for heap in &mut reg.heaps {
            heap.clear();
        }
        let now = Utc::now();
        for task in reg.sorted_tasks() {
            if task.is_enabled() {
                task.reset_clock();
                reg.schedule(&task, now);
            }
        }
        self.transition(from, RunState::Started);
        reg.heaps.iter().map(TaskHeap::len).sum()
    }

    /// Drain every due task from the shard of `now`'s second.
    fn heartbeat(&self, now: DateTime<Utc>) {
        // A catch-up pass runs with a `now` in the past; the following fire
        // must still land in a second whose tick is yet to come.
        let horizon = Utc::now().max(now);

        let mut guard = self.registry();
        let reg = &mut *guard;
        let shard = reg.shard_of(now);
        let mut fired = 0usize;
        loop {
            match reg.heaps[shard].peek() {
                Some((at, _)) if at <= now => {}
                _ => break,
            }
            let Some(task) = reg.heaps[shard].pop() else { break };
            let scheduled_at = task.trigger_time().unwrap_or(now);
            self.dispatch(reg.pool.as_ref(), &task, scheduled_at);
            reg.schedule(&task, horizon);
            fired += 1;
        }
        if fired > 0 {
            debug!(shard, fired, "heartbeat");
        }
    }

    fn dispatch(&self, pool: Option<&WorkerPool>, task: &Arc<Task>, scheduled_at: DateTime<Utc>) {
        let job = execute(task.clone(), scheduled_at, self.cancel.child_token());
        match pool {
            None => {
                tokio::spawn(job);
            }
            Some(pool) => {
                if let Err(e) = pool.try_submit(Box::pin(job)) {
                    warn!(task = %task.name(), %scheduled_at, error = %e, "fire dropped");
                }
            }
        }
    }
}

/// Last representable instant of the second `t` falls in.
fn second_end(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 999_999_999).unwrap_or(t)
}

/// Instant of the next wall-clock second boundary (plus [`TICK_SKEW`]).
fn next_wall_second() -> tokio::time::Instant {
    let subsec = u64::from(Utc::now().timestamp_subsec_nanos().min(999_999_999));
    tokio::time::Instant::now() + Duration::from_nanos(1_000_000_000 - subsec) + TICK_SKEW
}

/// The one-second clock. Holds only a weak reference so a scheduler that is
/// dropped without `close()` still lets the loop exit.
async fn drive(inner: Weak<Inner>, mut stop_rx: oneshot::Receiver<oneshot::Sender<()>>) {
    let mut last_second: Option<i64> = None;

    loop {
        // Re-aligned every round, so drift between the monotonic and the
        // wall clock cannot accumulate.
        tokio::select! {
            _ = tokio::time::sleep_until(next_wall_second()) => {
                let Some(inner) = inner.upgrade() else { break };
                let now = Utc::now();
                let second = now.timestamp();
                let lookback = inner.options.shard_count as i64;
                let first = match last_second {
                    Some(prev) if second > prev => (prev + 1).max(second - lookback + 1),
                    _ => second,
                };
                last_second = Some(second);

                if inner.run_state() != RunState::Started {
                    continue;
                }
                if first < second {
                    debug!(skipped = second - first, "clock stalled, catching up");
                }
                for s in first..=second {
                    let t = if s == second {
                        now
                    } else {
                        DateTime::from_timestamp(s, 0).map_or(now, second_end)
                    };
                    let inner = inner.clone();
                    tokio::spawn(async move { inner.heartbeat(t) });
                }
            }
            ack = &mut stop_rx => {
                if let Ok(ack) = ack {
                    let _ = ack.send(());
                }
                break;
            }
        }
    }
    debug!("scheduler clock stopped");
}

/// Run one scheduled fire of `task` and log the outcome.
async fn execute(task: Arc<Task>, scheduled_at: DateTime<Utc>, cancel: CancellationToken) {
    if !task.is_enabled() {
        debug!(task = %task.name(), "skipping fire of disabled task");
        return;
    }
    let ctx = JobContext::new(task.name(), Some(scheduled_at), cancel);
    let span = info_span!("cron_task", task = %task.name(), execution_id = %ctx.execution_id());
    async {
        let started = Instant::now();
        match task.trigger(&ctx, Some(&log_retry)).await {
            Ok(()) => debug!(elapsed_ms = started.elapsed().as_millis() as u64, "task finished"),
            Err(e) if e.is_admission_rejection() => warn!(
                running = task.executor().running(),
                max_concurrent = task.executor().max_concurrent(),
                rejected = task.executor().rejected(),
                "task skipped: over concurrency limit"
            ),
            Err(e) => error!(
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "task failed"
            ),
        }
    }
    .instrument(span)
    .await
}

fn log_retry(ctx: &JobContext, err: &ExecError) {
    warn!(attempt = ctx.attempt() + 1, error = %err, "task attempt failed, retrying");
}
