//! Worker pool for one execution domain
//!
//! Tasks run on a bounded number of execution slots (`num_workers`). Many
//! more tasks than slots may be outstanding: when a running task reaches a
//! suspension point it hands its slot back to the pool, and the pool starts
//! a compensating worker thread if runnable work is queued and no idle
//! worker can take it. A resumed task re-acquires a slot before it
//! continues, ahead of idle workers.

pub mod queue;
pub mod task;
pub mod work_stealer;

pub use queue::TaskQueue;
pub use task::{
    BlockedOn, Task, TaskBody, TaskBuilder, TaskContext, TaskHandle, TaskId, TaskState,
    TerminalObserver,
};
pub use work_stealer::{StealStats, WorkStealer};

use std::cell::RefCell;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::runtime::domain::DomainId;
use crate::runtime::errors::{fatal, FatalError, RuntimeError, RuntimeResult, TaskError, TaskResult};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of execution slots (tasks running at once).
    pub num_workers: usize,
    /// Number of sub-regions (NUMA-like locality queues).
    pub sub_regions: usize,
    /// Worker thread stack size.
    pub default_stack_size: usize,
    /// Tasks moved per successful steal.
    pub steal_batch: usize,
    /// Queue length above which an affinity hint is not honored.
    pub max_queue_size: usize,
    /// Live-task table capacity.
    pub max_tasks: usize,
    /// Upper bound on worker threads, compensating threads included.
    pub max_threads: usize,
    /// How long a surplus idle thread lingers before it retires.
    pub idle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            num_workers: num_cpus,
            sub_regions: 1,
            default_stack_size: 2 * 1024 * 1024,
            steal_batch: 4,
            max_queue_size: 1024,
            max_tasks: 1 << 20,
            max_threads: 1024,
            idle_timeout: Duration::from_millis(50),
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total tasks accepted by `spawn`.
    pub tasks_spawned: AtomicUsize,
    /// Total tasks that completed successfully.
    pub tasks_completed: AtomicUsize,
    /// Total tasks that failed.
    pub tasks_failed: AtomicUsize,
    /// Total tasks taken from another sub-region.
    pub tasks_stolen: AtomicUsize,
    /// Total suspensions.
    pub suspensions: AtomicUsize,
    /// Worker threads started beyond the initial set.
    pub compensating_threads: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Peak number of live tasks.
    pub peak_live: AtomicUsize,
}

impl SchedulerStats {
    #[inline]
    fn record_spawned(&self) {
        self.tasks_spawned.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    fn record_terminal(
        &self,
        failed: bool,
        duration_us: usize,
    ) {
        if failed {
            self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::SeqCst);
    }

    /// Update the live-task peak.
    #[inline]
    fn update_peak_live(
        &self,
        current: usize,
    ) {
        self.peak_live.fetch_max(current, Ordering::SeqCst);
    }

    /// Tasks that reached a terminal state.
    pub fn tasks_finished(&self) -> usize {
        self.tasks_completed.load(Ordering::SeqCst) + self.tasks_failed.load(Ordering::SeqCst)
    }
}

/// Mutable pool state, guarded by one lock.
#[derive(Debug)]
struct PoolState {
    /// Runnable tasks, per sub-region.
    stealer: WorkStealer,
    /// Slots currently held by running tasks.
    active: usize,
    /// Worker threads parked waiting for work.
    idle: usize,
    /// Worker threads alive.
    threads: usize,
    /// Resumed tasks waiting for a slot.
    resuming: usize,
    /// Home assignment cursor for new worker threads.
    next_worker: usize,
    /// Set by `shutdown`.
    shutdown: bool,
}

struct PoolShared {
    domain: DomainId,
    config: SchedulerConfig,
    state: Mutex<PoolState>,
    /// Idle workers wait here for work.
    work_ready: Condvar,
    /// Resumed tasks wait here for a slot.
    slot_free: Condvar,
    /// Live (non-terminal) tasks.
    table: Mutex<IndexMap<TaskId, Arc<Task>>>,
    next_id: AtomicUsize,
    running: AtomicBool,
    stats: SchedulerStats,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

thread_local! {
    /// The task running on this thread, if any.
    static CURRENT: RefCell<Option<(Arc<Task>, Arc<PoolShared>)>> = const { RefCell::new(None) };
}

/// The task running on the calling thread.
pub fn current_task() -> Option<Arc<Task>> {
    CURRENT.with(|current| current.borrow().as_ref().map(|(task, _)| task.clone()))
}

/// Token for a suspended task. [`Suspension::resume`] re-acquires an
/// execution slot; outside of a pool task both are no-ops.
#[must_use = "a suspension must be resumed"]
pub struct Suspension {
    inner: Option<(Arc<Task>, Arc<PoolShared>)>,
}

/// Mark the current task suspended on `reason` and release its slot.
pub fn suspend_current(reason: BlockedOn) -> Suspension {
    let inner = CURRENT.with(|current| current.borrow().clone());
    if let Some((task, shared)) = &inner {
        trace!("{} suspends on {}", task.id(), reason);
        task.set_blocked_on(Some(reason));
        if let Err(err) = task.transition(TaskState::Running, TaskState::Suspended) {
            fatal(err);
        }
        shared.release_for_suspend();
    }
    Suspension { inner }
}

impl Suspension {
    /// Re-acquire a slot and continue running.
    pub fn resume(mut self) {
        self.resume_inner();
    }

    fn resume_inner(&mut self) {
        if let Some((task, shared)) = self.inner.take() {
            if let Err(err) = task.transition(TaskState::Suspended, TaskState::Runnable) {
                fatal(err);
            }
            shared.acquire_for_resume();
            task.set_blocked_on(None);
            if let Err(err) = task.transition(TaskState::Runnable, TaskState::Running) {
                fatal(err);
            }
            trace!("{} resumed", task.id());
        }
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        self.resume_inner();
    }
}

impl PoolShared {
    fn slots(&self) -> usize {
        self.config.num_workers.max(1)
    }

    /// Make sure some worker will pick up queued work.
    fn ensure_worker(
        self: &Arc<Self>,
        state: &mut PoolState,
    ) {
        if state.stealer.is_empty() || state.active >= self.slots() || state.resuming > 0 {
            return;
        }
        if state.idle > 0 {
            self.work_ready.notify_one();
        } else if state.threads < self.config.max_threads.max(self.slots()) {
            let home = state.next_worker;
            state.next_worker += 1;
            state.threads += 1;
            if state.threads > self.slots() {
                self.stats.compensating_threads.fetch_add(1, Ordering::SeqCst);
            }
            if let Err(err) = self.start_worker(home) {
                state.threads -= 1;
                warn!("{}: failed to start worker thread: {}", self.domain, err);
            }
        } else {
            warn!(
                "{}: worker thread cap ({}) reached with {} queued task(s)",
                self.domain,
                self.config.max_threads,
                state.stealer.len()
            );
        }
    }

    fn start_worker(
        self: &Arc<Self>,
        home: usize,
    ) -> std::io::Result<()> {
        let shared = self.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{}", self.domain, home))
            .stack_size(self.config.default_stack_size)
            .spawn(move || shared.worker_loop(home))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Hand a slot back and wake whoever should use it.
    fn release_slot(
        self: &Arc<Self>,
        state: &mut PoolState,
    ) {
        state.active -= 1;
        if state.resuming > 0 {
            self.slot_free.notify_one();
        } else {
            self.ensure_worker(state);
        }
    }

    fn release_for_suspend(self: &Arc<Self>) {
        self.stats.suspensions.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        self.release_slot(&mut state);
    }

    fn acquire_for_resume(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.resuming += 1;
        while state.active >= self.slots() {
            self.slot_free.wait(&mut state);
        }
        state.resuming -= 1;
        state.active += 1;
        self.ensure_worker(&mut state);
    }

    /// Worker thread main loop.
    fn worker_loop(
        self: Arc<Self>,
        home: usize,
    ) {
        trace!("{}: worker {} started", self.domain, home);
        while let Some((task, stolen)) = self.next_task(home) {
            if stolen {
                self.stats.tasks_stolen.fetch_add(1, Ordering::SeqCst);
            }

            self.run_task(task);

            let mut state = self.state.lock();
            self.release_slot(&mut state);
        }
        trace!("{}: worker {} exits", self.domain, home);
    }

    /// Wait for a runnable task and a free slot. `None` tells the worker to
    /// exit: on shutdown once the queues are drained, or when a surplus
    /// thread has idled for `idle_timeout`.
    fn next_task(
        &self,
        home: usize,
    ) -> Option<(Arc<Task>, bool)> {
        let mut state = self.state.lock();
        loop {
            if state.resuming == 0 && state.active < self.slots() {
                if let Some(next) = state.stealer.pop_for(home) {
                    state.active += 1;
                    return Some(next);
                }
            }
            if state.shutdown && state.stealer.is_empty() {
                break;
            }
            state.idle += 1;
            let timed_out = self
                .work_ready
                .wait_for(&mut state, self.config.idle_timeout)
                .timed_out();
            state.idle -= 1;
            if timed_out && state.threads > self.slots() && state.stealer.is_empty() {
                break;
            }
        }
        state.threads -= 1;
        None
    }

    /// Run one task to a terminal state and hand its outcome over.
    fn run_task(
        self: &Arc<Self>,
        task: Arc<Task>,
    ) {
        if let Err(err) = task.transition(TaskState::Runnable, TaskState::Running) {
            fatal(err);
        }

        let ctx = TaskContext::new(task.clone(), PoolHandle { shared: self.clone() });
        let start = Instant::now();

        let previous = CURRENT.with(|current| current.replace(Some((task.clone(), self.clone()))));
        let outcome = match task.take_body() {
            Some(body) => match catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
                Ok(outcome) => outcome,
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            },
            None => Ok(()),
        };
        CURRENT.with(|current| *current.borrow_mut() = previous);

        let duration = start.elapsed();
        task.record_duration(duration);

        let terminal = if outcome.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        if let Err(err) = task.transition(TaskState::Running, terminal) {
            fatal(err);
        }
        self.table.lock().shift_remove(&task.id());
        self.stats
            .record_terminal(outcome.is_err(), duration.as_micros() as usize);
        trace!("{} finished as {:?}", task.id(), terminal);

        deliver_outcome(&task, outcome);
    }
}

/// Hand a terminal outcome to the task's observer and fill its completion.
pub(crate) fn deliver_outcome(
    task: &Arc<Task>,
    outcome: TaskResult,
) {
    let terminal = if outcome.is_ok() {
        TaskState::Completed
    } else {
        TaskState::Failed
    };
    match task.take_observer() {
        Some(observer) => {
            let reported = catch_unwind(AssertUnwindSafe(|| {
                observer.on_child_terminal(task, outcome);
            }));
            if let Err(payload) = reported {
                fatal(FatalError::ReentrantFailure {
                    task: task.id(),
                    message: panic_message(payload.as_ref()),
                });
            }
        },
        None => {
            if let Err(error) = outcome {
                warn!("unobserved failure of {} ({}): {}", task.id(), task.name(), error);
                task.set_orphan_error(error);
            }
        },
    }
    if task.completion().write(terminal).is_err() {
        fatal(FatalError::IllegalTransition {
            task: task.id(),
            from: terminal,
            to: terminal,
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Cloneable handle to a domain's worker pool.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("domain", &self.shared.domain)
            .field("num_workers", &self.shared.config.num_workers)
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

impl PoolHandle {
    /// Domain this pool belongs to.
    #[inline]
    pub fn domain(&self) -> DomainId {
        self.shared.domain
    }

    /// Build a task owned by this pool's domain. The current task, when it
    /// runs on the same domain, becomes the new task's parent.
    pub fn build_task<F>(
        &self,
        builder: TaskBuilder,
        body: F,
    ) -> Arc<Task>
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let parent = current_task()
            .filter(|task| task.domain() == self.domain())
            .map(|task| task.id());
        Arc::new(builder.parent(parent).build(id, self.domain(), body))
    }

    /// Queue a task. Non-blocking.
    pub fn spawn(
        &self,
        task: Arc<Task>,
    ) -> RuntimeResult<TaskHandle> {
        let shared = &self.shared;
        if !shared.running.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShutDown);
        }
        if task.state() != TaskState::Runnable {
            fatal(FatalError::IllegalTransition {
                task: task.id(),
                from: task.state(),
                to: TaskState::Runnable,
            });
        }

        {
            let mut table = shared.table.lock();
            if table.len() >= shared.config.max_tasks {
                return Err(RuntimeError::ResourceExhausted(format!(
                    "{} task table is full ({} live tasks)",
                    shared.domain,
                    table.len()
                )));
            }
            table.insert(task.id(), task.clone());
            shared.stats.update_peak_live(table.len());
        }
        shared.stats.record_spawned();

        let mut state = shared.state.lock();
        let region = state.stealer.push(task.clone());
        debug!("{}: spawned {} ({}) on sub-region {}", shared.domain, task.id(), task.name(), region);
        shared.ensure_worker(&mut state);
        drop(state);

        Ok(TaskHandle::new(task))
    }

    /// Build and queue a task.
    pub fn spawn_fn<F>(
        &self,
        body: F,
    ) -> RuntimeResult<TaskHandle>
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.spawn(self.build_task(TaskBuilder::new(), body))
    }

    /// Number of live (non-terminal) tasks.
    pub fn live_tasks(&self) -> usize {
        self.shared.table.lock().len()
    }

    /// Number of queued tasks in one sub-region.
    pub fn queued_in(
        &self,
        region: usize,
    ) -> usize {
        self.shared.state.lock().stealer.region_len(region)
    }

    /// Live tasks, or `None` when the table could not be locked in time.
    pub fn try_snapshot(
        &self,
        timeout: Duration,
    ) -> Option<Vec<Arc<Task>>> {
        self.shared
            .table
            .try_lock_for(timeout)
            .map(|table| table.values().cloned().collect())
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    /// Get the number of execution slots.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared.config.num_workers
    }

    /// Worker threads currently alive.
    pub fn num_threads(&self) -> usize {
        self.shared.state.lock().threads
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Check if the pool accepts new tasks.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks, drain queued work and join the workers.
    ///
    /// Suspended tasks keep their threads until they finish; the call
    /// returns after they do.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("{}: shutting down worker pool", self.shared.domain);

        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work_ready.notify_all();

        let me = thread::current().id();
        loop {
            let handles: Vec<_> = self.shared.threads.lock().drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.thread().id() == me {
                    continue;
                }
                if handle.join().is_err() {
                    warn!("{}: worker thread panicked", self.shared.domain);
                }
            }
        }
    }
}

/// Owner of a domain's worker pool. Shuts the pool down when dropped.
#[derive(Debug)]
pub struct WorkerPool {
    handle: PoolHandle,
}

impl WorkerPool {
    /// Create a pool with default config.
    #[inline]
    pub fn new(domain: DomainId) -> Self {
        Self::with_config(domain, SchedulerConfig::default())
    }

    /// Create a pool with custom configuration.
    pub fn with_config(
        domain: DomainId,
        config: SchedulerConfig,
    ) -> Self {
        let stealer = WorkStealer::new(config.sub_regions, config.steal_batch, config.max_queue_size);
        let num_workers = config.num_workers.max(1);

        let shared = Arc::new(PoolShared {
            domain,
            config,
            state: Mutex::new(PoolState {
                stealer,
                active: 0,
                idle: 0,
                threads: 0,
                resuming: 0,
                next_worker: 0,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            slot_free: Condvar::new(),
            table: Mutex::new(IndexMap::new()),
            next_id: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            stats: SchedulerStats::default(),
            threads: Mutex::new(Vec::with_capacity(num_workers)),
        });

        {
            let mut state = shared.state.lock();
            for home in 0..num_workers {
                state.threads += 1;
                state.next_worker += 1;
                if let Err(err) = shared.start_worker(home) {
                    state.threads -= 1;
                    warn!("{}: failed to start worker thread: {}", domain, err);
                }
            }
        }
        debug!("{}: worker pool started with {} slot(s)", domain, num_workers);

        Self {
            handle: PoolHandle { shared },
        }
    }

    /// A cloneable handle to this pool.
    #[inline]
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }
}

impl Deref for WorkerPool {
    type Target = PoolHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}
