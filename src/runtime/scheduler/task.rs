//! Task definitions for the scheduler.
//!
//! A [`Task`] is one schedulable unit of work: a closure, its owning domain,
//! its state and the observer that must learn about its termination.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::runtime::domain::DomainId;
use crate::runtime::errors::{FatalError, TaskError, TaskResult};
use crate::runtime::group::GroupId;
use crate::runtime::sync::SyncCell;

use super::PoolHandle;

/// Unique task identifier within one execution domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub usize);

impl TaskId {
    /// Stands for code that does not run inside a pool task.
    pub const EXTERNAL: TaskId = TaskId(usize::MAX);
}

impl fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if *self == TaskId::EXTERNAL {
            write!(f, "Task(external)")
        } else {
            write!(f, "Task({})", self.0)
        }
    }
}

/// Task state.
///
/// `Runnable -> Running -> {Completed | Failed}`, with
/// `Running -> Suspended -> Runnable -> Running` around a suspension point.
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Queued, or woken and waiting for an execution slot.
    Runnable,
    /// Executing on a worker.
    Running,
    /// Blocked on a synchronization cell, a group join or a remote operation.
    Suspended,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => TaskState::Runnable,
            1 => TaskState::Running,
            2 => TaskState::Suspended,
            3 => TaskState::Completed,
            _ => TaskState::Failed,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Runnable => 0,
            TaskState::Running => 1,
            TaskState::Suspended => 2,
            TaskState::Completed => 3,
            TaskState::Failed => 4,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(
        &self,
        to: TaskState,
    ) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Runnable, Running)
                | (Running, Suspended)
                | (Suspended, Runnable)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

/// What a suspended task is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BlockedOn {
    /// A synchronization cell or variable.
    Cell { label: Option<String> },
    /// The join point of a task group.
    GroupJoin { group: GroupId },
    /// The completion token of a remote operation.
    Completion { operation: String },
}

impl fmt::Display for BlockedOn {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            BlockedOn::Cell { label: Some(label) } => write!(f, "sync cell '{}'", label),
            BlockedOn::Cell { label: None } => write!(f, "sync cell"),
            BlockedOn::GroupJoin { group } => write!(f, "join of group {}", group),
            BlockedOn::Completion { operation } => write!(f, "completion of {}", operation),
        }
    }
}

/// The closure a task runs.
pub type TaskBody = Box<dyn FnOnce(&TaskContext) -> TaskResult + Send>;

/// Receives a task's outcome once the task is terminal.
///
/// Called exactly once per observed task, by whichever worker finished it.
pub trait TerminalObserver: Send + Sync {
    fn on_child_terminal(
        &self,
        task: &Task,
        outcome: TaskResult,
    );
}

/// A task that can be scheduled for execution.
pub struct Task {
    /// Unique task ID.
    id: TaskId,
    /// Task name for debugging.
    name: String,
    /// Owning execution domain.
    domain: DomainId,
    /// The task that spawned this one, if it ran on the same domain.
    parent: Option<TaskId>,
    /// Requested sub-region of the domain.
    affinity: Option<usize>,
    /// Current state (atomic for thread-safe access).
    state: AtomicU8,
    /// The actual work to execute.
    body: Mutex<Option<TaskBody>>,
    /// Who learns about termination.
    observer: Mutex<Option<Arc<dyn TerminalObserver>>>,
    /// What the task is suspended on.
    blocked_on: Mutex<Option<BlockedOn>>,
    /// Filled with the terminal state.
    completion: SyncCell<TaskState>,
    /// Failure of a task nobody observes.
    orphan_error: Mutex<Option<TaskError>>,
    /// Execution duration (for statistics).
    exec_duration: Mutex<Option<Duration>>,
}

impl fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("state", &self.state())
            .field("parent", &self.parent)
            .field("affinity", &self.affinity)
            .finish()
    }
}

impl Task {
    /// Create a new task with the given ID and body.
    pub fn new<F>(
        id: TaskId,
        domain: DomainId,
        body: F,
    ) -> Self
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        TaskBuilder::new().build(id, domain, body)
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    #[inline]
    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    /// Requested sub-region, if any.
    #[inline]
    pub fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`. Fails if the task is not in `from` or the
    /// transition is illegal.
    pub(crate) fn transition(
        &self,
        from: TaskState,
        to: TaskState,
    ) -> Result<(), FatalError> {
        if !from.can_transition_to(to) {
            return Err(FatalError::IllegalTransition {
                task: self.id,
                from,
                to,
            });
        }
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| FatalError::IllegalTransition {
                task: self.id,
                from: TaskState::from_u8(actual),
                to,
            })
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// What the task is currently suspended on.
    pub fn blocked_on(&self) -> Option<BlockedOn> {
        self.blocked_on.lock().clone()
    }

    pub(crate) fn try_blocked_on(&self) -> Option<Option<BlockedOn>> {
        self.blocked_on.try_lock().map(|guard| guard.clone())
    }

    pub(crate) fn set_blocked_on(
        &self,
        reason: Option<BlockedOn>,
    ) {
        *self.blocked_on.lock() = reason;
    }

    /// Attach the observer that receives this task's outcome.
    pub(crate) fn set_observer(
        &self,
        observer: Arc<dyn TerminalObserver>,
    ) -> Result<(), FatalError> {
        let mut slot = self.observer.lock();
        if slot.is_some() {
            return Err(FatalError::AlreadyObserved { task: self.id });
        }
        *slot = Some(observer);
        Ok(())
    }

    pub(crate) fn clear_observer(&self) {
        self.observer.lock().take();
    }

    pub(crate) fn has_observer(&self) -> bool {
        self.observer.lock().is_some()
    }

    pub(crate) fn take_observer(&self) -> Option<Arc<dyn TerminalObserver>> {
        self.observer.lock().take()
    }

    /// Take the body closure from the task.
    #[inline]
    pub(crate) fn take_body(&self) -> Option<TaskBody> {
        self.body.lock().take()
    }

    pub(crate) fn completion(&self) -> &SyncCell<TaskState> {
        &self.completion
    }

    pub(crate) fn set_orphan_error(
        &self,
        error: TaskError,
    ) {
        *self.orphan_error.lock() = Some(error);
    }

    /// Record the execution duration.
    #[inline]
    pub(crate) fn record_duration(
        &self,
        duration: Duration,
    ) {
        *self.exec_duration.lock() = Some(duration);
    }

    /// Get the execution duration.
    #[inline]
    pub fn exec_duration(&self) -> Option<Duration> {
        *self.exec_duration.lock()
    }
}

/// Task builder for constructing tasks with various options.
#[derive(Debug, Default, Clone)]
pub struct TaskBuilder {
    name: Option<String>,
    parent: Option<TaskId>,
    affinity: Option<usize>,
}

impl TaskBuilder {
    /// Create a new task builder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task name.
    #[inline]
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Request a sub-region of the domain. Honored when that sub-region
    /// exists and has queue capacity.
    #[inline]
    pub fn sub_region(
        mut self,
        region: usize,
    ) -> Self {
        self.affinity = Some(region);
        self
    }

    #[inline]
    pub(crate) fn parent(
        mut self,
        parent: Option<TaskId>,
    ) -> Self {
        if self.parent.is_none() {
            self.parent = parent;
        }
        self
    }

    /// Build the task with the given ID and body.
    pub fn build<F>(
        self,
        id: TaskId,
        domain: DomainId,
        body: F,
    ) -> Task
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        let name = self.name.unwrap_or_else(|| format!("Task({})", id.0));

        Task {
            id,
            completion: SyncCell::labeled(format!("completion of {}", name)),
            name,
            domain,
            parent: self.parent,
            affinity: self.affinity,
            state: AtomicU8::new(TaskState::Runnable.as_u8()),
            body: Mutex::new(Some(Box::new(body))),
            observer: Mutex::new(None),
            blocked_on: Mutex::new(None),
            orphan_error: Mutex::new(None),
            exec_duration: Mutex::new(None),
        }
    }
}

/// What a running task sees of the runtime.
#[derive(Clone)]
pub struct TaskContext {
    task: Arc<Task>,
    pool: PoolHandle,
}

impl fmt::Debug for TaskContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task.id())
            .field("domain", &self.task.domain())
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn new(
        task: Arc<Task>,
        pool: PoolHandle,
    ) -> Self {
        Self { task, pool }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.task.name()
    }

    #[inline]
    pub fn domain(&self) -> DomainId {
        self.task.domain()
    }

    /// The running task.
    #[inline]
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// The pool running this task.
    #[inline]
    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }
}

/// Handle to a spawned task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task: Arc<Task>,
}

impl TaskHandle {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self { task }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    #[inline]
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Wait for the task to terminate. A suspension point.
    pub fn wait(&self) -> TaskState {
        self.task.completion().read()
    }

    /// Take the error of a failed task that has no observer.
    pub fn take_error(&self) -> Option<TaskError> {
        self.task.orphan_error.lock().take()
    }
}
