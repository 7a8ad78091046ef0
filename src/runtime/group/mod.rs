//! Structured task groups
//!
//! A [`TaskGroup`] is the fork/join scope of a parallel block. It counts the
//! children registered with it, learns about each child's termination through
//! [`TerminalObserver`], records failures in an [`ErrorAggregator`] and
//! releases the joining parent once every child is terminal.
//!
//! Three forms exist:
//! - `Fixed(n)`: a fixed set of children (cobegin)
//! - `Iteration(n)`: one child per iteration (coforall)
//! - `Unbounded`: children registered by the parent or any descendant
//!   holding a [`GroupHandle`], joined at the enclosing barrier (sync)

mod aggregator;

pub use aggregator::ErrorAggregator;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, trace};

use crate::runtime::domain::DomainId;
use crate::runtime::errors::{
    fatal, FatalError, GroupError, RuntimeError, RuntimeResult, TaskError, TaskFailure,
    TaskResult,
};
use crate::runtime::scheduler::{
    BlockedOn, PoolHandle, Task, TaskBody, TaskBuilder, TaskContext, TaskHandle, TaskId, TerminalObserver,
};
use crate::runtime::sync::SyncCell;

static NEXT_GROUP: AtomicU64 = AtomicU64::new(0);

/// Process-unique group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GroupId(pub u64);

impl GroupId {
    fn next() -> Self {
        GroupId(NEXT_GROUP.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for GroupId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Group({})", self.0)
    }
}

/// The form of a parallel block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// A fixed set of `n` children.
    Fixed(usize),
    /// `n` children, one per iteration.
    Iteration(usize),
    /// Children registered incrementally until the join.
    Unbounded,
}

impl GroupKind {
    fn expected(&self) -> Option<usize> {
        match self {
            GroupKind::Fixed(n) | GroupKind::Iteration(n) => Some(*n),
            GroupKind::Unbounded => None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    /// Expected children for fixed forms.
    expected: Option<usize>,
    registered: usize,
    completed: usize,
    /// Registered children.
    children: HashSet<(DomainId, TaskId)>,
    /// Children whose terminal state has been reported.
    reported: HashSet<(DomainId, TaskId)>,
    /// Set once the parent reaches the join.
    joining: bool,
    /// Set once the join cell has been filled.
    fired: bool,
}

impl Counters {
    fn is_complete(&self) -> bool {
        match self.expected {
            Some(expected) => self.completed == expected,
            None => self.joining && self.completed == self.registered,
        }
    }
}

/// Shared state of one group. Children reference it as their observer.
pub(crate) struct GroupCore {
    id: GroupId,
    kind: GroupKind,
    counters: Mutex<Counters>,
    errors: ErrorAggregator,
    done: SyncCell<()>,
}

impl fmt::Debug for GroupCore {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let counters = self.counters.lock();
        f.debug_struct("GroupCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("registered", &counters.registered)
            .field("completed", &counters.completed)
            .field("failures", &self.errors.len())
            .finish()
    }
}

impl GroupCore {
    pub(crate) fn new(kind: GroupKind) -> Self {
        let id = GroupId::next();
        let core = Self {
            id,
            kind,
            counters: Mutex::new(Counters {
                expected: kind.expected(),
                ..Counters::default()
            }),
            errors: ErrorAggregator::new(),
            done: SyncCell::labeled(format!("join of {}", id)),
        };
        core.fire_if_complete(&mut core.counters.lock());
        core
    }

    fn fire_if_complete(
        &self,
        counters: &mut Counters,
    ) -> bool {
        if counters.fired || !counters.is_complete() {
            return false;
        }
        counters.fired = true;
        // Only this path writes the cell, guarded by `fired`.
        let _ = self.done.write(());
        trace!("{} complete ({} children)", self.id, counters.completed);
        true
    }

    /// Count a child in.
    pub(crate) fn register(
        &self,
        domain: DomainId,
        task: TaskId,
    ) -> Result<(), FatalError> {
        let mut counters = self.counters.lock();
        if counters.fired {
            return Err(FatalError::RegisterAfterClose { task, group: self.id });
        }
        if let Some(expected) = counters.expected {
            if counters.registered >= expected {
                return Err(FatalError::Overfilled { group: self.id, expected });
            }
        }
        counters.registered += 1;
        counters.children.insert((domain, task));
        Ok(())
    }

    /// Undo a registration whose spawn was rejected. Fixed forms shrink
    /// their expected count.
    pub(crate) fn withdraw(
        &self,
        domain: DomainId,
        task: TaskId,
    ) {
        let mut counters = self.counters.lock();
        if !counters.children.remove(&(domain, task)) {
            return;
        }
        counters.registered -= 1;
        if let Some(expected) = counters.expected.as_mut() {
            *expected -= 1;
        }
        self.fire_if_complete(&mut counters);
    }

    /// Record a child's terminal outcome. Returns whether this report
    /// completed the group.
    pub(crate) fn report(
        &self,
        domain: DomainId,
        task: TaskId,
        outcome: TaskResult,
    ) -> Result<bool, FatalError> {
        {
            let mut counters = self.counters.lock();
            if counters.reported.contains(&(domain, task)) {
                return Err(FatalError::DoubleReport { task, group: self.id });
            }
            if !counters.children.contains(&(domain, task)) {
                return Err(FatalError::UnregisteredChild { task, group: self.id });
            }
            counters.reported.insert((domain, task));
        }

        if let Err(error) = outcome {
            debug!("{} child {} on {} failed: {}", self.id, task, domain, error);
            self.errors.record(TaskFailure { task, domain, error });
        }

        let mut counters = self.counters.lock();
        counters.completed += 1;
        Ok(self.fire_if_complete(&mut counters))
    }

    /// Mark that the parent reached the join. Fixed forms that registered
    /// fewer children than announced wait only for those registered.
    fn close(&self) {
        let mut counters = self.counters.lock();
        counters.joining = true;
        let registered = counters.registered;
        if let Some(expected) = counters.expected.as_mut() {
            if *expected > registered {
                trace!("{} closed with {} of {} children", self.id, registered, expected);
                *expected = registered;
            }
        }
        self.fire_if_complete(&mut counters);
    }

    /// Close, wait for every child and take the failures.
    fn wait_all(&self) -> Result<(), GroupError> {
        self.close();
        self.done.wait_as(BlockedOn::GroupJoin { group: self.id });
        self.errors.into_result()
    }

    fn registered(&self) -> usize {
        self.counters.lock().registered
    }

    fn completed(&self) -> usize {
        self.counters.lock().completed
    }

    /// Build a child task, register it and queue it on `pool`.
    fn spawn_child(
        self: &Arc<Self>,
        pool: &PoolHandle,
        builder: TaskBuilder,
        body: impl FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    ) -> RuntimeResult<TaskHandle> {
        let task = pool.build_task(builder, body);
        self.adopt(&task);
        match pool.spawn(task.clone()) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                task.clear_observer();
                self.withdraw(task.domain(), task.id());
                Err(err)
            },
        }
    }

    /// Register `task` and become its observer.
    fn adopt(
        self: &Arc<Self>,
        task: &Arc<Task>,
    ) {
        if let Err(err) = self.register(task.domain(), task.id()) {
            fatal(err);
        }
        if let Err(err) = task.set_observer(self.clone()) {
            fatal(err);
        }
    }

    /// Spawn a child; a rejected spawn is recorded as a failure instead of
    /// returned.
    fn spawn_recorded(
        self: &Arc<Self>,
        pool: &PoolHandle,
        builder: TaskBuilder,
        body: impl FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    ) -> Option<TaskHandle> {
        let task = pool.build_task(builder, body);
        self.adopt(&task);
        match pool.spawn(task.clone()) {
            Ok(handle) => Some(handle),
            Err(err) => {
                task.clear_observer();
                self.withdraw(task.domain(), task.id());
                self.errors.record(TaskFailure {
                    task: task.id(),
                    domain: task.domain(),
                    error: rejection(err),
                });
                None
            },
        }
    }
}

fn rejection(err: RuntimeError) -> TaskError {
    match err {
        RuntimeError::ResourceExhausted(message) => TaskError::ResourceExhausted(message),
        other => TaskError::ResourceExhausted(other.to_string()),
    }
}

impl TerminalObserver for GroupCore {
    fn on_child_terminal(
        &self,
        task: &Task,
        outcome: TaskResult,
    ) {
        if let Err(err) = self.report(task.domain(), task.id(), outcome) {
            fatal(err);
        }
    }
}

/// A fork/join scope owned by the parent task.
///
/// ```ignore
/// let group = TaskGroup::fixed(&pool, 2);
/// group.spawn(|_| Ok(()))?;
/// group.spawn(|_| Err(TaskError::raised("boom")))?;
/// assert_eq!(group.join().unwrap_err().len(), 1);
/// ```
pub struct TaskGroup {
    core: Arc<GroupCore>,
    pool: PoolHandle,
    joined: bool,
}

impl fmt::Debug for TaskGroup {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("core", &self.core)
            .field("domain", &self.pool.domain())
            .finish()
    }
}

impl TaskGroup {
    /// Open a group of the given kind whose children run on `pool`.
    pub fn open(
        pool: &PoolHandle,
        kind: GroupKind,
    ) -> Self {
        let core = Arc::new(GroupCore::new(kind));
        trace!("opened {} as {:?} on {}", core.id, kind, pool.domain());
        Self {
            core,
            pool: pool.clone(),
            joined: false,
        }
    }

    #[inline]
    pub fn fixed(
        pool: &PoolHandle,
        n: usize,
    ) -> Self {
        Self::open(pool, GroupKind::Fixed(n))
    }

    #[inline]
    pub fn iteration(
        pool: &PoolHandle,
        n: usize,
    ) -> Self {
        Self::open(pool, GroupKind::Iteration(n))
    }

    #[inline]
    pub fn unbounded(pool: &PoolHandle) -> Self {
        Self::open(pool, GroupKind::Unbounded)
    }

    #[inline]
    pub fn id(&self) -> GroupId {
        self.core.id
    }

    #[inline]
    pub fn kind(&self) -> GroupKind {
        self.core.kind
    }

    /// Pool the children run on.
    #[inline]
    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    /// Register an already built task as a child. The task must not have
    /// been spawned yet.
    pub fn register_child(
        &self,
        task: &Arc<Task>,
    ) {
        self.core.adopt(task)
    }

    /// Withdraw a registered child that was never spawned.
    pub fn withdraw_child(
        &self,
        task: &Arc<Task>,
    ) {
        task.clear_observer();
        self.core.withdraw(task.domain(), task.id());
    }

    /// Spawn a child on the group's pool.
    pub fn spawn<F>(
        &self,
        body: F,
    ) -> RuntimeResult<TaskHandle>
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.core.spawn_child(&self.pool, TaskBuilder::new(), body)
    }

    /// Spawn a child on `pool` with builder options.
    pub fn spawn_with<F>(
        &self,
        pool: &PoolHandle,
        builder: TaskBuilder,
        body: F,
    ) -> RuntimeResult<TaskHandle>
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.core.spawn_child(pool, builder, body)
    }

    /// A cloneable handle for registering children from descendants.
    pub fn handle(&self) -> GroupHandle {
        GroupHandle {
            core: self.core.clone(),
            pool: self.pool.clone(),
        }
    }

    pub fn registered(&self) -> usize {
        self.core.registered()
    }

    pub fn completed(&self) -> usize {
        self.core.completed()
    }

    /// Number of failures recorded so far.
    pub fn failures(&self) -> usize {
        self.core.errors.len()
    }

    /// Wait until every registered child is terminal. A suspension point.
    ///
    /// Returns the failures of all children, in arrival order, as one
    /// [`GroupError`].
    pub fn join(mut self) -> Result<(), GroupError> {
        self.joined = true;
        self.core.wait_all()
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        if self.joined {
            return;
        }
        if let Err(err) = self.core.wait_all() {
            if std::thread::panicking() {
                error!("{} dropped during unwinding with {}", self.core.id, err);
                return;
            }
            fatal(FatalError::UnobservedFailures {
                group: self.core.id,
                count: err.len(),
                errors: err,
            });
        }
    }
}

/// Cloneable spawn capability of a group.
///
/// Children holding a handle may add siblings to an unbounded group until
/// the group completes.
#[derive(Clone)]
pub struct GroupHandle {
    core: Arc<GroupCore>,
    pool: PoolHandle,
}

impl fmt::Debug for GroupHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("GroupHandle").field("group", &self.core.id).finish()
    }
}

impl GroupHandle {
    #[inline]
    pub fn id(&self) -> GroupId {
        self.core.id
    }

    /// Spawn a child of the group. A rejected spawn is recorded as a
    /// `ResourceExhausted` failure of the group.
    pub fn begin<F>(
        &self,
        body: F,
    ) -> Option<TaskHandle>
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.core.spawn_recorded(&self.pool, TaskBuilder::new(), body)
    }

    /// Spawn a child with builder options.
    pub fn begin_with<F>(
        &self,
        builder: TaskBuilder,
        body: F,
    ) -> Option<TaskHandle>
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.core.spawn_recorded(&self.pool, builder, body)
    }

    /// Spawn a child, returning a rejection to the caller.
    pub fn spawn<F>(
        &self,
        body: F,
    ) -> RuntimeResult<TaskHandle>
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.core.spawn_child(&self.pool, TaskBuilder::new(), body)
    }

    /// Register an already built task as a child.
    pub fn register_child(
        &self,
        task: &Arc<Task>,
    ) {
        self.core.adopt(task)
    }

    /// Withdraw a registered child that was never spawned.
    pub fn withdraw_child(
        &self,
        task: &Arc<Task>,
    ) {
        task.clear_observer();
        self.core.withdraw(task.domain(), task.id());
    }
}

/// The body of a `sync` block.
pub struct SyncScope {
    handle: GroupHandle,
}

impl SyncScope {
    /// Spawn a fire-and-forget child joined at the end of the scope.
    pub fn begin<F>(
        &self,
        body: F,
    ) -> Option<TaskHandle>
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.handle.begin(body)
    }

    /// Handle for descendants that begin further children.
    pub fn handle(&self) -> GroupHandle {
        self.handle.clone()
    }
}

/// Run every closure as a child and join them.
pub fn cobegin(
    pool: &PoolHandle,
    bodies: Vec<TaskBody>,
) -> Result<(), GroupError> {
    let group = TaskGroup::fixed(pool, bodies.len());
    for body in bodies {
        group.core.spawn_recorded(pool, TaskBuilder::new(), body);
    }
    group.join()
}

/// Run `body` once per item, each as a child, and join them.
pub fn coforall<I, F>(
    pool: &PoolHandle,
    items: I,
    body: F,
) -> Result<(), GroupError>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: Fn(I::Item, &TaskContext) -> TaskResult + Send + Sync + 'static,
{
    let items: Vec<I::Item> = items.into_iter().collect();
    let group = TaskGroup::iteration(pool, items.len());
    let body = Arc::new(body);
    for (i, item) in items.into_iter().enumerate() {
        let body = body.clone();
        group.core.spawn_recorded(
            pool,
            TaskBuilder::new().name(format!("iteration {}", i)),
            move |ctx| body(item, ctx),
        );
    }
    group.join()
}

/// Run `f` and wait for every child begun inside it, including children
/// begun by those children through [`SyncScope::handle`].
pub fn sync_scope<R>(
    pool: &PoolHandle,
    f: impl FnOnce(&SyncScope) -> R,
) -> Result<R, GroupError> {
    let group = TaskGroup::unbounded(pool);
    let scope = SyncScope {
        handle: group.handle(),
    };
    let value = f(&scope);
    group.join().map(|()| value)
}
