//! Runtime errors
//!
//! Error taxonomy shared by the worker pool, task groups and the
//! communication endpoint.

use std::fmt;

use thiserror::Error;
use tracing::error;

use crate::runtime::comm::TransportError;
use crate::runtime::domain::DomainId;
use crate::runtime::group::GroupId;
use crate::runtime::memory::MemoryError;
use crate::runtime::scheduler::{TaskId, TaskState};
use crate::util::config::ConfigError;

/// Outcome of a task body.
pub type TaskResult = Result<(), TaskError>;

/// Result of a runtime API call.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// What a task body fails with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// An error raised by the task's own code.
    #[error("{0}")]
    Raised(String),

    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A nested task group failed and the error was not caught.
    #[error(transparent)]
    Group(GroupError),

    /// A remote operation could not be completed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A spawn was rejected because the domain ran out of capacity.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl TaskError {
    /// Raise an error with the given message.
    pub fn raised(message: impl Into<String>) -> Self {
        TaskError::Raised(message.into())
    }

    /// The nested group error, if this error is one.
    pub fn as_group(&self) -> Option<&GroupError> {
        match self {
            TaskError::Group(group) => Some(group),
            _ => None,
        }
    }
}

impl From<GroupError> for TaskError {
    fn from(err: GroupError) -> Self {
        TaskError::Group(err)
    }
}

impl From<RuntimeError> for TaskError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::ResourceExhausted(msg) => TaskError::ResourceExhausted(msg),
            RuntimeError::Transport(e) => TaskError::Transport(e.to_string()),
            RuntimeError::Uncaught(group) => TaskError::Group(group),
            other => TaskError::Raised(other.to_string()),
        }
    }
}

/// A failure recorded by a task group for one of its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// The child that failed.
    pub task: TaskId,
    /// Domain the child ran on.
    pub domain: DomainId,
    /// What it failed with.
    pub error: TaskError,
}

impl TaskFailure {
    pub fn new(
        task: TaskId,
        domain: DomainId,
        error: TaskError,
    ) -> Self {
        Self {
            task,
            domain,
            error,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{} on {}: {}", self.task, self.domain, self.error)
    }
}

/// Aggregate of the failures observed by one task group.
///
/// Failures are kept in the order the group recorded them, which is the
/// order in which children reached a terminal state. That order depends on
/// scheduling and must be treated as an unordered collection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupError {
    failures: Vec<TaskFailure>,
}

impl GroupError {
    /// Create a group error from recorded failures.
    pub fn new(failures: Vec<TaskFailure>) -> Self {
        Self { failures }
    }

    /// Number of failed children.
    #[inline]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Iterate over the failures in arrival order.
    pub fn iter(&self) -> std::slice::Iter<'_, TaskFailure> {
        self.failures.iter()
    }

    /// The recorded failures.
    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    /// Iterate over the child errors.
    pub fn errors(&self) -> impl Iterator<Item = &TaskError> {
        self.failures.iter().map(|f| &f.error)
    }

    /// Rendered messages of every child error.
    pub fn messages(&self) -> Vec<String> {
        self.errors().map(|e| e.to_string()).collect()
    }

    /// Failures with nested group errors expanded into their leaves.
    pub fn flatten(&self) -> Vec<&TaskFailure> {
        let mut leaves = Vec::with_capacity(self.failures.len());
        for failure in &self.failures {
            match &failure.error {
                TaskError::Group(nested) => leaves.extend(nested.flatten()),
                _ => leaves.push(failure),
            }
        }
        leaves
    }

    /// Consume the group error and return its failures.
    pub fn into_failures(self) -> Vec<TaskFailure> {
        self.failures
    }
}

impl fmt::Display for GroupError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{} task error(s)", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for GroupError {}

impl IntoIterator for GroupError {
    type Item = TaskFailure;
    type IntoIter = std::vec::IntoIter<TaskFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.into_iter()
    }
}

impl<'a> IntoIterator for &'a GroupError {
    type Item = &'a TaskFailure;
    type IntoIter = std::slice::Iter<'a, TaskFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.iter()
    }
}

/// Errors returned by runtime API calls.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unknown execution domain: {0}")]
    UnknownDomain(DomainId),

    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("remote operation failed: {0}")]
    Remote(String),

    #[error("runtime is shut down")]
    ShutDown,

    #[error("uncaught error: {0}")]
    Uncaught(GroupError),
}

/// Invariant violations. These are never recoverable; see [`fatal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("{task} reported a terminal state twice to group {group}")]
    DoubleReport { task: TaskId, group: GroupId },

    #[error("group {group} received a report from unregistered {task}")]
    UnregisteredChild { task: TaskId, group: GroupId },

    #[error("group {group} expects {expected} children but another was registered")]
    Overfilled { group: GroupId, expected: usize },

    #[error("group {group} already closed; cannot register {task}")]
    RegisterAfterClose { task: TaskId, group: GroupId },

    #[error("{task} is already observed by another group")]
    AlreadyObserved { task: TaskId },

    #[error("group {group} dropped with {count} unobserved failure(s): {errors}")]
    UnobservedFailures {
        group: GroupId,
        count: usize,
        errors: GroupError,
    },

    #[error("illegal state transition {from:?} -> {to:?} for {task}")]
    IllegalTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("error while reporting the termination of {task}: {message}")]
    ReentrantFailure { task: TaskId, message: String },
}

/// Report an invariant violation and terminate the process.
#[cold]
pub fn fatal(err: FatalError) -> ! {
    error!("fatal runtime error: {}", err);
    eprintln!("fatal runtime error: {}", err);
    std::process::abort()
}
