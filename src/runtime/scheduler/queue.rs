//! Task queue for the scheduler
//!
//! One queue per sub-region of a domain. Queues are not synchronized on
//! their own; the pool owns them behind its state lock.

use std::collections::VecDeque;
use std::sync::Arc;

use super::task::Task;

/// A FIFO of runnable tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: VecDeque<Arc<Task>>,
}

impl TaskQueue {
    /// Create a new empty task queue.
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }

    /// Push a task to the back of the queue.
    #[inline]
    pub fn push(&mut self, task: Arc<Task>) {
        self.inner.push_back(task);
    }

    /// Pop a task from the front of the queue.
    #[inline]
    pub fn pop_front(&mut self) -> Option<Arc<Task>> {
        self.inner.pop_front()
    }

    /// Pop a task from the back of the queue (for work stealing).
    #[inline]
    pub fn pop_back(&mut self) -> Option<Arc<Task>> {
        self.inner.pop_back()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
