//! Error aggregation for task groups.

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::runtime::errors::{GroupError, TaskFailure};

/// Collects child failures in arrival order.
///
/// `record` may be called from any number of workers at once. Nothing is
/// ever deduplicated: two children failing with equal errors are two
/// entries.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    failures: Mutex<SmallVec<[TaskFailure; 4]>>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one failure.
    pub fn record(
        &self,
        failure: TaskFailure,
    ) {
        self.failures.lock().push(failure);
    }

    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.lock().is_empty()
    }

    /// Take every recorded failure, leaving the aggregator empty.
    pub fn drain(&self) -> Vec<TaskFailure> {
        std::mem::take(&mut *self.failures.lock()).into_vec()
    }

    /// Drain into a group error, or `Ok` when nothing failed.
    pub fn into_result(&self) -> Result<(), GroupError> {
        let failures = self.drain();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GroupError::new(failures))
        }
    }
}
