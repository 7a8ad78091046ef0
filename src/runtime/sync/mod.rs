//! Synchronization cells
//!
//! Full/empty variables used as the runtime's suspension points.
//!
//! - [`SyncCell`]: single assignment. `Empty -> Full`, reads never empty it.
//! - [`SyncVar`]: reusable. `Empty <-> Full`, destructive reads empty it.
//!
//! An operation that cannot complete suspends the calling task. When the
//! caller is a pool task, its execution slot is handed back to the pool for
//! the duration of the wait (see [`crate::runtime::scheduler::suspend_current`]).

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::runtime::scheduler::{suspend_current, BlockedOn};

/// Synchronization cell errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A single-assignment cell was written twice.
    #[error("single-assignment cell {0} is already full")]
    AlreadyFull(String),
}

/// Block on `mutex`/`condvar` until `ready` yields a value.
///
/// The condition is re-checked on every wakeup. The suspension is released
/// only after the mutex guard is dropped so that resuming never waits for a
/// slot while holding the cell.
fn wait_until<S, R>(
    mutex: &Mutex<S>,
    condvar: &Condvar,
    reason: impl FnOnce() -> BlockedOn,
    mut ready: impl FnMut(&mut S) -> Option<R>,
) -> R {
    let mut guard = mutex.lock();
    if let Some(value) = ready(&mut guard) {
        return value;
    }

    let suspension = suspend_current(reason());
    let value = loop {
        condvar.wait(&mut guard);
        if let Some(value) = ready(&mut guard) {
            break value;
        }
    };
    drop(guard);
    suspension.resume();
    value
}

fn describe(label: &Option<String>) -> String {
    label.clone().unwrap_or_else(|| "<anonymous>".to_string())
}

/// Single-assignment synchronization cell.
#[derive(Debug)]
pub struct SyncCell<T> {
    label: Option<String>,
    slot: Mutex<Option<T>>,
    filled: Condvar,
}

impl<T> SyncCell<T> {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self {
            label: None,
            slot: Mutex::new(None),
            filled: Condvar::new(),
        }
    }

    /// Create an empty cell with a label shown in block reports.
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::new()
        }
    }

    /// The cell's label.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Fill the cell and wake every waiting reader.
    pub fn write(
        &self,
        value: T,
    ) -> Result<(), SyncError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(SyncError::AlreadyFull(describe(&self.label)));
        }
        *slot = Some(value);
        drop(slot);
        self.filled.notify_all();
        Ok(())
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wait until the cell is full without reading it.
    pub fn wait(&self) {
        self.wait_as(BlockedOn::Cell {
            label: self.label.clone(),
        })
    }

    pub(crate) fn wait_as(
        &self,
        reason: BlockedOn,
    ) {
        wait_until(&self.slot, &self.filled, || reason, |slot| slot.as_ref().map(|_| ()))
    }
}

impl<T: Clone> SyncCell<T> {
    /// Read the value, suspending while the cell is empty.
    pub fn read(&self) -> T {
        let label = self.label.clone();
        wait_until(
            &self.slot,
            &self.filled,
            || BlockedOn::Cell { label },
            |slot| slot.clone(),
        )
    }

    /// Read the value if the cell is full.
    pub fn try_read(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}

impl<T> Default for SyncCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Full/empty synchronization variable.
#[derive(Debug)]
pub struct SyncVar<T> {
    label: Option<String>,
    slot: Mutex<Option<T>>,
    changed: Condvar,
}

impl<T> SyncVar<T> {
    /// Create an empty variable.
    pub fn new() -> Self {
        Self {
            label: None,
            slot: Mutex::new(None),
            changed: Condvar::new(),
        }
    }

    /// Create a full variable.
    pub fn full(value: T) -> Self {
        Self {
            label: None,
            slot: Mutex::new(Some(value)),
            changed: Condvar::new(),
        }
    }

    /// Create an empty variable with a label shown in block reports.
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::new()
        }
    }

    fn reason(&self) -> BlockedOn {
        BlockedOn::Cell {
            label: self.label.clone(),
        }
    }

    /// Wait until empty, then fill.
    pub fn write_ef(
        &self,
        value: T,
    ) {
        let mut value = Some(value);
        wait_until(
            &self.slot,
            &self.changed,
            || self.reason(),
            |slot| {
                if slot.is_none() {
                    *slot = value.take();
                    Some(())
                } else {
                    None
                }
            },
        );
        self.changed.notify_all();
    }

    /// Fill regardless of the current state.
    pub fn write_xf(
        &self,
        value: T,
    ) {
        *self.slot.lock() = Some(value);
        self.changed.notify_all();
    }

    /// Wait until full, take the value and leave the variable empty.
    pub fn read_fe(&self) -> T {
        self.read_fe_as(self.reason())
    }

    pub(crate) fn read_fe_as(
        &self,
        reason: BlockedOn,
    ) -> T {
        let value = wait_until(&self.slot, &self.changed, || reason, |slot| slot.take());
        self.changed.notify_all();
        value
    }

    /// Take the value if full.
    pub fn try_read_fe(&self) -> Option<T> {
        let value = self.slot.lock().take();
        if value.is_some() {
            self.changed.notify_all();
        }
        value
    }

    /// Empty the variable.
    pub fn reset(&self) {
        *self.slot.lock() = None;
        self.changed.notify_all();
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T: Clone> SyncVar<T> {
    /// Wait until full and read, leaving the variable full.
    pub fn read_ff(&self) -> T {
        wait_until(&self.slot, &self.changed, || self.reason(), |slot| slot.clone())
    }
}

impl<T> Default for SyncVar<T> {
    fn default() -> Self {
        Self::new()
    }
}
