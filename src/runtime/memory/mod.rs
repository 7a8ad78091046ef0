//! Domain-local memory
//!
//! Every execution domain owns a set of byte segments. Segments are the
//! targets of one-sided `get`/`put`: a [`LocalHandle`] names a byte range
//! inside one segment, a [`RemoteAddr`] pairs a handle with its domain.
//! Handles carry no pointer; every access is bounds-checked against the
//! live segment.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::trace;

use crate::runtime::domain::DomainId;

/// Memory errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("unknown memory handle {0}")]
    UnknownHandle(LocalHandle),
    #[error("access of {len} byte(s) at offset {offset} is outside {handle}")]
    OutOfBounds {
        handle: LocalHandle,
        offset: usize,
        len: usize,
    },
    #[error("memory limit of {limit} byte(s) exceeded (requested {requested})")]
    Exhausted { limit: usize, requested: usize },
    #[error("{0} is not the base of an allocation")]
    NotAllocationBase(LocalHandle),
}

/// A byte range inside one of the owning domain's segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalHandle {
    pub(crate) segment: u64,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

impl LocalHandle {
    /// Length of the range in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for LocalHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "seg{}[{}..{}]", self.segment, self.offset, self.offset + self.len)
    }
}

/// Opaque address of memory owned by some domain. No arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteAddr {
    domain: DomainId,
    handle: LocalHandle,
}

impl RemoteAddr {
    pub fn new(
        domain: DomainId,
        handle: LocalHandle,
    ) -> Self {
        Self { domain, handle }
    }

    /// Owning domain.
    #[inline]
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    #[inline]
    pub fn handle(&self) -> LocalHandle {
        self.handle
    }

    /// Length of the addressed range in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.handle.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}@{}", self.handle, self.domain)
    }
}

/// One allocation.
#[derive(Debug)]
struct Region {
    buffer: Vec<u8>,
}

impl Region {
    fn zeroed(len: usize) -> Self {
        Self {
            buffer: vec![0; len],
        }
    }

    fn check(
        &self,
        handle: LocalHandle,
        offset: usize,
        len: usize,
    ) -> Result<std::ops::Range<usize>, MemoryError> {
        let start = offset;
        let end = start.checked_add(len).ok_or(MemoryError::OutOfBounds { handle, offset, len })?;
        if end > self.buffer.len() {
            return Err(MemoryError::OutOfBounds { handle, offset, len });
        }
        Ok(start..end)
    }
}

/// Segments owned by one execution domain.
#[derive(Debug)]
pub struct DomainMemory {
    segments: RwLock<HashMap<u64, Mutex<Region>>>,
    next_segment: AtomicU64,
    /// Bytes currently allocated.
    used: AtomicUsize,
    /// Allocation cap in bytes, `None` for unlimited.
    limit: Option<usize>,
}

impl DomainMemory {
    /// Create an empty memory without a limit.
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            segments: RwLock::new(HashMap::new()),
            next_segment: AtomicU64::new(0),
            used: AtomicUsize::new(0),
            limit,
        }
    }

    /// Allocate `len` zeroed bytes.
    pub fn alloc(
        &self,
        len: usize,
    ) -> Result<LocalHandle, MemoryError> {
        if let Some(limit) = self.limit {
            let reserved = self
                .used
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    used.checked_add(len).filter(|total| *total <= limit)
                });
            if reserved.is_err() {
                return Err(MemoryError::Exhausted { limit, requested: len });
            }
        } else {
            self.used.fetch_add(len, Ordering::SeqCst);
        }

        let segment = self.next_segment.fetch_add(1, Ordering::SeqCst);
        self.segments.write().insert(segment, Mutex::new(Region::zeroed(len)));
        trace!("allocated segment {} ({} bytes)", segment, len);

        Ok(LocalHandle {
            segment,
            offset: 0,
            len,
        })
    }

    /// Release an allocation. Only the handle returned by `alloc` frees.
    pub fn free(
        &self,
        handle: LocalHandle,
    ) -> Result<(), MemoryError> {
        let mut segments = self.segments.write();
        let len = match segments.get(&handle.segment) {
            None => return Err(MemoryError::UnknownHandle(handle)),
            Some(region) => region.lock().buffer.len(),
        };
        if handle.offset != 0 || handle.len != len {
            return Err(MemoryError::NotAllocationBase(handle));
        }
        segments.remove(&handle.segment);
        self.used.fetch_sub(len, Ordering::SeqCst);
        trace!("freed segment {}", handle.segment);
        Ok(())
    }

    /// Copy `len` bytes starting `offset` bytes into `handle`.
    pub fn read(
        &self,
        handle: LocalHandle,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, MemoryError> {
        let view = self.view(handle, offset, len)?;
        let segments = self.segments.read();
        let region = segments
            .get(&view.segment)
            .ok_or(MemoryError::UnknownHandle(handle))?
            .lock();
        let range = region.check(view, view.offset, view.len)?;
        Ok(region.buffer[range].to_vec())
    }

    /// Copy `data` into `handle` starting at `offset`.
    pub fn write(
        &self,
        handle: LocalHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), MemoryError> {
        let view = self.view(handle, offset, data.len())?;
        let segments = self.segments.read();
        let mut region = segments
            .get(&view.segment)
            .ok_or(MemoryError::UnknownHandle(handle))?
            .lock();
        let range = region.check(view, view.offset, view.len)?;
        region.buffer[range].copy_from_slice(data);
        Ok(())
    }

    /// Read the whole range named by `handle`.
    pub fn read_all(
        &self,
        handle: LocalHandle,
    ) -> Result<Vec<u8>, MemoryError> {
        self.read(handle, 0, handle.len)
    }

    /// A sub-range of `handle`.
    pub fn view(
        &self,
        handle: LocalHandle,
        offset: usize,
        len: usize,
    ) -> Result<LocalHandle, MemoryError> {
        let end = offset.checked_add(len);
        if end.is_none_or(|end| end > handle.len) {
            return Err(MemoryError::OutOfBounds { handle, offset, len });
        }
        Ok(LocalHandle {
            segment: handle.segment,
            offset: handle.offset + offset,
            len,
        })
    }

    /// Number of live allocations.
    pub fn segments(&self) -> usize {
        self.segments.read().len()
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

impl Default for DomainMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
