//! Transport plug-in boundary.
//!
//! A [`Transport`] moves opaque frames between execution domains. One-sided
//! memory operations are layered on top by the endpoint, so a backend only
//! has to deliver frames.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use hashbrown::HashSet;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;

use super::message::CodecError;
use crate::runtime::domain::DomainId;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{to} is unreachable from {from}")]
    Unreachable { from: DomainId, to: DomainId },
    #[error("no such domain: {0}")]
    UnknownDomain(DomainId),
    #[error("channel to {0} is closed")]
    Disconnected(DomainId),
    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),
}

/// One received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sending domain.
    pub source: DomainId,
    /// Encoded active message.
    pub bytes: Vec<u8>,
}

/// Capabilities every backend provides.
pub trait Transport: Send + Sync {
    /// Number of domains reachable through this transport.
    fn num_domains(&self) -> usize;

    /// Deliver `bytes` to `target`. Non-blocking.
    fn send(
        &self,
        source: DomainId,
        target: DomainId,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Next frame addressed to `domain`, or `None` after `timeout`.
    fn recv(
        &self,
        domain: DomainId,
        timeout: Duration,
    ) -> Result<Option<Frame>, TransportError>;

    /// Whether frames from `source` can currently reach `target`.
    fn is_reachable(
        &self,
        _source: DomainId,
        _target: DomainId,
    ) -> bool {
        true
    }

    /// Wait until every domain has entered the barrier.
    fn barrier(
        &self,
        _domain: DomainId,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("barrier"))
    }
}

/// In-process transport: one unbounded channel per domain.
pub struct LocalFabric {
    senders: Vec<Sender<Frame>>,
    receivers: Vec<Receiver<Frame>>,
    barrier: Barrier,
    /// Domains whose inbound traffic is refused.
    unreachable: RwLock<HashSet<DomainId>>,
    frames: AtomicUsize,
}

impl std::fmt::Debug for LocalFabric {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LocalFabric")
            .field("domains", &self.senders.len())
            .field("frames", &self.frames())
            .finish()
    }
}

impl LocalFabric {
    pub fn new(num_domains: usize) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..num_domains).map(|_| channel::unbounded()).unzip();
        Self {
            senders,
            receivers,
            barrier: Barrier::new(num_domains.max(1)),
            unreachable: RwLock::new(HashSet::new()),
            frames: AtomicUsize::new(0),
        }
    }

    /// Refuse (or accept again) every frame sent to `domain`.
    pub fn set_unreachable(
        &self,
        domain: DomainId,
        unreachable: bool,
    ) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(domain);
        } else {
            set.remove(&domain);
        }
    }

    /// Frames delivered so far.
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    fn index(
        &self,
        domain: DomainId,
    ) -> Result<usize, TransportError> {
        let index = domain.index();
        if index < self.senders.len() {
            Ok(index)
        } else {
            Err(TransportError::UnknownDomain(domain))
        }
    }
}

impl Transport for LocalFabric {
    fn num_domains(&self) -> usize {
        self.senders.len()
    }

    fn send(
        &self,
        source: DomainId,
        target: DomainId,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        let index = self.index(target)?;
        if self.unreachable.read().contains(&target) {
            return Err(TransportError::Unreachable {
                from: source,
                to: target,
            });
        }
        trace!("{} -> {}: {} byte frame", source, target, bytes.len());
        self.senders[index]
            .send(Frame { source, bytes })
            .map_err(|_| TransportError::Disconnected(target))?;
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_reachable(
        &self,
        _source: DomainId,
        target: DomainId,
    ) -> bool {
        self.index(target).is_ok() && !self.unreachable.read().contains(&target)
    }

    fn recv(
        &self,
        domain: DomainId,
        timeout: Duration,
    ) -> Result<Option<Frame>, TransportError> {
        let index = self.index(domain)?;
        match self.receivers[index].recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected(domain)),
        }
    }

    fn barrier(
        &self,
        domain: DomainId,
    ) -> Result<(), TransportError> {
        self.index(domain)?;
        self.barrier.wait();
        Ok(())
    }
}
