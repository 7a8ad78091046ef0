//! Communication endpoint
//!
//! The only component that crosses domain boundaries. Each domain owns one
//! [`CommEndpoint`]; it issues active messages for remote spawns and
//! one-sided memory operations, and runs a dispatcher thread that serves
//! incoming requests and completes pending operations.
//!
//! ```text
//! origin domain                              target domain
//! proxy task ── Spawn ──────────────────────▶ dispatcher ─▶ pool (handler task)
//!     ▲                                                        │
//!     └──────────── SpawnDone ◀──────── RemoteCompletion ◀─────┘
//! ```

pub mod handler;
pub mod message;
pub mod transport;

pub use handler::{Handler, HandlerId, HandlerRegistry};
pub use message::{ActiveMessage, CodecError, OpId};
pub use transport::{Frame, LocalFabric, Transport, TransportError};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::runtime::domain::{DomainId, ExecutionDomain};
use crate::runtime::errors::{fatal, RuntimeError, RuntimeResult, TaskError, TaskResult};
use crate::runtime::group::TaskGroup;
use crate::runtime::memory::{LocalHandle, RemoteAddr};
use crate::runtime::scheduler::{
    suspend_current, BlockedOn, Task, TaskBuilder, TaskContext, TaskHandle, TaskId,
    TerminalObserver,
};
use crate::runtime::sync::SyncVar;

/// Handle to the eventual result of a remote operation.
///
/// [`CompletionToken::wait`] is a suspension point.
pub struct CompletionToken<T> {
    op: Option<OpId>,
    operation: String,
    slot: Arc<SyncVar<RuntimeResult<T>>>,
}

impl<T> fmt::Debug for CompletionToken<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CompletionToken")
            .field("op", &self.op)
            .field("operation", &self.operation)
            .field("complete", &self.slot.is_full())
            .finish()
    }
}

impl<T> CompletionToken<T> {
    fn pending(
        op: OpId,
        operation: String,
    ) -> Self {
        Self {
            op: Some(op),
            operation,
            slot: Arc::new(SyncVar::new()),
        }
    }

    /// A token that is already complete.
    fn ready(
        operation: String,
        result: RuntimeResult<T>,
    ) -> Self {
        Self {
            op: None,
            operation,
            slot: Arc::new(SyncVar::full(result)),
        }
    }

    /// Remote operation id; `None` for operations served locally.
    pub fn op(&self) -> Option<OpId> {
        self.op
    }

    pub fn is_complete(&self) -> bool {
        self.slot.is_full()
    }

    /// Wait for the result.
    pub fn wait(self) -> RuntimeResult<T> {
        self.slot.read_fe_as(BlockedOn::Completion {
            operation: self.operation,
        })
    }
}

/// Waiting side of an in-flight operation.
enum Pending {
    Spawn(Arc<SyncVar<TaskResult>>),
    Get(Arc<SyncVar<RuntimeResult<Vec<u8>>>>),
    Put(Arc<SyncVar<RuntimeResult<()>>>),
    Alloc(Arc<SyncVar<RuntimeResult<RemoteAddr>>>),
    Free(Arc<SyncVar<RuntimeResult<()>>>),
}

impl Pending {
    fn abandon(self) {
        match self {
            Pending::Spawn(slot) => slot.write_xf(Err(TaskError::Transport(
                "endpoint shut down before the remote task reported".to_string(),
            ))),
            Pending::Get(slot) => slot.write_xf(Err(RuntimeError::ShutDown)),
            Pending::Put(slot) | Pending::Free(slot) => slot.write_xf(Err(RuntimeError::ShutDown)),
            Pending::Alloc(slot) => slot.write_xf(Err(RuntimeError::ShutDown)),
        }
    }

    /// Complete the operation with a transport failure.
    fn fail(
        self,
        err: TransportError,
    ) {
        match self {
            Pending::Spawn(slot) => slot.write_xf(Err(TaskError::Transport(err.to_string()))),
            Pending::Get(slot) => slot.write_xf(Err(err.into())),
            Pending::Put(slot) | Pending::Free(slot) => slot.write_xf(Err(err.into())),
            Pending::Alloc(slot) => slot.write_xf(Err(err.into())),
        }
    }
}

/// An in-flight operation and the domain expected to answer it.
struct PendingOp {
    target: DomainId,
    waiter: Pending,
}

/// Endpoint counters.
#[derive(Debug, Default)]
pub struct EndpointStats {
    pub frames_sent: AtomicUsize,
    pub frames_received: AtomicUsize,
    /// Replies that matched no pending operation.
    pub stray_replies: AtomicUsize,
    pub malformed_frames: AtomicUsize,
}

/// Per-domain communication endpoint.
pub struct CommEndpoint {
    domain: DomainId,
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerRegistry>,
    owner: Weak<ExecutionDomain>,
    pending: Mutex<HashMap<OpId, PendingOp>>,
    next_op: AtomicU64,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
    stats: EndpointStats,
}

impl fmt::Debug for CommEndpoint {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CommEndpoint")
            .field("domain", &self.domain)
            .field("pending", &self.pending_ops())
            .field("running", &self.is_running())
            .finish()
    }
}

impl CommEndpoint {
    pub(crate) fn new(
        domain: DomainId,
        transport: Arc<dyn Transport>,
        handlers: Arc<HandlerRegistry>,
        owner: Weak<ExecutionDomain>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            domain,
            transport,
            handlers,
            owner,
            pending: Mutex::new(HashMap::new()),
            next_op: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(true)),
            poll_interval,
            dispatcher: Mutex::new(None),
            stats: EndpointStats::default(),
        }
    }

    /// Start the dispatcher thread.
    pub(crate) fn start(&self) -> std::io::Result<()> {
        let owner = self.owner.clone();
        let transport = self.transport.clone();
        let running = self.running.clone();
        let domain = self.domain;
        let poll = self.poll_interval;
        let handle = thread::Builder::new()
            .name(format!("{}-dispatch", domain))
            .spawn(move || dispatch_loop(owner, transport, running, domain, poll))?;
        *self.dispatcher.lock() = Some(handle);
        debug!("{}: dispatcher started", domain);
        Ok(())
    }

    #[inline]
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn num_domains(&self) -> usize {
        self.transport.num_domains()
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Operations issued but not yet completed.
    pub fn pending_ops(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn owner(&self) -> RuntimeResult<Arc<ExecutionDomain>> {
        self.owner.upgrade().ok_or(RuntimeError::ShutDown)
    }

    fn check_domain(
        &self,
        target: DomainId,
    ) -> RuntimeResult<()> {
        if target.index() < self.transport.num_domains() {
            Ok(())
        } else {
            Err(RuntimeError::UnknownDomain(target))
        }
    }

    fn next_op(&self) -> OpId {
        OpId(self.next_op.fetch_add(1, Ordering::SeqCst))
    }

    /// Record `pending` and send `message`. The entry exists before the
    /// frame leaves so that a fast reply always finds it.
    fn issue(
        &self,
        target: DomainId,
        pending: Pending,
        message: ActiveMessage,
    ) -> RuntimeResult<()> {
        if !self.is_running() {
            return Err(RuntimeError::ShutDown);
        }
        let op = message.op();
        self.pending.lock().insert(
            op,
            PendingOp {
                target,
                waiter: pending,
            },
        );
        trace!("{}: {} {} -> {}", self.domain, message.kind(), op, target);
        if let Err(err) = self.transport.send(self.domain, target, message.encode()) {
            self.pending.lock().remove(&op);
            return Err(err.into());
        }
        self.stats.frames_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reply(
        &self,
        target: DomainId,
        message: ActiveMessage,
    ) {
        trace!("{}: {} {} -> {}", self.domain, message.kind(), message.op(), target);
        match self.transport.send(self.domain, target, message.encode()) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::SeqCst);
            },
            Err(err) => error!(
                "{}: could not send {} for {} to {}: {}",
                self.domain,
                message.kind(),
                message.op(),
                target,
                err
            ),
        }
    }

    /// Spawn `handler(args)` on `target` as a child of `group`.
    ///
    /// The returned handle is a local proxy task registered in `group` like
    /// any local child. It terminates with the remote task's outcome, or
    /// with `TaskError::Transport` when the remote task cannot be reached.
    pub fn remote_spawn(
        &self,
        group: &TaskGroup,
        target: DomainId,
        handler: &str,
        args: Vec<u8>,
    ) -> RuntimeResult<TaskHandle> {
        self.check_domain(target)?;
        let id = self
            .handlers
            .id(handler)
            .ok_or_else(|| RuntimeError::UnknownHandler(handler.to_string()))?;
        let owner = self.owner()?;
        let weak = self.owner.clone();

        group.spawn_with(
            owner.pool(),
            TaskBuilder::new().name(format!("{} on {}", handler, target)),
            move |ctx| {
                let domain = weak
                    .upgrade()
                    .ok_or_else(|| TaskError::Transport("origin domain shut down".to_string()))?;
                domain.endpoint().run_remote(&domain, ctx, target, id, args)
            },
        )
    }

    /// Body of a proxy task.
    fn run_remote(
        &self,
        domain: &ExecutionDomain,
        ctx: &TaskContext,
        target: DomainId,
        handler: HandlerId,
        args: Vec<u8>,
    ) -> TaskResult {
        if target == self.domain {
            let handler = self
                .handlers
                .get(handler)
                .cloned()
                .ok_or_else(|| TaskError::raised(format!("unknown handler {:?}", handler)))?;
            return handler(domain, ctx, &args);
        }

        let op = self.next_op();
        let slot = Arc::new(SyncVar::new());
        self.issue(
            target,
            Pending::Spawn(slot.clone()),
            ActiveMessage::Spawn {
                op,
                handler,
                origin_task: ctx.id(),
                args,
            },
        )?;
        slot.read_fe_as(BlockedOn::Completion {
            operation: format!("remote spawn {} on {}", op, target),
        })
    }

    /// Read the range named by `addr`.
    pub fn get(
        &self,
        addr: RemoteAddr,
    ) -> CompletionToken<Vec<u8>> {
        let operation = format!("get {}", addr);
        if addr.domain() == self.domain {
            let result = self
                .owner()
                .and_then(|domain| Ok(domain.memory().read_all(addr.handle())?));
            return CompletionToken::ready(operation, result);
        }
        if let Err(err) = self.check_domain(addr.domain()) {
            return CompletionToken::ready(operation, Err(err));
        }

        let op = self.next_op();
        let token = CompletionToken::pending(op, operation);
        let sent = self.issue(
            addr.domain(),
            Pending::Get(token.slot.clone()),
            ActiveMessage::Get {
                op,
                handle: addr.handle(),
            },
        );
        if let Err(err) = sent {
            token.slot.write_xf(Err(err));
        }
        token
    }

    /// Write `data` at the start of the range named by `addr`. The token
    /// completes once the bytes are in the target's memory.
    pub fn put(
        &self,
        addr: RemoteAddr,
        data: Vec<u8>,
    ) -> CompletionToken<()> {
        let operation = format!("put {}", addr);
        if addr.domain() == self.domain {
            let result = self
                .owner()
                .and_then(|domain| Ok(domain.memory().write(addr.handle(), 0, &data)?));
            return CompletionToken::ready(operation, result);
        }
        if let Err(err) = self.check_domain(addr.domain()) {
            return CompletionToken::ready(operation, Err(err));
        }

        let op = self.next_op();
        let token = CompletionToken::pending(op, operation);
        let sent = self.issue(
            addr.domain(),
            Pending::Put(token.slot.clone()),
            ActiveMessage::Put {
                op,
                handle: addr.handle(),
                data,
            },
        );
        if let Err(err) = sent {
            token.slot.write_xf(Err(err));
        }
        token
    }

    /// Allocate `len` zeroed bytes on `target`.
    pub fn alloc(
        &self,
        target: DomainId,
        len: usize,
    ) -> CompletionToken<RemoteAddr> {
        let operation = format!("alloc {} byte(s) on {}", len, target);
        if target == self.domain {
            let result = self.owner().and_then(|domain| {
                let handle = domain.memory().alloc(len)?;
                Ok(RemoteAddr::new(target, handle))
            });
            return CompletionToken::ready(operation, result);
        }
        if let Err(err) = self.check_domain(target) {
            return CompletionToken::ready(operation, Err(err));
        }

        let op = self.next_op();
        let token = CompletionToken::pending(op, operation);
        let sent = self.issue(
            target,
            Pending::Alloc(token.slot.clone()),
            ActiveMessage::Alloc { op, len: len as u64 },
        );
        if let Err(err) = sent {
            token.slot.write_xf(Err(err));
        }
        token
    }

    /// Release the allocation named by `addr`.
    pub fn free(
        &self,
        addr: RemoteAddr,
    ) -> CompletionToken<()> {
        let operation = format!("free {}", addr);
        if addr.domain() == self.domain {
            let result = self
                .owner()
                .and_then(|domain| Ok(domain.memory().free(addr.handle())?));
            return CompletionToken::ready(operation, result);
        }
        if let Err(err) = self.check_domain(addr.domain()) {
            return CompletionToken::ready(operation, Err(err));
        }

        let op = self.next_op();
        let token = CompletionToken::pending(op, operation);
        let sent = self.issue(
            addr.domain(),
            Pending::Free(token.slot.clone()),
            ActiveMessage::Free {
                op,
                handle: addr.handle(),
            },
        );
        if let Err(err) = sent {
            token.slot.write_xf(Err(err));
        }
        token
    }

    pub fn get_blocking(
        &self,
        addr: RemoteAddr,
    ) -> RuntimeResult<Vec<u8>> {
        self.get(addr).wait()
    }

    pub fn put_blocking(
        &self,
        addr: RemoteAddr,
        data: Vec<u8>,
    ) -> RuntimeResult<()> {
        self.put(addr, data).wait()
    }

    pub fn alloc_blocking(
        &self,
        target: DomainId,
        len: usize,
    ) -> RuntimeResult<RemoteAddr> {
        self.alloc(target, len).wait()
    }

    pub fn free_blocking(
        &self,
        addr: RemoteAddr,
    ) -> RuntimeResult<()> {
        self.free(addr).wait()
    }

    /// Copy the remote range `addr` into the local range `local`.
    pub fn get_into(
        &self,
        addr: RemoteAddr,
        local: LocalHandle,
    ) -> RuntimeResult<()> {
        let data = self.get_blocking(addr)?;
        self.owner()?.memory().write(local, 0, &data)?;
        Ok(())
    }

    /// Copy the local range `local` into the remote range `addr`.
    pub fn put_from(
        &self,
        local: LocalHandle,
        addr: RemoteAddr,
    ) -> RuntimeResult<()> {
        let data = self.owner()?.memory().read_all(local)?;
        self.put_blocking(addr, data)
    }

    /// Wait until every domain reaches the barrier. A suspension point.
    pub fn barrier(&self) -> RuntimeResult<()> {
        let suspension = suspend_current(BlockedOn::Completion {
            operation: "barrier".to_string(),
        });
        let result = self.transport.barrier(self.domain);
        suspension.resume();
        Ok(result?)
    }

    /// Handle one decoded frame.
    fn serve(
        &self,
        domain: &Arc<ExecutionDomain>,
        source: DomainId,
        message: ActiveMessage,
    ) {
        let reply = match message {
            ActiveMessage::Spawn {
                op,
                handler,
                origin_task,
                args,
            } => {
                self.materialize(domain, source, op, handler, origin_task, args);
                return;
            },
            ActiveMessage::Get { op, handle } => ActiveMessage::GetReply {
                op,
                result: domain.memory().read_all(handle).map_err(|e| e.to_string()),
            },
            ActiveMessage::Put { op, handle, data } => ActiveMessage::PutAck {
                op,
                result: domain.memory().write(handle, 0, &data).map_err(|e| e.to_string()),
            },
            ActiveMessage::Alloc { op, len } => ActiveMessage::AllocReply {
                op,
                result: domain.memory().alloc(len as usize).map_err(|e| e.to_string()),
            },
            ActiveMessage::Free { op, handle } => ActiveMessage::FreeAck {
                op,
                result: domain.memory().free(handle).map_err(|e| e.to_string()),
            },
            reply => {
                self.complete(source, reply);
                return;
            },
        };
        self.reply(source, reply);
    }

    /// Turn a `Spawn` request into a task on this domain's pool.
    fn materialize(
        &self,
        domain: &Arc<ExecutionDomain>,
        source: DomainId,
        op: OpId,
        id: HandlerId,
        origin_task: TaskId,
        args: Vec<u8>,
    ) {
        let Some(handler) = self.handlers.get(id).cloned() else {
            self.reply(
                source,
                ActiveMessage::SpawnDone {
                    op,
                    outcome: Err(TaskError::raised(format!("unknown handler {:?}", id))),
                },
            );
            return;
        };
        let name = self.handlers.name(id).unwrap_or("handler");

        let weak = Arc::downgrade(domain);
        let task = domain.pool().build_task(
            TaskBuilder::new().name(format!("{} from {}/{}", name, source, origin_task)),
            move |ctx| {
                let domain = weak
                    .upgrade()
                    .ok_or_else(|| TaskError::Transport("target domain shut down".to_string()))?;
                handler(&domain, ctx, &args)
            },
        );
        let reporter = RemoteCompletion {
            transport: self.transport.clone(),
            from: self.domain,
            to: source,
            op,
        };
        if let Err(err) = task.set_observer(Arc::new(reporter)) {
            fatal(err);
        }

        debug!("{}: materialized {} for {} from {}", self.domain, task.id(), op, source);
        if let Err(err) = domain.pool().spawn(task.clone()) {
            task.clear_observer();
            self.reply(
                source,
                ActiveMessage::SpawnDone {
                    op,
                    outcome: Err(err.into()),
                },
            );
        }
    }

    /// Deliver a reply to its pending operation. Each operation completes
    /// at most once; anything without a pending entry is dropped.
    fn complete(
        &self,
        source: DomainId,
        message: ActiveMessage,
    ) {
        let op = message.op();
        let Some(PendingOp { target, waiter }) = self.pending.lock().remove(&op) else {
            warn!("{}: stray {} for {} from {}", self.domain, message.kind(), op, source);
            self.stats.stray_replies.fetch_add(1, Ordering::SeqCst);
            return;
        };

        match (waiter, message) {
            (Pending::Spawn(slot), ActiveMessage::SpawnDone { outcome, .. }) => slot.write_xf(outcome),
            (Pending::Get(slot), ActiveMessage::GetReply { result, .. }) => {
                slot.write_xf(result.map_err(RuntimeError::Remote))
            },
            (Pending::Put(slot), ActiveMessage::PutAck { result, .. })
            | (Pending::Free(slot), ActiveMessage::FreeAck { result, .. }) => {
                slot.write_xf(result.map_err(RuntimeError::Remote))
            },
            (Pending::Alloc(slot), ActiveMessage::AllocReply { result, .. }) => slot.write_xf(
                result
                    .map(|handle| RemoteAddr::new(target, handle))
                    .map_err(RuntimeError::Remote),
            ),
            (pending, message) => {
                warn!(
                    "{}: {} from {} does not answer the operation pending as {}",
                    self.domain,
                    message.kind(),
                    source,
                    op
                );
                self.stats.stray_replies.fetch_add(1, Ordering::SeqCst);
                self.pending.lock().insert(op, PendingOp { target, waiter: pending });
            },
        }
    }

    /// Fail the operation a malformed reply from `source` was meant for.
    fn fail_malformed(
        &self,
        source: DomainId,
        op: OpId,
        err: CodecError,
    ) {
        let entry = {
            let mut pending = self.pending.lock();
            let answers = pending.get(&op).is_some_and(|entry| entry.target == source);
            if answers {
                pending.remove(&op)
            } else {
                None
            }
        };
        let Some(entry) = entry else {
            warn!("{}: dropping malformed {} from {}: {}", self.domain, op, source, err);
            return;
        };
        warn!("{}: reply for {} from {} is malformed: {}", self.domain, op, source, err);
        entry.waiter.fail(TransportError::Codec(err));
    }

    /// Fail every pending operation whose reply can no longer reach this
    /// domain. Returns how many were failed.
    ///
    /// Runs while the inbox is empty: a reply sent before its link went
    /// down has already been served.
    pub(crate) fn sweep_unreachable(&self) -> usize {
        let lost: Vec<(OpId, PendingOp)> = {
            let mut pending = self.pending.lock();
            let ops: Vec<OpId> = pending
                .iter()
                .filter(|(_, entry)| !self.transport.is_reachable(entry.target, self.domain))
                .map(|(op, _)| *op)
                .collect();
            ops.into_iter()
                .filter_map(|op| pending.remove(&op).map(|entry| (op, entry)))
                .collect()
        };
        for (op, entry) in &lost {
            warn!(
                "{}: {} is waiting on {}, which can no longer reach this domain",
                self.domain, op, entry.target
            );
        }
        let count = lost.len();
        for (_, entry) in lost {
            let err = TransportError::Unreachable {
                from: entry.target,
                to: self.domain,
            };
            entry.waiter.fail(err);
        }
        count
    }

    /// Stop the dispatcher and fail every pending operation.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("{}: dispatcher thread panicked", self.domain);
            }
        }
        let abandoned: Vec<_> = self.pending.lock().drain().map(|(_, entry)| entry.waiter).collect();
        if !abandoned.is_empty() {
            debug!("{}: abandoning {} pending operation(s)", self.domain, abandoned.len());
        }
        for pending in abandoned {
            pending.abandon();
        }
    }
}

impl Drop for CommEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reports the outcome of a materialized remote task to its origin.
struct RemoteCompletion {
    transport: Arc<dyn Transport>,
    from: DomainId,
    to: DomainId,
    op: OpId,
}

impl TerminalObserver for RemoteCompletion {
    fn on_child_terminal(
        &self,
        task: &Task,
        outcome: TaskResult,
    ) {
        trace!("{}: {} done, reporting {} to {}", self.from, task.id(), self.op, self.to);
        let message = ActiveMessage::SpawnDone { op: self.op, outcome };
        if let Err(err) = self.transport.send(self.from, self.to, message.encode()) {
            error!(
                "{}: outcome of {} ({}) could not reach {}: {}",
                self.from,
                task.id(),
                self.op,
                self.to,
                err
            );
        }
    }
}

fn dispatch_loop(
    owner: Weak<ExecutionDomain>,
    transport: Arc<dyn Transport>,
    running: Arc<AtomicBool>,
    domain: DomainId,
    poll: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let frame = match transport.recv(domain, poll) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                if let Some(owner) = owner.upgrade() {
                    owner.endpoint().sweep_unreachable();
                }
                continue;
            },
            Err(err) => {
                warn!("{}: dispatcher stops: {}", domain, err);
                break;
            },
        };
        let Some(owner) = owner.upgrade() else {
            break;
        };
        let endpoint = owner.endpoint();
        endpoint.stats.frames_received.fetch_add(1, Ordering::SeqCst);

        match ActiveMessage::decode(&frame.bytes) {
            Ok(message) => {
                trace!("{}: received {} {} from {}", domain, message.kind(), message.op(), frame.source);
                endpoint.serve(&owner, frame.source, message);
            },
            Err(err) => {
                endpoint.stats.malformed_frames.fetch_add(1, Ordering::SeqCst);
                match ActiveMessage::reply_op(&frame.bytes) {
                    Some(op) => endpoint.fail_malformed(frame.source, op, err),
                    None => warn!("{}: dropping malformed frame from {}: {}", domain, frame.source, err),
                }
            },
        }
    }
    trace!("{}: dispatcher exits", domain);
}

#[cfg(test)]
mod tests;
