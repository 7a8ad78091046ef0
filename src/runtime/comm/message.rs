//! Active-message wire format.
//!
//! Frame layout: magic `CFAM` (big endian, readable in dumps), a version
//! byte, a tag byte, then the message fields in little endian. Strings and
//! byte buffers carry a `u32` length prefix.

use std::fmt;

use thiserror::Error;

use super::handler::HandlerId;
use crate::runtime::domain::DomainId;
use crate::runtime::errors::{GroupError, TaskError, TaskFailure, TaskResult};
use crate::runtime::memory::LocalHandle;
use crate::runtime::scheduler::TaskId;

/// Frame magic: 'C' 'F' 'A' 'M'.
pub const MAGIC: u32 = 0x4346_414D;
/// Wire format version.
pub const VERSION: u8 = 1;
/// Nesting limit for group errors inside a frame.
const MAX_ERROR_DEPTH: usize = 32;

const TAG_SPAWN: u8 = 1;
const TAG_SPAWN_DONE: u8 = 2;
const TAG_GET: u8 = 3;
const TAG_GET_REPLY: u8 = 4;
const TAG_PUT: u8 = 5;
const TAG_PUT_ACK: u8 = 6;
const TAG_ALLOC: u8 = 7;
const TAG_ALLOC_REPLY: u8 = 8;
const TAG_FREE: u8 = 9;
const TAG_FREE_ACK: u8 = 10;

/// Decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown tag {0}")]
    UnknownTag(u8),
    #[error("truncated frame: needed {needed} byte(s), {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("error nesting deeper than {0}")]
    TooDeep(usize),
    #[error("{0} trailing byte(s) after message")]
    TrailingBytes(usize),
}

/// Identifier of one in-flight remote operation, unique per origin domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Messages exchanged between endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveMessage {
    /// Run `handler` with `args` as a new task on the target.
    Spawn {
        op: OpId,
        handler: HandlerId,
        origin_task: TaskId,
        args: Vec<u8>,
    },
    /// Outcome of a spawned task.
    SpawnDone { op: OpId, outcome: TaskResult },
    /// Read the range named by `handle`.
    Get { op: OpId, handle: LocalHandle },
    GetReply {
        op: OpId,
        result: Result<Vec<u8>, String>,
    },
    /// Write `data` at the start of `handle`.
    Put {
        op: OpId,
        handle: LocalHandle,
        data: Vec<u8>,
    },
    PutAck {
        op: OpId,
        result: Result<(), String>,
    },
    /// Allocate `len` zeroed bytes.
    Alloc { op: OpId, len: u64 },
    AllocReply {
        op: OpId,
        result: Result<LocalHandle, String>,
    },
    /// Release the allocation named by `handle`.
    Free { op: OpId, handle: LocalHandle },
    FreeAck {
        op: OpId,
        result: Result<(), String>,
    },
}

impl ActiveMessage {
    /// The operation this message belongs to.
    pub fn op(&self) -> OpId {
        match self {
            ActiveMessage::Spawn { op, .. }
            | ActiveMessage::SpawnDone { op, .. }
            | ActiveMessage::Get { op, .. }
            | ActiveMessage::GetReply { op, .. }
            | ActiveMessage::Put { op, .. }
            | ActiveMessage::PutAck { op, .. }
            | ActiveMessage::Alloc { op, .. }
            | ActiveMessage::AllocReply { op, .. }
            | ActiveMessage::Free { op, .. }
            | ActiveMessage::FreeAck { op, .. } => *op,
        }
    }

    /// Message name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ActiveMessage::Spawn { .. } => "spawn",
            ActiveMessage::SpawnDone { .. } => "spawn-done",
            ActiveMessage::Get { .. } => "get",
            ActiveMessage::GetReply { .. } => "get-reply",
            ActiveMessage::Put { .. } => "put",
            ActiveMessage::PutAck { .. } => "put-ack",
            ActiveMessage::Alloc { .. } => "alloc",
            ActiveMessage::AllocReply { .. } => "alloc-reply",
            ActiveMessage::Free { .. } => "free",
            ActiveMessage::FreeAck { .. } => "free-ack",
        }
    }

    /// Whether this message answers a request.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            ActiveMessage::SpawnDone { .. }
                | ActiveMessage::GetReply { .. }
                | ActiveMessage::PutAck { .. }
                | ActiveMessage::AllocReply { .. }
                | ActiveMessage::FreeAck { .. }
        )
    }

    /// Encode into a frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.buf.extend_from_slice(&MAGIC.to_be_bytes());
        w.u8(VERSION);
        match self {
            ActiveMessage::Spawn {
                op,
                handler,
                origin_task,
                args,
            } => {
                w.u8(TAG_SPAWN);
                w.u64(op.0);
                w.u32(handler.0);
                w.u64(origin_task.0 as u64);
                w.bytes(args);
            },
            ActiveMessage::SpawnDone { op, outcome } => {
                w.u8(TAG_SPAWN_DONE);
                w.u64(op.0);
                match outcome {
                    Ok(()) => w.u8(0),
                    Err(error) => {
                        w.u8(1);
                        w.task_error(error, 0);
                    },
                }
            },
            ActiveMessage::Get { op, handle } => {
                w.u8(TAG_GET);
                w.u64(op.0);
                w.handle(handle);
            },
            ActiveMessage::GetReply { op, result } => {
                w.u8(TAG_GET_REPLY);
                w.u64(op.0);
                w.result(result, |w, data| w.bytes(data));
            },
            ActiveMessage::Put { op, handle, data } => {
                w.u8(TAG_PUT);
                w.u64(op.0);
                w.handle(handle);
                w.bytes(data);
            },
            ActiveMessage::PutAck { op, result } => {
                w.u8(TAG_PUT_ACK);
                w.u64(op.0);
                w.result(result, |_, _| {});
            },
            ActiveMessage::Alloc { op, len } => {
                w.u8(TAG_ALLOC);
                w.u64(op.0);
                w.u64(*len);
            },
            ActiveMessage::AllocReply { op, result } => {
                w.u8(TAG_ALLOC_REPLY);
                w.u64(op.0);
                w.result(result, |w, handle| w.handle(handle));
            },
            ActiveMessage::Free { op, handle } => {
                w.u8(TAG_FREE);
                w.u64(op.0);
                w.handle(handle);
            },
            ActiveMessage::FreeAck { op, result } => {
                w.u8(TAG_FREE_ACK);
                w.u64(op.0);
                w.result(result, |_, _| {});
            },
        }
        w.buf
    }

    /// Operation id of a frame whose header names a reply, read without
    /// decoding the body.
    pub fn reply_op(bytes: &[u8]) -> Option<OpId> {
        let mut r = Reader { bytes, pos: 0 };
        let magic = u32::from_be_bytes(r.array().ok()?);
        if magic != MAGIC || r.u8().ok()? != VERSION {
            return None;
        }
        match r.u8().ok()? {
            TAG_SPAWN_DONE | TAG_GET_REPLY | TAG_PUT_ACK | TAG_ALLOC_REPLY | TAG_FREE_ACK => {
                r.u64().ok().map(OpId)
            },
            _ => None,
        }
    }

    /// Decode a frame. The whole buffer must be consumed.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader { bytes, pos: 0 };
        let magic = u32::from_be_bytes(r.array()?);
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let version = r.u8()?;
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let tag = r.u8()?;
        let op = OpId(r.u64()?);
        let message = match tag {
            TAG_SPAWN => ActiveMessage::Spawn {
                op,
                handler: HandlerId(r.u32()?),
                origin_task: TaskId(r.u64()? as usize),
                args: r.bytes()?,
            },
            TAG_SPAWN_DONE => ActiveMessage::SpawnDone {
                op,
                outcome: match r.u8()? {
                    0 => Ok(()),
                    _ => Err(r.task_error(0)?),
                },
            },
            TAG_GET => ActiveMessage::Get {
                op,
                handle: r.handle()?,
            },
            TAG_GET_REPLY => ActiveMessage::GetReply {
                op,
                result: r.result(|r| r.bytes())?,
            },
            TAG_PUT => ActiveMessage::Put {
                op,
                handle: r.handle()?,
                data: r.bytes()?,
            },
            TAG_PUT_ACK => ActiveMessage::PutAck {
                op,
                result: r.result(|_| Ok(()))?,
            },
            TAG_ALLOC => ActiveMessage::Alloc { op, len: r.u64()? },
            TAG_ALLOC_REPLY => ActiveMessage::AllocReply {
                op,
                result: r.result(|r| r.handle())?,
            },
            TAG_FREE => ActiveMessage::Free {
                op,
                handle: r.handle()?,
            },
            TAG_FREE_ACK => ActiveMessage::FreeAck {
                op,
                result: r.result(|_| Ok(()))?,
            },
            other => return Err(CodecError::UnknownTag(other)),
        };

        let remaining = r.remaining();
        if remaining != 0 {
            return Err(CodecError::TrailingBytes(remaining));
        }
        Ok(message)
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(
        &mut self,
        value: u8,
    ) {
        self.buf.push(value);
    }

    fn u32(
        &mut self,
        value: u32,
    ) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(
        &mut self,
        value: u64,
    ) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(
        &mut self,
        data: &[u8],
    ) {
        self.u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    fn string(
        &mut self,
        s: &str,
    ) {
        self.bytes(s.as_bytes());
    }

    fn handle(
        &mut self,
        handle: &LocalHandle,
    ) {
        self.u64(handle.segment);
        self.u64(handle.offset as u64);
        self.u64(handle.len as u64);
    }

    fn result<T>(
        &mut self,
        result: &Result<T, String>,
        ok: impl FnOnce(&mut Self, &T),
    ) {
        match result {
            Ok(value) => {
                self.u8(0);
                ok(self, value);
            },
            Err(message) => {
                self.u8(1);
                self.string(message);
            },
        }
    }

    /// Group errors nested at `MAX_ERROR_DEPTH` are written as a `Raised`
    /// leaf carrying their rendered text, so every frame decodes.
    fn task_error(
        &mut self,
        error: &TaskError,
        depth: usize,
    ) {
        match error {
            TaskError::Group(group) if depth >= MAX_ERROR_DEPTH => {
                self.u8(0);
                self.string(&group.to_string());
            },
            TaskError::Raised(message) => {
                self.u8(0);
                self.string(message);
            },
            TaskError::Panicked(message) => {
                self.u8(1);
                self.string(message);
            },
            TaskError::Group(group) => {
                self.u8(2);
                self.u32(group.len() as u32);
                for failure in group.iter() {
                    self.u64(failure.task.0 as u64);
                    self.u32(failure.domain.0);
                    self.task_error(&failure.error, depth + 1);
                }
            },
            TaskError::Transport(message) => {
                self.u8(3);
                self.string(message);
            },
            TaskError::ResourceExhausted(message) => {
                self.u8(4);
                self.string(message);
            },
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(
        &mut self,
        n: usize,
    ) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    fn handle(&mut self) -> Result<LocalHandle, CodecError> {
        Ok(LocalHandle {
            segment: self.u64()?,
            offset: self.u64()? as usize,
            len: self.u64()? as usize,
        })
    }

    fn result<T>(
        &mut self,
        ok: impl FnOnce(&mut Self) -> Result<T, CodecError>,
    ) -> Result<Result<T, String>, CodecError> {
        match self.u8()? {
            0 => Ok(Ok(ok(self)?)),
            _ => Ok(Err(self.string()?)),
        }
    }

    fn task_error(
        &mut self,
        depth: usize,
    ) -> Result<TaskError, CodecError> {
        if depth > MAX_ERROR_DEPTH {
            return Err(CodecError::TooDeep(MAX_ERROR_DEPTH));
        }
        let error = match self.u8()? {
            0 => TaskError::Raised(self.string()?),
            1 => TaskError::Panicked(self.string()?),
            2 => {
                let count = self.u32()? as usize;
                // Each failure takes at least 13 bytes.
                if count > self.remaining() / 13 {
                    return Err(CodecError::Truncated {
                        needed: count.saturating_mul(13),
                        remaining: self.remaining(),
                    });
                }
                let mut failures = Vec::with_capacity(count);
                for _ in 0..count {
                    let task = TaskId(self.u64()? as usize);
                    let domain = DomainId(self.u32()?);
                    let error = self.task_error(depth + 1)?;
                    failures.push(TaskFailure { task, domain, error });
                }
                TaskError::Group(GroupError::new(failures))
            },
            3 => TaskError::Transport(self.string()?),
            4 => TaskError::ResourceExhausted(self.string()?),
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok(error)
    }
}
