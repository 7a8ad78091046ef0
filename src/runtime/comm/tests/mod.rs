//! Comm 单元测试
//!
//! 测试消息编解码、本地传输和处理器注册表

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;

use crate::runtime::comm::message::{MAGIC, VERSION};
use crate::runtime::comm::{
    ActiveMessage, CodecError, HandlerId, HandlerRegistry, LocalFabric, OpId, Transport,
    TransportError,
};
use crate::runtime::domain::DomainId;
use crate::runtime::errors::{GroupError, TaskError, TaskFailure};
use crate::runtime::memory::LocalHandle;
use crate::runtime::scheduler::TaskId;

fn handle(
    segment: u64,
    offset: usize,
    len: usize,
) -> LocalHandle {
    LocalHandle {
        segment,
        offset,
        len,
    }
}

fn nested_error(depth: usize) -> TaskError {
    let mut error = TaskError::raised("leaf");
    for level in 0..depth {
        error = TaskError::Group(GroupError::new(vec![TaskFailure::new(
            TaskId(level),
            DomainId(1),
            error,
        )]));
    }
    error
}

#[cfg(test)]
mod codec_tests {
    use super::*;

    #[test]
    fn test_frame_header() {
        let bytes = ActiveMessage::Alloc {
            op: OpId(3),
            len: 64,
        }
        .encode();
        assert_eq!(&bytes[..4], &MAGIC.to_be_bytes());
        assert_eq!(bytes[4], VERSION);
    }

    #[test]
    fn test_spawn_done_carries_nested_group_error() {
        let outcome = Err(TaskError::Group(GroupError::new(vec![
            TaskFailure::new(TaskId(4), DomainId(1), TaskError::raised("boom")),
            TaskFailure::new(TaskId(5), DomainId(1), TaskError::Panicked("oops".into())),
            TaskFailure::new(TaskId(6), DomainId(0), nested_error(3)),
        ])));
        let message = ActiveMessage::SpawnDone {
            op: OpId(11),
            outcome,
        };
        let decoded = ActiveMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_reply_classification() {
        let get = ActiveMessage::Get {
            op: OpId(1),
            handle: handle(0, 0, 4),
        };
        let reply = ActiveMessage::GetReply {
            op: OpId(1),
            result: Err("no such segment".into()),
        };
        assert!(!get.is_reply());
        assert!(reply.is_reply());
        assert_eq!(get.op(), reply.op());
        assert_eq!(get.kind(), "get");
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = ActiveMessage::Free {
            op: OpId(1),
            handle: handle(2, 0, 8),
        }
        .encode();
        bytes[0] ^= 0xFF;
        assert!(matches!(ActiveMessage::decode(&bytes), Err(CodecError::BadMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = ActiveMessage::Alloc {
            op: OpId(1),
            len: 1,
        }
        .encode();
        bytes[4] = VERSION + 1;
        assert_eq!(
            ActiveMessage::decode(&bytes),
            Err(CodecError::UnsupportedVersion(VERSION + 1))
        );
    }

    #[test]
    fn test_unknown_tag() {
        let mut bytes = ActiveMessage::Alloc {
            op: OpId(1),
            len: 1,
        }
        .encode();
        bytes[5] = 0xEE;
        assert_eq!(ActiveMessage::decode(&bytes), Err(CodecError::UnknownTag(0xEE)));
    }

    #[test]
    fn test_truncated_frame() {
        let bytes = ActiveMessage::Put {
            op: OpId(9),
            handle: handle(1, 0, 16),
            data: vec![7; 16],
        }
        .encode();
        for cut in [0, 3, 5, 10, bytes.len() - 1] {
            assert!(
                matches!(
                    ActiveMessage::decode(&bytes[..cut]),
                    Err(CodecError::Truncated { .. })
                ),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = ActiveMessage::FreeAck {
            op: OpId(2),
            result: Ok(()),
        }
        .encode();
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(ActiveMessage::decode(&bytes), Err(CodecError::TrailingBytes(2)));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut bytes = ActiveMessage::PutAck {
            op: OpId(2),
            result: Err("ab".into()),
        }
        .encode();
        let last = bytes.len() - 1;
        bytes[last] = 0xFF;
        assert_eq!(ActiveMessage::decode(&bytes), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_error_nesting_limit() {
        let shallow = ActiveMessage::SpawnDone {
            op: OpId(1),
            outcome: Err(nested_error(8)),
        };
        assert!(ActiveMessage::decode(&shallow.encode()).is_ok());

        // A frame nested past the limit, written by hand.
        let mut bytes = MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[VERSION, 2]);
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.push(1);
        for level in 0..40u64 {
            bytes.push(2);
            bytes.extend_from_slice(&1u32.to_le_bytes());
            bytes.extend_from_slice(&level.to_le_bytes());
            bytes.extend_from_slice(&1u32.to_le_bytes());
        }
        bytes.push(0);
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(b"leaf");
        assert!(matches!(ActiveMessage::decode(&bytes), Err(CodecError::TooDeep(_))));
    }

    #[test]
    fn test_deep_error_collapses_when_encoded() {
        let deep = ActiveMessage::SpawnDone {
            op: OpId(1),
            outcome: Err(nested_error(40)),
        };
        let Ok(ActiveMessage::SpawnDone {
            outcome: Err(mut error),
            ..
        }) = ActiveMessage::decode(&deep.encode())
        else {
            panic!("deep error frame did not decode");
        };

        let mut groups = 0;
        while let TaskError::Group(group) = error {
            assert_eq!(group.len(), 1);
            error = group.into_iter().next().unwrap().error;
            groups += 1;
        }
        assert_eq!(groups, 32);
        assert!(matches!(error, TaskError::Raised(message) if message.contains("leaf")));
    }

    #[test]
    fn test_decode_never_panics_on_garbage() {
        fn prop(bytes: Vec<u8>) -> bool {
            let _ = ActiveMessage::decode(&bytes);
            true
        }
        quickcheck::quickcheck(prop as fn(Vec<u8>) -> bool);
    }

    #[test]
    fn test_decode_never_panics_after_valid_header() {
        fn prop(
            tag: u8,
            body: Vec<u8>,
        ) -> bool {
            let mut bytes = MAGIC.to_be_bytes().to_vec();
            bytes.push(VERSION);
            bytes.push(tag % 12);
            bytes.extend(body);
            let _ = ActiveMessage::decode(&bytes);
            true
        }
        quickcheck::quickcheck(prop as fn(u8, Vec<u8>) -> bool);
    }
}

fn message_strategy() -> impl Strategy<Value = ActiveMessage> {
    let op = any::<u64>().prop_map(OpId);
    let local = (any::<u64>(), 0usize..1 << 20, 0usize..1 << 20)
        .prop_map(|(segment, offset, len)| handle(segment, offset, len));
    let text = "[a-z ]{0,16}";
    prop_oneof![
        (op.clone(), any::<u32>(), any::<u32>(), prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(op, handler, task, args)| ActiveMessage::Spawn {
                op,
                handler: HandlerId(handler),
                origin_task: TaskId(task as usize),
                args,
            }),
        (op.clone(), prop::option::of(text)).prop_map(|(op, err)| ActiveMessage::SpawnDone {
            op,
            outcome: match err {
                Some(message) => Err(TaskError::Transport(message)),
                None => Ok(()),
            },
        }),
        (op.clone(), local.clone()).prop_map(|(op, handle)| ActiveMessage::Get { op, handle }),
        (op.clone(), prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(op, data)| ActiveMessage::GetReply { op, result: Ok(data) }),
        (op.clone(), local.clone(), prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(op, handle, data)| ActiveMessage::Put { op, handle, data }),
        (op.clone(), text).prop_map(|(op, message)| ActiveMessage::PutAck {
            op,
            result: Err(message),
        }),
        (op.clone(), any::<u64>()).prop_map(|(op, len)| ActiveMessage::Alloc { op, len }),
        (op.clone(), local.clone()).prop_map(|(op, handle)| ActiveMessage::AllocReply {
            op,
            result: Ok(handle),
        }),
        (op.clone(), local).prop_map(|(op, handle)| ActiveMessage::Free { op, handle }),
        op.prop_map(|op| ActiveMessage::FreeAck { op, result: Ok(()) }),
    ]
}

proptest! {
    #[test]
    fn prop_message_survives_the_wire(message in message_strategy()) {
        let decoded = ActiveMessage::decode(&message.encode());
        prop_assert_eq!(decoded, Ok(message));
    }
}

#[cfg(test)]
mod local_fabric_tests {
    use super::*;

    #[test]
    fn test_send_and_receive() {
        let fabric = LocalFabric::new(2);
        fabric.send(DomainId(0), DomainId(1), vec![1, 2, 3]).unwrap();
        let frame = fabric.recv(DomainId(1), Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(frame.source, DomainId(0));
        assert_eq!(frame.bytes, vec![1, 2, 3]);
        assert_eq!(fabric.frames(), 1);
    }

    #[test]
    fn test_recv_times_out() {
        let fabric = LocalFabric::new(1);
        let frame = fabric.recv(DomainId(0), Duration::from_millis(5)).unwrap();
        assert!(frame.is_none());
    }

    #[test]
    fn test_unknown_domain() {
        let fabric = LocalFabric::new(2);
        assert_eq!(
            fabric.send(DomainId(0), DomainId(5), vec![]),
            Err(TransportError::UnknownDomain(DomainId(5)))
        );
        assert!(fabric.recv(DomainId(2), Duration::ZERO).is_err());
    }

    #[test]
    fn test_unreachable_domain() {
        let fabric = LocalFabric::new(2);
        fabric.set_unreachable(DomainId(1), true);
        assert_eq!(
            fabric.send(DomainId(0), DomainId(1), vec![0]),
            Err(TransportError::Unreachable {
                from: DomainId(0),
                to: DomainId(1),
            })
        );
        fabric.set_unreachable(DomainId(1), false);
        assert!(fabric.send(DomainId(0), DomainId(1), vec![0]).is_ok());
    }

    #[test]
    fn test_barrier_releases_all_domains() {
        let fabric = Arc::new(LocalFabric::new(3));
        let waiters: Vec<_> = (0..3)
            .map(|i| {
                let fabric = fabric.clone();
                thread::spawn(move || fabric.barrier(DomainId(i)))
            })
            .collect();
        for waiter in waiters {
            assert!(waiter.join().unwrap().is_ok());
        }
    }
}

#[cfg(test)]
mod handler_registry_tests {
    use super::*;

    #[test]
    fn test_ids_follow_registration_order() {
        let mut registry = HandlerRegistry::new();
        let a = registry.register("a", |_, _, _| Ok(()));
        let b = registry.register("b", |_, _, _| Err(TaskError::raised("b")));
        assert_eq!(a, HandlerId(0));
        assert_eq!(b, HandlerId(1));
        assert_eq!(registry.id("b"), Some(b));
        assert_eq!(registry.name(a), Some("a"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_reregister_keeps_id() {
        let mut registry = HandlerRegistry::new();
        let first = registry.register("work", |_, _, _| Ok(()));
        let second = registry.register("work", |_, _, _| Ok(()));
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.id("missing").is_none());
        assert!(registry.get(HandlerId(0)).is_none());
    }
}
