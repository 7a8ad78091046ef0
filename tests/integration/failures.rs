use std::sync::Arc;
use std::time::Duration;

use conflux::runtime::comm::message::{MAGIC, VERSION};
use conflux::runtime::comm::{ActiveMessage, TransportError};
use conflux::runtime::{
    coforall, Cluster, DomainId, GroupError, HandlerRegistry, LocalFabric, RuntimeError, TaskError,
    TaskFailure, TaskGroup, TaskId, Transport,
};

use crate::common::{cluster, cluster_with_fabric, config};

fn noop_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register("noop", |_, _, _| Ok(()));
    handlers
}

#[test]
fn test_unreachable_target_fails_the_proxy_task() {
    let (cluster, fabric) = cluster_with_fabric(2, noop_handlers());
    fabric.set_unreachable(DomainId(1), true);
    let domain = cluster.domain(DomainId(0)).unwrap();

    let group = TaskGroup::unbounded(domain.pool());
    domain.endpoint().remote_spawn(&group, DomainId(1), "noop", Vec::new()).unwrap();
    let err = group.join().unwrap_err();

    assert_eq!(err.len(), 1);
    assert!(matches!(err.failures()[0].error, TaskError::Transport(_)));
    assert_eq!(err.failures()[0].domain, DomainId(0));
}

#[test]
fn test_lost_completion_fails_the_proxy_task() {
    let fabric = Arc::new(LocalFabric::new(2));
    let mut handlers = HandlerRegistry::new();
    let cut = fabric.clone();
    handlers.register("cut", move |_, _, _| {
        // The outcome of this task can no longer travel back.
        cut.set_unreachable(DomainId(0), true);
        Ok(())
    });
    let cluster = Cluster::launch_with_transport(config(2), handlers, fabric.clone()).unwrap();
    let domain = cluster.domain(DomainId(0)).unwrap();

    let group = TaskGroup::unbounded(domain.pool());
    domain.endpoint().remote_spawn(&group, DomainId(1), "cut", Vec::new()).unwrap();
    let err = group.join().unwrap_err();

    assert_eq!(err.len(), 1);
    assert!(matches!(&err.failures()[0].error, TaskError::Transport(message) if message.contains("unreachable")));
    assert_eq!(domain.endpoint().pending_ops(), 0);
    fabric.set_unreachable(DomainId(0), false);
}

#[test]
fn test_deeply_nested_remote_error_reaches_the_origin() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("deep", |_, _, _| {
        let mut error = TaskError::raised("bottom");
        for level in 0..40 {
            error = TaskError::Group(GroupError::new(vec![TaskFailure::new(
                TaskId(level),
                DomainId(1),
                error,
            )]));
        }
        Err(error)
    });
    let cluster = cluster(2, handlers);
    let domain = cluster.domain(DomainId(0)).unwrap();

    let group = TaskGroup::unbounded(domain.pool());
    domain.endpoint().remote_spawn(&group, DomainId(1), "deep", Vec::new()).unwrap();
    let err = group.join().unwrap_err();

    assert_eq!(err.len(), 1);
    assert!(err.failures()[0].error.as_group().is_some());
    let leaves = err.flatten();
    assert_eq!(leaves.len(), 1);
    assert!(leaves[0].error.to_string().contains("bottom"));
}

#[test]
fn test_malformed_reply_fails_the_waiting_proxy() {
    // Domain 1 exists on the fabric only; the test answers for it.
    let fabric = Arc::new(LocalFabric::new(2));
    let cluster = Cluster::launch_with_transport(config(1), noop_handlers(), fabric.clone()).unwrap();
    let domain = cluster.domain(DomainId(0)).unwrap();

    let group = TaskGroup::unbounded(domain.pool());
    domain.endpoint().remote_spawn(&group, DomainId(1), "noop", Vec::new()).unwrap();

    let frame = fabric.recv(DomainId(1), Duration::from_secs(5)).unwrap().unwrap();
    let ActiveMessage::Spawn { op, .. } = ActiveMessage::decode(&frame.bytes).unwrap() else {
        panic!("expected a spawn request");
    };
    let mut reply = MAGIC.to_be_bytes().to_vec();
    reply.extend_from_slice(&[VERSION, 2]);
    reply.extend_from_slice(&op.0.to_le_bytes());
    reply.extend_from_slice(&[1, 99]);
    fabric.send(DomainId(1), DomainId(0), reply).unwrap();

    let err = group.join().unwrap_err();
    assert_eq!(err.len(), 1);
    assert!(matches!(&err.failures()[0].error, TaskError::Transport(message) if message.contains("malformed")));
    assert_eq!(domain.endpoint().pending_ops(), 0);
}

#[test]
fn test_unreachable_target_fails_memory_ops() {
    let (cluster, fabric) = cluster_with_fabric(2, HandlerRegistry::new());
    let endpoint = cluster.domain(DomainId(0)).unwrap().endpoint();
    let addr = endpoint.alloc_blocking(DomainId(1), 8).unwrap();

    fabric.set_unreachable(DomainId(1), true);
    let err = endpoint.get_blocking(addr).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Transport(TransportError::Unreachable { .. })
    ));
    assert_eq!(endpoint.pending_ops(), 0);

    fabric.set_unreachable(DomainId(1), false);
    assert_eq!(endpoint.get_blocking(addr).unwrap(), vec![0; 8]);
}

#[test]
fn test_top_level_failure_is_uncaught() {
    let cluster = cluster(1, HandlerRegistry::new());
    let err = cluster.run_main(|_, _| Err(TaskError::raised("top"))).unwrap_err();
    match err {
        RuntimeError::Uncaught(errors) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors.failures()[0].error, TaskError::raised("top"));
        },
        other => panic!("expected an uncaught error, got {:?}", other),
    }
}

#[test]
fn test_nested_failures_flatten_to_leaves() {
    let cluster = cluster(1, HandlerRegistry::new());
    let err = cluster
        .run_main(|domain, _| {
            coforall(domain.pool(), 0..4usize, |i, _| {
                if i % 2 == 0 {
                    Err(TaskError::raised(format!("child {}", i)))
                } else {
                    Ok(())
                }
            })?;
            Ok(())
        })
        .unwrap_err();

    let RuntimeError::Uncaught(errors) = err else {
        panic!("expected an uncaught error");
    };
    assert_eq!(errors.len(), 1);
    let mut leaves: Vec<String> = errors.flatten().iter().map(|f| f.error.to_string()).collect();
    leaves.sort();
    assert_eq!(leaves, vec!["child 0".to_string(), "child 2".to_string()]);
}

#[test]
fn test_caught_group_error_does_not_escape() {
    let cluster = cluster(1, HandlerRegistry::new());
    cluster
        .run_main(|domain, ctx| {
            let group = TaskGroup::unbounded(ctx.pool());
            group.spawn(|_| Err(TaskError::raised("handled")))?;
            let caught = group.join().unwrap_err();
            assert_eq!(caught.messages(), vec!["handled".to_string()]);
            assert_eq!(domain.id(), DomainId(0));
            Ok(())
        })
        .unwrap();
}
