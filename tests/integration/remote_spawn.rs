use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use conflux::runtime::{DomainId, HandlerRegistry, RuntimeError, TaskError, TaskGroup};

use crate::common::cluster;

fn counting_handlers(counters: &Arc<Vec<AtomicUsize>>) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    let counts = counters.clone();
    handlers.register("bump", move |domain, _ctx, args| {
        counts[domain.id().index()].fetch_add(args[0] as usize, Ordering::SeqCst);
        Ok(())
    });
    handlers.register("refuse", |domain, _ctx, _args| {
        Err(TaskError::raised(format!("refused on {}", domain.id())))
    });
    handlers
}

#[test]
fn test_remote_side_effects_visible_after_join() {
    let counters = Arc::new((0..3).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
    let cluster = cluster(3, counting_handlers(&counters));

    let seen = counters.clone();
    cluster
        .run_main(move |domain, ctx| {
            let group = TaskGroup::unbounded(ctx.pool());
            for target in 0..3u32 {
                domain
                    .endpoint()
                    .remote_spawn(&group, DomainId(target), "bump", vec![target as u8 + 1])?;
            }
            group.join()?;
            for target in 0..3 {
                assert_eq!(seen[target].load(Ordering::SeqCst), target + 1);
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_remote_failure_reaches_the_group() {
    let counters = Arc::new((0..2).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
    let cluster = cluster(2, counting_handlers(&counters));
    let domain = cluster.domain(DomainId(0)).unwrap();

    let group = TaskGroup::unbounded(domain.pool());
    domain.endpoint().remote_spawn(&group, DomainId(1), "refuse", Vec::new()).unwrap();
    domain.endpoint().remote_spawn(&group, DomainId(1), "bump", vec![5]).unwrap();
    let err = group.join().unwrap_err();

    assert_eq!(err.len(), 1);
    assert_eq!(err.failures()[0].error, TaskError::raised("refused on Domain(1)"));
    assert_eq!(counters[1].load(Ordering::SeqCst), 5);
}

#[test]
fn test_nested_remote_spawns() {
    let mut handlers = HandlerRegistry::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let leaf_hits = hits.clone();
    handlers.register("leaf", move |_domain, _ctx, _args| {
        leaf_hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    handlers.register("relay", |domain, ctx, _args| {
        let group = TaskGroup::unbounded(ctx.pool());
        domain.endpoint().remote_spawn(&group, DomainId(0), "leaf", Vec::new())?;
        domain.endpoint().remote_spawn(&group, DomainId(0), "leaf", Vec::new())?;
        group.join()?;
        Ok(())
    });
    let cluster = cluster(2, handlers);

    cluster
        .run_main(|domain, ctx| {
            let group = TaskGroup::unbounded(ctx.pool());
            domain.endpoint().remote_spawn(&group, DomainId(1), "relay", Vec::new())?;
            group.join()?;
            Ok(())
        })
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_unknown_handler_and_domain() {
    let cluster = cluster(2, HandlerRegistry::new());
    let domain = cluster.domain(DomainId(0)).unwrap();
    let group = TaskGroup::unbounded(domain.pool());

    let err = domain.endpoint().remote_spawn(&group, DomainId(1), "missing", Vec::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownHandler(_)));

    let err = domain.endpoint().remote_spawn(&group, DomainId(7), "missing", Vec::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownDomain(DomainId(7))));

    assert!(group.join().is_ok());
}
