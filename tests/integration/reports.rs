use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use conflux::runtime::scheduler::BlockedOn;
use conflux::runtime::{Cluster, DomainId, HandlerRegistry, SyncCell, TaskHandle, TaskState};

use crate::common::config;

fn wait_for_state(
    handle: &TaskHandle,
    state: TaskState,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.state() != state {
        assert!(Instant::now() < deadline, "task never reached {:?}", state);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_snapshot_honours_flags() {
    let mut config = config(2);
    config.block_report = true;
    config.task_report = true;
    let cluster = Cluster::launch(config, HandlerRegistry::new()).unwrap();
    let domain = cluster.domain(DomainId(1)).unwrap();

    let gate = Arc::new(SyncCell::labeled("gate"));
    let waiter = {
        let gate = gate.clone();
        domain
            .spawn(move |_| {
                gate.read();
                Ok(())
            })
            .unwrap()
    };
    wait_for_state(&waiter, TaskState::Suspended);

    let report = cluster.snapshot();
    assert_eq!(report.domains.len(), 2);
    let on_one = &report.domains[1];
    assert_eq!(on_one.domain, DomainId(1));
    assert_eq!(on_one.live_tasks, 1);
    let blocked = on_one.blocked.as_ref().unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].task, waiter.id());
    assert_eq!(
        blocked[0].blocked_on,
        BlockedOn::Cell {
            label: Some("gate".to_string()),
        }
    );
    assert_eq!(on_one.tasks.as_ref().unwrap().len(), 1);
    assert_eq!(report.blocked_tasks(), 1);

    let text = report.to_string();
    assert!(text.contains("sync cell 'gate'"), "{}", text);
    let json = report.to_json().unwrap();
    assert!(json.contains("\"blocked\""));

    let bare = cluster.snapshot_with(false, false);
    assert!(bare.domains.iter().all(|d| d.blocked.is_none() && d.tasks.is_none()));
    assert!(!bare.to_json().unwrap().contains("\"blocked\""));

    gate.write(()).unwrap();
    assert_eq!(waiter.wait(), TaskState::Completed);
}

#[test]
fn test_task_tree_nests_children() {
    let mut config = config(1);
    config.task_report = true;
    let cluster = Cluster::launch(config, HandlerRegistry::new()).unwrap();
    let domain = cluster.domain(DomainId(0)).unwrap();

    let gate = Arc::new(SyncCell::<()>::new());
    let parent = {
        let gate = gate.clone();
        domain
            .spawn(move |ctx| {
                let group = conflux::runtime::TaskGroup::unbounded(ctx.pool());
                let inner = gate.clone();
                group.spawn(move |_| {
                    inner.read();
                    Ok(())
                })?;
                group.join()?;
                Ok(())
            })
            .unwrap()
    };
    wait_for_state(&parent, TaskState::Suspended);

    let report = cluster.snapshot();
    let tasks = report.domains[0].tasks.as_ref().unwrap();
    assert_eq!(tasks.len(), 2);
    let child = tasks.iter().find(|t| t.task != parent.id()).unwrap();
    assert_eq!(child.parent, Some(parent.id()));
    assert!(report.domains[0].blocked.is_none());

    gate.write(()).unwrap();
    assert_eq!(parent.wait(), TaskState::Completed);
}
