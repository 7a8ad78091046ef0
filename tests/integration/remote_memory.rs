use conflux::runtime::{coforall, DomainId, HandlerRegistry, RuntimeError};

use crate::common::cluster;

#[test]
fn test_alloc_put_get_free_round_trip() {
    let cluster = cluster(2, HandlerRegistry::new());
    let endpoint = cluster.domain(DomainId(0)).unwrap().endpoint();

    let addr = endpoint.alloc_blocking(DomainId(1), 16).unwrap();
    assert_eq!(addr.domain(), DomainId(1));
    assert_eq!(addr.len(), 16);
    assert_eq!(endpoint.get_blocking(addr).unwrap(), vec![0; 16]);

    let data: Vec<u8> = (0..16).collect();
    endpoint.put_blocking(addr, data.clone()).unwrap();
    assert_eq!(endpoint.get_blocking(addr).unwrap(), data);
    assert_eq!(cluster.domain(DomainId(1)).unwrap().memory().read_all(addr.handle()).unwrap(), data);

    endpoint.free_blocking(addr).unwrap();
    assert!(matches!(endpoint.get_blocking(addr), Err(RuntimeError::Remote(_))));
    assert_eq!(endpoint.pending_ops(), 0);
}

#[test]
fn test_local_target_is_served_directly() {
    let cluster = cluster(2, HandlerRegistry::new());
    let endpoint = cluster.domain(DomainId(1)).unwrap().endpoint();

    let token = endpoint.alloc(DomainId(1), 4);
    assert!(token.op().is_none());
    assert!(token.is_complete());
    let addr = token.wait().unwrap();
    endpoint.put_blocking(addr, vec![9, 9]).unwrap();
    assert_eq!(endpoint.get_blocking(addr).unwrap(), vec![9, 9, 0, 0]);
}

#[test]
fn test_put_out_of_bounds_is_reported() {
    let cluster = cluster(2, HandlerRegistry::new());
    let endpoint = cluster.domain(DomainId(0)).unwrap().endpoint();

    let addr = endpoint.alloc_blocking(DomainId(1), 2).unwrap();
    let err = endpoint.put_blocking(addr, vec![1, 2, 3]).unwrap_err();
    assert!(matches!(err, RuntimeError::Remote(_)));
}

#[test]
fn test_get_into_and_put_from() {
    let cluster = cluster(2, HandlerRegistry::new());
    let home = cluster.domain(DomainId(0)).unwrap();
    let endpoint = home.endpoint();

    let local = home.memory().alloc(4).unwrap();
    home.memory().write(local, 0, &[1, 2, 3, 4]).unwrap();
    let remote = endpoint.alloc_blocking(DomainId(1), 4).unwrap();

    endpoint.put_from(local, remote).unwrap();
    let copy = home.memory().alloc(4).unwrap();
    endpoint.get_into(remote, copy).unwrap();
    assert_eq!(home.memory().read_all(copy).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn test_many_tasks_issue_remote_ops() {
    let cluster = cluster(2, HandlerRegistry::new());
    let home = cluster.domain(DomainId(0)).unwrap().clone();
    cluster
        .run_main(move |domain, _ctx| {
            coforall(domain.pool(), 0..32u8, move |i, _ctx| {
                let endpoint = home.endpoint();
                let addr = endpoint.alloc_blocking(DomainId(1), 1)?;
                endpoint.put_blocking(addr, vec![i])?;
                assert_eq!(endpoint.get_blocking(addr)?, vec![i]);
                endpoint.free_blocking(addr)?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
    assert_eq!(cluster.domain(DomainId(1)).unwrap().memory().used(), 0);
}
