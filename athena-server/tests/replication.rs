//! Manager-level coverage for GC, sticky reissue, and the idempotent
//! replication path the HA peer drives.
use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use athena_core::{EventBus, Metrics};
use athena_server::{build_subnets, ClientRequest, LeaseManager, LeaseTimers};
use conflict::{ConflictDetector, ConflictTable, DetectorConfig};
use ha::LeaseDelta;
use lease_store::{unix_now, ConflictMethod, Lease, LeaseState, LeaseStore};
use pnet::util::MacAddr;
use probe::{NoopProber, Prober};
use tempfile::TempDir;

fn manager(offer_reservation: u64, sticky_window: u64) -> (Arc<LeaseManager>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LeaseStore::open(dir.path().join("leases.redb")).unwrap());
    let metrics = Metrics::new().unwrap();
    let bus = EventBus::start(256, metrics.clone());
    let table = ConflictTable::load(store.clone(), 300, 3).unwrap();
    let detector = Arc::new(ConflictDetector::new(
        DetectorConfig {
            enabled: true,
            probe_timeout: Duration::from_millis(50),
            max_probes: 3,
            strategy: config::ProbeStrategy::Sequential,
            parallel_count: 3,
            cache_ttl: Duration::from_secs(60),
            send_gratuitous: false,
            icmp_fallback: true,
        },
        Some(Prober::Noop(NoopProber::new())),
        None,
        table,
        bus.clone(),
        metrics.clone(),
        vec!["10.0.0.0/24".parse().unwrap()],
    ));
    let manager = Arc::new(LeaseManager::new(
        store,
        detector,
        bus,
        metrics,
        LeaseTimers {
            offer_reservation,
            sticky_window,
        },
        3,
    ));
    let cfg = config::parse_str(
        r#"{"server": {"server_id": "t"},
            "subnets": [{"network": "10.0.0.0/24", "pools": [
                {"range_start": "10.0.0.100", "range_end": "10.0.0.199"}
            ]}]}"#,
    )
    .unwrap();
    manager.update_pools(build_subnets(&cfg).unwrap()).unwrap();
    (manager, dir)
}

fn client(last: u8) -> ClientRequest {
    ClientRequest {
        mac: MacAddr::new(2, 0, 0, 0, 0, last),
        ..Default::default()
    }
}

fn subnet_of(manager: &LeaseManager) -> Arc<athena_server::Subnet> {
    manager.subnets()[0].clone()
}

#[tokio::test]
async fn gc_reclaims_lapsed_offers() {
    let (manager, _dir) = manager(0, 0);
    let subnet = subnet_of(&manager);
    let (lease, _) = manager.offer(&subnet, &client(1)).await.unwrap();
    assert_eq!(lease.state, LeaseState::Offered);
    assert_eq!(subnet.pools()[0].pool().allocated(), 1);

    // reservation was zero seconds; one tick later it is reclaimable
    let reclaimed = manager.gc(unix_now() + 5).await.unwrap();
    assert_eq!(reclaimed, 1);
    let stored = manager.store().get_by_ip(lease.ip).unwrap().unwrap();
    assert_eq!(stored.state, LeaseState::Expired);
    assert_eq!(subnet.pools()[0].pool().allocated(), 0);
}

#[tokio::test]
async fn sticky_window_reissues_previous_address() {
    let (manager, _dir) = manager(0, 3600);
    let subnet = subnet_of(&manager);
    let req = client(2);
    let (first, _) = manager.offer(&subnet, &req).await.unwrap();
    manager.gc(unix_now() + 5).await.unwrap();
    // expired, but inside the sticky window: same address comes back
    let (second, _) = manager.offer(&subnet, &req).await.unwrap();
    assert_eq!(second.ip, first.ip);
    assert_eq!(second.state, LeaseState::Offered);
}

#[tokio::test]
async fn abandoned_binding_frees_its_pool_bit() {
    let (manager, _dir) = manager(120, 3600);
    let subnet = subnet_of(&manager);
    let req = client(6);
    let (first, _) = manager.offer(&subnet, &req).await.unwrap();
    assert!(subnet.pools()[0].pool().is_allocated(first.ip));

    // the offered address turns out to be in use before the client
    // requests it, so the next discover must move the client
    manager
        .detector()
        .table()
        .add(first.ip, ConflictMethod::ArpProbe, None, "10.0.0.0/24");
    let (second, _) = manager.offer(&subnet, &req).await.unwrap();
    assert_ne!(second.ip, first.ip);

    // the old reservation gave its bit back and its row is expired
    assert!(!subnet.pools()[0].pool().is_allocated(first.ip));
    assert!(subnet.pools()[0].pool().is_allocated(second.ip));
    let stored = manager.store().get_by_ip(first.ip).unwrap().unwrap();
    assert_eq!(stored.state, LeaseState::Expired);
}

#[tokio::test]
async fn release_requires_owning_client() {
    let (manager, _dir) = manager(120, 0);
    let subnet = subnet_of(&manager);
    let req = client(3);
    let (lease, _) = manager.offer(&subnet, &req).await.unwrap();

    let wrong = client(4);
    assert!(manager.release(lease.ip, &wrong.key()).await.is_err());
    manager.release(lease.ip, &req.key()).await.unwrap();
    let stored = manager.store().get_by_ip(lease.ip).unwrap().unwrap();
    assert_eq!(stored.state, LeaseState::Released);
}

fn replicated(ip: [u8; 4], start: u64, expiry: u64, state: LeaseState) -> Lease {
    Lease {
        ip: ip.into(),
        mac: MacAddr::new(2, 0, 0, 0, 0, 9),
        client_id: None,
        hostname: None,
        fqdn: None,
        subnet: "10.0.0.0/24".into(),
        pool: "10.0.0.100-10.0.0.199".into(),
        start,
        expiry,
        state,
        relay: None,
        options: Default::default(),
    }
}

#[tokio::test]
async fn replicated_put_is_idempotent() {
    let (manager, _dir) = manager(120, 0);
    let subnet = subnet_of(&manager);
    let now = unix_now();
    let lease = replicated([10, 0, 0, 150], now, now + 600, LeaseState::Active);

    assert!(manager.apply_remote(LeaseDelta::Put(lease.clone())).await.unwrap());
    // same update again is a no-op
    assert!(!manager.apply_remote(LeaseDelta::Put(lease.clone())).await.unwrap());
    assert_eq!(manager.store().count().unwrap(), 1);
    assert!(subnet.pools()[0].pool().is_allocated(lease.ip));
    assert_eq!(subnet.pools()[0].pool().allocated(), 1);
}

#[tokio::test]
async fn stale_replicated_put_ignored() {
    let (manager, _dir) = manager(120, 0);
    let now = unix_now();
    let fresh = replicated([10, 0, 0, 151], now, now + 600, LeaseState::Active);
    let stale = replicated([10, 0, 0, 151], now - 100, now + 100, LeaseState::Released);

    manager.apply_remote(LeaseDelta::Put(fresh.clone())).await.unwrap();
    assert!(!manager.apply_remote(LeaseDelta::Put(stale)).await.unwrap());
    let stored = manager.store().get_by_ip(fresh.ip).unwrap().unwrap();
    assert_eq!(stored.state, LeaseState::Active);
    assert_eq!(stored.expiry, now + 600);
}

#[tokio::test]
async fn replicated_transition_frees_pool() {
    let (manager, _dir) = manager(120, 0);
    let subnet = subnet_of(&manager);
    let now = unix_now();
    let active = replicated([10, 0, 0, 152], now, now + 600, LeaseState::Active);
    manager.apply_remote(LeaseDelta::Put(active)).await.unwrap();
    assert_eq!(subnet.pools()[0].pool().allocated(), 1);

    let released = replicated([10, 0, 0, 152], now, now + 601, LeaseState::Released);
    manager.apply_remote(LeaseDelta::Put(released)).await.unwrap();
    assert_eq!(subnet.pools()[0].pool().allocated(), 0);

    // a delete for a gone-stale row clears everything
    let back = replicated([10, 0, 0, 152], now, now + 700, LeaseState::Active);
    manager.apply_remote(LeaseDelta::Put(back)).await.unwrap();
    assert!(manager
        .apply_remote(LeaseDelta::Delete([10, 0, 0, 152].into()))
        .await
        .unwrap());
    assert!(manager.store().get_by_ip([10, 0, 0, 152].into()).unwrap().is_none());
    assert_eq!(subnet.pools()[0].pool().allocated(), 0);
}

#[tokio::test]
async fn pool_reload_reconciles_bitmaps() {
    let (manager, _dir) = manager(120, 0);
    let subnet = subnet_of(&manager);
    let req = client(5);
    let (lease, _) = manager.offer(&subnet, &req).await.unwrap();
    assert!(subnet.pools()[0].pool().is_allocated(lease.ip));

    // reload with a shifted range that no longer covers the lease
    let cfg = config::parse_str(
        r#"{"server": {"server_id": "t"},
            "subnets": [{"network": "10.0.0.0/24", "pools": [
                {"range_start": "10.0.0.150", "range_end": "10.0.0.199"}
            ]}]}"#,
    )
    .unwrap();
    manager.update_pools(build_subnets(&cfg).unwrap()).unwrap();
    // orphaned lease kept in the store until natural expiry
    let stored = manager.store().get_by_ip(lease.ip).unwrap().unwrap();
    assert_eq!(stored.state, LeaseState::Offered);
    let fresh = manager.subnets();
    assert_eq!(fresh[0].pools()[0].pool().allocated(), 0);

    // reload that covers it again re-marks the bit
    let cfg = config::parse_str(
        r#"{"server": {"server_id": "t"},
            "subnets": [{"network": "10.0.0.0/24", "pools": [
                {"range_start": "10.0.0.100", "range_end": "10.0.0.199"}
            ]}]}"#,
    )
    .unwrap();
    manager.update_pools(build_subnets(&cfg).unwrap()).unwrap();
    let fresh = manager.subnets();
    assert!(fresh[0].pools()[0].pool().is_allocated(lease.ip));
}
