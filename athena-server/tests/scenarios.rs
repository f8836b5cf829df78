//! Full-path scenarios: encoded packets in, encoded replies out, with a
//! scripted prober standing in for the wire.
use std::{net::Ipv4Addr, net::SocketAddr, sync::Arc, time::Duration};

use athena_core::{EventBus, Metrics};
use athena_server::{build_subnets, DhcpHandler, LeaseManager, LeaseTimers};
use conflict::{ConflictDetector, ConflictTable, DetectorConfig};
use dhcproto::{
    v4::{self, DhcpOption, Message, MessageType, OptionCode},
    Encodable,
};
use lease_store::{unix_now, ConflictMethod, LeaseState, LeaseStore};
use pnet::{ipnetwork::Ipv4Network, util::MacAddr};
use probe::{NoopProber, Prober};
use tempfile::TempDir;

const CLIENT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

struct Fixture {
    handler: DhcpHandler,
    manager: Arc<LeaseManager>,
    _dir: TempDir,
}

fn fixture(seed_conflicts: &[(Ipv4Addr, Option<MacAddr>)]) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LeaseStore::open(dir.path().join("leases.redb")).unwrap());
    let metrics = Metrics::new().unwrap();
    let bus = EventBus::start(256, metrics.clone());

    let table = ConflictTable::load(store.clone(), 300, 3).unwrap();
    let noop = NoopProber::new();
    for (ip, mac) in seed_conflicts {
        noop.seed_conflict(*ip, *mac);
    }
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
        Some(Prober::Noop(noop)),
        None,
        table,
        bus.clone(),
        metrics.clone(),
        vec!["10.0.0.0/24".parse().unwrap()],
    ));

    let manager = Arc::new(LeaseManager::new(
        store,
        detector,
        bus.clone(),
        metrics.clone(),
        LeaseTimers {
            offer_reservation: 120,
            sticky_window: 3600,
        },
        3,
    ));
    let cfg = config::parse_str(
        r#"
server:
  server_id: athena-test
subnets:
  - network: "10.0.0.0/24"
    pools:
      - range_start: 10.0.0.100
        range_end: 10.0.0.199
        lease_time: { default: 86400, min: 3600, max: 604800 }
      - name: voip
        range_start: 10.0.0.200
        range_end: 10.0.0.220
        match_circuit_id: "eth0/1/*"
"#,
    )
    .unwrap();
    manager.update_pools(build_subnets(&cfg).unwrap()).unwrap();

    let handler = DhcpHandler::new(
        manager.clone(),
        bus,
        metrics,
        Ipv4Network::new(SERVER_IP, 24).unwrap(),
        None,
    );
    Fixture {
        handler,
        manager,
        _dir: dir,
    }
}

fn src() -> SocketAddr {
    "0.0.0.0:68".parse().unwrap()
}

fn base_msg(mac: [u8; 6]) -> Message {
    let mut msg = Message::new_with_id(
        0x1234_5678,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        &mac,
    );
    msg.opts_mut()
        .insert(DhcpOption::ParameterRequestList(vec![
            OptionCode::SubnetMask,
            OptionCode::Router,
            OptionCode::DomainNameServer,
        ]));
    msg
}

fn discover(mac: [u8; 6]) -> Vec<u8> {
    let mut msg = base_msg(mac);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Discover));
    msg.to_vec().unwrap()
}

fn request(mac: [u8; 6], requested: Ipv4Addr, server_id: Option<Ipv4Addr>) -> Vec<u8> {
    let mut msg = base_msg(mac);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Request));
    msg.opts_mut()
        .insert(DhcpOption::RequestedIpAddress(requested));
    if let Some(sid) = server_id {
        msg.opts_mut().insert(DhcpOption::ServerIdentifier(sid));
    }
    msg.to_vec().unwrap()
}

fn renew(mac: [u8; 6], ciaddr: Ipv4Addr) -> Vec<u8> {
    let mut msg = base_msg(mac);
    msg.set_ciaddr(ciaddr);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Request));
    msg.to_vec().unwrap()
}

fn decline(mac: [u8; 6], ip: Ipv4Addr) -> Vec<u8> {
    let mut msg = base_msg(mac);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Decline));
    msg.opts_mut().insert(DhcpOption::RequestedIpAddress(ip));
    msg.opts_mut()
        .insert(DhcpOption::ServerIdentifier(SERVER_IP));
    msg.to_vec().unwrap()
}

fn opt_u32(msg: &Message, code: OptionCode) -> Option<u32> {
    match msg.opts().get(code) {
        Some(DhcpOption::AddressLeaseTime(t)) => Some(*t),
        Some(DhcpOption::Renewal(t)) => Some(*t),
        Some(DhcpOption::Rebinding(t)) => Some(*t),
        _ => None,
    }
}

#[tokio::test]
async fn clean_assignment() {
    let fx = fixture(&[]);

    let (offer, dst) = fx.handler.handle(&discover(CLIENT_MAC), src()).await.unwrap();
    assert_eq!(offer.opts().msg_type(), Some(MessageType::Offer));
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(10, 0, 0, 100));
    assert_eq!(
        offer.opts().get(OptionCode::ServerIdentifier),
        Some(&DhcpOption::ServerIdentifier(SERVER_IP))
    );
    assert_eq!(opt_u32(&offer, OptionCode::AddressLeaseTime), Some(86_400));
    // no relay, no ciaddr: broadcast
    assert_eq!(dst, "255.255.255.255:68".parse().unwrap());

    let (ack, _) = fx
        .handler
        .handle(
            &request(CLIENT_MAC, offer.yiaddr(), Some(SERVER_IP)),
            src(),
        )
        .await
        .unwrap();
    assert_eq!(ack.opts().msg_type(), Some(MessageType::Ack));
    assert_eq!(ack.yiaddr(), Ipv4Addr::new(10, 0, 0, 100));

    let lease = fx
        .manager
        .store()
        .get_by_ip([10, 0, 0, 100].into())
        .unwrap()
        .unwrap();
    assert_eq!(lease.state, LeaseState::Active);
    assert_eq!(lease.mac, MacAddr::new(2, 0, 0, 0, 0, 1));
    let expect = unix_now() + 86_400;
    assert!(lease.expiry.abs_diff(expect) <= 5);
}

#[tokio::test]
async fn conflict_then_skip() {
    let squatter = MacAddr::new(0x06, 0xaa, 0xbb, 0xcc, 0xdd, 0xee);
    let fx = fixture(&[(Ipv4Addr::new(10, 0, 0, 100), Some(squatter))]);

    let (offer, _) = fx.handler.handle(&discover(CLIENT_MAC), src()).await.unwrap();
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(10, 0, 0, 101));

    let recs = fx.manager.detector().table().records();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].ip, Ipv4Addr::new(10, 0, 0, 100));
    assert_eq!(recs[0].probe_count, 1);
    assert_eq!(recs[0].method, ConflictMethod::ArpProbe);
    assert_eq!(recs[0].responder_mac.as_deref(), Some(&*squatter.to_string()));
}

#[tokio::test]
async fn decline_flips_to_conflict() {
    let fx = fixture(&[]);
    let ip = Ipv4Addr::new(10, 0, 0, 100);

    fx.handler.handle(&discover(CLIENT_MAC), src()).await.unwrap();
    fx.handler
        .handle(&request(CLIENT_MAC, ip, Some(SERVER_IP)), src())
        .await
        .unwrap();
    // client finds the address in use and declines; no reply expected
    assert!(fx.handler.handle(&decline(CLIENT_MAC, ip), src()).await.is_none());

    let lease = fx.manager.store().get_by_ip(ip).unwrap().unwrap();
    assert_eq!(lease.state, LeaseState::Declined);
    let recs = fx.manager.detector().table().records();
    assert_eq!(recs[0].method, ConflictMethod::ClientDecline);

    // the next discover for the same client skips the declined address
    let (offer, _) = fx.handler.handle(&discover(CLIENT_MAC), src()).await.unwrap();
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(10, 0, 0, 101));
}

#[tokio::test]
async fn relay_selects_matching_pool() {
    let fx = fixture(&[]);
    let giaddr = Ipv4Addr::new(10, 0, 0, 1);

    let mut msg = base_msg(CLIENT_MAC);
    msg.set_giaddr(giaddr);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Discover));
    let mut relay_info = v4::relay::RelayAgentInformation::default();
    relay_info.insert(v4::relay::RelayInfo::AgentCircuitId(b"eth0/1/3".to_vec()));
    relay_info.insert(v4::relay::RelayInfo::AgentRemoteId(b"switch-A".to_vec()));
    msg.opts_mut()
        .insert(DhcpOption::RelayAgentInformation(relay_info.clone()));

    let (offer, dst) = fx
        .handler
        .handle(&msg.to_vec().unwrap(), src())
        .await
        .unwrap();
    // allocated from the voip pool, not the default
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(10, 0, 0, 200));
    // unicast back to the relay on the server port
    assert_eq!(dst, SocketAddr::from((giaddr, 67)));
    // option 82 copied back
    assert_eq!(
        offer.opts().get(OptionCode::RelayAgentInformation),
        Some(&DhcpOption::RelayAgentInformation(relay_info))
    );

    let lease = fx
        .manager
        .store()
        .get_by_ip([10, 0, 0, 200].into())
        .unwrap()
        .unwrap();
    let relay = lease.relay.unwrap();
    assert_eq!(relay.giaddr, giaddr);
    assert_eq!(relay.circuit_id.as_deref(), Some("eth0/1/3"));
    assert_eq!(relay.remote_id.as_deref(), Some("switch-A"));
}

#[tokio::test]
async fn renew_extends_matching_lease() {
    let fx = fixture(&[]);
    let ip = Ipv4Addr::new(10, 0, 0, 100);
    fx.handler.handle(&discover(CLIENT_MAC), src()).await.unwrap();
    fx.handler
        .handle(&request(CLIENT_MAC, ip, Some(SERVER_IP)), src())
        .await
        .unwrap();

    let (ack, dst) = fx.handler.handle(&renew(CLIENT_MAC, ip), src()).await.unwrap();
    assert_eq!(ack.opts().msg_type(), Some(MessageType::Ack));
    assert_eq!(ack.yiaddr(), ip);
    // renewing clients are unicast on their ciaddr
    assert_eq!(dst, SocketAddr::from((ip, 68)));
}

#[tokio::test]
async fn renew_wrong_address_naks() {
    let fx = fixture(&[]);
    fx.handler.handle(&discover(CLIENT_MAC), src()).await.unwrap();
    fx.handler
        .handle(
            &request(CLIENT_MAC, [10, 0, 0, 100].into(), Some(SERVER_IP)),
            src(),
        )
        .await
        .unwrap();

    let (nak, dst) = fx
        .handler
        .handle(&renew(CLIENT_MAC, [10, 0, 0, 150].into()), src())
        .await
        .unwrap();
    assert_eq!(nak.opts().msg_type(), Some(MessageType::Nak));
    assert_eq!(nak.yiaddr(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(dst, "255.255.255.255:68".parse().unwrap());
}

#[tokio::test]
async fn request_for_other_server_dropped() {
    let fx = fixture(&[]);
    fx.handler.handle(&discover(CLIENT_MAC), src()).await.unwrap();
    let other = Ipv4Addr::new(10, 0, 0, 99);
    assert!(fx
        .handler
        .handle(&request(CLIENT_MAC, [10, 0, 0, 100].into(), Some(other)), src())
        .await
        .is_none());
}

#[tokio::test]
async fn inform_gets_options_without_lease() {
    let fx = fixture(&[]);
    let mut msg = base_msg(CLIENT_MAC);
    msg.set_ciaddr(Ipv4Addr::new(10, 0, 0, 42));
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Inform));
    let (ack, dst) = fx
        .handler
        .handle(&msg.to_vec().unwrap(), src())
        .await
        .unwrap();
    assert_eq!(ack.opts().msg_type(), Some(MessageType::Ack));
    assert_eq!(ack.yiaddr(), Ipv4Addr::UNSPECIFIED);
    assert!(ack.opts().get(OptionCode::AddressLeaseTime).is_none());
    assert_eq!(dst, SocketAddr::from((Ipv4Addr::new(10, 0, 0, 42), 68)));
    // no lease was written
    assert_eq!(fx.manager.store().count().unwrap(), 0);
}

#[tokio::test]
async fn exhausted_pool_stays_silent() {
    let fx = fixture(&[]);
    // burn the whole default pool with distinct clients
    for i in 0..100u8 {
        let mut mac = CLIENT_MAC;
        mac[5] = i.wrapping_add(10);
        mac[4] = 7;
        let got = fx.handler.handle(&discover(mac), src()).await;
        assert!(got.is_some(), "client {i} should still get an offer");
    }
    let mut mac = CLIENT_MAC;
    mac[3] = 0xff;
    assert!(fx.handler.handle(&discover(mac), src()).await.is_none());
}

#[tokio::test]
async fn standby_node_stays_silent() {
    use tokio_util::sync::CancellationToken;
    let fx = fixture(&[]);
    // a secondary with an unreachable peer never leaves Connecting and
    // must not answer
    let metrics = Metrics::new().unwrap();
    let bus = EventBus::start(16, metrics.clone());
    let token = CancellationToken::new();
    let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let peer_addr = free.local_addr().unwrap();
    drop(free);
    let (handle, mut inbound) = ha::spawn(
        ha::HaSettings {
            role: config::Role::Secondary,
            server_id: "athena-test".into(),
            listen_address: "127.0.0.1:0".parse().unwrap(),
            peer_address: peer_addr,
            secret: "swordfish".into(),
            heartbeat_interval: Duration::from_secs(1),
            failover_timeout: Duration::from_secs(10),
        },
        bus.clone(),
        metrics.clone(),
        token.clone(),
    );
    tokio::spawn(async move { while inbound.recv().await.is_some() {} });

    let gated = DhcpHandler::new(
        fx.manager.clone(),
        bus,
        metrics,
        Ipv4Network::new(SERVER_IP, 24).unwrap(),
        Some(handle),
    );
    assert!(gated.handle(&discover(CLIENT_MAC), src()).await.is_none());
    // and no lease was created by the gated node
    assert_eq!(fx.manager.store().count().unwrap(), 0);
    token.cancel();
}

#[tokio::test]
async fn malformed_packet_dropped() {
    let fx = fixture(&[]);
    assert!(fx.handler.handle(&[0u8; 10], src()).await.is_none());
}
