//! ARP probing on directly attached subnets. An L2 who-has for the
//! candidate address; any reply means a live host already owns it.
use std::{
    collections::HashMap,
    io,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use pnet::{
    datalink::{self, Channel, DataLinkSender, NetworkInterface},
    ipnetwork::IpNetwork,
    packet::{
        arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket},
        ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket},
        MutablePacket, Packet,
    },
    util::MacAddr,
};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::{ProbeError, ProbeOutcome, Result};

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;
const ARP_FRAME_LEN: usize = ETHERNET_HEADER_LEN + ARP_PACKET_LEN;

/// how often the receiver thread wakes up to check for shutdown
const RECV_POLL: Duration = Duration::from_millis(100);

type PendingMap = Arc<Mutex<HashMap<Ipv4Addr, oneshot::Sender<MacAddr>>>>;

/// One prober per served interface. Construction opens a link-layer
/// channel (needs CAP_NET_RAW) and spawns a receiver thread that matches
/// ARP replies to in-flight probes by sender protocol address.
pub struct ArpProber {
    interface_mac: MacAddr,
    interface_ip: Ipv4Addr,
    tx: Mutex<Box<dyn DataLinkSender>>,
    pending: PendingMap,
    stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for ArpProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArpProber")
            .field("interface_mac", &self.interface_mac)
            .field("interface_ip", &self.interface_ip)
            .finish()
    }
}

impl Drop for ArpProber {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl ArpProber {
    pub fn new(interface: &NetworkInterface) -> Result<Self> {
        let interface_mac = interface
            .mac
            .ok_or_else(|| ProbeError::NoInterfaceMac(interface.name.clone()))?;
        let interface_ip = interface
            .ips
            .iter()
            .find_map(|net| match net {
                IpNetwork::V4(net) => Some(net.ip()),
                _ => None,
            })
            .ok_or_else(|| ProbeError::NoInterfaceAddr(interface.name.clone()))?;

        let config = datalink::Config {
            read_timeout: Some(RECV_POLL),
            ..Default::default()
        };
        let (tx, mut rx) = match datalink::channel(interface, config)? {
            Channel::Ethernet(tx, rx) => (tx, rx),
            _ => {
                return Err(ProbeError::Io(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unknown datalink channel type",
                )))
            }
        };

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_pending = pending.clone();
        let thread_stop = stop.clone();
        let iface_name = interface.name.clone();
        thread::Builder::new()
            .name(format!("arp-recv-{iface_name}"))
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    match rx.next() {
                        Ok(frame) => {
                            if let Some((sender_ip, sender_mac)) = parse_arp_reply(frame) {
                                if let Some(tx) = thread_pending.lock().remove(&sender_ip) {
                                    trace!(?sender_ip, ?sender_mac, "matched ARP reply to probe");
                                    // probe may have timed out already
                                    let _ = tx.send(sender_mac);
                                }
                            }
                        }
                        Err(err)
                            if err.kind() == io::ErrorKind::TimedOut
                                || err.kind() == io::ErrorKind::WouldBlock =>
                        {
                            continue;
                        }
                        Err(err) => {
                            warn!(?err, interface = %iface_name, "arp receiver exiting");
                            return;
                        }
                    }
                }
            })?;

        debug!(?interface_mac, ?interface_ip, "arp prober ready");
        Ok(Self {
            interface_mac,
            interface_ip,
            tx: Mutex::new(tx),
            pending,
            stop,
        })
    }

    /// Send a who-has for `ip` and wait up to `timeout` for any reply
    /// whose sender protocol address matches.
    pub async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> Result<ProbeOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(ip, reply_tx);
        let guard = Guard {
            pending: self.pending.clone(),
            ip,
        };

        let frame = build_request(self.interface_mac, self.interface_ip, ip)?;
        self.send_frame(&frame)?;
        trace!(?ip, "sent ARP request-- waiting for reply");

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(mac)) => {
                drop(guard);
                Ok(ProbeOutcome::Conflict {
                    responder_mac: Some(mac),
                })
            }
            Ok(Err(_)) => {
                drop(guard);
                Err(ProbeError::ListenerGone)
            }
            Err(_) => {
                trace!(?ip, elapsed = ?timeout, "no ARP reply, address clear");
                drop(guard);
                Ok(ProbeOutcome::Clear)
            }
        }
    }

    /// Announce a freshly assigned address on behalf of its new owner so
    /// neighboring ARP caches update. Best effort.
    pub fn send_gratuitous(&self, ip: Ipv4Addr, client_mac: MacAddr) -> Result<()> {
        let mut buf = [0u8; ARP_FRAME_LEN];
        let mut eth = MutableEthernetPacket::new(&mut buf).ok_or(ProbeError::BadPacket)?;
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(client_mac);
        eth.set_ethertype(EtherTypes::Arp);

        let mut arp = MutableArpPacket::new(eth.payload_mut()).ok_or(ProbeError::BadPacket)?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(client_mac);
        arp.set_sender_proto_addr(ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(ip);

        self.send_frame(&buf)?;
        debug!(?ip, ?client_mac, "sent gratuitous ARP");
        Ok(())
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        match self.tx.lock().send_to(frame, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => Err(err.into()),
            None => Err(ProbeError::BadPacket),
        }
    }
}

struct Guard {
    pending: PendingMap,
    ip: Ipv4Addr,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.ip);
    }
}

fn build_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Result<[u8; ARP_FRAME_LEN]> {
    let mut buf = [0u8; ARP_FRAME_LEN];
    let mut eth = MutableEthernetPacket::new(&mut buf).ok_or(ProbeError::BadPacket)?;
    eth.set_destination(MacAddr::broadcast());
    eth.set_source(sender_mac);
    eth.set_ethertype(EtherTypes::Arp);

    let mut arp = MutableArpPacket::new(eth.payload_mut()).ok_or(ProbeError::BadPacket)?;
    arp.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp.set_protocol_type(EtherTypes::Ipv4);
    arp.set_hw_addr_len(6);
    arp.set_proto_addr_len(4);
    arp.set_operation(ArpOperations::Request);
    arp.set_sender_hw_addr(sender_mac);
    arp.set_sender_proto_addr(sender_ip);
    arp.set_target_hw_addr(MacAddr::zero());
    arp.set_target_proto_addr(target_ip);
    Ok(buf)
}

/// (sender proto addr, sender hw addr) from an ARP reply frame, or None
/// for any other traffic
fn parse_arp_reply(frame: &[u8]) -> Option<(Ipv4Addr, MacAddr)> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(eth.payload())?;
    if arp.get_operation() != ArpOperations::Reply {
        return None;
    }
    Some((arp.get_sender_proto_addr(), arp.get_sender_hw_addr()))
}
