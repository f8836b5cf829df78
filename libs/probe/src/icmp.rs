//! ICMP echo probing for addresses we can't reach at L2 (relayed
//! subnets). One socket per process; a listener task demuxes replies to
//! waiting probes by sequence number.
use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    os::unix::io::{FromRawFd, IntoRawFd},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use pnet::packet::{icmp, ipv4, Packet};
use socket2::{Domain, Protocol, Type};
use tokio::{
    net::UdpSocket,
    sync::{broadcast, oneshot},
    task,
};
use tracing::{debug, error, trace, warn};

use crate::{ProbeOutcome, Result};

/// payload carried in every echo request so replies to our own probes are
/// recognizable
pub const PROBE_PAYLOAD: &[u8] = b"athena-probe";

const ICMP_HEADER_SIZE: usize = 8;
const REQUEST_SIZE: usize = ICMP_HEADER_SIZE + PROBE_PAYLOAD.len();

type PendingMap = Arc<Mutex<HashMap<u16, oneshot::Sender<()>>>>;

struct IcmpSocket {
    socket: UdpSocket,
    /// RAW sockets deliver the IPv4 header with each datagram
    decode_header: bool,
}

impl IcmpSocket {
    fn new() -> io::Result<Self> {
        let (socket, decode_header) = match raw_socket(Type::DGRAM) {
            Ok(s) => (s, false),
            Err(err) => {
                error!(
                    ?err,
                    "error building DGRAM socket, check ping_group_range. trying RAW socket"
                );
                (raw_socket(Type::RAW)?, true)
            }
        };
        debug!("created icmpv4 probe socket");
        Ok(Self {
            socket,
            decode_header,
        })
    }

    async fn send_to(&self, buf: &[u8], ip: Ipv4Addr) -> io::Result<usize> {
        self.socket
            .send_to(buf, SocketAddr::new(IpAddr::V4(ip), 0))
            .await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

fn raw_socket(type_: Type) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, type_, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(unsafe { std::net::UdpSocket::from_raw_fd(socket.into_raw_fd()) })
}

/// Process-wide ICMP echo prober. The constructor spawns the reply
/// listener; dropping the prober stops it.
pub struct IcmpProber {
    socket: Arc<IcmpSocket>,
    pending: PendingMap,
    ident: u16,
    seq: AtomicU16,
    // dropping this stops the listener task
    #[allow(dead_code)]
    notify_shutdown: broadcast::Sender<()>,
}

impl std::fmt::Debug for IcmpProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcmpProber")
            .field("ident", &self.ident)
            .finish()
    }
}

impl IcmpProber {
    pub fn new() -> Result<Self> {
        let socket = Arc::new(IcmpSocket::new()?);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notify_shutdown, mut shutdown_rx) = broadcast::channel(1);

        let listener_socket = socket.clone();
        let listener_pending = pending.clone();
        task::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                tokio::select! {
                    ret = listener_socket.recv(&mut buf) => {
                        match ret {
                            Ok((n, addr)) => {
                                trace!(?addr, n, "received data on icmp socket");
                                if let Some(seq) = decode_reply(&buf[..n], listener_socket.decode_header) {
                                    if let Some(tx) = listener_pending.lock().remove(&seq) {
                                        // receiver dropped just means the probe timed out
                                        let _ = tx.send(());
                                    } else {
                                        trace!(seq, "reply for a probe we no longer wait on");
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(?err, "icmp recv failed, listener exiting");
                                return;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("icmp listener shutdown received");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            socket,
            pending,
            ident: (std::process::id() & 0xffff) as u16,
            seq: AtomicU16::new(1),
            notify_shutdown,
        })
    }

    /// Send one echo request and wait up to `timeout` for the matching
    /// reply. A reply means the address is in use.
    pub async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> Result<ProbeOutcome> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);
        // make sure the map is cleaned up even if this future is dropped
        let guard = Guard {
            pending: self.pending.clone(),
            seq,
        };

        let mut buf = [0u8; REQUEST_SIZE];
        encode_request(&mut buf, self.ident, seq)?;
        self.socket.send_to(&buf, ip).await?;
        trace!(?ip, seq, "sent echo request-- waiting for reply");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                drop(guard);
                Ok(ProbeOutcome::Conflict {
                    responder_mac: None,
                })
            }
            Ok(Err(_)) => {
                drop(guard);
                Err(crate::ProbeError::ListenerGone)
            }
            Err(_) => {
                debug!(?ip, seq, elapsed = ?timeout, "probe timed out, address clear");
                drop(guard);
                Ok(ProbeOutcome::Clear)
            }
        }
    }
}

/// removes the pending entry when a probe future goes away
struct Guard {
    pending: PendingMap,
    seq: u16,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.seq);
    }
}

fn encode_request(buf: &mut [u8], ident: u16, seq: u16) -> Result<()> {
    let mut packet = icmp::echo_request::MutableEchoRequestPacket::new(buf)
        .ok_or(crate::ProbeError::BadPacket)?;
    packet.set_icmp_type(icmp::IcmpTypes::EchoRequest);
    packet.set_identifier(ident);
    packet.set_sequence_number(seq);
    packet.set_payload(PROBE_PAYLOAD);
    let checksum = icmp::checksum(
        &icmp::IcmpPacket::new(packet.packet()).ok_or(crate::ProbeError::BadPacket)?,
    );
    packet.set_checksum(checksum);
    Ok(())
}

/// Pull the sequence number out of an Echo Reply carrying our payload.
/// Anything else (spurious traffic, other types) returns None.
fn decode_reply(buf: &[u8], decode_header: bool) -> Option<u16> {
    // needed for borrowck
    let ipv4_packet;
    let buf = if decode_header {
        ipv4_packet = ipv4::Ipv4Packet::new(buf)?;
        ipv4_packet.payload()
    } else {
        buf
    };
    let packet = icmp::echo_reply::EchoReplyPacket::new(buf)?;
    if packet.get_icmp_type() != icmp::IcmpTypes::EchoReply {
        return None;
    }
    if &buf[ICMP_HEADER_SIZE..] != PROBE_PAYLOAD {
        return None;
    }
    Some(packet.get_sequence_number())
}
