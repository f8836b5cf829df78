//! # DHCP handler
//!
//! Per-packet orchestration: parse, gate on the HA state, resolve the
//! subnet, drive the lease manager, and build the reply with the right
//! options and destination per RFC 2131.
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use athena_core::{Event, EventBus, EventKind, Metrics};
use conflict::ConflictDetector;
use dhcproto::{
    v4::{
        self,
        relay::{RelayCode, RelayInfo as RelayOpt},
        DhcpOption, DhcpOptions, Message, MessageType, Opcode, OptionCode,
    },
    Decodable, Decoder, Encodable, Encoder,
};
use ha::HaHandle;
use lease_store::RelayInfo;
use pnet::{ipnetwork::Ipv4Network, util::MacAddr};
use pool::MatchCriteria;
use tracing::{debug, trace};

use crate::{
    lease::{ClientRequest, LeaseManager},
    subnet::{find_subnet, Subnet, SubnetPool},
};

pub struct DhcpHandler {
    manager: Arc<LeaseManager>,
    detector: Arc<ConflictDetector>,
    bus: EventBus,
    metrics: Metrics,
    /// our identity on this interface; doubles as option 54
    server_id: Ipv4Addr,
    /// the served interface's network, used for fallback subnet
    /// resolution and netmask/router/broadcast defaults
    interface: Ipv4Network,
    ha: Option<HaHandle>,
}

impl std::fmt::Debug for DhcpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhcpHandler")
            .field("server_id", &self.server_id)
            .field("interface", &self.interface)
            .finish()
    }
}

impl DhcpHandler {
    pub fn new(
        manager: Arc<LeaseManager>,
        bus: EventBus,
        metrics: Metrics,
        interface: Ipv4Network,
        ha: Option<HaHandle>,
    ) -> Self {
        let detector = manager.detector().clone();
        Self {
            manager,
            detector,
            bus,
            metrics,
            server_id: interface.ip(),
            interface,
            ha,
        }
    }

    pub fn server_id(&self) -> Ipv4Addr {
        self.server_id
    }

    /// Process one datagram. `None` means no reply (malformed, standby,
    /// policy drop, or a message type that never gets one).
    pub async fn handle(&self, buf: &[u8], src: SocketAddr) -> Option<(Message, SocketAddr)> {
        let req = match Message::decode(&mut Decoder::new(buf)) {
            Ok(req) => req,
            Err(err) => {
                self.metrics.malformed_count.inc();
                debug!(?err, %src, "dropping malformed packet");
                return None;
            }
        };
        if req.opcode() != Opcode::BootRequest {
            return None;
        }
        let Some(msg_type) = req.opts().msg_type() else {
            self.metrics.malformed_count.inc();
            debug!(%src, "dropping packet without message type");
            return None;
        };
        self.metrics
            .recv_count
            .with_label_values(&[type_label(msg_type)])
            .inc();

        // standby nodes never answer
        if let Some(ha) = &self.ha {
            if !ha.answers_dhcp() {
                self.metrics.standby_drop_count.inc();
                trace!(state = %ha.state(), "not the active node, dropping");
                return None;
            }
        }

        let subnet_ip = self.subnet_address(&req);
        let subnets = self.manager.subnets();
        let Some(subnet) = find_subnet(&subnets, subnet_ip) else {
            debug!(%subnet_ip, "no configured subnet matches, dropping");
            return None;
        };

        let info = self.client_request(&req, msg_type);
        let reply = match msg_type {
            MessageType::Discover => self.discover(&req, subnet, info).await,
            MessageType::Request => self.request(&req, subnet, info).await,
            MessageType::Release => {
                let ip = req.ciaddr();
                if let Err(err) = self.manager.release(ip, &info.key()).await {
                    debug!(?err, %ip, "release ignored");
                }
                None
            }
            MessageType::Decline => {
                match info.requested_ip {
                    Some(ip) => {
                        if let Err(err) = self.manager.decline(subnet, ip, &info).await {
                            debug!(?err, %ip, "decline ignored");
                        }
                    }
                    None => debug!("decline without requested IP ignored"),
                }
                None
            }
            MessageType::Inform => self.inform(&req, subnet),
            other => {
                trace!(?other, "server does not handle this message type");
                None
            }
        };

        reply.map(|(resp, dst)| {
            if let Some(t) = resp.opts().msg_type() {
                self.metrics
                    .sent_count
                    .with_label_values(&[type_label(t)])
                    .inc();
            }
            (resp, dst)
        })
    }

    async fn discover(
        &self,
        req: &Message,
        subnet: &Arc<Subnet>,
        info: ClientRequest,
    ) -> Option<(Message, SocketAddr)> {
        self.bus.publish(Event::bare(EventKind::LeaseDiscover));
        let (lease, sp) = match self.manager.offer(subnet, &info).await {
            Ok(ok) => ok,
            Err(err) => {
                // a DISCOVER we can't serve gets no reply
                debug!(?err, mac = %info.mac, "not offering");
                return None;
            }
        };
        let mut resp = self.bound_reply(req, MessageType::Offer, lease.ip);
        self.populate_opts(
            req,
            &mut resp,
            &subnet.merged_options(&sp),
            Some((sp.as_ref(), info.requested_lease)),
        );
        self.maybe_gratuitous(lease.ip, lease.mac);
        let dst = self.resp_addr(req, &resp_view(&resp));
        Some((resp, dst))
    }

    async fn request(
        &self,
        req: &Message,
        subnet: &Arc<Subnet>,
        info: ClientRequest,
    ) -> Option<(Message, SocketAddr)> {
        // a client answering another server's offer is not ours to serve
        if let Some(DhcpOption::ServerIdentifier(sid)) =
            req.opts().get(OptionCode::ServerIdentifier)
        {
            if *sid != self.server_id {
                trace!(%sid, "client selected another server, dropping");
                return None;
            }
        }
        let selecting = req
            .opts()
            .get(OptionCode::ServerIdentifier)
            .is_some();
        let renewing = !selecting && !req.ciaddr().is_unspecified();

        let result = if renewing {
            self.manager.renew(subnet, &info).await
        } else {
            self.manager.ack(subnet, &info).await
        };
        match result {
            Ok((lease, sp)) => {
                let mut resp = self.bound_reply(req, MessageType::Ack, lease.ip);
                self.populate_opts(
                    req,
                    &mut resp,
                    &subnet.merged_options(&sp),
                    Some((sp.as_ref(), info.requested_lease)),
                );
                self.maybe_gratuitous(lease.ip, lease.mac);
                let dst = self.resp_addr(req, &resp_view(&resp));
                Some((resp, dst))
            }
            Err(err) => {
                debug!(?err, "request refused, NAK");
                Some(self.nak(req))
            }
        }
    }

    fn inform(&self, req: &Message, subnet: &Arc<Subnet>) -> Option<(Message, SocketAddr)> {
        // options only, never a yiaddr or lease mutation; pool-scoped
        // overrides don't apply without an assigned address
        let mut resp = self.base_reply(req, MessageType::Ack);
        resp.set_ciaddr(req.ciaddr());
        self.populate_opts(req, &mut resp, subnet.options(), None);
        let dst = if req.ciaddr().is_unspecified() {
            self.resp_addr(req, &resp_view(&resp))
        } else {
            (req.ciaddr(), v4::CLIENT_PORT).into()
        };
        Some((resp, dst))
    }

    fn nak(&self, req: &Message) -> (Message, SocketAddr) {
        let mut resp = self.base_reply(req, MessageType::Nak);
        resp.set_giaddr(req.giaddr());
        // copy client id back per RFC 6842
        if let Some(id) = req.opts().get(OptionCode::ClientIdentifier) {
            resp.opts_mut().insert(id.clone());
        }
        self.bus.publish(Event::bare(EventKind::LeaseNak));
        // NAKs broadcast when no relay is involved
        let dst: SocketAddr = if req.giaddr().is_unspecified() {
            (Ipv4Addr::BROADCAST, v4::CLIENT_PORT).into()
        } else {
            (req.giaddr(), v4::SERVER_PORT).into()
        };
        (resp, dst)
    }

    fn base_reply(&self, req: &Message, msg_type: MessageType) -> Message {
        let mut resp = Message::new_with_id(
            req.xid(),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            req.giaddr(),
            req.chaddr(),
        );
        resp.set_opcode(Opcode::BootReply);
        resp.set_flags(req.flags());
        resp.opts_mut().insert(DhcpOption::MessageType(msg_type));
        resp.opts_mut()
            .insert(DhcpOption::ServerIdentifier(self.server_id));
        resp
    }

    fn bound_reply(&self, req: &Message, msg_type: MessageType, yiaddr: Ipv4Addr) -> Message {
        let mut resp = self.base_reply(req, msg_type);
        resp.set_yiaddr(yiaddr);
        resp.set_siaddr(self.server_id);
        resp
    }

    /// Fill the response option set: copy-backs (82, 61), interface
    /// derived netmask/router/broadcast, the parameter request list
    /// served from the merged subnet+pool options, and lease timers.
    fn populate_opts(
        &self,
        req: &Message,
        resp: &mut Message,
        param_opts: &DhcpOptions,
        lease: Option<(&SubnetPool, Option<Duration>)>,
    ) {
        // https://datatracker.ietf.org/doc/html/rfc3046#section-2.2
        // copy opt 82 (relay agent) into response
        if let Some(info) = req.opts().get(OptionCode::RelayAgentInformation) {
            resp.opts_mut().insert(info.clone());
        }
        // https://datatracker.ietf.org/doc/html/rfc6842#section-3
        // copy client id
        if let Some(id) = req.opts().get(OptionCode::ClientIdentifier) {
            resp.opts_mut().insert(id.clone());
        }

        let subnet_ip = self.subnet_address(req);
        let mut interface_match = false;
        // if we populate from interface, interface must be on same subnet
        // as packet (local)
        if self.interface.contains(subnet_ip) {
            resp.opts_mut()
                .insert(DhcpOption::Router(vec![self.interface.ip()]));
            resp.opts_mut()
                .insert(DhcpOption::SubnetMask(self.interface.mask()));
            interface_match = true;
        }
        // configured router/netmask override the interface
        for code in [OptionCode::Router, OptionCode::SubnetMask] {
            if let Some(v) = param_opts.get(code) {
                resp.opts_mut().insert(v.clone());
            }
        }

        if let Some(DhcpOption::ParameterRequestList(requested)) =
            req.opts().get(OptionCode::ParameterRequestList)
        {
            if requested.contains(&OptionCode::BroadcastAddr) && interface_match {
                resp.opts_mut()
                    .insert(DhcpOption::BroadcastAddr(self.interface.broadcast()));
            }
            for code in requested {
                if let Some(v) = param_opts.get(*code) {
                    resp.opts_mut().insert(v.clone());
                }
            }
        }

        if let Some((sp, requested_lease)) = lease {
            let (t, t1, t2) = sp.lease_time().determine_lease(requested_lease);
            resp.opts_mut()
                .insert(DhcpOption::AddressLeaseTime(whole_seconds(t)));
            resp.opts_mut()
                .insert(DhcpOption::Renewal(whole_seconds(t1)));
            resp.opts_mut()
                .insert(DhcpOption::Rebinding(whole_seconds(t2)));
        }
    }

    /// RFC 2131 response addressing:
    /// relay (giaddr) -> unicast to the relay on the server port;
    /// ciaddr -> unicast to the client; otherwise broadcast. Without ARP
    /// cache injection the yiaddr-unicast case degrades to broadcast,
    /// which every INIT-state client is required to accept.
    fn resp_addr(&self, req: &Message, resp: &RespView) -> SocketAddr {
        let giaddr = req.giaddr();
        let ciaddr = req.ciaddr();
        if !giaddr.is_unspecified() {
            trace!("responding via relay giaddr");
            (giaddr, v4::SERVER_PORT).into()
        } else if !ciaddr.is_unspecified() && !resp.is_nak {
            trace!("responding unicast to ciaddr");
            (ciaddr, v4::CLIENT_PORT).into()
        } else {
            trace!("responding via broadcast");
            (Ipv4Addr::BROADCAST, v4::CLIENT_PORT).into()
        }
    }

    /// figure out which subnet a message belongs to: relay link
    /// selection, then subnet selection, then giaddr, then ciaddr, then
    /// the ingress interface
    fn subnet_address(&self, req: &Message) -> Ipv4Addr {
        let link = req
            .opts()
            .get(OptionCode::RelayAgentInformation)
            .and_then(|opt| {
                if let DhcpOption::RelayAgentInformation(info) = opt {
                    if let Some(RelayOpt::LinkSelection(ip)) = info.get(RelayCode::LinkSelection) {
                        return Some(*ip);
                    }
                }
                None
            })
            .or_else(|| match req.opts().get(OptionCode::SubnetSelection) {
                Some(DhcpOption::SubnetSelection(ip)) => Some(*ip),
                _ => None,
            });
        if let Some(ip) = link {
            ip
        } else if !req.giaddr().is_unspecified() {
            req.giaddr()
        } else if !req.ciaddr().is_unspecified() {
            req.ciaddr()
        } else {
            self.interface.ip()
        }
    }

    fn client_request(&self, req: &Message, msg_type: MessageType) -> ClientRequest {
        let client_id = match req.opts().get(OptionCode::ClientIdentifier) {
            Some(DhcpOption::ClientIdentifier(id)) if !id.is_empty() => Some(id.clone()),
            _ => None,
        };
        let chaddr = req.chaddr();
        let mac = if chaddr.len() >= 6 {
            MacAddr::new(chaddr[0], chaddr[1], chaddr[2], chaddr[3], chaddr[4], chaddr[5])
        } else {
            MacAddr::zero()
        };
        let opt_requested = match req.opts().get(OptionCode::RequestedIpAddress) {
            Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
            _ => None,
        };
        // renew/rebind carry the address in ciaddr instead of option 50
        let requested_ip = if !req.ciaddr().is_unspecified() && msg_type == MessageType::Request {
            Some(req.ciaddr())
        } else {
            opt_requested
        };
        let requested_lease = match req.opts().get(OptionCode::AddressLeaseTime) {
            Some(DhcpOption::AddressLeaseTime(t)) => Some(Duration::from_secs(*t as u64)),
            _ => None,
        };
        let hostname = match req.opts().get(OptionCode::Hostname) {
            Some(DhcpOption::Hostname(h)) => Some(h.clone()),
            _ => None,
        };
        let fqdn = match req.opts().get(OptionCode::ClientFQDN) {
            Some(DhcpOption::ClientFQDN(f)) => Some(f.domain().to_string()),
            _ => None,
        };

        let (circuit_id, remote_id) = relay_ids(req);
        let vendor_class = opt_utf8(req, OptionCode::ClassIdentifier).unwrap_or_default();
        let user_class = opt_utf8(req, OptionCode::from(77)).unwrap_or_default();

        let relay = if req.giaddr().is_unspecified() {
            None
        } else {
            Some(RelayInfo {
                giaddr: req.giaddr(),
                circuit_id: (!circuit_id.is_empty()).then(|| circuit_id.clone()),
                remote_id: (!remote_id.is_empty()).then(|| remote_id.clone()),
            })
        };

        ClientRequest {
            client_id,
            mac,
            requested_ip,
            requested_lease,
            hostname,
            fqdn,
            criteria: MatchCriteria {
                circuit_id,
                remote_id,
                vendor_class,
                user_class,
            },
            relay,
        }
    }

    fn maybe_gratuitous(&self, ip: Ipv4Addr, mac: MacAddr) {
        let detector = self.detector.clone();
        tokio::spawn(async move {
            detector.send_gratuitous_arp_for_lease(ip, mac);
        });
    }
}

/// bits of the response that addressing cares about
struct RespView {
    is_nak: bool,
}

fn resp_view(resp: &Message) -> RespView {
    RespView {
        is_nak: resp.opts().msg_type() == Some(MessageType::Nak),
    }
}

fn relay_ids(req: &Message) -> (String, String) {
    let mut circuit = String::new();
    let mut remote = String::new();
    if let Some(DhcpOption::RelayAgentInformation(info)) =
        req.opts().get(OptionCode::RelayAgentInformation)
    {
        if let Some(RelayOpt::AgentCircuitId(id)) = info.get(RelayCode::AgentCircuitId) {
            circuit = String::from_utf8_lossy(id).into_owned();
        }
        if let Some(RelayOpt::AgentRemoteId(id)) = info.get(RelayCode::AgentRemoteId) {
            remote = String::from_utf8_lossy(id).into_owned();
        }
    }
    (circuit, remote)
}

fn opt_utf8(req: &Message, code: OptionCode) -> Option<String> {
    req.opts().get(code).and_then(|opt| match opt {
        DhcpOption::ClassIdentifier(v) => Some(String::from_utf8_lossy(v).into_owned()),
        DhcpOption::Unknown(u) => Some(String::from_utf8_lossy(u.data()).into_owned()),
        _ => None,
    })
}

fn type_label(t: MessageType) -> &'static str {
    match t {
        MessageType::Discover => "discover",
        MessageType::Offer => "offer",
        MessageType::Request => "request",
        MessageType::Ack => "ack",
        MessageType::Nak => "nak",
        MessageType::Release => "release",
        MessageType::Decline => "decline",
        MessageType::Inform => "inform",
        _ => "unknown",
    }
}

fn whole_seconds(t: Duration) -> u32 {
    if t.subsec_millis() >= 500 {
        t.as_secs() as u32 + 1
    } else {
        t.as_secs() as u32
    }
}

/// encode a reply for the wire
pub fn encode_reply(msg: &Message) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(300);
    let mut enc = Encoder::new(&mut buf);
    msg.encode(&mut enc)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    Ok(buf)
}
