//! # Config docs
//!
//! On-disk configuration. A config file decodes first as JSON, then as
//! YAML. Sections:
//!
//! - `server`: interface, server id, lease database path, log level, pid file
//! - `ha`: active/standby peering (role, addresses, shared secret, timers)
//! - `subnets[]`: network CIDR, subnet-scoped options, `pools[]`
//! - `conflict_detection`: probing strategy and conflict table tuning
//! - `hooks`: event bus sizing
//!
//! ## Pool matching
//!
//! Each pool may carry `match_circuit_id` / `match_remote_id` /
//! `match_vendor_class` / `match_user_class` glob patterns. A pool with at
//! least one pattern only serves requests where every pattern matches; a
//! pool with none is the subnet default.
//!
//! ## Lease time
//!
//! `lease_time` takes `default`/`min`/`max` seconds. A client-requested
//! lease time is clamped into `[min, max]`; T1 is half the lease, T2 is
//! seven eighths.
use std::{collections::BTreeMap, net::Ipv4Addr, path::PathBuf};

use dhcproto::{
    v4::{DhcpOption, DhcpOptions, OptionCode},
    Decodable, Decoder, Encodable, Encoder,
};
use ipnet::Ipv4Net;
use serde::{de, Deserialize, Deserializer, Serialize};
use tracing::warn;

pub(crate) fn default_offer_reservation() -> u64 {
    120
}
fn default_heartbeat() -> u64 {
    1
}
fn default_failover() -> u64 {
    10
}
fn default_probe_timeout_ms() -> u64 {
    500
}
fn default_max_probes() -> usize {
    3
}
fn default_parallel_count() -> usize {
    3
}
fn default_hold_time() -> u64 {
    3600
}
fn default_max_conflict_count() -> u32 {
    3
}
fn default_cache_ttl() -> u64 {
    60
}
fn default_event_buffer() -> usize {
    1024
}
fn default_sticky_window() -> u64 {
    3600
}
fn default_enabled() -> bool {
    true
}
fn default_lease_db() -> PathBuf {
    PathBuf::from("/var/lib/athena/leases.redb")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerSection,
    #[serde(default)]
    pub ha: Option<HaSection>,
    #[serde(default)]
    pub subnets: Vec<SubnetSection>,
    #[serde(default)]
    pub conflict_detection: ConflictSection,
    #[serde(default)]
    pub hooks: HooksSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSection {
    /// interface to serve DHCP on; when absent the first up, non-loopback
    /// IPv4 interface is used
    #[serde(default)]
    pub interface: Option<String>,
    /// string identifier reported in logs and HA hellos
    pub server_id: String,
    #[serde(default = "default_lease_db")]
    pub lease_db: PathBuf,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub role: Role,
    pub listen_address: String,
    pub peer_address: String,
    pub secret: String,
    /// seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval: u64,
    /// seconds
    #[serde(default = "default_failover")]
    pub failover_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSection {
    pub network: Ipv4Net,
    /// subnet-scoped option overrides
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub pools: Vec<PoolSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default)]
    pub name: Option<String>,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    #[serde(default)]
    pub lease_time: MinMax,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub exclusions: Vec<Ipv4Addr>,
    #[serde(default)]
    pub match_circuit_id: Option<String>,
    #[serde(default)]
    pub match_remote_id: Option<String>,
    #[serde(default)]
    pub match_vendor_class: Option<String>,
    #[serde(default)]
    pub match_user_class: Option<String>,
}

impl PoolSection {
    /// explicit name or one derived from the range
    pub fn pool_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.range_start, self.range_end))
    }
}

/// lease time bounds, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinMax {
    pub default: u64,
    pub min: u64,
    pub max: u64,
}

impl Default for MinMax {
    fn default() -> Self {
        Self {
            default: 86_400,
            min: 3_600,
            max: 604_800,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    Sequential,
    Parallel,
}

impl Default for ProbeStrategy {
    fn default() -> Self {
        ProbeStrategy::Sequential
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub probe_strategy: ProbeStrategy,
    /// milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_max_probes")]
    pub max_probes_per_discover: usize,
    #[serde(default = "default_parallel_count")]
    pub parallel_probe_count: usize,
    /// seconds an unresolved conflict keeps its IP out of rotation
    #[serde(default = "default_hold_time")]
    pub conflict_hold_time: u64,
    /// probe_count at which the conflict becomes permanent
    #[serde(default = "default_max_conflict_count")]
    pub max_conflict_count: u32,
    /// seconds
    #[serde(default = "default_cache_ttl")]
    pub probe_cache_ttl: u64,
    #[serde(default)]
    pub send_gratuitous_arp: bool,
    #[serde(default = "default_enabled")]
    pub icmp_fallback: bool,
}

impl Default for ConflictSection {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_strategy: ProbeStrategy::default(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_probes_per_discover: default_max_probes(),
            parallel_probe_count: default_parallel_count(),
            conflict_hold_time: default_hold_time(),
            max_conflict_count: default_max_conflict_count(),
            probe_cache_ttl: default_cache_ttl(),
            send_gratuitous_arp: false,
            icmp_fallback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HooksSection {
    #[serde(default = "default_event_buffer")]
    pub event_buffer_size: usize,
    /// seconds a client's previous address is preferred for reissue after
    /// its lease lapses
    #[serde(default = "default_sticky_window")]
    pub sticky_window: u64,
    /// seconds between a DISCOVER's offer and its reclamation
    #[serde(default = "default_offer_reservation")]
    pub offer_reservation: u64,
}

impl Default for HooksSection {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer(),
            sticky_window: default_sticky_window(),
            offer_reservation: default_offer_reservation(),
        }
    }
}

/// DHCP options as configured. Received as a map of option code -> typed
/// value, encoded to wire form and decoded through `DhcpOptions` so every
/// code ends up in its proper representation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub values: Opts,
}

impl Options {
    pub fn get(self) -> DhcpOptions {
        self.values.0
    }
}

impl AsRef<DhcpOptions> for Options {
    fn as_ref(&self) -> &DhcpOptions {
        &self.values.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Opts(pub DhcpOptions);

/// this type is only used as an intermediate representation
/// Opts are received as essentially a map of u8 -> Opt
/// and transformed into DhcpOptions
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum Opt {
    Ip(Ipv4Addr),
    IpList(Vec<Ipv4Addr>),
    U32(u32),
    U16(u16),
    Str(String),
    Hex(String),
}

impl<'de> serde::Deserialize<'de> for Opts {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // decode what was on the wire to a map
        let map: BTreeMap<u8, Opt> = Deserialize::deserialize(de)?;
        // we'll encode the map to buf so we can use DhcpOptions::decode
        let mut buf = vec![];
        let mut enc = Encoder::new(&mut buf);
        for (code, opt) in map {
            write_opt(&mut enc, code, opt).map_err(de::Error::custom)?;
        }
        // write `End` so DhcpOptions can decode
        enc.write_u8(OptionCode::End.into())
            .map_err(de::Error::custom)?;

        // buffer now has binary data for DhcpOptions -- decode it
        let opts = DhcpOptions::decode(&mut Decoder::new(&buf)).map_err(de::Error::custom)?;
        Ok(Self(opts))
    }
}

fn write_opt(enc: &mut Encoder<'_>, code: u8, opt: Opt) -> anyhow::Result<()> {
    enc.write_u8(code)?;
    match opt {
        Opt::Ip(ip) => {
            enc.write_u8(4)?;
            enc.write_slice(&ip.octets())?;
        }
        Opt::IpList(list) => {
            enc.write_u8(list.len() as u8 * 4)?;
            for ip in list {
                enc.write_u32(ip.into())?;
            }
        }
        Opt::Str(s) => {
            enc.write_u8(s.as_bytes().len() as u8)?;
            enc.write_slice(s.as_bytes())?;
        }
        Opt::U32(n) => {
            enc.write_u8(4)?;
            enc.write_u32(n)?;
        }
        Opt::U16(n) => {
            enc.write_u8(2)?;
            enc.write_u16(n)?;
        }
        Opt::Hex(s) => {
            let bytes = hex::decode(s)?;
            enc.write_u8(bytes.len() as u8)?;
            enc.write_slice(&bytes)?;
        }
    }
    Ok(())
}

impl Serialize for Opts {
    fn serialize<S>(&self, ser: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let map = self
            .0
            .iter()
            .filter_map(|(code, opt)| decode_opt(code, opt))
            .collect::<BTreeMap<u8, Opt>>();
        ser.collect_map(&map)
    }
}

fn decode_opt(code: &OptionCode, opt: &DhcpOption) -> Option<(u8, Opt)> {
    use dhcproto::v4::DhcpOption::*;
    match opt {
        Pad | End => None,
        SubnetMask(addr)
        | BroadcastAddr(addr)
        | RequestedIpAddress(addr)
        | ServerIdentifier(addr)
        | SubnetSelection(addr) => Some(((*code).into(), Opt::Ip(*addr))),
        TimeServer(ips)
        | NameServer(ips)
        | Router(ips)
        | DomainNameServer(ips)
        | NtpServers(ips) => Some(((*code).into(), Opt::IpList(ips.clone()))),
        AddressLeaseTime(num) | Renewal(num) | Rebinding(num) => {
            Some(((*code).into(), Opt::U32(*num)))
        }
        Hostname(s) | DomainName(s) | Message(s) => Some(((*code).into(), Opt::Str(s.clone()))),
        BootFileSize(num) | MaxMessageSize(num) => Some(((*code).into(), Opt::U16(*num))),
        Unknown(opt) => Some(((*code).into(), Opt::Hex(hex::encode(opt.data())))),
        _ => {
            // the data includes the code value, let's slice that off
            match opt.to_vec() {
                Ok(buf) => Some((
                    (*code).into(),
                    Opt::Hex(if buf.is_empty() {
                        "".into()
                    } else {
                        hex::encode(&buf[1..])
                    }),
                )),
                Err(err) => {
                    warn!(?err);
                    None
                }
            }
        }
    }
}
