pub mod store;
pub mod wire;

use std::{path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use dhcproto::v4;
use pnet::{
    self,
    datalink::NetworkInterface,
    ipnetwork::{IpNetwork, Ipv4Network},
};
use tracing::debug;

pub use store::{ConfigChange, DynConfig, Origin, Section};
pub use wire::{Config, ProbeStrategy, Role};

/// attempts to decode the config first as JSON, then YAML, finally erroring
/// if neither work
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to find config at {}", &path.display()))?;
    parse_str(&raw)
}

pub fn parse_str(s: &str) -> Result<Config> {
    let config = match serde_json::from_str::<Config>(s) {
        Ok(cfg) => cfg,
        Err(json_err) => serde_yaml::from_str(s)
            .map_err(|yaml_err| {
                anyhow::anyhow!("config is neither JSON ({json_err}) nor YAML ({yaml_err})")
            })?,
    };
    debug!(?config);
    Ok(config)
}

/// Client identity for lease lookups: option 61 bytes when the client sent
/// one, else the `chaddr` hardware address.
pub fn client_id(req: &v4::Message) -> Vec<u8> {
    if let Some(v4::DhcpOption::ClientIdentifier(id)) =
        req.opts().get(v4::OptionCode::ClientIdentifier)
    {
        if !id.is_empty() {
            return id.clone();
        }
    }
    req.chaddr().to_vec()
}

/// find the first up non-loopback IPv4 interface, if a name is provided it
/// must also match
pub fn find_v4_interface(name: Option<&str>) -> Result<NetworkInterface> {
    let interface = pnet::datalink::interfaces().into_iter().find(|e| {
        e.is_up()
            && !e.is_loopback()
            && e.ips.iter().any(|i| i.is_ipv4())
            && name.map(|n| n == e.name).unwrap_or(true)
    });
    debug!(?interface);
    match interface {
        Some(int) => Ok(int),
        None => bail!("unable to find usable IPv4 interface {:?}", name),
    }
}

/// the first IPv4 network configured on an interface
pub fn interface_ipv4(interface: &NetworkInterface) -> Option<Ipv4Network> {
    interface.ips.iter().find_map(|net| match net {
        IpNetwork::V4(net) => Some(*net),
        _ => None,
    })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LeaseTime {
    default: Duration,
    min: Duration,
    max: Duration,
}

impl From<wire::MinMax> for LeaseTime {
    fn from(m: wire::MinMax) -> Self {
        Self {
            default: Duration::from_secs(m.default),
            min: Duration::from_secs(m.min),
            max: Duration::from_secs(m.max),
        }
    }
}

impl LeaseTime {
    pub fn new(default: Duration, min: Duration, max: Duration) -> Self {
        Self { default, min, max }
    }
    pub fn get_default(&self) -> Duration {
        self.default
    }
    /// calculate the lease time based on a possible requested time
    pub fn determine_lease(&self, requested: Option<Duration>) -> (Duration, Duration, Duration) {
        let LeaseTime { default, min, max } = *self;
        match requested {
            // time must be larger than `min` and smaller than `max`
            Some(req) => {
                let t = req.clamp(min, max);
                (t, renew(t), rebind(t))
            }
            None => (default, renew(default), rebind(default)),
        }
    }
}

pub fn renew(t: Duration) -> Duration {
    t / 2
}

pub fn rebind(t: Duration) -> Duration {
    t * 7 / 8
}
