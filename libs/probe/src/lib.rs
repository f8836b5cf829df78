//! # probe
//!
//! Liveness checks for candidate addresses. Before an IP is offered, the
//! conflict detector asks a prober whether anything already answers for
//! it: an [`ArpProber`] on the served interface for local subnets, an
//! [`IcmpProber`] for relayed ones. Probers are a closed set of variants,
//! not a trait object, so the detector can reason about exactly which
//! checks exist.
mod arp;
mod icmp;

pub use arp::ArpProber;
pub use icmp::IcmpProber;

use std::{collections::HashMap, net::Ipv4Addr, time::Duration};

use parking_lot::Mutex;
use pnet::util::MacAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("packet build failed")]
    BadPacket,
    #[error("interface {0} has no usable IPv4 address")]
    NoInterfaceAddr(String),
    #[error("interface {0} has no MAC address")]
    NoInterfaceMac(String),
    #[error("reply listener gone")]
    ListenerGone,
}

pub type Result<T> = std::result::Result<T, ProbeError>;

/// What a probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// no answer inside the timeout; address looks free
    Clear,
    /// something answered for the address
    Conflict { responder_mac: Option<MacAddr> },
}

impl ProbeOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ProbeOutcome::Conflict { .. })
    }
}

/// The bounded set of probe implementations.
#[derive(Debug)]
pub enum Prober {
    Arp(ArpProber),
    Icmp(IcmpProber),
    /// scripted prober: always clear unless an address was seeded as
    /// conflicted. Used in tests and as an explicit stand-in when no real
    /// prober is available.
    Noop(NoopProber),
}

impl Prober {
    pub async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> Result<ProbeOutcome> {
        match self {
            Prober::Arp(p) => p.probe(ip, timeout).await,
            Prober::Icmp(p) => p.probe(ip, timeout).await,
            Prober::Noop(p) => Ok(p.probe(ip)),
        }
    }

    /// stable label used in conflict records and logs
    pub fn method(&self) -> &'static str {
        match self {
            Prober::Arp(_) => "arp_probe",
            Prober::Icmp(_) => "icmp_probe",
            Prober::Noop(_) => "noop",
        }
    }
}

/// Deterministic prober for tests and degraded mode.
#[derive(Debug, Default)]
pub struct NoopProber {
    conflicts: Mutex<HashMap<Ipv4Addr, Option<MacAddr>>>,
}

impl NoopProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// seed an address that will report conflict on probe
    pub fn seed_conflict(&self, ip: Ipv4Addr, responder_mac: Option<MacAddr>) {
        self.conflicts.lock().insert(ip, responder_mac);
    }

    pub fn clear_conflict(&self, ip: Ipv4Addr) {
        self.conflicts.lock().remove(&ip);
    }

    fn probe(&self, ip: Ipv4Addr) -> ProbeOutcome {
        match self.conflicts.lock().get(&ip) {
            Some(mac) => ProbeOutcome::Conflict {
                responder_mac: *mac,
            },
            None => ProbeOutcome::Clear,
        }
    }
}
