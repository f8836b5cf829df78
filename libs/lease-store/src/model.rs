//! Stored record types shared across the server.
use std::{collections::BTreeMap, net::Ipv4Addr, time::SystemTime};

use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};

/// Client identity bytes: option 61 when present, else the MAC. Stable
/// across messages from one client.
pub type ClientId = Vec<u8>;

/// seconds since the unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Lease lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Offered,
    Active,
    Expired,
    Released,
    Declined,
}

impl LeaseState {
    /// states that hold the address in its pool
    pub fn is_bound(&self) -> bool {
        matches!(self, LeaseState::Offered | LeaseState::Active)
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Offered => write!(f, "offered"),
            LeaseState::Active => write!(f, "active"),
            LeaseState::Expired => write!(f, "expired"),
            LeaseState::Released => write!(f, "released"),
            LeaseState::Declined => write!(f, "declined"),
        }
    }
}

/// Relay agent details captured from option 82 / giaddr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub giaddr: Ipv4Addr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

/// One binding record: client identity -> IPv4 address with a lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    /// CIDR of the owning subnet config
    pub subnet: String,
    /// pool name, informational
    pub pool: String,
    /// unix seconds
    pub start: u64,
    /// unix seconds
    pub expiry: u64,
    pub state: LeaseState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayInfo>,
    /// opaque option map persisted for audit
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl Lease {
    /// The lookup key: option 61 bytes if the client sent one, else the
    /// MAC bytes.
    pub fn client_key(&self) -> ClientId {
        match &self.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => mac_bytes(self.mac),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expiry
    }
}

pub fn mac_bytes(mac: MacAddr) -> Vec<u8> {
    vec![mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]
}

/// How a conflict was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictMethod {
    ArpProbe,
    IcmpProbe,
    ClientDecline,
}

impl std::fmt::Display for ConflictMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictMethod::ArpProbe => write!(f, "arp_probe"),
            ConflictMethod::IcmpProbe => write!(f, "icmp_probe"),
            ConflictMethod::ClientDecline => write!(f, "client_decline"),
        }
    }
}

/// A known-bad address. An unresolved record past its hold time that is
/// not permanent behaves as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub ip: Ipv4Addr,
    /// unix seconds of the most recent observation
    pub detected_at: u64,
    pub method: ConflictMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder_mac: Option<String>,
    pub subnet: String,
    pub probe_count: u32,
    /// unix seconds
    pub hold_until: u64,
    pub permanent: bool,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
}

impl ConflictRecord {
    pub fn new(
        ip: Ipv4Addr,
        method: ConflictMethod,
        responder_mac: Option<String>,
        subnet: String,
        hold_until: u64,
    ) -> Self {
        Self {
            ip,
            detected_at: unix_now(),
            method,
            responder_mac,
            subnet,
            probe_count: 1,
            hold_until,
            permanent: false,
            resolved: false,
            resolved_at: None,
        }
    }

    /// active = not resolved and either permanent or inside the hold window
    pub fn is_active(&self, now: u64) -> bool {
        !self.resolved && (self.permanent || now <= self.hold_until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_key_prefers_option61() {
        let mut lease = Lease {
            ip: [10, 0, 0, 1].into(),
            mac: MacAddr::new(2, 0, 0, 0, 0, 1),
            client_id: Some(vec![1, 2, 3]),
            hostname: None,
            fqdn: None,
            subnet: "10.0.0.0/24".into(),
            pool: "default".into(),
            start: 0,
            expiry: 10,
            state: LeaseState::Active,
            relay: None,
            options: Default::default(),
        };
        assert_eq!(lease.client_key(), vec![1, 2, 3]);
        lease.client_id = None;
        assert_eq!(lease.client_key(), vec![2, 0, 0, 0, 0, 1]);
        // empty option 61 falls back to the MAC too
        lease.client_id = Some(vec![]);
        assert_eq!(lease.client_key(), vec![2, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn conflict_activity_window() {
        let now = unix_now();
        let mut rec = ConflictRecord::new(
            [10, 0, 0, 50].into(),
            ConflictMethod::IcmpProbe,
            None,
            "10.0.0.0/24".into(),
            now + 60,
        );
        assert!(rec.is_active(now));
        assert!(!rec.is_active(now + 61));
        rec.permanent = true;
        assert!(rec.is_active(now + 9999));
        rec.resolved = true;
        assert!(!rec.is_active(now));
    }

    #[test]
    fn lease_serde_stable() {
        let lease = Lease {
            ip: [10, 0, 0, 100].into(),
            mac: MacAddr::new(2, 0, 0, 0, 0, 1),
            client_id: Some(vec![0xde, 0xad]),
            hostname: Some("printer".into()),
            fqdn: Some("printer.example.com.".into()),
            subnet: "10.0.0.0/24".into(),
            pool: "voip".into(),
            start: 100,
            expiry: 86500,
            state: LeaseState::Offered,
            relay: Some(RelayInfo {
                giaddr: [10, 0, 0, 1].into(),
                circuit_id: Some("eth0/1/3".into()),
                remote_id: None,
            }),
            options: Default::default(),
        };
        let json = serde_json::to_string(&lease).unwrap();
        let back: Lease = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lease);
    }
}
