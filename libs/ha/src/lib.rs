//! # ha
//!
//! Active/standby peering. One authenticated TCP connection carries
//! heartbeats, lease and conflict replication, and config sync between the
//! two nodes; a small finite state machine decides which node answers
//! DHCP. Only the node in `Active` or `PartnerDown` serves clients.
mod fsm;
mod peer;
mod wire;

pub use fsm::{Fsm, FsmEvent, HaState, Transition};
pub use peer::{spawn, HaHandle, HaSettings, Inbound};
pub use wire::{FrameCodec, LeaseDelta, PeerMessage, PROTOCOL_VERSION};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("frame authentication failed")]
    Auth,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("peer announced protocol version {0}, we speak {1}")]
    BadVersion(u16, u16),
    #[error("peer announced role {0}, same as ours; refusing adjacency")]
    RoleConflict(config::Role),
    #[error("invalid peer address {0}: {1}")]
    BadAddress(String, std::net::AddrParseError),
    #[error("expected Hello, peer sent {0}")]
    NoHello(&'static str),
}
