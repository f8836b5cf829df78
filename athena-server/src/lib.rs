//! # athena-server
//!
//! The DHCPv4 serving core: lease lifecycle management, per-packet
//! handling, the UDP front end, and the glue that keeps the HA peer's
//! replica current.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

pub mod context;
pub mod ha_link;
pub mod handler;
pub mod lease;
pub mod server;
pub mod subnet;

pub use context::CoreContext;
pub use handler::DhcpHandler;
pub use lease::{ClientRequest, LeaseError, LeaseManager, LeaseTimers};
pub use subnet::{build_subnets, find_subnet, Subnet, SubnetPool};
