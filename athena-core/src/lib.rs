//! # athena-core
//!
//! Scaffolding shared by every athena-dhcpd subsystem: the in-process
//! event bus and the metrics registry. Feature crates (conflict detection,
//! HA peering, the lease server) build on top of this one.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

pub mod event;
pub mod metrics;

pub use event::{Event, EventBus, EventKind, EventPayload};
pub use metrics::Metrics;
