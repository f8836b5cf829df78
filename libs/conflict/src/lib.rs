//! # conflict
//!
//! Duplicate-address defense. Before any IP is offered it passes through
//! the [`ConflictDetector`]: known conflicts short-circuit from the
//! persistent [`ConflictTable`], recent probe results short-circuit from
//! the TTL [`ProbeCache`], and only then does a real ARP/ICMP probe go on
//! the wire. Conflicts are held out of rotation for a hold period and
//! flagged permanent after repeated offenses.
mod cache;
mod detector;
mod table;

pub use cache::ProbeCache;
pub use detector::{ConflictDetector, DetectError, DetectorConfig, ProbeVerdict};
pub use table::ConflictTable;
