//! Dynamic config store.
//!
//! Holds the live [`Config`] snapshot behind an atomic pointer and persists
//! replicable sections into the lease store's `config` table. Subsystems
//! that care about changes subscribe to a broadcast channel instead of
//! registering callbacks, so a reload never re-enters subscriber code from
//! inside the write path.
use std::sync::Arc;

use arc_swap::ArcSwap;
use lease_store::LeaseStore;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::wire::Config;

/// Named config sections. Only [`Section::REPLICABLE`] sections travel to
/// the HA peer; `server` and `ha` stay node-local (they carry per-node
/// identity like the interface and the role).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Server,
    Ha,
    Subnets,
    ConflictDetection,
    Hooks,
}

impl Section {
    pub const REPLICABLE: &'static [Section] =
        &[Section::Subnets, Section::ConflictDetection, Section::Hooks];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Server => "server",
            Section::Ha => "ha",
            Section::Subnets => "subnets",
            Section::ConflictDetection => "conflict_detection",
            Section::Hooks => "hooks",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "server" => Section::Server,
            "ha" => Section::Ha,
            "subnets" => Section::Subnets,
            "conflict_detection" => Section::ConflictDetection,
            "hooks" => Section::Hooks,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// where a change came from; peer-applied changes are not echoed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Peer,
}

#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub section: Section,
    pub bytes: Vec<u8>,
    pub origin: Origin,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown config section {0:?}")]
    UnknownSection(String),
    #[error("section decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] lease_store::StoreError),
}

pub struct DynConfig {
    current: ArcSwap<Config>,
    store: Arc<LeaseStore>,
    tx: broadcast::Sender<ConfigChange>,
}

impl std::fmt::Debug for DynConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynConfig").finish()
    }
}

impl DynConfig {
    /// Build from the bootstrap file config, overlaying any replicable
    /// sections previously persisted (peer-synced values survive a
    /// restart).
    pub fn new(bootstrap: Config, store: Arc<LeaseStore>) -> Result<Self, ConfigError> {
        let (tx, _) = broadcast::channel(64);
        let mut cfg = bootstrap;
        for (name, bytes) in store.all_sections()? {
            let Some(section) = Section::from_str(&name) else {
                warn!(section = %name, "ignoring unknown persisted config section");
                continue;
            };
            if !Section::REPLICABLE.contains(&section) {
                continue;
            }
            match apply_bytes(&mut cfg, section, &bytes) {
                Ok(()) => debug!(%section, "loaded persisted config section"),
                Err(err) => warn!(?err, %section, "persisted config section ignored"),
            }
        }
        Ok(Self {
            current: ArcSwap::from_pointee(cfg),
            store,
            tx,
        })
    }

    /// lock-free snapshot of the live config
    pub fn snapshot(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.tx.subscribe()
    }

    /// A local write: apply, persist, and notify subscribers (including
    /// the HA peer loop, which forwards Local-origin changes).
    pub fn update_section(&self, section: Section, bytes: &[u8]) -> Result<(), ConfigError> {
        self.apply(section, bytes, Origin::Local)
    }

    /// A peer write: same as [`update_section`] but marked so the peer
    /// loop does not echo it back.
    ///
    /// [`update_section`]: DynConfig::update_section
    pub fn apply_peer_config(&self, section: Section, bytes: &[u8]) -> Result<(), ConfigError> {
        self.apply(section, bytes, Origin::Peer)
    }

    fn apply(&self, section: Section, bytes: &[u8], origin: Origin) -> Result<(), ConfigError> {
        let mut cfg = (*self.current.load_full()).clone();
        apply_bytes(&mut cfg, section, bytes)?;
        self.store.put_section(section.as_str(), bytes)?;
        self.current.store(Arc::new(cfg));
        info!(%section, ?origin, "config section updated");
        // a send error just means nobody is listening right now
        let _ = self.tx.send(ConfigChange {
            section,
            bytes: bytes.to_vec(),
            origin,
        });
        Ok(())
    }

    /// Serialize every replicable section from the live snapshot, used to
    /// build a full sync for a newly formed adjacency.
    pub fn export_all_sections(&self) -> Result<Vec<(Section, Vec<u8>)>, ConfigError> {
        let cfg = self.snapshot();
        Section::REPLICABLE
            .iter()
            .map(|&section| Ok((section, section_bytes(&cfg, section)?)))
            .collect()
    }
}

fn apply_bytes(cfg: &mut Config, section: Section, bytes: &[u8]) -> Result<(), ConfigError> {
    match section {
        Section::Server => cfg.server = serde_json::from_slice(bytes)?,
        Section::Ha => cfg.ha = serde_json::from_slice(bytes)?,
        Section::Subnets => cfg.subnets = serde_json::from_slice(bytes)?,
        Section::ConflictDetection => cfg.conflict_detection = serde_json::from_slice(bytes)?,
        Section::Hooks => cfg.hooks = serde_json::from_slice(bytes)?,
    }
    Ok(())
}

fn section_bytes(cfg: &Config, section: Section) -> Result<Vec<u8>, ConfigError> {
    Ok(match section {
        Section::Server => serde_json::to_vec(&cfg.server)?,
        Section::Ha => serde_json::to_vec(&cfg.ha)?,
        Section::Subnets => serde_json::to_vec(&cfg.subnets)?,
        Section::ConflictDetection => serde_json::to_vec(&cfg.conflict_detection)?,
        Section::Hooks => serde_json::to_vec(&cfg.hooks)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bootstrap() -> Config {
        crate::parse_str(
            r#"{"server": {"server_id": "athena-test"},
                "subnets": [{"network": "10.0.0.0/24", "pools": [
                    {"range_start": "10.0.0.100", "range_end": "10.0.0.199"}
                ]}]}"#,
        )
        .unwrap()
    }

    fn dyn_config() -> (DynConfig, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LeaseStore::open(dir.path().join("cfg.redb")).unwrap());
        (DynConfig::new(bootstrap(), store).unwrap(), dir)
    }

    #[test]
    fn update_swaps_snapshot_and_notifies() {
        let (cfg, _dir) = dyn_config();
        let mut rx = cfg.subscribe();

        let new_subnets = serde_json::to_vec(&Vec::<crate::wire::SubnetSection>::new()).unwrap();
        cfg.update_section(Section::Subnets, &new_subnets).unwrap();

        assert!(cfg.snapshot().subnets.is_empty());
        let change = rx.try_recv().unwrap();
        assert_eq!(change.section, Section::Subnets);
        assert_eq!(change.origin, Origin::Local);
    }

    #[test]
    fn peer_apply_marked_peer() {
        let (cfg, _dir) = dyn_config();
        let mut rx = cfg.subscribe();
        let bytes = serde_json::to_vec(&cfg.snapshot().hooks).unwrap();
        cfg.apply_peer_config(Section::Hooks, &bytes).unwrap();
        assert_eq!(rx.try_recv().unwrap().origin, Origin::Peer);
    }

    #[test]
    fn persisted_sections_survive_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.redb");
        {
            let store = Arc::new(LeaseStore::open(&path).unwrap());
            let cfg = DynConfig::new(bootstrap(), store).unwrap();
            let empty = serde_json::to_vec(&Vec::<crate::wire::SubnetSection>::new()).unwrap();
            cfg.apply_peer_config(Section::Subnets, &empty).unwrap();
        }
        let store = Arc::new(LeaseStore::open(&path).unwrap());
        let cfg = DynConfig::new(bootstrap(), store).unwrap();
        // the peer-synced (empty) subnets win over the bootstrap file
        assert!(cfg.snapshot().subnets.is_empty());
    }

    #[test]
    fn export_covers_replicable_sections() {
        let (cfg, _dir) = dyn_config();
        let sections = cfg.export_all_sections().unwrap();
        assert_eq!(sections.len(), Section::REPLICABLE.len());
        for (section, bytes) in sections {
            assert!(Section::REPLICABLE.contains(&section));
            assert!(!bytes.is_empty());
        }
    }

    #[test]
    fn bad_section_bytes_rejected() {
        let (cfg, _dir) = dyn_config();
        assert!(cfg
            .update_section(Section::Subnets, b"definitely not json")
            .is_err());
        // snapshot unchanged
        assert_eq!(cfg.snapshot().subnets.len(), 1);
    }
}
