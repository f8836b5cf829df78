//! # CoreContext
//!
//! Everything the server runs on, constructed once at startup and
//! threaded through: durable store, dynamic config, event bus, metrics,
//! conflict detector, lease manager, DHCP handler and the optional HA
//! peer. Background upkeep (GC, conflict hold expiry, config watching)
//! lives here too.
use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use athena_core::{EventBus, Metrics};
use config::{wire, DynConfig, Section};
use conflict::{ConflictDetector, ConflictTable, DetectorConfig};
use ipnet::Ipv4Net;
use lease_store::{unix_now, LeaseStore};
use probe::{ArpProber, IcmpProber, Prober};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ha_link,
    handler::DhcpHandler,
    lease::{LeaseManager, LeaseTimers},
    server,
    subnet::build_subnets,
};

const GC_INTERVAL: Duration = Duration::from_secs(60);
/// terminal lease rows older than this get purged from the store
const PURGE_RETENTION: u64 = 7 * 24 * 3600;

pub struct CoreContext {
    pub cfg: Arc<DynConfig>,
    pub store: Arc<LeaseStore>,
    pub metrics: Metrics,
    pub bus: EventBus,
    pub manager: Arc<LeaseManager>,
    pub handler: Arc<DhcpHandler>,
    pub ha: Option<ha::HaHandle>,
    pub interface_name: String,
    token: CancellationToken,
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("interface", &self.interface_name)
            .finish()
    }
}

impl CoreContext {
    /// Construct the whole core. Failures here (store, interface, config)
    /// are fatal and bubble to the binary's exit code.
    pub fn build(bootstrap: wire::Config, token: CancellationToken) -> Result<Arc<Self>> {
        let store = Arc::new(
            LeaseStore::open(&bootstrap.server.lease_db).with_context(|| {
                format!(
                    "failed to open lease store at {}",
                    bootstrap.server.lease_db.display()
                )
            })?,
        );
        let cfg = Arc::new(DynConfig::new(bootstrap, store.clone())?);
        let snapshot = cfg.snapshot();

        let metrics = Metrics::new().context("metrics registration failed")?;
        let bus = EventBus::start(snapshot.hooks.event_buffer_size, metrics.clone());

        let interface = config::find_v4_interface(snapshot.server.interface.as_deref())
            .context("no usable interface")?;
        let interface_net =
            config::interface_ipv4(&interface).context("interface has no IPv4 address")?;
        info!(interface = %interface.name, ip = %interface_net, "serving on interface");

        // probers; losing one is degraded mode, not fatal
        let arp = match ArpProber::new(&interface) {
            Ok(p) => Some(Prober::Arp(p)),
            Err(err) => {
                error!(
                    ?err,
                    "ARP prober unavailable (CAP_NET_RAW missing?), conflict probes on local subnets are disabled"
                );
                None
            }
        };
        let icmp = if snapshot.conflict_detection.icmp_fallback {
            match IcmpProber::new() {
                Ok(p) => Some(Prober::Icmp(p)),
                Err(err) => {
                    error!(?err, "ICMP prober unavailable, relayed subnets degrade to assume-clear");
                    None
                }
            }
        } else {
            None
        };

        let table = ConflictTable::load(
            store.clone(),
            snapshot.conflict_detection.conflict_hold_time,
            snapshot.conflict_detection.max_conflict_count,
        )?;
        let local_subnets = interface_local_subnets(&interface);
        let detector = Arc::new(ConflictDetector::new(
            DetectorConfig::from(&snapshot.conflict_detection),
            arp,
            icmp,
            table,
            bus.clone(),
            metrics.clone(),
            local_subnets,
        ));

        let manager = Arc::new(LeaseManager::new(
            store.clone(),
            detector.clone(),
            bus.clone(),
            metrics.clone(),
            LeaseTimers {
                offer_reservation: snapshot.hooks.offer_reservation,
                sticky_window: snapshot.hooks.sticky_window,
            },
            snapshot.conflict_detection.max_probes_per_discover,
        ));
        let subnets = build_subnets(&snapshot).context("invalid subnet configuration")?;
        manager
            .update_pools(subnets)
            .context("pool reconciliation failed")?;

        let ha = match &snapshot.ha {
            Some(section) if section.enabled => {
                let settings = ha::HaSettings::from_section(section, &snapshot.server.server_id)?;
                info!(role = %settings.role, peer = %settings.peer_address, "starting HA peer");
                let (handle, inbound) =
                    ha::spawn(settings, bus.clone(), metrics.clone(), token.child_token());
                ha_link::spawn(
                    handle.clone(),
                    inbound,
                    manager.clone(),
                    cfg.clone(),
                    bus.clone(),
                    token.child_token(),
                );
                Some(handle)
            }
            _ => None,
        };

        let handler = Arc::new(DhcpHandler::new(
            manager.clone(),
            bus.clone(),
            metrics.clone(),
            interface_net,
            ha.clone(),
        ));

        let ctx = Arc::new(Self {
            cfg,
            store,
            metrics,
            bus,
            manager,
            handler,
            ha,
            interface_name: interface.name,
            token,
        });
        ctx.spawn_gc();
        ctx.spawn_config_watcher();
        Ok(ctx)
    }

    /// Run the UDP server until shutdown.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        server::run(
            self.handler.clone(),
            self.interface_name.clone(),
            self.token.child_token(),
        )
        .await
    }

    /// SIGHUP: re-read the bootstrap file and push its replicable
    /// sections through the dynamic store (the watcher task rebuilds
    /// pools). `server` and `ha` changes need a restart.
    pub fn reload(&self, fresh: wire::Config) {
        info!("reloading configuration");
        for section in Section::REPLICABLE {
            let bytes = match section {
                Section::Subnets => serde_json::to_vec(&fresh.subnets),
                Section::ConflictDetection => serde_json::to_vec(&fresh.conflict_detection),
                Section::Hooks => serde_json::to_vec(&fresh.hooks),
                _ => continue,
            };
            match bytes {
                Ok(bytes) => {
                    if let Err(err) = self.cfg.update_section(*section, &bytes) {
                        error!(?err, %section, "reload failed for section");
                    }
                }
                Err(err) => error!(?err, %section, "reload serialization failed"),
            }
        }
    }

    fn spawn_gc(self: &Arc<Self>) {
        let ctx = self.clone();
        let token = self.token.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("gc task stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        let now = unix_now();
                        match ctx.manager.gc(now).await {
                            Ok(0) => {}
                            Ok(n) => debug!(reclaimed = n, "gc pass reclaimed leases"),
                            Err(err) => warn!(?err, "gc pass failed"),
                        }
                        ctx.manager.detector().cleanup_expired();
                        match ctx.store.purge_terminal(now.saturating_sub(PURGE_RETENTION)) {
                            Ok(0) => {}
                            Ok(n) => debug!(purged = n, "purged terminal lease rows"),
                            Err(err) => warn!(?err, "purge failed"),
                        }
                    }
                }
            }
        });
    }

    fn spawn_config_watcher(self: &Arc<Self>) {
        let ctx = self.clone();
        let token = self.token.child_token();
        let mut changes = self.cfg.subscribe();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = token.cancelled() => return,
                    change = changes.recv() => match change {
                        Ok(change) => change,
                        Err(err) => {
                            warn!(?err, "config change stream lagged");
                            continue;
                        }
                    },
                };
                let snapshot = ctx.cfg.snapshot();
                match change.section {
                    Section::Subnets => match build_subnets(&snapshot) {
                        Ok(subnets) => {
                            if let Err(err) = ctx.manager.update_pools(subnets) {
                                error!(?err, "pool reconciliation after reload failed");
                            } else {
                                info!("pools rebuilt after config change");
                            }
                        }
                        Err(err) => error!(?err, "rejected invalid subnet config"),
                    },
                    Section::Hooks => {
                        ctx.manager.update_config(LeaseTimers {
                            offer_reservation: snapshot.hooks.offer_reservation,
                            sticky_window: snapshot.hooks.sticky_window,
                        });
                        info!("lease timers updated");
                    }
                    Section::ConflictDetection => {
                        // table hold/permanence knobs bind at startup
                        info!("conflict_detection changed; probe settings apply after restart");
                    }
                    _ => {}
                }
            }
        });
    }
}

fn interface_local_subnets(interface: &pnet::datalink::NetworkInterface) -> Vec<Ipv4Net> {
    interface
        .ips
        .iter()
        .filter_map(|net| match net {
            pnet::ipnetwork::IpNetwork::V4(net) => {
                Ipv4Net::new(net.ip(), net.prefix()).ok().map(|n| n.trunc())
            }
            _ => None,
        })
        .collect()
}
