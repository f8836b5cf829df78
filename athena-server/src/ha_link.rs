//! Wires the HA peer to the rest of the server: applies replicated
//! lease/conflict/config updates locally, answers snapshot requests, and
//! forwards local changes (published on the event bus and the config
//! store's change channel) to the peer.
use std::sync::Arc;

use athena_core::{Event, EventBus, EventKind, EventPayload};
use config::{DynConfig, Origin, Section};
use ha::{HaHandle, Inbound, LeaseDelta, PeerMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lease::LeaseManager;

const FORWARD_BUFFER: usize = 1024;

pub fn spawn(
    handle: HaHandle,
    inbound: mpsc::Receiver<Inbound>,
    manager: Arc<LeaseManager>,
    cfg: Arc<DynConfig>,
    bus: EventBus,
    token: CancellationToken,
) {
    tokio::spawn(apply_loop(
        handle.clone(),
        inbound,
        manager.clone(),
        cfg.clone(),
        bus.clone(),
        token.clone(),
    ));
    tokio::spawn(forward_loop(handle, cfg, bus, token));
}

/// Apply whatever the peer sends.
async fn apply_loop(
    handle: HaHandle,
    mut inbound: mpsc::Receiver<Inbound>,
    manager: Arc<LeaseManager>,
    cfg: Arc<DynConfig>,
    bus: EventBus,
    token: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => return,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };
        match msg {
            Inbound::AdjacencyFormed { peer_role, state } => {
                info!(%peer_role, %state, "ha adjacency ready");
                // the serving node seeds the standby with everything
                if state.answers_dhcp() {
                    send_full_sync(&handle, &manager, &cfg);
                }
            }
            Inbound::LeaseUpdate(deltas) => {
                for delta in deltas {
                    if let Err(err) = manager.apply_remote(delta).await {
                        warn!(?err, "failed to apply replicated lease");
                    }
                }
            }
            Inbound::ConflictUpdate(records) => {
                for rec in records {
                    manager.detector().table().apply_remote(rec);
                }
            }
            Inbound::ConfigSync { section, bytes } => {
                apply_config(&cfg, &section, &bytes);
            }
            Inbound::FullConfigSync { sections } => {
                for (section, bytes) in sections {
                    apply_config(&cfg, &section, &bytes);
                }
            }
            Inbound::SnapshotRequest => {
                debug!("peer requested a snapshot");
                send_full_sync(&handle, &manager, &cfg);
            }
            Inbound::SnapshotChunk {
                leases,
                conflicts,
                fin,
            } => {
                debug!(
                    leases = leases.len(),
                    conflicts = conflicts.len(),
                    fin,
                    "applying snapshot chunk"
                );
                for lease in leases {
                    if let Err(err) = manager.apply_remote(LeaseDelta::Put(lease)).await {
                        warn!(?err, "failed to apply snapshot lease");
                    }
                }
                for rec in conflicts {
                    manager.detector().table().apply_remote(rec);
                }
                if fin {
                    handle.sync_complete();
                    bus.publish(Event::bare(EventKind::HaSyncComplete));
                }
            }
        }
    }
}

fn apply_config(cfg: &DynConfig, section: &str, bytes: &[u8]) {
    let Some(section) = Section::from_str(section) else {
        warn!(section, "peer sent unknown config section");
        return;
    };
    if let Err(err) = cfg.apply_peer_config(section, bytes) {
        warn!(?err, %section, "failed to apply replicated config");
    }
}

fn send_full_sync(handle: &HaHandle, manager: &LeaseManager, cfg: &DynConfig) {
    match cfg.export_all_sections() {
        Ok(sections) => handle.send(PeerMessage::FullConfigSync {
            sections: sections
                .into_iter()
                .map(|(s, b)| (s.as_str().to_string(), b))
                .collect(),
        }),
        Err(err) => warn!(?err, "config export failed"),
    }
    let leases = match manager.store().all() {
        Ok(leases) => leases,
        Err(err) => {
            warn!(?err, "lease snapshot failed");
            return;
        }
    };
    let conflicts = manager.detector().table().records();
    info!(
        leases = leases.len(),
        conflicts = conflicts.len(),
        "sending state snapshot to peer"
    );
    handle.send(PeerMessage::SnapshotChunk {
        leases,
        conflicts,
        fin: true,
    });
}

/// Forward local changes to the peer while we are the serving node.
async fn forward_loop(
    handle: HaHandle,
    cfg: Arc<DynConfig>,
    bus: EventBus,
    token: CancellationToken,
) {
    let (sub_id, mut events) = bus.subscribe(FORWARD_BUFFER);
    let mut config_changes = cfg.subscribe();
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                bus.unsubscribe(sub_id);
                return;
            }
            evt = events.recv() => {
                let Some(evt) = evt else { return };
                if !handle.answers_dhcp() {
                    continue;
                }
                forward_event(&handle, evt);
            }
            change = config_changes.recv() => {
                match change {
                    Ok(change) if change.origin == Origin::Local => {
                        if handle.answers_dhcp() {
                            handle.send(PeerMessage::ConfigSync {
                                section: change.section.as_str().to_string(),
                                bytes: change.bytes,
                            });
                        }
                    }
                    Ok(_) => {} // peer-applied changes are not echoed back
                    Err(err) => {
                        debug!(?err, "config change stream lagged");
                    }
                }
            }
        }
    }
}

fn forward_event(handle: &HaHandle, evt: Event) {
    match (evt.kind, evt.payload) {
        (
            EventKind::LeaseOffer
            | EventKind::LeaseAck
            | EventKind::LeaseRenew
            | EventKind::LeaseRelease
            | EventKind::LeaseDecline
            | EventKind::LeaseExpire,
            EventPayload::Lease(lease),
        ) => {
            handle.send(PeerMessage::LeaseUpdate {
                deltas: vec![LeaseDelta::Put(lease)],
            });
        }
        (
            EventKind::ConflictDetected
            | EventKind::ConflictDecline
            | EventKind::ConflictPermanent
            | EventKind::ConflictResolved,
            EventPayload::Conflict(rec),
        ) => {
            handle.send(PeerMessage::ConflictUpdate { records: vec![rec] });
        }
        _ => {}
    }
}
