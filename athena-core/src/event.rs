//! # event bus
//!
//! Bounded in-process fan-out. Publishers never block: a full input
//! channel drops the event and counts it. A dispatcher task copies each
//! event to every subscriber; a full subscriber channel drops that one
//! event for that one subscriber only. Per-subscriber delivery order is
//! publish order; there is no cross-subscriber ordering.
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use lease_store::{unix_now, ConflictRecord, Lease};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics::Metrics;

/// Stable event names consumed by in-process subscribers (HA peer, audit,
/// DDNS, SIEM, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LeaseDiscover,
    LeaseOffer,
    LeaseAck,
    LeaseRenew,
    LeaseNak,
    LeaseRelease,
    LeaseDecline,
    LeaseExpire,
    ConflictDetected,
    ConflictDecline,
    ConflictResolved,
    ConflictPermanent,
    HaFailover,
    HaSyncComplete,
    RogueDetected,
    RogueResolved,
    AnomalyDetected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LeaseDiscover => "lease.discover",
            EventKind::LeaseOffer => "lease.offer",
            EventKind::LeaseAck => "lease.ack",
            EventKind::LeaseRenew => "lease.renew",
            EventKind::LeaseNak => "lease.nak",
            EventKind::LeaseRelease => "lease.release",
            EventKind::LeaseDecline => "lease.decline",
            EventKind::LeaseExpire => "lease.expire",
            EventKind::ConflictDetected => "conflict.detected",
            EventKind::ConflictDecline => "conflict.decline",
            EventKind::ConflictResolved => "conflict.resolved",
            EventKind::ConflictPermanent => "conflict.permanent",
            EventKind::HaFailover => "ha.failover",
            EventKind::HaSyncComplete => "ha.sync_complete",
            EventKind::RogueDetected => "rogue.detected",
            EventKind::RogueResolved => "rogue.resolved",
            EventKind::AnomalyDetected => "anomaly.detected",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Lease(Lease),
    Conflict(ConflictRecord),
    Ha { from: &'static str, to: &'static str },
    None,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// unix seconds at publish time
    pub at: u64,
    pub payload: EventPayload,
}

impl Event {
    pub fn lease(kind: EventKind, lease: Lease) -> Self {
        Self {
            kind,
            at: unix_now(),
            payload: EventPayload::Lease(lease),
        }
    }
    pub fn conflict(kind: EventKind, rec: ConflictRecord) -> Self {
        Self {
            kind,
            at: unix_now(),
            payload: EventPayload::Conflict(rec),
        }
    }
    pub fn ha(from: &'static str, to: &'static str) -> Self {
        Self {
            kind: EventKind::HaFailover,
            at: unix_now(),
            payload: EventPayload::Ha { from, to },
        }
    }
    pub fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            at: unix_now(),
            payload: EventPayload::None,
        }
    }
}

pub type SubId = usize;

struct Subscriber {
    id: SubId,
    tx: mpsc::Sender<Event>,
}

struct Shared {
    subs: RwLock<Vec<Subscriber>>,
    next_id: AtomicUsize,
    metrics: Metrics,
}

/// Cloneable handle to the bus. The dispatcher task exits when every
/// handle has been dropped and the input drained.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.shared.subs.read().len())
            .finish()
    }
}

impl EventBus {
    /// Create the bus and spawn its dispatcher.
    pub fn start(buffer: usize, metrics: Metrics) -> EventBus {
        let (tx, mut rx) = mpsc::channel::<Event>(buffer.max(1));
        let shared = Arc::new(Shared {
            subs: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            metrics,
        });

        let dispatch = shared.clone();
        tokio::spawn(async move {
            while let Some(evt) = rx.recv().await {
                let subs = dispatch.subs.read();
                for sub in subs.iter() {
                    if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(evt.clone()) {
                        dispatch
                            .metrics
                            .event_sub_drops
                            .with_label_values(&[&sub.id.to_string()])
                            .inc();
                        warn!(kind = %evt.kind, subscriber = sub.id, "subscriber full, dropping event");
                    }
                }
            }
            debug!("event bus dispatcher drained and stopped");
        });

        EventBus { tx, shared }
    }

    /// Non-blocking publish. A full input drops the event with a counter
    /// bump; a closed bus (shutdown) is silent.
    pub fn publish(&self, evt: Event) {
        match self.tx.try_send(evt) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(evt)) => {
                self.shared.metrics.event_input_drops.inc();
                warn!(kind = %evt.kind, "event bus input full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Register a subscriber with its own bounded channel.
    pub fn subscribe(&self, buffer: usize) -> (SubId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.subs.write().push(Subscriber { id, tx });
        debug!(subscriber = id, "event subscriber added");
        (id, rx)
    }

    /// Drop a subscriber; its channel closes.
    pub fn unsubscribe(&self, id: SubId) {
        self.shared.subs.write().retain(|s| s.id != id);
        debug!(subscriber = id, "event subscriber removed");
    }

    /// number of events dropped at the input so far
    pub fn input_drops(&self) -> u64 {
        self.shared.metrics.event_input_drops.get()
    }
}
