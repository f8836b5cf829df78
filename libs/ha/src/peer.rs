//! The peer task: one long-lived authenticated TCP connection, heartbeats,
//! and the replication stream. The task owns the [`Fsm`]; everything the
//! rest of the server needs flows through a [`HaHandle`] (outbound
//! messages, state watch) and an inbound channel the server layer applies
//! (lease/conflict/config updates, snapshots).
use std::{net::SocketAddr, time::Duration};

use athena_core::{Event, EventBus, Metrics};
use config::{wire::HaSection, Role};
use lease_store::{ConflictRecord, Lease};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    time::{interval, sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    fsm::{Fsm, FsmEvent, HaState},
    wire::{FrameCodec, LeaseDelta, PeerMessage, PROTOCOL_VERSION},
    HaError,
};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const OUTBOUND_DEPTH: usize = 1024;
const INBOUND_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct HaSettings {
    pub role: Role,
    pub server_id: String,
    pub listen_address: SocketAddr,
    pub peer_address: SocketAddr,
    pub secret: String,
    pub heartbeat_interval: Duration,
    pub failover_timeout: Duration,
}

impl HaSettings {
    pub fn from_section(s: &HaSection, server_id: &str) -> Result<Self, HaError> {
        let listen_address = s
            .listen_address
            .parse()
            .map_err(|e| HaError::BadAddress(s.listen_address.clone(), e))?;
        let peer_address = s
            .peer_address
            .parse()
            .map_err(|e| HaError::BadAddress(s.peer_address.clone(), e))?;
        Ok(Self {
            role: s.role,
            server_id: server_id.to_string(),
            listen_address,
            peer_address,
            secret: s.secret.clone(),
            heartbeat_interval: Duration::from_secs(s.heartbeat_interval.max(1)),
            failover_timeout: Duration::from_secs(s.failover_timeout.max(1)),
        })
    }
}

/// Peer traffic the server layer must apply.
#[derive(Debug)]
pub enum Inbound {
    /// hello exchange completed; `state` is our post-hello FSM state
    AdjacencyFormed { peer_role: Role, state: HaState },
    LeaseUpdate(Vec<LeaseDelta>),
    ConflictUpdate(Vec<ConflictRecord>),
    ConfigSync {
        section: String,
        bytes: Vec<u8>,
    },
    FullConfigSync {
        sections: Vec<(String, Vec<u8>)>,
    },
    SnapshotRequest,
    SnapshotChunk {
        leases: Vec<Lease>,
        conflicts: Vec<ConflictRecord>,
        fin: bool,
    },
}

#[derive(Debug)]
enum Control {
    SyncComplete,
}

/// Cheap cloneable handle into the peer task.
#[derive(Debug, Clone)]
pub struct HaHandle {
    state_rx: watch::Receiver<HaState>,
    outbound_tx: mpsc::Sender<PeerMessage>,
    control_tx: mpsc::Sender<Control>,
}

impl HaHandle {
    pub fn state(&self) -> HaState {
        *self.state_rx.borrow()
    }

    /// the DHCP gate: standby nodes never answer
    pub fn answers_dhcp(&self) -> bool {
        self.state().answers_dhcp()
    }

    pub fn watch(&self) -> watch::Receiver<HaState> {
        self.state_rx.clone()
    }

    /// Queue a message for the peer. Dropped with a warning when the link
    /// is down or the queue is full; the snapshot on reconnect reconciles.
    pub fn send(&self, msg: PeerMessage) {
        if let Err(err) = self.outbound_tx.try_send(msg) {
            let msg = match &err {
                mpsc::error::TrySendError::Full(m) | mpsc::error::TrySendError::Closed(m) => {
                    m.name()
                }
            };
            warn!(msg, "ha outbound queue unavailable, dropping message");
        }
    }

    /// Tell the FSM the snapshot we were waiting on has been applied.
    pub fn sync_complete(&self) {
        let _ = self.control_tx.try_send(Control::SyncComplete);
    }
}

/// Start the peer task. Returns the handle plus the inbound stream the
/// server layer drains.
pub fn spawn(
    settings: HaSettings,
    bus: EventBus,
    metrics: Metrics,
    token: CancellationToken,
) -> (HaHandle, mpsc::Receiver<Inbound>) {
    let (state_tx, state_rx) = watch::channel(HaState::Init);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
    let (control_tx, control_rx) = mpsc::channel(8);

    let codec = FrameCodec::new(&settings.secret);
    let fsm = Fsm::new(settings.role);
    let task = PeerTask {
        settings,
        codec,
        fsm,
        state_tx,
        inbound_tx,
        outbound_rx,
        control_rx,
        bus,
        metrics,
        last_heartbeat: Instant::now(),
        timeout_fired: false,
        hb_seq: 0,
        token,
    };
    tokio::spawn(task.run());

    (
        HaHandle {
            state_rx,
            outbound_tx,
            control_tx,
        },
        inbound_rx,
    )
}

struct PeerTask {
    settings: HaSettings,
    codec: FrameCodec,
    fsm: Fsm,
    state_tx: watch::Sender<HaState>,
    inbound_tx: mpsc::Sender<Inbound>,
    outbound_rx: mpsc::Receiver<PeerMessage>,
    control_rx: mpsc::Receiver<Control>,
    bus: EventBus,
    metrics: Metrics,
    last_heartbeat: Instant,
    timeout_fired: bool,
    hb_seq: u64,
    token: CancellationToken,
}

enum LoopOutcome {
    /// connection is done, go back to accept/dial
    Disconnected,
    /// shutting down entirely
    Shutdown,
}

impl PeerTask {
    async fn run(mut self) {
        self.apply(FsmEvent::Start);
        match self.settings.role {
            Role::Primary => self.run_listener().await,
            Role::Secondary => self.run_dialer().await,
        }
        debug!("ha peer task stopped");
    }

    async fn run_listener(mut self) {
        let listener = loop {
            match TcpListener::bind(self.settings.listen_address).await {
                Ok(l) => break l,
                Err(err) => {
                    error!(?err, addr = %self.settings.listen_address, "ha listen failed, retrying");
                    tokio::select! {
                        _ = self.token.cancelled() => return,
                        _ = sleep(BACKOFF_START) => {}
                    }
                }
            }
        };
        info!(addr = %self.settings.listen_address, "ha listening for peer");
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        info!(%peer, "ha peer connected");
                        match self.run_connection(stream).await {
                            Ok(LoopOutcome::Shutdown) => return,
                            Ok(LoopOutcome::Disconnected) => {}
                            Err(err) => warn!(?err, "ha connection ended"),
                        }
                    }
                    Err(err) => {
                        warn!(?err, "ha accept failed");
                        sleep(BACKOFF_START).await;
                    }
                },
                _ = sleep(self.settings.heartbeat_interval) => self.check_timeout(),
                Some(msg) = self.outbound_rx.recv() => {
                    trace!(msg = msg.name(), "no adjacency, dropping outbound message");
                }
            }
        }
    }

    async fn run_dialer(mut self) {
        let mut backoff = BACKOFF_START;
        loop {
            if self.token.is_cancelled() {
                return;
            }
            match TcpStream::connect(self.settings.peer_address).await {
                Ok(stream) => {
                    info!(peer = %self.settings.peer_address, "ha connected to peer");
                    backoff = BACKOFF_START;
                    match self.run_connection(stream).await {
                        Ok(LoopOutcome::Shutdown) => return,
                        Ok(LoopOutcome::Disconnected) => {}
                        Err(err) => warn!(?err, "ha connection ended"),
                    }
                }
                Err(err) => {
                    debug!(?err, peer = %self.settings.peer_address, "ha dial failed");
                }
            }
            // capped exponential backoff, checking failover timers while
            // we wait
            let deadline = Instant::now() + backoff;
            while Instant::now() < deadline {
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = sleep(
                        self.settings
                            .heartbeat_interval
                            .min(deadline.saturating_duration_since(Instant::now())),
                    ) => {
                        self.check_timeout();
                    }
                    Some(msg) = self.outbound_rx.recv() => {
                        trace!(msg = msg.name(), "no adjacency, dropping outbound message");
                    }
                }
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn run_connection(&mut self, stream: TcpStream) -> Result<LoopOutcome, HaError> {
        let (mut read_half, mut write_half) = stream.into_split();

        self.codec
            .write_frame(
                &mut write_half,
                &PeerMessage::Hello {
                    role: self.settings.role,
                    server_id: self.settings.server_id.clone(),
                    version: PROTOCOL_VERSION,
                },
            )
            .await?;

        let hello_deadline = self.settings.heartbeat_interval * 3;
        let first = timeout(hello_deadline, self.codec.read_frame(&mut read_half))
            .await
            .map_err(|_| HaError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "no hello")))??;
        let peer_role = match first {
            PeerMessage::Hello {
                role,
                server_id,
                version,
            } => {
                if version != PROTOCOL_VERSION {
                    return Err(HaError::BadVersion(version, PROTOCOL_VERSION));
                }
                if role == self.settings.role {
                    // misconfiguration: both nodes claim the same role
                    return Err(HaError::RoleConflict(role));
                }
                info!(peer_id = %server_id, peer_role = %role, "ha adjacency formed");
                role
            }
            other => return Err(HaError::NoHello(other.name())),
        };

        let was_serving = self.fsm.state().answers_dhcp();
        self.apply(FsmEvent::HelloExchanged { peer_role });
        self.last_heartbeat = Instant::now();
        self.timeout_fired = false;

        if was_serving && self.settings.role == Role::Secondary {
            // tell the returning primary we hold the service
            self.codec
                .write_frame(&mut write_half, &PeerMessage::FailoverDeclare)
                .await?;
        }
        if self.fsm.state() == HaState::Recovery {
            self.codec
                .write_frame(&mut write_half, &PeerMessage::SnapshotRequest)
                .await?;
        }
        let _ = self
            .inbound_tx
            .send(Inbound::AdjacencyFormed {
                peer_role,
                state: self.fsm.state(),
            })
            .await;

        // dedicated reader task so frame reads never get cancelled halfway
        let (msg_tx, mut msg_rx) = mpsc::channel::<PeerMessage>(64);
        let reader_codec = self.codec.clone();
        let reader = tokio::spawn(async move {
            loop {
                match reader_codec.read_frame(&mut read_half).await {
                    Ok(msg) => {
                        if msg_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(?err, "ha read loop ended");
                        return;
                    }
                }
            }
        });

        let mut heartbeat = interval(self.settings.heartbeat_interval);
        let outcome = loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    let _ = self.codec.write_frame(&mut write_half, &PeerMessage::Bye).await;
                    break LoopOutcome::Shutdown;
                }
                _ = heartbeat.tick() => {
                    self.hb_seq += 1;
                    let seq = self.hb_seq;
                    if let Err(err) = self
                        .codec
                        .write_frame(&mut write_half, &PeerMessage::Heartbeat { seq })
                        .await
                    {
                        warn!(?err, "heartbeat send failed");
                        break LoopOutcome::Disconnected;
                    }
                    self.check_timeout();
                }
                Some(msg) = self.outbound_rx.recv() => {
                    if let Err(err) = self.codec.write_frame(&mut write_half, &msg).await {
                        warn!(?err, "ha send failed");
                        break LoopOutcome::Disconnected;
                    }
                }
                Some(ctrl) = self.control_rx.recv() => match ctrl {
                    Control::SyncComplete => {
                        self.apply(FsmEvent::SyncComplete);
                        if self.fsm.state() == HaState::Active {
                            // re-announce so a standing-in secondary stands down
                            let _ = self
                                .codec
                                .write_frame(
                                    &mut write_half,
                                    &PeerMessage::Hello {
                                        role: self.settings.role,
                                        server_id: self.settings.server_id.clone(),
                                        version: PROTOCOL_VERSION,
                                    },
                                )
                                .await;
                        }
                    }
                },
                msg = msg_rx.recv() => match msg {
                    Some(msg) => {
                        if let Some(outcome) = self.dispatch(msg, &mut write_half).await? {
                            break outcome;
                        }
                    }
                    None => break LoopOutcome::Disconnected,
                },
            }
        };
        reader.abort();
        Ok(outcome)
    }

    /// returns Some(outcome) when the connection should end
    async fn dispatch(
        &mut self,
        msg: PeerMessage,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    ) -> Result<Option<LoopOutcome>, HaError> {
        self.last_heartbeat = Instant::now();
        self.timeout_fired = false;
        match msg {
            PeerMessage::Hello { role, version, .. } => {
                if version != PROTOCOL_VERSION {
                    return Err(HaError::BadVersion(version, PROTOCOL_VERSION));
                }
                if role == self.settings.role {
                    return Err(HaError::RoleConflict(role));
                }
                self.apply(FsmEvent::HelloExchanged { peer_role: role });
                if self.fsm.state() == HaState::Recovery {
                    self.codec
                        .write_frame(write_half, &PeerMessage::SnapshotRequest)
                        .await?;
                }
                let _ = self
                    .inbound_tx
                    .send(Inbound::AdjacencyFormed {
                        peer_role: role,
                        state: self.fsm.state(),
                    })
                    .await;
            }
            PeerMessage::Heartbeat { seq } => {
                trace!(seq, "heartbeat from peer");
                self.metrics.ha_heartbeats.inc();
            }
            PeerMessage::FailoverDeclare => {
                self.apply(FsmEvent::FailoverDeclared);
                if self.fsm.state() == HaState::Recovery {
                    self.codec
                        .write_frame(write_half, &PeerMessage::SnapshotRequest)
                        .await?;
                }
            }
            PeerMessage::Bye => {
                info!("peer said goodbye");
                self.apply(FsmEvent::PeerBye);
                if self.fsm.state() == HaState::PartnerDown
                    && self.settings.role == Role::Secondary
                {
                    self.apply(FsmEvent::Takeover);
                }
                return Ok(Some(LoopOutcome::Disconnected));
            }
            PeerMessage::LeaseUpdate { deltas } => {
                self.metrics.ha_lease_updates.inc_by(deltas.len() as u64);
                let _ = self.inbound_tx.send(Inbound::LeaseUpdate(deltas)).await;
            }
            PeerMessage::ConflictUpdate { records } => {
                let _ = self.inbound_tx.send(Inbound::ConflictUpdate(records)).await;
            }
            PeerMessage::ConfigSync { section, bytes } => {
                let _ = self
                    .inbound_tx
                    .send(Inbound::ConfigSync { section, bytes })
                    .await;
            }
            PeerMessage::FullConfigSync { sections } => {
                let _ = self
                    .inbound_tx
                    .send(Inbound::FullConfigSync { sections })
                    .await;
            }
            PeerMessage::SnapshotRequest => {
                let _ = self.inbound_tx.send(Inbound::SnapshotRequest).await;
            }
            PeerMessage::SnapshotChunk {
                leases,
                conflicts,
                fin,
            } => {
                let _ = self
                    .inbound_tx
                    .send(Inbound::SnapshotChunk {
                        leases,
                        conflicts,
                        fin,
                    })
                    .await;
            }
        }
        Ok(None)
    }

    fn check_timeout(&mut self) {
        if self.timeout_fired
            || self.last_heartbeat.elapsed() < self.settings.failover_timeout
        {
            return;
        }
        if matches!(
            self.fsm.state(),
            HaState::Standby | HaState::Active | HaState::Recovery
        ) {
            self.timeout_fired = true;
            warn!(
                elapsed = ?self.last_heartbeat.elapsed(),
                "no heartbeat from peer inside failover timeout"
            );
            self.apply(FsmEvent::HeartbeatTimeout);
            if self.fsm.state() == HaState::PartnerDown && self.settings.role == Role::Secondary {
                self.apply(FsmEvent::Takeover);
            }
        }
    }

    fn apply(&mut self, event: FsmEvent) {
        if let Some(t) = self.fsm.handle(event) {
            self.state_tx.send_replace(t.to);
            self.metrics.ha_state.set(t.to.gauge_value());
            if t.is_failover() {
                self.bus.publish(Event::ha(t.from.as_str(), t.to.as_str()));
            }
        }
    }
}
