//! Strategy layer over the probers. Decides which prober to use for a
//! candidate, short-circuits through the conflict table and probe cache,
//! and records every outcome.
use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use athena_core::{Event, EventBus, EventKind, Metrics};
use config::{wire::ConflictSection, ProbeStrategy};
use ipnet::Ipv4Net;
use lease_store::ConflictMethod;
use pnet::util::MacAddr;
use probe::Prober;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{ConflictTable, ProbeCache};

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("no probe candidates supplied")]
    NoCandidates,
    #[error("all {probed} probed candidates are in conflict")]
    AllConflicted { probed: usize },
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub enabled: bool,
    pub probe_timeout: Duration,
    pub max_probes: usize,
    pub strategy: ProbeStrategy,
    pub parallel_count: usize,
    pub cache_ttl: Duration,
    pub send_gratuitous: bool,
    pub icmp_fallback: bool,
}

impl From<&ConflictSection> for DetectorConfig {
    fn from(s: &ConflictSection) -> Self {
        Self {
            enabled: s.enabled,
            probe_timeout: Duration::from_millis(s.probe_timeout_ms),
            max_probes: s.max_probes_per_discover,
            strategy: s.probe_strategy,
            parallel_count: s.parallel_probe_count.max(1),
            cache_ttl: Duration::from_secs(s.probe_cache_ttl),
            send_gratuitous: s.send_gratuitous_arp,
            icmp_fallback: s.icmp_fallback,
        }
    }
}

/// What [`ConflictDetector::probe_ip`] concluded about one address.
#[derive(Debug, Clone)]
pub struct ProbeVerdict {
    pub conflict: bool,
    /// where the verdict came from
    pub source: &'static str,
    pub responder_mac: Option<MacAddr>,
}

impl ProbeVerdict {
    fn clear(source: &'static str) -> Self {
        Self {
            conflict: false,
            source,
            responder_mac: None,
        }
    }
}

#[derive(Debug)]
pub struct ConflictDetector {
    cfg: DetectorConfig,
    /// L2 prober for directly attached subnets, None when the link-layer
    /// socket could not be opened
    arp: Option<Prober>,
    /// L3 fallback for relayed subnets
    icmp: Option<Prober>,
    table: ConflictTable,
    cache: ProbeCache,
    bus: EventBus,
    metrics: Metrics,
    local_subnets: Vec<Ipv4Net>,
}

impl ConflictDetector {
    pub fn new(
        cfg: DetectorConfig,
        arp: Option<Prober>,
        icmp: Option<Prober>,
        table: ConflictTable,
        bus: EventBus,
        metrics: Metrics,
        local_subnets: Vec<Ipv4Net>,
    ) -> Self {
        if arp.is_none() {
            // degraded mode: local candidates are assumed clear
            error!("no ARP prober available (missing CAP_NET_RAW?), local subnets degrade to assume-clear");
        }
        let cache = ProbeCache::new(cfg.cache_ttl);
        Self {
            cfg,
            arp,
            icmp,
            table,
            cache,
            bus,
            metrics,
            local_subnets,
        }
    }

    pub fn table(&self) -> &ConflictTable {
        &self.table
    }

    pub fn cache(&self) -> &ProbeCache {
        &self.cache
    }

    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        self.local_subnets.iter().any(|net| net.contains(&ip))
    }

    /// Probe one candidate, cheapest source first: conflict table, probe
    /// cache, then the wire.
    pub async fn probe_ip(&self, ip: Ipv4Addr, subnet: &str) -> ProbeVerdict {
        if !self.cfg.enabled {
            return ProbeVerdict::clear("disabled");
        }
        if self.table.is_conflicted(ip) {
            debug!(%ip, "conflict table hit, skipping probe");
            return ProbeVerdict {
                conflict: true,
                source: "conflict_table",
                responder_mac: None,
            };
        }
        if self.cache.is_clear(ip) {
            self.metrics.probe_cache_hits.inc();
            return ProbeVerdict::clear("cache");
        }

        let (prober, method) = match self.pick_prober(ip) {
            Some(pick) => pick,
            None => {
                warn!(%ip, "no prober available, assuming address is clear");
                return ProbeVerdict::clear("unavailable");
            }
        };

        self.metrics
            .probe_count
            .with_label_values(&[method_label(method)])
            .inc();
        match prober.probe(ip, self.cfg.probe_timeout).await {
            Ok(outcome) if outcome.is_conflict() => {
                let responder_mac = match outcome {
                    probe::ProbeOutcome::Conflict { responder_mac } => responder_mac,
                    _ => None,
                };
                self.record_conflict(ip, method, responder_mac, subnet);
                ProbeVerdict {
                    conflict: true,
                    source: method_label(method),
                    responder_mac,
                }
            }
            Ok(_) => {
                self.cache.mark_clear(ip);
                ProbeVerdict::clear(method_label(method))
            }
            Err(err) => {
                // probe failure is not a conflict; degrade to clear
                warn!(?err, %ip, "probe failed, assuming address is clear");
                ProbeVerdict::clear("error")
            }
        }
    }

    /// Pick the winner from a candidate list.
    ///
    /// Sequential: walk up to `max_probes` candidates in order and take the
    /// first clear one. When every probed candidate conflicted but the
    /// list has more, hand out the next unprobed candidate rather than
    /// failing a client we could still serve. Parallel: launch
    /// `parallel_count` probes under one shared deadline and take the
    /// first clear reply.
    pub async fn probe_and_select(
        self: &Arc<Self>,
        candidates: &[Ipv4Addr],
        subnet: &str,
    ) -> Result<Ipv4Addr, DetectError> {
        if candidates.is_empty() {
            return Err(DetectError::NoCandidates);
        }
        if !self.cfg.enabled {
            return Ok(candidates[0]);
        }
        match self.cfg.strategy {
            ProbeStrategy::Sequential => self.select_sequential(candidates, subnet).await,
            ProbeStrategy::Parallel => self.select_parallel(candidates, subnet).await,
        }
    }

    async fn select_sequential(
        &self,
        candidates: &[Ipv4Addr],
        subnet: &str,
    ) -> Result<Ipv4Addr, DetectError> {
        let probes = self.cfg.max_probes.min(candidates.len());
        for &ip in &candidates[..probes] {
            if !self.probe_ip(ip, subnet).await.conflict {
                return Ok(ip);
            }
        }
        if candidates.len() > probes {
            let ip = candidates[probes];
            warn!(
                %ip,
                probed = probes,
                "all probed candidates conflicted, offering next candidate unprobed"
            );
            return Ok(ip);
        }
        Err(DetectError::AllConflicted { probed: probes })
    }

    async fn select_parallel(
        self: &Arc<Self>,
        candidates: &[Ipv4Addr],
        subnet: &str,
    ) -> Result<Ipv4Addr, DetectError> {
        let n = self.cfg.parallel_count.min(candidates.len());
        let mut set = JoinSet::new();
        for &ip in &candidates[..n] {
            let det = Arc::clone(self);
            let subnet = subnet.to_string();
            set.spawn(async move {
                let verdict = det.probe_ip(ip, &subnet).await;
                (ip, verdict)
            });
        }
        while let Some(res) = set.join_next().await {
            match res {
                Ok((ip, verdict)) if !verdict.conflict => {
                    // winner found; cancel the stragglers
                    set.abort_all();
                    return Ok(ip);
                }
                Ok(_) => {}
                Err(err) => warn!(?err, "parallel probe task failed"),
            }
        }
        Err(DetectError::AllConflicted { probed: n })
    }

    /// A client told us its assigned address is in use.
    pub fn handle_decline(&self, ip: Ipv4Addr, client_mac: MacAddr, subnet: &str) {
        info!(%ip, %client_mac, "client declined address, recording conflict");
        self.cache.invalidate(ip);
        let permanent = self.table.add(ip, ConflictMethod::ClientDecline, None, subnet);
        self.metrics
            .conflict_count
            .with_label_values(&["client_decline"])
            .inc();
        self.metrics
            .conflicts_active
            .set(self.table.active_count() as i64);
        self.publish_conflict(ip, permanent, EventKind::ConflictDecline);
    }

    /// Resolve lapsed holds; called from the GC ticker.
    pub fn cleanup_expired(&self) {
        for rec in self.table.cleanup_expired() {
            debug!(ip = %rec.ip, "conflict hold expired, resolved");
            self.bus
                .publish(Event::conflict(EventKind::ConflictResolved, rec));
        }
        self.metrics
            .conflicts_active
            .set(self.table.active_count() as i64);
    }

    /// Post-ACK announcement so neighbor caches learn the new owner.
    /// Local subnets only; best effort.
    pub fn send_gratuitous_arp_for_lease(&self, ip: Ipv4Addr, client_mac: MacAddr) {
        if !self.cfg.send_gratuitous || !self.is_local(ip) {
            return;
        }
        if let Some(Prober::Arp(arp)) = &self.arp {
            if let Err(err) = arp.send_gratuitous(ip, client_mac) {
                warn!(?err, %ip, "gratuitous ARP failed");
            }
        }
    }

    fn pick_prober(&self, ip: Ipv4Addr) -> Option<(&Prober, ConflictMethod)> {
        if self.is_local(ip) {
            if let Some(arp) = &self.arp {
                return Some((arp, ConflictMethod::ArpProbe));
            }
        }
        if self.cfg.icmp_fallback {
            if let Some(icmp) = &self.icmp {
                return Some((icmp, ConflictMethod::IcmpProbe));
            }
        }
        None
    }

    fn record_conflict(
        &self,
        ip: Ipv4Addr,
        method: ConflictMethod,
        responder_mac: Option<MacAddr>,
        subnet: &str,
    ) {
        info!(%ip, %method, ?responder_mac, "address conflict detected");
        let permanent = self
            .table
            .add(ip, method, responder_mac.map(|m| m.to_string()), subnet);
        self.cache.mark_conflict(ip);
        self.metrics
            .conflict_count
            .with_label_values(&[method_label(method)])
            .inc();
        self.metrics
            .conflicts_active
            .set(self.table.active_count() as i64);
        self.publish_conflict(ip, permanent, EventKind::ConflictDetected);
    }

    fn publish_conflict(&self, ip: Ipv4Addr, permanent: bool, kind: EventKind) {
        if let Some(rec) = self.table.get(ip) {
            let kind = if permanent {
                EventKind::ConflictPermanent
            } else {
                kind
            };
            self.bus.publish(Event::conflict(kind, rec));
        }
    }
}

fn method_label(method: ConflictMethod) -> &'static str {
    match method {
        ConflictMethod::ArpProbe => "arp_probe",
        ConflictMethod::IcmpProbe => "icmp_probe",
        ConflictMethod::ClientDecline => "client_decline",
    }
}
