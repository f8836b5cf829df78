//! # lease manager
//!
//! The authoritative binding store and its lifecycle operations. Every
//! mutation is serialized per client identity through a sharded lock, so a
//! DISCOVER and REQUEST from the same client can never race; across
//! clients everything runs concurrently with pool bitmaps and the durable
//! store providing their own consistency.
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use athena_core::{Event, EventBus, EventKind, Metrics};
use chrono::{DateTime, SecondsFormat, Utc};
use conflict::{ConflictDetector, DetectError};
use ha::LeaseDelta;
use lease_store::{unix_now, Lease, LeaseState, LeaseStore, RelayInfo, StoreError};
use pnet::util::MacAddr;
use pool::MatchCriteria;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::subnet::{find_subnet, Subnet, SubnetPool};

fn rfc3339(unix: u64) -> String {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH + Duration::from_secs(unix))
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

const LOCK_SHARDS: usize = 256;
/// extra candidates fetched beyond max_probes so the sequential overflow
/// rule always has somewhere to go
const CANDIDATE_SPARE: usize = 2;
/// attempts to claim a probed winner before giving up (another task can
/// steal a candidate between probe and claim)
const MAX_CLAIM_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("no pool matches the request criteria")]
    NoPoolMatch,
    #[error("pool {0} has no free addresses")]
    PoolExhausted(String),
    #[error("every probed candidate is in conflict")]
    AllCandidatesConflicted,
    #[error("request carries no requested IP")]
    NoRequestedIp,
    #[error("no binding for this client")]
    NoBinding,
    #[error("client requested {requested}, bound to {bound}")]
    WrongAddress {
        requested: Ipv4Addr,
        bound: Ipv4Addr,
    },
    #[error("binding for {0} belongs to a different client")]
    ClientMismatch(Ipv4Addr),
    #[error("offer for {0} lapsed before the client requested it")]
    OfferLapsed(Ipv4Addr),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What the handler extracted from one DHCP message.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// option 61 bytes, when the client sent one
    pub client_id: Option<Vec<u8>>,
    pub mac: MacAddr,
    pub requested_ip: Option<Ipv4Addr>,
    pub requested_lease: Option<Duration>,
    pub hostname: Option<String>,
    pub fqdn: Option<String>,
    pub criteria: MatchCriteria,
    pub relay: Option<RelayInfo>,
}

impl Default for ClientRequest {
    fn default() -> Self {
        Self {
            client_id: None,
            mac: MacAddr::zero(),
            requested_ip: None,
            requested_lease: None,
            hostname: None,
            fqdn: None,
            criteria: MatchCriteria::default(),
            relay: None,
        }
    }
}

impl ClientRequest {
    /// the binding key: option 61 else MAC bytes
    pub fn key(&self) -> Vec<u8> {
        match &self.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => lease_store::mac_bytes(self.mac),
        }
    }
}

/// reload-safe knobs from the `hooks` section
#[derive(Debug, Clone, Copy)]
pub struct LeaseTimers {
    /// seconds an OFFER stays reserved
    pub offer_reservation: u64,
    /// seconds a lapsed client keeps dibs on its old address
    pub sticky_window: u64,
}

pub struct LeaseManager {
    store: Arc<LeaseStore>,
    detector: Arc<ConflictDetector>,
    bus: EventBus,
    metrics: Metrics,
    subnets: ArcSwap<Vec<Arc<Subnet>>>,
    timers: ArcSwap<LeaseTimers>,
    /// max_probes + spare; how many candidates each DISCOVER fans out
    candidate_count: usize,
    locks: Vec<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager").finish()
    }
}

impl LeaseManager {
    pub fn new(
        store: Arc<LeaseStore>,
        detector: Arc<ConflictDetector>,
        bus: EventBus,
        metrics: Metrics,
        timers: LeaseTimers,
        max_probes: usize,
    ) -> Self {
        Self {
            store,
            detector,
            bus,
            metrics,
            subnets: ArcSwap::from_pointee(Vec::new()),
            timers: ArcSwap::from_pointee(timers),
            candidate_count: max_probes + CANDIDATE_SPARE,
            locks: (0..LOCK_SHARDS).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        &self.store
    }

    pub fn detector(&self) -> &Arc<ConflictDetector> {
        &self.detector
    }

    pub fn subnets(&self) -> Arc<Vec<Arc<Subnet>>> {
        self.subnets.load_full()
    }

    pub fn timers(&self) -> LeaseTimers {
        **self.timers.load()
    }

    /// live-reload the hooks knobs
    pub fn update_config(&self, timers: LeaseTimers) {
        self.timers.store(Arc::new(timers));
    }

    /// Swap in freshly built subnets and reconcile pool bitmaps with the
    /// store: every bound lease claims its bit; leases whose IP no pool
    /// covers any more are logged and left to expire naturally.
    pub fn update_pools(&self, subnets: Vec<Arc<Subnet>>) -> Result<(), LeaseError> {
        for lease in self.store.all()? {
            if !lease.state.is_bound() {
                continue;
            }
            let claimed = find_subnet(&subnets, lease.ip)
                .and_then(|s| s.pool_containing(lease.ip))
                .map(|p| {
                    // may already be set when ranges overlap with the old
                    // config generation
                    p.pool().allocate_specific(lease.ip) || p.pool().is_allocated(lease.ip)
                })
                .unwrap_or(false);
            if !claimed {
                warn!(ip = %lease.ip, state = %lease.state, "lease no longer covered by any pool, leaving until expiry");
            }
        }
        for subnet in &subnets {
            for sp in subnet.pools() {
                sp.pool().init_metrics(&self.metrics.pool_gauges);
            }
        }
        self.subnets.store(Arc::new(subnets));
        Ok(())
    }

    async fn lock(&self, key: &[u8]) -> tokio::sync::MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = (hasher.finish() as usize) % LOCK_SHARDS;
        self.locks[shard].lock().await
    }

    /// DISCOVER. Prefer the client's previous address when it is still
    /// sane; otherwise select a pool, probe candidates, and reserve the
    /// winner for the offer window.
    pub async fn offer(
        &self,
        subnet: &Arc<Subnet>,
        req: &ClientRequest,
    ) -> Result<(Lease, Arc<SubnetPool>), LeaseError> {
        let key = req.key();
        let _guard = self.lock(&key).await;
        let now = unix_now();
        let timers = self.timers();

        let prev = self.store.get_by_client(&key)?;
        if let Some(prev) = &prev {
            if let Some(sp) = self.reissue_candidate(subnet, prev, now, &timers) {
                let claimed = prev.state.is_bound() || sp.pool().allocate_specific(prev.ip);
                if claimed {
                    debug!(ip = %prev.ip, "reissuing client's previous address");
                    let lease = self.offered_lease(prev.ip, subnet, &sp, req, now, &timers);
                    self.store.put(&lease)?;
                    self.bus.publish(Event::lease(EventKind::LeaseOffer, lease.clone()));
                    return Ok((lease, sp));
                }
            }
        }

        let sp = subnet
            .select_pool(&req.criteria)
            .ok_or(LeaseError::NoPoolMatch)?
            .clone();
        let cidr = subnet.cidr();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let candidates = sp.pool().allocate_n(self.candidate_count);
            if candidates.is_empty() {
                return Err(LeaseError::PoolExhausted(sp.name().to_string()));
            }
            let ip = match self.detector.probe_and_select(&candidates, &cidr).await {
                Ok(ip) => ip,
                Err(DetectError::NoCandidates) => {
                    return Err(LeaseError::PoolExhausted(sp.name().to_string()))
                }
                Err(DetectError::AllConflicted { .. }) => {
                    return Err(LeaseError::AllCandidatesConflicted)
                }
            };
            if !sp.pool().allocate_specific(ip) {
                // another task grabbed it between probe and claim
                if attempts >= MAX_CLAIM_ATTEMPTS {
                    return Err(LeaseError::PoolExhausted(sp.name().to_string()));
                }
                debug!(%ip, attempts, "candidate taken concurrently, retrying");
                continue;
            }
            let lease = self.offered_lease(ip, subnet, &sp, req, now, &timers);
            if let Some(prev) = &prev {
                if prev.state.is_bound() && prev.ip != lease.ip {
                    self.retire_previous(prev);
                }
            }
            self.store.put(&lease)?;
            info!(ip = %lease.ip, mac = %lease.mac, pool = %sp.name(), "offering address");
            self.bus.publish(Event::lease(EventKind::LeaseOffer, lease.clone()));
            return Ok((lease, sp));
        }
    }

    fn reissue_candidate(
        &self,
        subnet: &Arc<Subnet>,
        prev: &Lease,
        now: u64,
        timers: &LeaseTimers,
    ) -> Option<Arc<SubnetPool>> {
        if prev.state == LeaseState::Declined {
            return None;
        }
        if !subnet.network().contains(&prev.ip) {
            return None;
        }
        if self.detector.table().is_conflicted(prev.ip) {
            return None;
        }
        let still_current = prev.state.is_bound() && now <= prev.expiry;
        let within_sticky = now <= prev.expiry.saturating_add(timers.sticky_window);
        if !(still_current || within_sticky) {
            return None;
        }
        subnet.pool_containing(prev.ip).cloned()
    }

    fn offered_lease(
        &self,
        ip: Ipv4Addr,
        subnet: &Arc<Subnet>,
        sp: &Arc<SubnetPool>,
        req: &ClientRequest,
        now: u64,
        timers: &LeaseTimers,
    ) -> Lease {
        Lease {
            ip,
            mac: req.mac,
            client_id: req.client_id.clone(),
            hostname: req.hostname.clone(),
            fqdn: req.fqdn.clone(),
            subnet: subnet.cidr(),
            pool: sp.name().to_string(),
            start: now,
            expiry: now + timers.offer_reservation,
            state: LeaseState::Offered,
            relay: req.relay.clone(),
            options: Default::default(),
        }
    }

    /// REQUEST in SELECTING or INIT-REBOOT. Promote the offered binding to
    /// active when the requested address matches what we offered.
    pub async fn ack(
        &self,
        subnet: &Arc<Subnet>,
        req: &ClientRequest,
    ) -> Result<(Lease, Arc<SubnetPool>), LeaseError> {
        let key = req.key();
        let _guard = self.lock(&key).await;
        let requested = req.requested_ip.ok_or(LeaseError::NoRequestedIp)?;
        let mut lease = self.store.get_by_client(&key)?.ok_or(LeaseError::NoBinding)?;
        if lease.ip != requested {
            return Err(LeaseError::WrongAddress {
                requested,
                bound: lease.ip,
            });
        }
        let sp = subnet
            .pool_containing(requested)
            .ok_or(LeaseError::NoPoolMatch)?
            .clone();
        let now = unix_now();
        if !lease.state.is_bound() {
            // the offer was reclaimed; only revive it if the bit is still
            // free
            if !sp.pool().allocate_specific(requested) {
                return Err(LeaseError::OfferLapsed(requested));
            }
        }
        let (t, ..) = sp.lease_time().determine_lease(req.requested_lease);
        lease.state = LeaseState::Active;
        lease.start = now;
        lease.expiry = now + t.as_secs();
        lease.hostname = req.hostname.clone().or(lease.hostname);
        lease.fqdn = req.fqdn.clone().or(lease.fqdn);
        lease.relay = req.relay.clone().or(lease.relay);
        self.store.put(&lease)?;
        info!(
            ip = %lease.ip,
            mac = %lease.mac,
            expires_at = %rfc3339(lease.expiry),
            "lease active"
        );
        self.bus.publish(Event::lease(EventKind::LeaseAck, lease.clone()));
        Ok((lease, sp))
    }

    /// REQUEST in RENEWING/REBINDING: extend the active lease.
    pub async fn renew(
        &self,
        subnet: &Arc<Subnet>,
        req: &ClientRequest,
    ) -> Result<(Lease, Arc<SubnetPool>), LeaseError> {
        let key = req.key();
        let _guard = self.lock(&key).await;
        let requested = req.requested_ip.ok_or(LeaseError::NoRequestedIp)?;
        let mut lease = self.store.get_by_client(&key)?.ok_or(LeaseError::NoBinding)?;
        if lease.state != LeaseState::Active || lease.ip != requested {
            return Err(LeaseError::WrongAddress {
                requested,
                bound: lease.ip,
            });
        }
        let sp = subnet
            .pool_containing(requested)
            .ok_or(LeaseError::NoPoolMatch)?
            .clone();
        let (t, ..) = sp.lease_time().determine_lease(req.requested_lease);
        let now = unix_now();
        lease.expiry = now + t.as_secs();
        self.store.put(&lease)?;
        debug!(ip = %lease.ip, expires_at = %rfc3339(lease.expiry), "lease renewed");
        self.bus.publish(Event::lease(EventKind::LeaseRenew, lease.clone()));
        Ok((lease, sp))
    }

    /// RELEASE. Free the address when the client owns the binding.
    pub async fn release(&self, ip: Ipv4Addr, key: &[u8]) -> Result<(), LeaseError> {
        let _guard = self.lock(key).await;
        let mut lease = self.store.get_by_ip(ip)?.ok_or(LeaseError::NoBinding)?;
        if lease.client_key() != key {
            return Err(LeaseError::ClientMismatch(ip));
        }
        self.free_in_pool(&lease);
        lease.state = LeaseState::Released;
        self.store.put(&lease)?;
        info!(%ip, "lease released");
        self.bus.publish(Event::lease(EventKind::LeaseRelease, lease));
        Ok(())
    }

    /// DECLINE. The client saw the address in use: record the conflict and
    /// retire the binding.
    pub async fn decline(
        &self,
        subnet: &Arc<Subnet>,
        ip: Ipv4Addr,
        req: &ClientRequest,
    ) -> Result<(), LeaseError> {
        let key = req.key();
        let _guard = self.lock(&key).await;
        let mut lease = self.store.get_by_ip(ip)?.ok_or(LeaseError::NoBinding)?;
        if lease.client_key() != key {
            return Err(LeaseError::ClientMismatch(ip));
        }
        self.detector.handle_decline(ip, req.mac, &subnet.cidr());
        self.free_in_pool(&lease);
        lease.state = LeaseState::Declined;
        self.store.put(&lease)?;
        self.bus.publish(Event::lease(EventKind::LeaseDecline, lease));
        Ok(())
    }

    /// Periodic reclamation: lapsed offers and expired actives go back to
    /// their pools.
    pub async fn gc(&self, now: u64) -> Result<usize, LeaseError> {
        let mut reclaimed = 0;
        for lease in self.store.all()? {
            if !lease.state.is_bound() || now <= lease.expiry {
                continue;
            }
            let key = lease.client_key();
            let _guard = self.lock(&key).await;
            // re-read under the lock; the client may have renewed since
            let Some(mut current) = self.store.get_by_ip(lease.ip)? else {
                continue;
            };
            if !current.state.is_bound() || now <= current.expiry {
                continue;
            }
            let was_active = current.state == LeaseState::Active;
            self.free_in_pool(&current);
            current.state = LeaseState::Expired;
            self.store.put(&current)?;
            reclaimed += 1;
            debug!(ip = %current.ip, was_active, "lease expired");
            if was_active {
                self.bus
                    .publish(Event::lease(EventKind::LeaseExpire, current));
            }
        }
        Ok(reclaimed)
    }

    /// A client is moving to a new address. `store.put` expires the old
    /// row inside the same write txn; the pool bit and the standby's
    /// replica need the matching transition too.
    fn retire_previous(&self, prev: &Lease) {
        debug!(ip = %prev.ip, state = %prev.state, "retiring client's previous binding");
        self.free_in_pool(prev);
        let mut stale = prev.clone();
        stale.state = LeaseState::Expired;
        self.bus.publish(Event::lease(EventKind::LeaseExpire, stale));
    }

    fn free_in_pool(&self, lease: &Lease) {
        if !lease.state.is_bound() {
            return;
        }
        let subnets = self.subnets.load();
        match find_subnet(&subnets, lease.ip).and_then(|s| s.pool_containing(lease.ip)) {
            Some(sp) => {
                sp.pool().release(lease.ip);
            }
            None => debug!(ip = %lease.ip, "freed lease not covered by any pool"),
        }
    }

    /// Apply one replicated lease change idempotently. Last writer wins by
    /// `(expiry, start)`; a stale update is a no-op.
    pub async fn apply_remote(&self, delta: LeaseDelta) -> Result<bool, LeaseError> {
        match delta {
            LeaseDelta::Put(new) => {
                let key = new.client_key();
                let _guard = self.lock(&key).await;
                if let Some(old) = self.store.get_by_ip(new.ip)? {
                    if (old.expiry, old.start) > (new.expiry, new.start) {
                        debug!(ip = %new.ip, "stale replicated lease ignored");
                        return Ok(false);
                    }
                    if old == new {
                        return Ok(false);
                    }
                    if old.state.is_bound() && !new.state.is_bound() {
                        self.free_in_pool(&old);
                    }
                }
                if new.state.is_bound() {
                    let subnets = self.subnets.load();
                    if let Some(sp) =
                        find_subnet(&subnets, new.ip).and_then(|s| s.pool_containing(new.ip))
                    {
                        sp.pool().allocate_specific(new.ip);
                    }
                }
                self.store.put(&new)?;
                Ok(true)
            }
            LeaseDelta::Delete(ip) => {
                if let Some(old) = self.store.get_by_ip(ip)? {
                    let key = old.client_key();
                    let _guard = self.lock(&key).await;
                    self.free_in_pool(&old);
                    self.store.delete(ip)?;
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }
}
