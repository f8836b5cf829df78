//! Persistent conflict table. In-memory map for the hot path, with every
//! mutation written through to the store's `conflicts` table inside the
//! same critical section.
use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};

use lease_store::{unix_now, ConflictMethod, ConflictRecord, LeaseStore};
use parking_lot::Mutex;
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct ConflictTable {
    inner: Mutex<HashMap<Ipv4Addr, ConflictRecord>>,
    store: Arc<LeaseStore>,
    /// seconds a fresh conflict keeps its IP out of rotation
    hold_time: u64,
    /// probe_count at which the record becomes permanent
    max_conflict_count: u32,
}

impl ConflictTable {
    /// Reload the table from the store.
    pub fn load(
        store: Arc<LeaseStore>,
        hold_time: u64,
        max_conflict_count: u32,
    ) -> Result<Self, lease_store::StoreError> {
        let mut inner = HashMap::new();
        for rec in store.all_conflicts()? {
            inner.insert(rec.ip, rec);
        }
        debug!(records = inner.len(), "conflict table loaded");
        Ok(Self {
            inner: Mutex::new(inner),
            store,
            hold_time,
            max_conflict_count,
        })
    }

    /// Record a conflict observation. An existing record gets its count
    /// bumped, its hold refreshed and its resolved flag cleared; hitting
    /// `max_conflict_count` flips `permanent`, which only [`clear`]
    /// removes. Returns whether the record is now permanent.
    ///
    /// [`clear`]: ConflictTable::clear
    pub fn add(
        &self,
        ip: Ipv4Addr,
        method: ConflictMethod,
        responder_mac: Option<String>,
        subnet: &str,
    ) -> bool {
        let now = unix_now();
        let observed_mac = responder_mac.clone();
        let mut inner = self.inner.lock();
        let rec = inner
            .entry(ip)
            .and_modify(|rec| {
                rec.probe_count = rec.probe_count.saturating_add(1);
                rec.detected_at = now;
                rec.method = method;
                if observed_mac.is_some() {
                    rec.responder_mac = observed_mac.clone();
                }
                rec.hold_until = now + self.hold_time;
                rec.resolved = false;
                rec.resolved_at = None;
            })
            .or_insert_with(|| {
                ConflictRecord::new(
                    ip,
                    method,
                    responder_mac,
                    subnet.to_string(),
                    now + self.hold_time,
                )
            });
        if rec.probe_count >= self.max_conflict_count && !rec.permanent {
            rec.permanent = true;
            info!(%ip, count = rec.probe_count, "conflict flagged permanent");
        }
        let permanent = rec.permanent;
        self.persist(rec);
        permanent
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<ConflictRecord> {
        self.inner.lock().get(&ip).cloned()
    }

    /// record exists, is unresolved, and is permanent or inside its hold
    /// window
    pub fn is_conflicted(&self, ip: Ipv4Addr) -> bool {
        self.inner
            .lock()
            .get(&ip)
            .map(|rec| rec.is_active(unix_now()))
            .unwrap_or(false)
    }

    /// Mark resolved without deleting; a later `add` reactivates it with
    /// its probe count intact.
    pub fn resolve(&self, ip: Ipv4Addr) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(&ip) {
            Some(rec) => {
                rec.resolved = true;
                rec.resolved_at = Some(unix_now());
                self.persist(rec);
                true
            }
            None => false,
        }
    }

    /// Hard removal (admin action); forgets permanence and probe counts.
    pub fn clear(&self, ip: Ipv4Addr) -> bool {
        let removed = self.inner.lock().remove(&ip).is_some();
        if removed {
            if let Err(err) = self.store.delete_conflict(ip) {
                error!(?err, %ip, "failed to delete conflict record");
            }
        }
        removed
    }

    /// Resolve every non-permanent record whose hold window lapsed.
    /// Returns the records resolved this pass.
    pub fn cleanup_expired(&self) -> Vec<ConflictRecord> {
        let now = unix_now();
        let mut resolved = Vec::new();
        let mut inner = self.inner.lock();
        for rec in inner.values_mut() {
            if !rec.resolved && !rec.permanent && now > rec.hold_until {
                rec.resolved = true;
                rec.resolved_at = Some(now);
                self.persist(rec);
                resolved.push(rec.clone());
            }
        }
        resolved
    }

    pub fn all_active(&self) -> Vec<ConflictRecord> {
        let now = unix_now();
        self.inner
            .lock()
            .values()
            .filter(|rec| rec.is_active(now))
            .cloned()
            .collect()
    }

    pub fn all_resolved(&self) -> Vec<ConflictRecord> {
        self.inner
            .lock()
            .values()
            .filter(|rec| rec.resolved)
            .cloned()
            .collect()
    }

    /// every record, for HA export
    pub fn records(&self) -> Vec<ConflictRecord> {
        self.inner.lock().values().cloned().collect()
    }

    /// Apply a record replicated from the peer verbatim.
    pub fn apply_remote(&self, rec: ConflictRecord) {
        let mut inner = self.inner.lock();
        self.persist(&rec);
        inner.insert(rec.ip, rec);
    }

    pub fn active_count(&self) -> usize {
        let now = unix_now();
        self.inner
            .lock()
            .values()
            .filter(|rec| rec.is_active(now))
            .count()
    }

    fn persist(&self, rec: &ConflictRecord) {
        // a store failure degrades to in-memory state, it never blocks the
        // DHCP path
        if let Err(err) = self.store.put_conflict(rec) {
            error!(?err, ip = %rec.ip, "failed to persist conflict record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table(hold: u64, max: u32) -> (ConflictTable, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LeaseStore::open(dir.path().join("t.redb")).unwrap());
        (ConflictTable::load(store, hold, max).unwrap(), dir)
    }

    #[test]
    fn add_and_hold() {
        let (t, _dir) = table(300, 3);
        let ip = Ipv4Addr::from([10, 0, 0, 50]);
        assert!(!t.add(ip, ConflictMethod::ArpProbe, Some("06:aa:bb:cc:dd:ee".into()), "10.0.0.0/24"));
        assert!(t.is_conflicted(ip));
        let recs = t.records();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].probe_count, 1);
        assert_eq!(recs[0].responder_mac.as_deref(), Some("06:aa:bb:cc:dd:ee"));
    }

    #[test]
    fn permanent_after_max_count() {
        let (t, _dir) = table(300, 3);
        let ip = Ipv4Addr::from([10, 0, 0, 50]);
        assert!(!t.add(ip, ConflictMethod::IcmpProbe, None, "10.0.0.0/24"));
        assert!(!t.add(ip, ConflictMethod::IcmpProbe, None, "10.0.0.0/24"));
        // third strike
        assert!(t.add(ip, ConflictMethod::IcmpProbe, None, "10.0.0.0/24"));
        assert!(t.is_conflicted(ip));
        // permanent survives cleanup
        assert!(t.cleanup_expired().is_empty());
        assert!(t.is_conflicted(ip));
        // and only clear removes it
        assert!(t.clear(ip));
        assert!(!t.is_conflicted(ip));
    }

    #[test]
    fn resolve_then_readd() {
        let (t, _dir) = table(300, 5);
        let ip = Ipv4Addr::from([10, 0, 0, 51]);
        t.add(ip, ConflictMethod::ClientDecline, None, "10.0.0.0/24");
        assert!(t.resolve(ip));
        assert!(!t.is_conflicted(ip));
        assert_eq!(t.all_resolved().len(), 1);
        // re-add reactivates with the count continuing
        t.add(ip, ConflictMethod::ClientDecline, None, "10.0.0.0/24");
        assert!(t.is_conflicted(ip));
        assert_eq!(t.records()[0].probe_count, 2);
    }

    #[test]
    fn expired_hold_resolves() {
        let (t, _dir) = table(0, 10);
        let ip = Ipv4Addr::from([10, 0, 0, 52]);
        t.add(ip, ConflictMethod::ArpProbe, None, "10.0.0.0/24");
        // hold_time 0: already outside the window on the next second
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let resolved = t.cleanup_expired();
        assert_eq!(resolved.len(), 1);
        assert!(!t.is_conflicted(ip));
    }

    #[test]
    fn reload_from_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.redb");
        {
            let store = Arc::new(LeaseStore::open(&path).unwrap());
            let t = ConflictTable::load(store, 300, 3).unwrap();
            t.add([10, 0, 0, 53].into(), ConflictMethod::ArpProbe, None, "10.0.0.0/24");
        }
        let store = Arc::new(LeaseStore::open(&path).unwrap());
        let t = ConflictTable::load(store, 300, 3).unwrap();
        assert!(t.is_conflicted([10, 0, 0, 53].into()));
    }
}
