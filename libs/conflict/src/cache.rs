//! TTL cache of recent probe results, so a burst of DISCOVERs does not
//! probe the same address over and over.
use std::{
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    conflict: bool,
    at: Instant,
}

/// Lock-free concurrent map with per-entry eviction on access.
#[derive(Debug)]
pub struct ProbeCache {
    entries: DashMap<Ipv4Addr, CacheEntry>,
    ttl: Duration,
}

impl ProbeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn mark_clear(&self, ip: Ipv4Addr) {
        self.entries.insert(
            ip,
            CacheEntry {
                conflict: false,
                at: Instant::now(),
            },
        );
    }

    pub fn mark_conflict(&self, ip: Ipv4Addr) {
        self.entries.insert(
            ip,
            CacheEntry {
                conflict: true,
                at: Instant::now(),
            },
        );
    }

    pub fn is_clear(&self, ip: Ipv4Addr) -> bool {
        self.get(ip).map(|conflict| !conflict).unwrap_or(false)
    }

    pub fn is_conflict(&self, ip: Ipv4Addr) -> bool {
        self.get(ip).unwrap_or(false)
    }

    /// drop any entry, fresh or not (used on DHCPDECLINE)
    pub fn invalidate(&self, ip: Ipv4Addr) {
        self.entries.remove(&ip);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, ip: Ipv4Addr) -> Option<bool> {
        // evict on read when expired
        let expired = match self.entries.get(&ip) {
            Some(entry) if entry.at.elapsed() <= self.ttl => return Some(entry.conflict),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(&ip);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_read() {
        let cache = ProbeCache::new(Duration::from_secs(60));
        let ip = Ipv4Addr::from([10, 0, 0, 1]);
        assert!(!cache.is_clear(ip));
        cache.mark_clear(ip);
        assert!(cache.is_clear(ip));
        assert!(!cache.is_conflict(ip));
        cache.mark_conflict(ip);
        assert!(cache.is_conflict(ip));
        assert!(!cache.is_clear(ip));
    }

    #[test]
    fn expiry_evicts_on_read() {
        let cache = ProbeCache::new(Duration::from_millis(10));
        let ip = Ipv4Addr::from([10, 0, 0, 2]);
        cache.mark_clear(ip);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.is_clear(ip));
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_removes() {
        let cache = ProbeCache::new(Duration::from_secs(60));
        let ip = Ipv4Addr::from([10, 0, 0, 3]);
        cache.mark_conflict(ip);
        cache.invalidate(ip);
        assert!(!cache.is_conflict(ip));
        assert_eq!(cache.len(), 0);
    }
}
