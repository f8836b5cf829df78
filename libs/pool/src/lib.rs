//! # pool
//!
//! Bitmap-backed address pools. A [`Pool`] owns a contiguous inclusive
//! range of IPv4 addresses inside a network and tracks allocation with one
//! bit per address, so grabbing the next free IP is a word scan and
//! everything else is O(1).
//!
//! Pools optionally carry match criteria (glob patterns over circuit id,
//! remote id, vendor class, user class) used by [`select_pool`] to steer
//! clients into a specific pool before falling back to the default.
use std::{collections::HashSet, net::Ipv4Addr};

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use prometheus::{GaugeVec, IntGaugeVec, Opts, Registry};
use thiserror::Error;
use tracing::debug;

mod matcher;

pub use matcher::{MatchCriteria, MatchPatterns};

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("range start {start} is after range end {end}")]
    StartAfterEnd { start: Ipv4Addr, end: Ipv4Addr },
    #[error("address {ip} is outside network {network}")]
    OutsideNetwork { ip: Ipv4Addr, network: Ipv4Net },
    #[error("pool has no free addresses")]
    Exhausted,
}

/// Gauges shared by every pool, labeled by pool name. Registered once at
/// startup and handed to [`Pool::init_metrics`].
#[derive(Clone)]
pub struct PoolGauges {
    size: IntGaugeVec,
    allocated: IntGaugeVec,
    utilization: GaugeVec,
}

impl std::fmt::Debug for PoolGauges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGauges").finish()
    }
}

impl PoolGauges {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let size = IntGaugeVec::new(
            Opts::new("pool_size", "total addresses in pool"),
            &["pool"],
        )?;
        let allocated = IntGaugeVec::new(
            Opts::new("pool_allocated", "allocated addresses in pool"),
            &["pool"],
        )?;
        let utilization = GaugeVec::new(
            Opts::new("pool_utilization", "allocated / size per pool"),
            &["pool"],
        )?;
        registry.register(Box::new(size.clone()))?;
        registry.register(Box::new(allocated.clone()))?;
        registry.register(Box::new(utilization.clone()))?;
        Ok(Self {
            size,
            allocated,
            utilization,
        })
    }
}

struct Bits {
    words: Vec<u64>,
    allocated: usize,
}

impl Bits {
    fn is_set(&self, idx: usize) -> bool {
        self.words[idx / WORD_BITS] & (1u64 << (idx % WORD_BITS)) != 0
    }
    fn set(&mut self, idx: usize) {
        self.words[idx / WORD_BITS] |= 1u64 << (idx % WORD_BITS);
    }
    fn clear(&mut self, idx: usize) {
        self.words[idx / WORD_BITS] &= !(1u64 << (idx % WORD_BITS));
    }
}

/// A contiguous inclusive range of IPv4 addresses with a packed allocation
/// bitmap. All mutation happens under a pool-local mutex; reads of the
/// static fields (name, range, network) are lock-free.
pub struct Pool {
    name: String,
    start: u32,
    end: u32,
    network: Ipv4Net,
    size: usize,
    exclusions: HashSet<Ipv4Addr>,
    patterns: MatchPatterns,
    bits: Mutex<Bits>,
    gauges: Mutex<Option<PoolGauges>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("start", &Ipv4Addr::from(self.start))
            .field("end", &Ipv4Addr::from(self.end))
            .field("network", &self.network)
            .field("size", &self.size)
            .field("allocated", &self.allocated())
            .finish()
    }
}

impl Pool {
    /// Build a pool over `[start, end]`. Both ends must sit inside
    /// `network`. Excluded addresses are pre-marked allocated so they are
    /// never handed out.
    pub fn new(
        name: impl Into<String>,
        start: Ipv4Addr,
        end: Ipv4Addr,
        network: Ipv4Net,
        exclusions: HashSet<Ipv4Addr>,
        patterns: MatchPatterns,
    ) -> Result<Self, PoolError> {
        let (s, e) = (u32::from(start), u32::from(end));
        if s > e {
            return Err(PoolError::StartAfterEnd { start, end });
        }
        if !network.contains(&start) {
            return Err(PoolError::OutsideNetwork { ip: start, network });
        }
        if !network.contains(&end) {
            return Err(PoolError::OutsideNetwork { ip: end, network });
        }
        let size = (e - s + 1) as usize;
        let words = vec![0u64; size.div_ceil(WORD_BITS)];
        let mut bits = Bits {
            words,
            allocated: 0,
        };
        // mask off the tail of the last word so the scan never yields an
        // index past the range
        for idx in size..bits.words.len() * WORD_BITS {
            bits.set(idx);
        }
        for ip in &exclusions {
            let v = u32::from(*ip);
            if (s..=e).contains(&v) {
                let idx = (v - s) as usize;
                if !bits.is_set(idx) {
                    bits.set(idx);
                    bits.allocated += 1;
                }
            }
        }
        Ok(Self {
            name: name.into(),
            start: s,
            end: e,
            network,
            size,
            exclusions,
            patterns,
            bits: Mutex::new(bits),
            gauges: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn range(&self) -> (Ipv4Addr, Ipv4Addr) {
        (Ipv4Addr::from(self.start), Ipv4Addr::from(self.end))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn patterns(&self) -> &MatchPatterns {
        &self.patterns
    }

    /// whether this pool carries at least one match pattern
    pub fn is_specific(&self) -> bool {
        self.patterns.is_specific()
    }

    fn index(&self, ip: Ipv4Addr) -> Option<usize> {
        let v = u32::from(ip);
        (self.start..=self.end)
            .contains(&v)
            .then(|| (v - self.start) as usize)
    }

    /// Grab the first free address. Scans whole words, so cost is
    /// proportional to `size / 64` in the worst case and constant while
    /// the pool is sparsely used.
    pub fn allocate(&self) -> Option<Ipv4Addr> {
        let mut bits = self.bits.lock();
        for (w, word) in bits.words.iter().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                let idx = w * WORD_BITS + bit;
                bits.set(idx);
                bits.allocated += 1;
                let ip = Ipv4Addr::from(self.start + idx as u32);
                self.publish(&bits);
                return Some(ip);
            }
        }
        None
    }

    /// Mark one specific address allocated. Returns false when the address
    /// is outside the range or already taken.
    pub fn allocate_specific(&self, ip: Ipv4Addr) -> bool {
        let Some(idx) = self.index(ip) else {
            return false;
        };
        let mut bits = self.bits.lock();
        if bits.is_set(idx) {
            return false;
        }
        bits.set(idx);
        bits.allocated += 1;
        self.publish(&bits);
        true
    }

    /// Return up to `n` currently-free addresses without marking them.
    /// Callers probe these and then claim the winner with
    /// [`allocate_specific`].
    ///
    /// [`allocate_specific`]: Pool::allocate_specific
    pub fn allocate_n(&self, n: usize) -> Vec<Ipv4Addr> {
        let bits = self.bits.lock();
        let mut out = Vec::with_capacity(n.min(self.size));
        'scan: for (w, word) in bits.words.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let mut free = !*word;
            while free != 0 {
                let bit = free.trailing_zeros() as usize;
                free &= free - 1;
                let idx = w * WORD_BITS + bit;
                out.push(Ipv4Addr::from(self.start + idx as u32));
                if out.len() == n {
                    break 'scan;
                }
            }
        }
        out
    }

    /// Free a previously allocated address. Excluded addresses stay
    /// allocated forever.
    pub fn release(&self, ip: Ipv4Addr) -> bool {
        if self.exclusions.contains(&ip) {
            return false;
        }
        let Some(idx) = self.index(ip) else {
            return false;
        };
        let mut bits = self.bits.lock();
        if !bits.is_set(idx) {
            return false;
        }
        bits.clear(idx);
        bits.allocated -= 1;
        self.publish(&bits);
        true
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.index(ip).is_some()
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        match self.index(ip) {
            Some(idx) => self.bits.lock().is_set(idx),
            None => false,
        }
    }

    pub fn allocated(&self) -> usize {
        self.bits.lock().allocated
    }

    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.allocated() as f64 / self.size as f64
    }

    /// Attach the shared gauges and publish the current values. Gauge
    /// values are refreshed on every subsequent allocate/release.
    pub fn init_metrics(&self, gauges: &PoolGauges) {
        *self.gauges.lock() = Some(gauges.clone());
        let bits = self.bits.lock();
        self.publish(&bits);
        debug!(pool = %self.name, size = self.size, allocated = bits.allocated, "pool metrics initialized");
    }

    fn publish(&self, bits: &Bits) {
        if let Some(g) = &*self.gauges.lock() {
            g.size.with_label_values(&[&self.name]).set(self.size as i64);
            g.allocated
                .with_label_values(&[&self.name])
                .set(bits.allocated as i64);
            let util = if self.size == 0 {
                0.0
            } else {
                bits.allocated as f64 / self.size as f64
            };
            g.utilization.with_label_values(&[&self.name]).set(util);
        }
    }
}

/// Pick the pool for a request. Specific pools (those with at least one
/// pattern) win in declaration order when every non-empty pattern matches
/// its criterion; otherwise the first pattern-free pool is the default.
pub fn select_pool<'a, T: AsRef<Pool>>(pools: &'a [T], criteria: &MatchCriteria) -> Option<&'a T> {
    if let Some(p) = pools
        .iter()
        .filter(|p| p.as_ref().is_specific())
        .find(|p| p.as_ref().patterns().matches(criteria))
    {
        return Some(p);
    }
    pools.iter().find(|p| !p.as_ref().is_specific())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool(start: [u8; 4], end: [u8; 4]) -> Pool {
        Pool::new(
            "test",
            start.into(),
            end.into(),
            "10.0.0.0/24".parse().unwrap(),
            HashSet::new(),
            MatchPatterns::default(),
        )
        .unwrap()
    }

    #[test]
    fn allocate_in_order() {
        let p = pool([10, 0, 0, 100], [10, 0, 0, 103]);
        assert_eq!(p.allocate(), Some([10, 0, 0, 100].into()));
        assert_eq!(p.allocate(), Some([10, 0, 0, 101].into()));
        assert_eq!(p.allocate(), Some([10, 0, 0, 102].into()));
        assert_eq!(p.allocate(), Some([10, 0, 0, 103].into()));
        assert_eq!(p.allocate(), None);
        assert_eq!(p.allocated(), 4);
        assert!((p.utilization() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn allocate_release_roundtrip() {
        let p = pool([10, 0, 0, 100], [10, 0, 0, 199]);
        let ip = p.allocate().unwrap();
        assert!(p.is_allocated(ip));
        assert!(p.contains(ip));
        assert_eq!(p.allocated(), 1);
        assert!(p.release(ip));
        assert!(!p.is_allocated(ip));
        assert_eq!(p.allocated(), 0);
        // double release is a no-op
        assert!(!p.release(ip));
    }

    #[test]
    fn allocate_specific_bounds() {
        let p = pool([10, 0, 0, 100], [10, 0, 0, 110]);
        assert!(p.allocate_specific([10, 0, 0, 105].into()));
        // already taken
        assert!(!p.allocate_specific([10, 0, 0, 105].into()));
        // out of range
        assert!(!p.allocate_specific([10, 0, 0, 50].into()));
        assert!(!p.is_allocated([10, 0, 0, 50].into()));
    }

    #[test]
    fn allocate_n_does_not_mutate() {
        let p = pool([10, 0, 0, 100], [10, 0, 0, 199]);
        p.allocate_specific([10, 0, 0, 100].into()).then_some(()).unwrap();
        let candidates = p.allocate_n(5);
        assert_eq!(candidates.len(), 5);
        assert_eq!(candidates[0], Ipv4Addr::from([10, 0, 0, 101]));
        // all distinct and all free
        for ip in &candidates {
            assert!(!p.is_allocated(*ip));
        }
        assert_eq!(p.allocated(), 1);
        // more than the pool holds caps at what's free
        let all = p.allocate_n(500);
        assert_eq!(all.len(), 99);
    }

    #[test]
    fn counter_matches_bitmap() {
        let p = pool([10, 0, 0, 1], [10, 0, 0, 200]);
        for _ in 0..57 {
            p.allocate().unwrap();
        }
        p.release([10, 0, 0, 7].into());
        p.release([10, 0, 0, 31].into());
        let (start, end) = p.range();
        let mut set = 0;
        let mut ip = u32::from(start);
        while ip <= u32::from(end) {
            if p.is_allocated(Ipv4Addr::from(ip)) {
                set += 1;
            }
            ip += 1;
        }
        assert_eq!(set, p.allocated());
        assert_eq!(set, 55);
    }

    #[test]
    fn exclusions_never_offered() {
        let excl: HashSet<Ipv4Addr> = [[10, 0, 0, 100].into(), [10, 0, 0, 101].into()]
            .into_iter()
            .collect();
        let p = Pool::new(
            "excl",
            [10, 0, 0, 100].into(),
            [10, 0, 0, 103].into(),
            "10.0.0.0/24".parse().unwrap(),
            excl,
            MatchPatterns::default(),
        )
        .unwrap();
        assert_eq!(p.allocate(), Some([10, 0, 0, 102].into()));
        assert_eq!(p.allocate(), Some([10, 0, 0, 103].into()));
        assert_eq!(p.allocate(), None);
        // exclusions count as allocated and can't be released
        assert!(p.is_allocated([10, 0, 0, 100].into()));
        assert!(!p.release([10, 0, 0, 100].into()));
    }

    #[test]
    fn invalid_ranges_rejected() {
        assert!(matches!(
            Pool::new(
                "bad",
                [10, 0, 0, 200].into(),
                [10, 0, 0, 100].into(),
                "10.0.0.0/24".parse().unwrap(),
                HashSet::new(),
                MatchPatterns::default(),
            ),
            Err(PoolError::StartAfterEnd { .. })
        ));
        assert!(matches!(
            Pool::new(
                "bad",
                [10, 0, 1, 10].into(),
                [10, 0, 1, 20].into(),
                "10.0.0.0/24".parse().unwrap(),
                HashSet::new(),
                MatchPatterns::default(),
            ),
            Err(PoolError::OutsideNetwork { .. })
        ));
    }

    #[test]
    fn fill_large_pool() {
        // exercise word boundaries
        let p = pool([10, 0, 0, 0], [10, 0, 0, 255]);
        for i in 0..=255u32 {
            assert_eq!(p.allocate(), Some(Ipv4Addr::from(0x0a000000 + i)));
        }
        assert_eq!(p.allocate(), None);
    }

    fn specific(name: &str, circuit: &str) -> Arc<Pool> {
        Arc::new(
            Pool::new(
                name,
                [10, 0, 0, 100].into(),
                [10, 0, 0, 199].into(),
                "10.0.0.0/24".parse().unwrap(),
                HashSet::new(),
                MatchPatterns {
                    circuit_id: Some(circuit.into()),
                    ..Default::default()
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn select_prefers_specific() {
        let default = Arc::new(pool([10, 0, 0, 100], [10, 0, 0, 199]));
        let voip = specific("voip", "eth0/1/*");
        let pools = vec![default.clone(), voip.clone()];

        let crit = MatchCriteria {
            circuit_id: "eth0/1/3".into(),
            ..Default::default()
        };
        assert_eq!(select_pool(&pools, &crit).unwrap().name(), "voip");

        // no circuit id: specific pool can't match, default wins
        let crit = MatchCriteria::default();
        assert_eq!(select_pool(&pools, &crit).unwrap().name(), "test");
    }

    #[test]
    fn select_none_when_no_default() {
        let voip = specific("voip", "eth0/1/*");
        let pools = vec![voip];
        let crit = MatchCriteria {
            circuit_id: "eth9".into(),
            ..Default::default()
        };
        assert!(select_pool(&pools, &crit).is_none());
    }
}
