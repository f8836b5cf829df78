//! Runtime view of the `subnets` config section: validated pools with
//! their bitmaps, lease times and option overlays.
use std::{collections::HashSet, net::Ipv4Addr, sync::Arc};

use config::{wire, LeaseTime};
use dhcproto::v4::DhcpOptions;
use ipnet::Ipv4Net;
use pool::{MatchCriteria, MatchPatterns, Pool, PoolError};
use tracing::debug;

/// One configured pool plus the policy that travels with it.
#[derive(Debug)]
pub struct SubnetPool {
    pool: Pool,
    lease_time: LeaseTime,
    options: DhcpOptions,
}

impl AsRef<Pool> for SubnetPool {
    fn as_ref(&self) -> &Pool {
        &self.pool
    }
}


impl SubnetPool {
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
    pub fn name(&self) -> &str {
        self.pool.name()
    }
    pub fn lease_time(&self) -> LeaseTime {
        self.lease_time
    }
    pub fn options(&self) -> &DhcpOptions {
        &self.options
    }
}

#[derive(Debug)]
pub struct Subnet {
    network: Ipv4Net,
    options: DhcpOptions,
    pools: Vec<Arc<SubnetPool>>,
}

impl Subnet {
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// the CIDR string recorded in leases and conflict records
    pub fn cidr(&self) -> String {
        self.network.to_string()
    }

    pub fn options(&self) -> &DhcpOptions {
        &self.options
    }

    pub fn pools(&self) -> &[Arc<SubnetPool>] {
        &self.pools
    }

    pub fn select_pool(&self, criteria: &MatchCriteria) -> Option<&Arc<SubnetPool>> {
        let refs: Vec<&SubnetPool> = self.pools.iter().map(|p| p.as_ref()).collect();
        let selected = pool::select_pool(&refs, criteria)?;
        self.pools
            .iter()
            .find(|p| std::ptr::eq(p.as_ref(), *selected))
    }

    pub fn pool_containing(&self, ip: Ipv4Addr) -> Option<&Arc<SubnetPool>> {
        self.pools.iter().find(|p| p.pool().contains(ip))
    }

    /// merged option view: subnet options with pool overrides on top
    pub fn merged_options(&self, pool: &SubnetPool) -> DhcpOptions {
        let mut opts = self.options.clone();
        for (_, opt) in pool.options().iter() {
            opts.insert(opt.clone());
        }
        opts
    }
}

/// Build runtime subnets from the wire config. Every pool range is
/// validated against its subnet's network.
pub fn build_subnets(cfg: &wire::Config) -> Result<Vec<Arc<Subnet>>, PoolError> {
    let mut subnets = Vec::with_capacity(cfg.subnets.len());
    for sub in &cfg.subnets {
        let mut pools = Vec::with_capacity(sub.pools.len());
        for p in &sub.pools {
            let patterns = MatchPatterns {
                circuit_id: p.match_circuit_id.clone(),
                remote_id: p.match_remote_id.clone(),
                vendor_class: p.match_vendor_class.clone(),
                user_class: p.match_user_class.clone(),
            };
            let exclusions: HashSet<Ipv4Addr> = p.exclusions.iter().copied().collect();
            let pool = Pool::new(
                p.pool_name(),
                p.range_start,
                p.range_end,
                sub.network,
                exclusions,
                patterns,
            )?;
            debug!(pool = %pool.name(), network = %sub.network, size = pool.size(), "pool built");
            pools.push(Arc::new(SubnetPool {
                pool,
                lease_time: p.lease_time.into(),
                options: p.options.as_ref().clone(),
            }));
        }
        subnets.push(Arc::new(Subnet {
            network: sub.network,
            options: sub.options.as_ref().clone(),
            pools,
        }));
    }
    Ok(subnets)
}

pub fn find_subnet(subnets: &[Arc<Subnet>], ip: Ipv4Addr) -> Option<&Arc<Subnet>> {
    subnets.iter().find(|s| s.network.contains(&ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> wire::Config {
        config::parse_str(
            r#"
server:
  server_id: athena-test
subnets:
  - network: "10.0.0.0/24"
    pools:
      - range_start: 10.0.0.100
        range_end: 10.0.0.199
      - name: voip
        range_start: 10.0.0.200
        range_end: 10.0.0.220
        match_circuit_id: "eth0/1/*"
  - network: "192.168.5.0/24"
    pools:
      - range_start: 192.168.5.10
        range_end: 192.168.5.50
"#,
        )
        .unwrap()
    }

    #[test]
    fn build_and_find() {
        let subnets = build_subnets(&cfg()).unwrap();
        assert_eq!(subnets.len(), 2);
        let s = find_subnet(&subnets, [10, 0, 0, 1].into()).unwrap();
        assert_eq!(s.cidr(), "10.0.0.0/24");
        assert!(find_subnet(&subnets, [172, 16, 0, 1].into()).is_none());
    }

    #[test]
    fn relay_criteria_pick_specific_pool() {
        let subnets = build_subnets(&cfg()).unwrap();
        let s = find_subnet(&subnets, [10, 0, 0, 1].into()).unwrap();
        let crit = MatchCriteria {
            circuit_id: "eth0/1/3".into(),
            ..Default::default()
        };
        assert_eq!(s.select_pool(&crit).unwrap().name(), "voip");
        assert_eq!(
            s.select_pool(&MatchCriteria::default()).unwrap().name(),
            "10.0.0.100-10.0.0.199"
        );
    }

    #[test]
    fn pool_containing_locates() {
        let subnets = build_subnets(&cfg()).unwrap();
        let s = find_subnet(&subnets, [10, 0, 0, 1].into()).unwrap();
        assert_eq!(s.pool_containing([10, 0, 0, 210].into()).unwrap().name(), "voip");
        assert!(s.pool_containing([10, 0, 0, 50].into()).is_none());
    }

    #[test]
    fn bad_range_refused() {
        let mut c = cfg();
        c.subnets[0].pools[0].range_end = [10, 0, 1, 50].into();
        assert!(build_subnets(&c).is_err());
    }
}
