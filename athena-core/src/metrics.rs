//! # metrics
//!
//! Server statistics. Everything is registered against one [`Registry`]
//! owned by the server context at construction; there are no process-wide
//! metric globals, so tests can build as many isolated instances as they
//! like.
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

use pool::PoolGauges;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// count of recv'd DHCP messages by type
    pub recv_count: IntCounterVec,
    /// count of sent DHCP messages by type
    pub sent_count: IntCounterVec,
    /// packets that failed to parse
    pub malformed_count: IntCounter,
    /// packets dropped because the HA FSM is not active
    pub standby_drop_count: IntCounter,
    /// histogram of reply build+send times
    pub reply_duration: Histogram,
    /// currently processing messages
    pub in_flight: IntGauge,

    /// events dropped at the bus input
    pub event_input_drops: IntCounter,
    /// events dropped per subscriber channel
    pub event_sub_drops: IntCounterVec,

    /// probes sent by method
    pub probe_count: IntCounterVec,
    /// conflicts recorded by method
    pub conflict_count: IntCounterVec,
    /// active (unresolved) conflict records
    pub conflicts_active: IntGauge,
    /// probe cache hits
    pub probe_cache_hits: IntCounter,

    /// ha fsm state as an integer (init=0 .. recovery=5)
    pub ha_state: IntGauge,
    /// heartbeats received from the peer
    pub ha_heartbeats: IntCounter,
    /// lease updates applied from the peer
    pub ha_lease_updates: IntCounter,

    /// per-pool gauges handed to `Pool::init_metrics`
    pub pool_gauges: PoolGauges,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let recv_count = IntCounterVec::new(
            Opts::new("recv_type_counts", "Recv Type Counts"),
            &["message_type"],
        )?;
        let sent_count = IntCounterVec::new(
            Opts::new("sent_type_counts", "Sent Type Counts"),
            &["message_type"],
        )?;
        let malformed_count =
            IntCounter::new("malformed_packets", "count of packets that failed to parse")?;
        let standby_drop_count = IntCounter::new(
            "standby_dropped_packets",
            "packets dropped while not the active HA node",
        )?;
        let reply_duration = Histogram::with_opts(HistogramOpts::new(
            "dhcpv4_duration",
            "dhcpv4 reply duration (seconds)",
        ))?;
        let in_flight = IntGauge::new("in_flight", "count of currently processing messages")?;

        let event_input_drops = IntCounter::new(
            "event_input_drops",
            "events dropped because the bus input was full",
        )?;
        let event_sub_drops = IntCounterVec::new(
            Opts::new(
                "event_subscriber_drops",
                "events dropped because a subscriber channel was full",
            ),
            &["subscriber"],
        )?;

        let probe_count = IntCounterVec::new(
            Opts::new("probe_count", "probes sent by method"),
            &["method"],
        )?;
        let conflict_count = IntCounterVec::new(
            Opts::new("conflict_count", "conflicts recorded by method"),
            &["method"],
        )?;
        let conflicts_active =
            IntGauge::new("conflicts_active", "active (unresolved) conflict records")?;
        let probe_cache_hits = IntCounter::new("probe_cache_hits", "probe cache hits")?;

        let ha_state = IntGauge::new("ha_state", "HA FSM state (init=0..recovery=5)")?;
        let ha_heartbeats = IntCounter::new("ha_heartbeats", "heartbeats received from peer")?;
        let ha_lease_updates =
            IntCounter::new("ha_lease_updates", "lease updates applied from peer")?;

        for c in [
            &malformed_count,
            &standby_drop_count,
            &event_input_drops,
            &probe_cache_hits,
            &ha_heartbeats,
            &ha_lease_updates,
        ] {
            registry.register(Box::new(c.clone()))?;
        }
        for g in [&in_flight, &conflicts_active, &ha_state] {
            registry.register(Box::new(g.clone()))?;
        }
        for v in [
            &recv_count,
            &sent_count,
            &event_sub_drops,
            &probe_count,
            &conflict_count,
        ] {
            registry.register(Box::new(v.clone()))?;
        }
        registry.register(Box::new(reply_duration.clone()))?;

        let pool_gauges = PoolGauges::register(&registry)?;

        Ok(Self {
            registry,
            recv_count,
            sent_count,
            malformed_count,
            standby_drop_count,
            reply_duration,
            in_flight,
            event_input_drops,
            event_sub_drops,
            probe_count,
            conflict_count,
            conflicts_active,
            probe_cache_hits,
            ha_state,
            ha_heartbeats,
            ha_lease_updates,
            pool_gauges,
        })
    }

    /// the registry external surfaces scrape from
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn metrics_registered_and_isolated() {
        let a = Metrics::new().unwrap();
        // a second instance registers cleanly-- nothing global
        let b = Metrics::new().unwrap();

        a.recv_count.with_label_values(&["discover"]).inc();
        a.malformed_count.inc();
        a.conflict_count.with_label_values(&["arp_probe"]).inc();
        a.ha_state.set(3);
        let p = pool::Pool::new(
            "metrics-test",
            [10, 0, 0, 1].into(),
            [10, 0, 0, 10].into(),
            "10.0.0.0/24".parse().unwrap(),
            Default::default(),
            Default::default(),
        )
        .unwrap();
        p.init_metrics(&a.pool_gauges);
        assert_eq!(b.malformed_count.get(), 0);

        let names = a
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();
        for expect in [
            "recv_type_counts",
            "malformed_packets",
            "event_input_drops",
            "conflict_count",
            "ha_state",
            "pool_size",
        ] {
            assert!(names.contains(expect), "registered metric families: {names:?}");
        }
    }
}
