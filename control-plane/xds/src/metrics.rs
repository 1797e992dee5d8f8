use crate::SnapshotCache;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{counter::ConstCounter, gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SnapshotCache);

/// Exposes the state of a snapshot cache.
pub fn register(reg: &mut Registry, cache: SnapshotCache) {
    reg.register_collector(Box::new(Instrumented(cache)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let counts = self.0.request_counts();
        let fetches = ConstCounter::new(counts.fetches);
        fetches.encode(encoder.encode_descriptor(
            "discovery_fetches",
            "The number of discovery fetches served",
            None,
            fetches.metric_type(),
        )?)?;

        let watches = ConstCounter::new(counts.watches);
        watches.encode(encoder.encode_descriptor(
            "discovery_watches",
            "The number of discovery streams opened",
            None,
            watches.metric_type(),
        )?)?;

        let snapshots = self.0.snapshots();

        let mut version_encoder = encoder.encode_descriptor(
            "snapshot_version",
            "The version of the snapshot currently served to a node",
            None,
            MetricType::Gauge,
        )?;
        for (node, snapshot) in &snapshots {
            let labels = [("node", node.as_str())];
            // Versions are produced by the synchronizer and are always numeric.
            let version = snapshot.version.parse::<i64>().unwrap_or_default();
            ConstGauge::new(version).encode(version_encoder.encode_family(&labels)?)?;
        }

        let mut resources_encoder = encoder.encode_descriptor(
            "snapshot_resources",
            "The number of resources in the snapshot currently served to a node",
            None,
            MetricType::Gauge,
        )?;
        for (node, snapshot) in &snapshots {
            for (kind, count) in [
                ("cluster", snapshot.clusters.len()),
                ("route", snapshot.routes.len()),
                ("listener", snapshot.listeners.len()),
            ] {
                let labels = [("node", node.as_str()), ("kind", kind)];
                let gauge = ConstGauge::new(count as i64);
                gauge.encode(resources_encoder.encode_family(&labels)?)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build;
    use gateway_control_plane_core::HostPort;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn encodes_cache_state() {
        let cache = SnapshotCache::default();
        let snapshot = build::snapshot(3, &[], &HostPort::new("control-plane", 9090), 10000)
            .expect("snapshot must build");
        cache.set_snapshot("envoy-gateway", snapshot).expect("must publish");
        cache.fetch(Some("envoy-gateway"));

        let mut reg = Registry::default();
        register(reg.sub_registry_with_prefix("xds"), cache);

        let mut text = String::new();
        encode(&mut text, &reg).expect("metrics must encode");
        assert!(text.contains("xds_discovery_fetches_total 1"), "{text}");
        assert!(text.contains("xds_discovery_watches_total 0"), "{text}");
        assert!(
            text.contains(r#"xds_snapshot_version{node="envoy-gateway"} 3"#),
            "{text}"
        );
        assert!(
            text.contains(r#"xds_snapshot_resources{node="envoy-gateway",kind="cluster"} 1"#),
            "{text}"
        );
    }
}
