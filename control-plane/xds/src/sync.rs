use crate::build::{self, BuildError};
use gateway_control_plane_core::{
    HostPort, ProxyConfigSource, ServiceProxyConfig, ServiceSelector, SnapshotStore,
};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

/// Polls are scheduled this long before the source's cache entries would expire.
const POLL_MARGIN: time::Duration = time::Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct Params {
    pub node_id: String,
    pub selector: ServiceSelector,
    /// The address at which proxies reach the external authorization service.
    pub authz_addr: HostPort,
    pub public_port: u16,
    pub fetch_timeout: time::Duration,
    pub poll_interval: time::Duration,
}

/// Version state of the last published snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
    snapshot_version: u64,
    // Upstream versions by service id; unset until the first publish.
    applied: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to fetch service configuration: {0}")]
    Fetch(#[source] anyhow::Error),

    #[error("timed out fetching service configuration after {0:?}")]
    FetchTimeout(time::Duration),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("failed to publish snapshot {version}: {source}")]
    Publish {
        version: u64,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Published { version: u64 },
    Unchanged,
}

#[derive(Clone, Debug, Default)]
pub struct SyncMetrics {
    cycles: Family<OutcomeLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: &'static str,
}

/// Keeps the proxy fleet's snapshot in line with the proxy-configuration source.
#[derive(Debug)]
pub struct Synchronizer<S, P> {
    source: S,
    store: P,
    params: Params,
    state: SyncState,
    metrics: SyncMetrics,
}

/// Computes the delay between polls so that each poll happens before the source's cached entries
/// expire.
pub fn poll_interval(cache_ttl: time::Duration, refresh_interval: time::Duration) -> time::Duration {
    cache_ttl.saturating_sub(refresh_interval) + POLL_MARGIN
}

// === impl SyncState ===

impl SyncState {
    /// The version of the last published snapshot, or zero if nothing has been published.
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    /// Upstream service versions included in the last published snapshot.
    pub fn applied_versions(&self) -> Option<&BTreeMap<String, u64>> {
        self.applied.as_ref()
    }

    fn is_current(&self, versions: &BTreeMap<String, u64>) -> bool {
        self.applied.as_ref() == Some(versions)
    }
}

// === impl SyncMetrics ===

impl SyncMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let cycles = Family::<OutcomeLabels, Counter>::default();
        reg.register(
            "cycles",
            "Total number of configuration sync cycles by outcome",
            cycles.clone(),
        );
        Self { cycles }
    }

    fn record(&self, result: &Result<Outcome, SyncError>) {
        let outcome = match result {
            Ok(Outcome::Published { .. }) => "published",
            Ok(Outcome::Unchanged) => "unchanged",
            Err(SyncError::Fetch(_) | SyncError::FetchTimeout(_)) => "fetch_failed",
            Err(SyncError::Build(_)) => "invalid_config",
            Err(SyncError::Publish { .. }) => "publish_failed",
        };
        self.cycles.get_or_create(&OutcomeLabels { outcome }).inc();
    }
}

// === impl Synchronizer ===

impl<S, P> Synchronizer<S, P>
where
    S: ProxyConfigSource + Send + Sync,
    P: SnapshotStore + Send + Sync,
{
    pub fn new(source: S, store: P, params: Params, metrics: SyncMetrics) -> Self {
        Self {
            source,
            store,
            params,
            state: SyncState::default(),
            metrics,
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Waits for the first discovery request and then syncs periodically, forever.
    pub async fn run(mut self) {
        debug!("Waiting for the first discovery request");
        self.store.first_request().await;
        info!(
            selector = %self.params.selector,
            interval = ?self.params.poll_interval,
            "Starting configuration sync"
        );

        loop {
            match self.sync().await {
                Ok(Outcome::Published { version }) => info!(%version, "Published new snapshot"),
                Ok(Outcome::Unchanged) => debug!("No configuration changes detected"),
                Err(error) => warn!(%error, "Configuration sync failed"),
            }

            debug!(interval = ?self.params.poll_interval, "Waiting for next sync");
            time::sleep(self.params.poll_interval).await;
        }
    }

    /// Runs a single sync cycle.
    ///
    /// The state only advances when a snapshot is published; on any error the previously
    /// published snapshot remains in place.
    pub async fn sync(&mut self) -> Result<Outcome, SyncError> {
        let result = self.try_sync().await;
        self.metrics.record(&result);
        result
    }

    async fn try_sync(&mut self) -> Result<Outcome, SyncError> {
        let mut services = self.fetch().await?;
        services.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        for service in &services {
            debug!(service = %service.service_id, version = service.version, "Detected service");
        }

        let version = self.state.snapshot_version + 1;
        let snapshot = build::snapshot(
            version,
            &services,
            &self.params.authz_addr,
            self.params.public_port,
        )?;

        let versions = services
            .iter()
            .map(|s| (s.service_id.clone(), s.version))
            .collect::<BTreeMap<_, _>>();
        if self.state.is_current(&versions) {
            return Ok(Outcome::Unchanged);
        }

        self.store
            .set_snapshot(&self.params.node_id, snapshot)
            .map_err(|source| SyncError::Publish { version, source })?;
        self.state = SyncState {
            snapshot_version: version,
            applied: Some(versions),
        };
        Ok(Outcome::Published { version })
    }

    async fn fetch(&self) -> Result<Vec<ServiceProxyConfig>, SyncError> {
        let timeout = self.params.fetch_timeout;
        match time::timeout(timeout, self.source.fetch(&self.params.selector)).await {
            Ok(Ok(services)) => Ok(services),
            Ok(Err(error)) => Err(SyncError::Fetch(error)),
            Err(_) => Err(SyncError::FetchTimeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests;
