use futures::{future, prelude::*};
use gateway_control_plane_core::{HttpFilter, Snapshot, SnapshotStore};
use parking_lot::RwLock;
use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// The node id used for discovery requests that don't identify their node.
const UNKNOWN_NODE: &str = "unknown";

/// Holds the latest snapshot for each node.
///
/// Snapshots are replaced atomically: subscribers observe either the previous snapshot or the new
/// one, never a mix of both.
#[derive(Clone, Debug)]
pub struct SnapshotCache(Arc<Inner>);

pub type SnapshotStream = Pin<Box<dyn Stream<Item = Arc<Snapshot>> + Send + 'static>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("snapshot {version}: duplicate cluster {cluster}")]
    DuplicateCluster { version: String, cluster: String },

    #[error("snapshot {version}: route {prefix:?} references unknown cluster {cluster}")]
    UnknownRouteCluster {
        version: String,
        prefix: String,
        cluster: String,
    },

    #[error("snapshot {version}: listener {listener} references unknown cluster {cluster}")]
    UnknownFilterCluster {
        version: String,
        listener: String,
        cluster: String,
    },
}

type SnapshotTx = watch::Sender<Option<Arc<Snapshot>>>;

#[derive(Debug)]
struct Inner {
    nodes: RwLock<HashMap<String, SnapshotTx>>,
    first_request: watch::Sender<bool>,
    fetches: AtomicU64,
    watches: AtomicU64,
}

/// Counters describing the discovery requests served by a cache.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RequestCounts {
    pub(crate) fetches: u64,
    pub(crate) watches: u64,
}

// === impl SnapshotCache ===

impl Default for SnapshotCache {
    fn default() -> Self {
        Self(Arc::new(Inner {
            nodes: RwLock::new(HashMap::new()),
            first_request: watch::channel(false).0,
            fetches: AtomicU64::new(0),
            watches: AtomicU64::new(0),
        }))
    }
}

impl SnapshotCache {
    /// Validates and stores a snapshot, notifying all of the node's watches.
    pub fn set_snapshot(&self, node_id: &str, snapshot: Snapshot) -> Result<(), PublishError> {
        check_consistent(&snapshot)?;

        let version = snapshot.version.clone();
        let snapshot = Some(Arc::new(snapshot));
        match self.0.nodes.write().entry(node_id.to_string()) {
            Entry::Occupied(entry) => {
                entry.get().send_replace(snapshot);
            }
            Entry::Vacant(entry) => {
                entry.insert(watch::channel(snapshot).0);
            }
        }
        debug!(node = %node_id, %version, "snapshot updated");
        Ok(())
    }

    /// Serves a single discovery fetch for `node`.
    pub fn fetch(&self, node: Option<&str>) -> Option<Arc<Snapshot>> {
        self.0.fetches.fetch_add(1, Ordering::Relaxed);
        self.mark_requested();
        self.snapshot(node_id(node))
    }

    /// Opens a discovery stream for `node`.
    ///
    /// This is the entry point for a streaming discovery transport: each subscribed proxy holds one
    /// stream, which yields the current snapshot, if any, and then every subsequent update. The
    /// JSON gateway only serves fetches.
    pub fn watch(&self, node: Option<&str>) -> SnapshotStream {
        self.0.watches.fetch_add(1, Ordering::Relaxed);
        self.mark_requested();

        let rx = self
            .0
            .nodes
            .write()
            .entry(node_id(node).to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        Box::pin(tokio_stream::wrappers::WatchStream::new(rx).filter_map(future::ready))
    }

    /// Returns the current snapshot for a node without counting as a discovery request.
    pub fn snapshot(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        self.0
            .nodes
            .read()
            .get(node_id)
            .and_then(|tx| tx.borrow().clone())
    }

    /// Indicates whether any proxy has issued a discovery request.
    pub fn is_requested(&self) -> bool {
        *self.0.first_request.borrow()
    }

    pub(crate) fn request_counts(&self) -> RequestCounts {
        RequestCounts {
            fetches: self.0.fetches.load(Ordering::Relaxed),
            watches: self.0.watches.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn snapshots(&self) -> Vec<(String, Arc<Snapshot>)> {
        let nodes = self.0.nodes.read();
        let mut snapshots = nodes
            .iter()
            .filter_map(|(node, tx)| Some((node.clone(), tx.borrow().clone()?)))
            .collect::<Vec<_>>();
        snapshots.sort_by(|(a, _), (b, _)| a.cmp(b));
        snapshots
    }

    fn mark_requested(&self) {
        let first = self.0.first_request.send_if_modified(|requested| {
            let first = !*requested;
            *requested = true;
            first
        });
        if first {
            info!("Observed first discovery request");
        }
    }

    async fn requested(&self) {
        let mut rx = self.0.first_request.subscribe();
        // The sender is owned by the cache, so it can't be dropped while we wait.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

#[async_trait::async_trait]
impl SnapshotStore for SnapshotCache {
    fn set_snapshot(&self, node_id: &str, snapshot: Snapshot) -> anyhow::Result<()> {
        SnapshotCache::set_snapshot(self, node_id, snapshot).map_err(Into::into)
    }

    async fn first_request(&self) {
        self.requested().await
    }
}

fn node_id(node: Option<&str>) -> &str {
    match node {
        Some(id) if !id.is_empty() => id,
        _ => UNKNOWN_NODE,
    }
}

fn check_consistent(snapshot: &Snapshot) -> Result<(), PublishError> {
    let mut clusters = BTreeSet::new();
    for cluster in &snapshot.clusters {
        if !clusters.insert(cluster.name.as_str()) {
            return Err(PublishError::DuplicateCluster {
                version: snapshot.version.clone(),
                cluster: cluster.name.clone(),
            });
        }
    }

    let routes = snapshot.routes.iter().chain(
        snapshot
            .listeners
            .iter()
            .flat_map(|l| l.virtual_hosts())
            .flat_map(|vh| vh.routes.iter()),
    );
    for route in routes {
        if !clusters.contains(route.cluster.as_str()) {
            return Err(PublishError::UnknownRouteCluster {
                version: snapshot.version.clone(),
                prefix: route.path_prefix.clone(),
                cluster: route.cluster.clone(),
            });
        }
    }

    for listener in &snapshot.listeners {
        for filter in &listener.connection_manager.http_filters {
            if let HttpFilter::ExtAuthz(authz) = filter {
                if !clusters.contains(authz.cluster.as_str()) {
                    return Err(PublishError::UnknownFilterCluster {
                        version: snapshot.version.clone(),
                        listener: listener.name.clone(),
                        cluster: authz.cluster.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}
