use crate::resource::{Cluster, Listener, Route};
use anyhow::Result;
use serde::Serialize;

/// A versioned, internally consistent bundle of every resource served to a
/// node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub version: String,
    pub clusters: Vec<Cluster>,
    pub routes: Vec<Route>,
    pub listeners: Vec<Listener>,
}

/// Models the discovery server's snapshot store.
#[async_trait::async_trait]
pub trait SnapshotStore {
    /// Atomically replaces the snapshot served to `node_id`.
    fn set_snapshot(&self, node_id: &str, snapshot: Snapshot) -> Result<()>;

    /// Completes once any proxy has issued a discovery request or fetch.
    ///
    /// Completes immediately if that has already happened.
    async fn first_request(&self);
}

// === impl Snapshot ===

impl Snapshot {
    pub fn new(
        version: u64,
        clusters: Vec<Cluster>,
        routes: Vec<Route>,
        listeners: Vec<Listener>,
    ) -> Self {
        Self {
            version: version.to_string(),
            clusters,
            routes,
            listeners,
        }
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name == name)
    }
}
