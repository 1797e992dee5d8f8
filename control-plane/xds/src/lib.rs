//! Gateway discovery resources
//!
//! This crate compiles per-service metadata from the management API into the proxy's discovery
//! resource graph and keeps the proxy fleet's snapshot up to date:
//!
//! - [`build`] translates a single service's metadata into a cluster, a route and a virtual host,
//!   and produces the fixed authorization cluster and public listener shared by every service.
//! - [`SnapshotCache`] holds the latest snapshot per node. Discovery fetches and watches are served
//!   from it, and the first of them opens the cold-start gate.
//! - [`Synchronizer`] polls the proxy-configuration source, rebuilds the snapshot and publishes it
//!   only when an upstream service version changed.
//!
//! ```text
//! [ ProxyConfigSource ] -> [ Synchronizer ] -> [ build ] -> [ SnapshotCache ] -> proxies
//! ```

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod build;
mod cache;
pub mod metrics;
mod sync;

pub use self::{
    build::BuildError,
    cache::{PublishError, SnapshotCache, SnapshotStream},
    sync::{poll_interval, Outcome, Params, SyncError, SyncMetrics, SyncState, Synchronizer},
};
