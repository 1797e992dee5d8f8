#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod authz;
pub mod resource;
pub mod service;
pub mod snapshot;

pub use self::{
    authz::{Authorize, AuthorizeRequest},
    resource::{
        AuthzContext, Cluster, DiscoveryType, HostPort, HttpFilter, Listener, Route, VirtualHost,
    },
    service::{ProxyConfigSource, ServiceProxyConfig, ServiceSelector},
    snapshot::{Snapshot, SnapshotStore},
};

/// Identifies the proxy fleet managed by this control plane.
pub const NODE_ID: &str = "envoy-gateway";
