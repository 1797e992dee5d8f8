//! Proxy discovery resources.
//!
//! These types model the subset of the proxy's resource graph that the
//! control plane produces: clusters, routes, virtual hosts and a single HTTP
//! listener. They are independent of the discovery wire format.

use serde::{Serialize, Serializer};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::Duration,
};

/// The name of the cluster pointing at the external authorization service.
pub const AUTHZ_CLUSTER_NAME: &str = "extauthz";

pub const LISTENER_NAME: &str = "listener_0";
pub const ROUTE_CONFIG_NAME: &str = "local_route";
pub const STAT_PREFIX: &str = "ingress_http";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

/// How the proxy resolves a cluster's address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DiscoveryType {
    /// Re-resolved periodically; all resolved addresses are used.
    StrictDns,
    /// Resolved once per connection; only the first address is used.
    LogicalDns,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum LbPolicy {
    RoundRobin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UpstreamTls {
    pub sni: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub name: String,
    pub discovery_type: DiscoveryType,
    pub connect_timeout: Duration,
    pub lb_policy: LbPolicy,
    pub address: HostPort,
    pub tls: Option<UpstreamTls>,
    pub http2: bool,
}

/// Authorization context attached to a route and handed back, unmodified, to
/// the external authorization service on every request.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct AuthzContext {
    pub service_id: String,
    pub management_url: String,
    #[serde(serialize_with = "redacted")]
    pub access_token: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Route {
    pub path_prefix: String,
    pub cluster: String,
    pub host_rewrite: String,
    pub authz_context: AuthzContext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: BTreeSet<String>,
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExtAuthzFilter {
    pub cluster: String,
    pub timeout: Duration,
    /// When false, requests are rejected if the authorization service fails.
    pub failure_mode_allow: bool,
}

/// HTTP filters, in the order the proxy applies them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum HttpFilter {
    ExtAuthz(ExtAuthzFilter),
    Router,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum CodecType {
    Auto,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteConfiguration {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HttpConnectionManager {
    pub codec: CodecType,
    pub stat_prefix: String,
    pub route_config: RouteConfiguration,
    pub http_filters: Vec<HttpFilter>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub name: String,
    pub address: HostPort,
    pub connection_manager: HttpConnectionManager,
}

// === impl HostPort ===

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// === impl Cluster ===

impl Cluster {
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }
}

// === impl AuthzContext ===

impl AuthzContext {
    pub const SERVICE_ID: &'static str = "service_id";
    pub const SYSTEM_URL: &'static str = "system_url";
    pub const ACCESS_TOKEN: &'static str = "access_token";

    /// Encodes the context as the authorization filter's per-route context
    /// extensions.
    pub fn context_extensions(&self) -> BTreeMap<String, String> {
        [
            (Self::SERVICE_ID, &self.service_id),
            (Self::SYSTEM_URL, &self.management_url),
            (Self::ACCESS_TOKEN, &self.access_token),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
    }
}

impl fmt::Debug for AuthzContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthzContext")
            .field("service_id", &self.service_id)
            .field("management_url", &self.management_url)
            .finish_non_exhaustive()
    }
}

// === impl Listener ===

impl Listener {
    pub fn virtual_hosts(&self) -> &[VirtualHost] {
        &self.connection_manager.route_config.virtual_hosts
    }
}

fn redacted<S: Serializer>(_: &str, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str("<redacted>")
}
