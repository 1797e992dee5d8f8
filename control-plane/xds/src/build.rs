//! Translates service metadata into discovery resources.
//!
//! Every function in this module is pure: the same input always yields the same resources, which
//! is what allows the synchronizer to detect changes from upstream versions alone.

use gateway_control_plane_core::{
    resource::{
        AuthzContext, Cluster, CodecType, DiscoveryType, ExtAuthzFilter, HostPort,
        HttpConnectionManager, HttpFilter, LbPolicy, Listener, Route, RouteConfiguration,
        UpstreamTls, VirtualHost, AUTHZ_CLUSTER_NAME, LISTENER_NAME, ROUTE_CONFIG_NAME,
        STAT_PREFIX,
    },
    ServiceProxyConfig, Snapshot,
};
use http::Uri;
use std::{collections::BTreeSet, time::Duration};
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const AUTHZ_TIMEOUT: Duration = Duration::from_secs(5);
const LISTENER_BIND_ADDR: &str = "0.0.0.0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("service {service_id}: invalid {field} {url:?}: {reason}")]
    InvalidServiceConfig {
        service_id: String,
        field: &'static str,
        url: String,
        reason: String,
    },

    #[error("service {service_id}: unsupported api backend scheme {scheme:?}")]
    InvalidBackendScheme { service_id: String, scheme: String },

    #[error("service {service_id}: cluster {cluster} conflicts with another service's backend")]
    ClusterConflict { service_id: String, cluster: String },

    #[error("service {service_id} is listed more than once")]
    DuplicateService { service_id: String },
}

/// The resources derived from a single service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceResources {
    pub cluster: Cluster,
    pub route: Route,
    pub virtual_host: VirtualHost,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct BackendUrl {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

/// Builds the cluster, route and virtual host for a service.
pub fn service(config: &ServiceProxyConfig) -> Result<ServiceResources, BuildError> {
    let backend = parse_backend(config)?;
    let endpoint_host = parse_endpoint_host(config)?;

    let cluster_name = cluster_name(&backend.host);
    let cluster = Cluster {
        name: cluster_name.clone(),
        discovery_type: DiscoveryType::StrictDns,
        connect_timeout: CONNECT_TIMEOUT,
        lb_policy: LbPolicy::RoundRobin,
        address: HostPort::new(backend.host.clone(), backend.port),
        tls: match backend.scheme {
            Scheme::Https => Some(UpstreamTls {
                sni: backend.host.clone(),
            }),
            Scheme::Http => None,
        },
        http2: false,
    };

    let route = Route {
        path_prefix: backend.path,
        cluster: cluster_name,
        host_rewrite: backend.host,
        authz_context: AuthzContext {
            service_id: config.service_id.clone(),
            management_url: config.management_url.clone(),
            access_token: config.access_token.clone(),
        },
    };

    let virtual_host = VirtualHost {
        name: config.service_id.clone(),
        domains: BTreeSet::from([endpoint_host]),
        routes: vec![route.clone()],
    };

    Ok(ServiceResources {
        cluster,
        route,
        virtual_host,
    })
}

/// Builds the cluster through which proxies reach the external authorization service.
pub fn authz_cluster(addr: &HostPort) -> Cluster {
    Cluster {
        name: AUTHZ_CLUSTER_NAME.to_string(),
        discovery_type: DiscoveryType::LogicalDns,
        connect_timeout: CONNECT_TIMEOUT,
        lb_policy: LbPolicy::RoundRobin,
        address: addr.clone(),
        tls: None,
        // The authorization API is gRPC.
        http2: true,
    }
}

/// Builds the public HTTP listener serving every virtual host.
pub fn listener(virtual_hosts: Vec<VirtualHost>, public_port: u16) -> Listener {
    Listener {
        name: LISTENER_NAME.to_string(),
        address: HostPort::new(LISTENER_BIND_ADDR, public_port),
        connection_manager: HttpConnectionManager {
            codec: CodecType::Auto,
            stat_prefix: STAT_PREFIX.to_string(),
            route_config: RouteConfiguration {
                name: ROUTE_CONFIG_NAME.to_string(),
                virtual_hosts,
            },
            http_filters: vec![
                HttpFilter::ExtAuthz(ExtAuthzFilter {
                    cluster: AUTHZ_CLUSTER_NAME.to_string(),
                    timeout: AUTHZ_TIMEOUT,
                    failure_mode_allow: false,
                }),
                HttpFilter::Router,
            ],
        },
    }
}

/// Builds a complete snapshot for `services`.
///
/// Fails if any single service fails to build; no partial snapshot is produced.
pub fn snapshot(
    version: u64,
    services: &[ServiceProxyConfig],
    authz_addr: &HostPort,
    public_port: u16,
) -> Result<Snapshot, BuildError> {
    let mut clusters = vec![authz_cluster(authz_addr)];
    let mut routes = Vec::with_capacity(services.len());
    let mut virtual_hosts = Vec::with_capacity(services.len());
    let mut service_ids = BTreeSet::new();

    for config in services {
        if !service_ids.insert(config.service_id.as_str()) {
            return Err(BuildError::DuplicateService {
                service_id: config.service_id.clone(),
            });
        }

        let ServiceResources {
            cluster,
            route,
            virtual_host,
        } = service(config)?;

        // Services sharing a backend share its cluster.
        match clusters.iter().find(|c| c.name == cluster.name) {
            Some(existing) if *existing == cluster => {}
            Some(_) => {
                return Err(BuildError::ClusterConflict {
                    service_id: config.service_id.clone(),
                    cluster: cluster.name,
                })
            }
            None => clusters.push(cluster),
        }
        routes.push(route);
        virtual_hosts.push(virtual_host);
    }

    let listeners = vec![listener(virtual_hosts, public_port)];
    Ok(Snapshot::new(version, clusters, routes, listeners))
}

fn cluster_name(host: &str) -> String {
    host.replace('.', "_")
}

fn parse_backend(config: &ServiceProxyConfig) -> Result<BackendUrl, BuildError> {
    const FIELD: &str = "api backend url";
    let url = &config.api_backend_url;
    let invalid = |reason: &str| invalid_config(config, FIELD, url, reason);

    let uri = url
        .parse::<Uri>()
        .map_err(|error| invalid(&error.to_string()))?;

    let scheme = match uri.scheme_str() {
        Some("http") => Scheme::Http,
        Some("https") => Scheme::Https,
        Some(scheme) => {
            return Err(BuildError::InvalidBackendScheme {
                service_id: config.service_id.clone(),
                scheme: scheme.to_string(),
            })
        }
        None => return Err(invalid("missing scheme")),
    };

    let host = hostname(&uri).ok_or_else(|| invalid("missing host"))?;

    let port = match uri.port_u16() {
        Some(0) => return Err(invalid("port must not be zero")),
        Some(port) => port,
        None => match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        },
    };

    Ok(BackendUrl {
        scheme,
        host,
        port,
        path: uri.path().to_string(),
    })
}

fn parse_endpoint_host(config: &ServiceProxyConfig) -> Result<String, BuildError> {
    const FIELD: &str = "proxy endpoint url";
    let url = &config.proxy_endpoint_url;
    let uri = url
        .parse::<Uri>()
        .map_err(|error| invalid_config(config, FIELD, url, &error.to_string()))?;
    hostname(&uri).ok_or_else(|| invalid_config(config, FIELD, url, "missing host"))
}

/// Returns the URI's host without IPv6 brackets.
fn hostname(uri: &Uri) -> Option<String> {
    let host = uri.host()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some(host.to_string())
}

fn invalid_config(
    config: &ServiceProxyConfig,
    field: &'static str,
    url: &str,
    reason: &str,
) -> BuildError {
    BuildError::InvalidServiceConfig {
        service_id: config.service_id.clone(),
        field,
        url: url.to_string(),
        reason: reason.to_string(),
    }
}
