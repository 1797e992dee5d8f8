use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing and backend metadata for a single managed service, as reported by
/// the management API.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceProxyConfig {
    pub service_id: String,
    pub access_token: String,
    pub management_url: String,
    pub api_backend_url: String,
    pub proxy_endpoint_url: String,
    pub version: u64,
}

/// Selects which services are tracked by the control plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceSelector {
    All,
    Service(String),
}

/// Models the proxy-configuration source.
///
/// Implementations own their caching, refresh and retry policies.
#[async_trait::async_trait]
pub trait ProxyConfigSource {
    async fn fetch(&self, selector: &ServiceSelector) -> Result<Vec<ServiceProxyConfig>>;
}

// === impl ServiceProxyConfig ===

// The access token is credential material; keep it out of logs.
impl fmt::Debug for ServiceProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProxyConfig")
            .field("service_id", &self.service_id)
            .field("management_url", &self.management_url)
            .field("api_backend_url", &self.api_backend_url)
            .field("proxy_endpoint_url", &self.proxy_endpoint_url)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

// === impl ServiceSelector ===

impl ServiceSelector {
    /// An absent or empty service id selects every service in the account.
    pub fn from_service_id(id: Option<String>) -> Self {
        match id {
            Some(id) if !id.is_empty() => Self::Service(id),
            _ => Self::All,
        }
    }

    pub fn selects(&self, service_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Service(id) => id == service_id,
        }
    }
}

impl fmt::Display for ServiceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => "all".fmt(f),
            Self::Service(id) => write!(f, "service/{id}"),
        }
    }
}
