//! File-backed implementations of the proxy-configuration source and the authorization backend.
//!
//! Both read the same JSON document, which is re-read on every call so that edits take effect on
//! the next sync cycle or check:
//!
//! ```json
//! {
//!   "services": [{
//!     "service_id": "42",
//!     "api_backend_url": "https://api.example.com/v1",
//!     "proxy_endpoint_url": "https://edge.example.com",
//!     "version": 3,
//!     "user_keys": ["..."],
//!     "applications": [{ "app_id": "...", "app_key": "..." }]
//!   }]
//! }
//! ```
//!
//! `management_url` and `access_token` may be set per service; otherwise the process-wide
//! credentials apply.

use anyhow::{bail, Context, Result};
use gateway_control_plane_core::{
    Authorize, AuthorizeRequest, ProxyConfigSource, ServiceProxyConfig, ServiceSelector,
};
use serde::Deserialize;
use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Management API credentials used for services that don't specify their own.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub management_url: String,
    pub access_token: String,
}

#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
    defaults: Credentials,
    entries_max: usize,
    retries: usize,
}

#[derive(Clone, Debug)]
pub struct FileAuthorizer {
    path: PathBuf,
    defaults: Credentials,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ServicesFile {
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceEntry {
    service_id: String,
    #[serde(default)]
    management_url: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    api_backend_url: String,
    proxy_endpoint_url: String,
    version: u64,
    #[serde(default)]
    user_keys: BTreeSet<String>,
    #[serde(default)]
    applications: Vec<Application>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Application {
    app_id: String,
    #[serde(default)]
    app_key: Option<String>,
}

// === impl Credentials ===

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("management_url", &self.management_url)
            .finish_non_exhaustive()
    }
}

// === impl FileSource ===

impl FileSource {
    pub fn new(path: PathBuf, defaults: Credentials, entries_max: usize, retries: usize) -> Self {
        Self {
            path,
            defaults,
            entries_max,
            retries,
        }
    }

    async fn load(&self) -> Result<ServicesFile> {
        let mut attempt = 0;
        loop {
            match read(&self.path).await {
                Ok(file) => return Ok(file),
                Err(error) if attempt < self.retries => {
                    attempt += 1;
                    debug!(%error, attempt, "Retrying services file read");
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait::async_trait]
impl ProxyConfigSource for FileSource {
    async fn fetch(&self, selector: &ServiceSelector) -> Result<Vec<ServiceProxyConfig>> {
        let file = self.load().await?;
        let mut services = file
            .services
            .into_iter()
            .filter(|s| selector.selects(&s.service_id))
            .map(|s| s.into_config(&self.defaults))
            .collect::<Vec<_>>();

        if let ServiceSelector::Service(id) = selector {
            if services.is_empty() {
                bail!("service {id} not found in {}", self.path.display());
            }
        }

        if services.len() > self.entries_max {
            warn!(
                services = services.len(),
                max = self.entries_max,
                "Too many services; ignoring the excess"
            );
            services.sort_by(|a, b| a.service_id.cmp(&b.service_id));
            services.truncate(self.entries_max);
        }
        Ok(services)
    }
}

// === impl FileAuthorizer ===

impl FileAuthorizer {
    pub fn new(path: PathBuf, defaults: Credentials) -> Self {
        Self { path, defaults }
    }
}

#[async_trait::async_trait]
impl Authorize for FileAuthorizer {
    async fn authorize(&self, request: AuthorizeRequest) -> Result<bool> {
        let file = read(&self.path).await?;
        let Some(service) = file
            .services
            .iter()
            .find(|s| s.service_id == request.service_id)
        else {
            debug!(service = %request.service_id, "Unknown service");
            return Ok(false);
        };

        let (management_url, access_token) = service.credentials(&self.defaults);
        if management_url != request.management_url || access_token != request.access_token {
            debug!(service = %request.service_id, "Credentials context does not match the service");
            return Ok(false);
        }

        Ok(service.authorizes(&request))
    }
}

// === impl ServiceEntry ===

impl ServiceEntry {
    fn credentials<'a>(&'a self, defaults: &'a Credentials) -> (&'a str, &'a str) {
        (
            self.management_url
                .as_deref()
                .unwrap_or(defaults.management_url.as_str()),
            self.access_token
                .as_deref()
                .unwrap_or(defaults.access_token.as_str()),
        )
    }

    fn into_config(self, defaults: &Credentials) -> ServiceProxyConfig {
        ServiceProxyConfig {
            service_id: self.service_id,
            management_url: self
                .management_url
                .unwrap_or_else(|| defaults.management_url.clone()),
            access_token: self
                .access_token
                .unwrap_or_else(|| defaults.access_token.clone()),
            api_backend_url: self.api_backend_url,
            proxy_endpoint_url: self.proxy_endpoint_url,
            version: self.version,
        }
    }

    fn authorizes(&self, request: &AuthorizeRequest) -> bool {
        if let Some(key) = &request.user_key {
            if self.user_keys.contains(key) {
                return true;
            }
        }

        match &request.app_id {
            Some(app_id) => self.applications.iter().any(|app| {
                app.app_id == *app_id
                    && match &app.app_key {
                        Some(key) => request.app_key.as_ref() == Some(key),
                        None => true,
                    }
            }),
            None => false,
        }
    }
}

async fn read(path: &Path) -> Result<ServicesFile> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}
