use anyhow::Result;
use std::fmt;

/// The inputs of a single authorization decision.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthorizeRequest {
    pub service_id: String,
    pub management_url: String,
    pub access_token: String,
    pub host: String,
    pub path: String,
    pub method: String,
    pub app_id: Option<String>,
    pub app_key: Option<String>,
    pub user_key: Option<String>,
}

/// Models the authorization backend.
///
/// The backend decides which credential scheme applies to a service; callers
/// pass along whatever credentials the request carried.
#[async_trait::async_trait]
pub trait Authorize {
    async fn authorize(&self, request: AuthorizeRequest) -> Result<bool>;
}

// === impl AuthorizeRequest ===

impl fmt::Debug for AuthorizeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizeRequest")
            .field("service_id", &self.service_id)
            .field("management_url", &self.management_url)
            .field("host", &self.host)
            .field("path", &self.path)
            .field("method", &self.method)
            .field("app_id", &self.app_id)
            .field("app_key", &self.app_key.as_ref().map(|_| "<redacted>"))
            .field("user_key", &self.user_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}
