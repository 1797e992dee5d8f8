use crate::{
    metrics::{DecisionMetrics, GrpcServerMetricsFamily, GrpcServerRPCMetrics},
    proto::{
        self,
        authorization_server::{self, Authorization, AuthorizationServer},
        check_response::HttpResponse,
        CheckRequest, CheckResponse,
    },
};
use gateway_control_plane_core::{Authorize, AuthorizeRequest, AuthzContext};
use std::collections::HashMap;
use thiserror::Error;
use tokio::time;
use tracing::{debug, trace, warn};

/// Answers the proxies' external authorization checks.
///
/// Every failure to reach a positive decision results in a denial; errors are never surfaced to
/// the proxy as RPC failures.
#[derive(Clone, Debug)]
pub struct ExtAuthzServer<A> {
    backend: A,
    timeout: time::Duration,
    rpc: GrpcServerRPCMetrics,
    decisions: DecisionMetrics,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(DenyReason),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Error)]
pub enum DenyReason {
    /// The request target could not be parsed.
    #[error("malformed request target")]
    MalformedRequest,
    /// The route did not carry a complete credentials context.
    #[error("missing credentials context")]
    MissingCredentialsContext,
    /// The backend rejected the request's credentials.
    #[error("unauthorized")]
    Unauthorized,
    /// The backend failed or timed out.
    #[error("authorization backend unavailable")]
    BackendUnavailable,
}

// === impl ExtAuthzServer ===

impl<A> ExtAuthzServer<A>
where
    A: Authorize + Send + Sync + 'static,
{
    pub fn new(
        backend: A,
        timeout: time::Duration,
        metrics: GrpcServerMetricsFamily,
        decisions: DecisionMetrics,
    ) -> Self {
        Self {
            backend,
            timeout,
            rpc: metrics.unary_rpc(authorization_server::SERVICE_NAME, "Check"),
            decisions,
        }
    }

    pub fn svc(self) -> AuthorizationServer<Self> {
        AuthorizationServer::new(self)
    }

    pub async fn decide(&self, req: &CheckRequest) -> Decision {
        let request = match authorize_request(req) {
            Ok(request) => request,
            Err(reason) => {
                debug!(?reason, "Denying request without consulting the backend");
                return Decision::Denied(reason);
            }
        };
        trace!(?request);

        let service_id = request.service_id.clone();
        match time::timeout(self.timeout, self.backend.authorize(request)).await {
            Ok(Ok(true)) => Decision::Allowed,
            Ok(Ok(false)) => {
                debug!(service = %service_id, "Backend denied request");
                Decision::Denied(DenyReason::Unauthorized)
            }
            Ok(Err(error)) => {
                warn!(service = %service_id, %error, "Authorization backend failed");
                Decision::Denied(DenyReason::BackendUnavailable)
            }
            Err(_) => {
                warn!(service = %service_id, timeout = ?self.timeout, "Authorization backend timed out");
                Decision::Denied(DenyReason::BackendUnavailable)
            }
        }
    }
}

#[async_trait::async_trait]
impl<A> Authorization for ExtAuthzServer<A>
where
    A: Authorize + Send + Sync + 'static,
{
    async fn check(
        &self,
        req: tonic::Request<CheckRequest>,
    ) -> Result<tonic::Response<CheckResponse>, tonic::Status> {
        let obs = self.rpc.start();
        let decision = self.decide(req.get_ref()).await;
        self.decisions.record(&decision);

        obs.msg_sent();
        obs.end(tonic::Code::Ok);
        Ok(tonic::Response::new(decision.into_response()))
    }
}

// === impl Decision ===

impl Decision {
    pub fn into_response(self) -> CheckResponse {
        match self {
            Self::Allowed => CheckResponse {
                status: Some(proto::rpc::Status {
                    code: tonic::Code::Ok as i32,
                    message: "ok".to_string(),
                }),
                http_response: Some(HttpResponse::OkResponse(Default::default())),
            },
            Self::Denied(_) => CheckResponse {
                status: Some(proto::rpc::Status {
                    code: tonic::Code::PermissionDenied as i32,
                    message: "permission denied".to_string(),
                }),
                http_response: Some(HttpResponse::DeniedResponse(Default::default())),
            },
        }
    }
}

fn authorize_request(req: &CheckRequest) -> Result<AuthorizeRequest, DenyReason> {
    let attrs = req
        .attributes
        .as_ref()
        .ok_or(DenyReason::MalformedRequest)?;
    let http = attrs
        .request
        .as_ref()
        .and_then(|r| r.http.as_ref())
        .ok_or(DenyReason::MalformedRequest)?;

    let uri = parse_request_target(&http.path).ok_or(DenyReason::MalformedRequest)?;
    let path = percent_encoding::percent_decode_str(uri.path())
        .decode_utf8()
        .map_err(|_| DenyReason::MalformedRequest)?
        .into_owned();

    let service_id = context(&attrs.context_extensions, AuthzContext::SERVICE_ID)?;
    let management_url = context(&attrs.context_extensions, AuthzContext::SYSTEM_URL)?;
    let access_token = context(&attrs.context_extensions, AuthzContext::ACCESS_TOKEN)?;

    let mut request = AuthorizeRequest {
        service_id,
        management_url,
        access_token,
        host: http.host.clone(),
        path,
        method: http.method.clone(),
        ..Default::default()
    };
    for (key, value) in url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes()) {
        let slot = match &*key {
            "app_id" => &mut request.app_id,
            "app_key" => &mut request.app_key,
            "user_key" => &mut request.user_key,
            _ => continue,
        };
        // The first non-empty occurrence of a parameter wins.
        if slot.is_none() && !value.is_empty() {
            *slot = Some(value.into_owned());
        }
    }
    Ok(request)
}

/// Parses a request target in origin form (`/path?query`) or absolute form.
fn parse_request_target(target: &str) -> Option<http::Uri> {
    let uri = target.parse::<http::Uri>().ok()?;
    if uri.scheme().is_none() && !target.starts_with('/') {
        return None;
    }
    Some(uri)
}

fn context(extensions: &HashMap<String, String>, key: &str) -> Result<String, DenyReason> {
    match extensions.get(key) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => {
            debug!(%key, "Missing credentials context");
            Err(DenyReason::MissingCredentialsContext)
        }
    }
}
