use crate::server::{empty, text, Body};
use futures::future;
use gateway_control_plane_xds::SnapshotCache;
use hyper::{Request, Response};
use std::convert::Infallible;
use tracing::{debug, warn};

/// Serves JSON renderings of the snapshots held by the cache.
///
/// `GET /snapshot/{node}` is handled as a discovery fetch for `node`, so the first read opens the
/// synchronizer's cold-start gate.
#[derive(Clone, Debug)]
pub struct SnapshotGateway {
    cache: SnapshotCache,
}

// === impl SnapshotGateway ===

impl SnapshotGateway {
    pub fn new(cache: SnapshotCache) -> Self {
        Self { cache }
    }

    fn handle_fetch(&self, node: &str) -> Response<Body> {
        let Some(snapshot) = self.cache.fetch(Some(node)) else {
            debug!(%node, "No snapshot published");
            return text(http::StatusCode::NOT_FOUND, "no snapshot\n");
        };

        match serde_json::to_vec(&*snapshot) {
            Ok(json) => Response::builder()
                .status(http::StatusCode::OK)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(json))
                .expect("snapshot response must be valid"),
            Err(error) => {
                warn!(%error, "Failed to encode snapshot");
                empty(http::StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl<B> tower::Service<Request<B>> for SnapshotGateway {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::Ready<Result<Response<Body>, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let Some(node) = req.uri().path().strip_prefix("/snapshot/") else {
            return future::ok(empty(http::StatusCode::NOT_FOUND));
        };
        if req.method() != http::Method::GET {
            return future::ok(empty(http::StatusCode::METHOD_NOT_ALLOWED));
        }
        future::ok(self.handle_fetch(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_control_plane_core::{HostPort, ServiceProxyConfig, NODE_ID};
    use gateway_control_plane_xds::build;
    use http_body_util::BodyExt;
    use tower::Service;

    fn mk_snapshot() -> gateway_control_plane_core::Snapshot {
        let service = ServiceProxyConfig {
            service_id: "42".to_string(),
            access_token: "secret-token".to_string(),
            management_url: "https://tenant-admin.example.com".to_string(),
            api_backend_url: "https://api.example.com/v1".to_string(),
            proxy_endpoint_url: "https://edge.example.com".to_string(),
            version: 3,
        };
        build::snapshot(1, &[service], &HostPort::new("control-plane", 9090), 10000)
            .expect("snapshot must build")
    }

    async fn get(gateway: &mut SnapshotGateway, path: &str) -> (http::StatusCode, String) {
        let req = Request::get(path).body(()).unwrap();
        let rsp = gateway.call(req).await.unwrap();
        let status = rsp.status();
        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn fetch_opens_the_gate() {
        let cache = SnapshotCache::default();
        let mut gateway = SnapshotGateway::new(cache.clone());
        assert!(!cache.is_requested());

        let (status, _) = get(&mut gateway, &format!("/snapshot/{NODE_ID}")).await;
        assert_eq!(status, http::StatusCode::NOT_FOUND);
        assert!(cache.is_requested());
    }

    #[tokio::test]
    async fn renders_published_snapshots() {
        let cache = SnapshotCache::default();
        cache
            .set_snapshot(NODE_ID, mk_snapshot())
            .expect("must publish");
        let mut gateway = SnapshotGateway::new(cache);

        let (status, body) = get(&mut gateway, &format!("/snapshot/{NODE_ID}")).await;
        assert_eq!(status, http::StatusCode::OK);
        let json = serde_json::from_str::<serde_json::Value>(&body).expect("must be JSON");
        assert_eq!(json["version"], "1");
        assert!(!body.contains("secret-token"), "{body}");

        let (status, _) = get(&mut gateway, "/snapshot/other").await;
        assert_eq!(status, http::StatusCode::NOT_FOUND);
        let (status, _) = get(&mut gateway, "/").await;
        assert_eq!(status, http::StatusCode::NOT_FOUND);
    }
}
