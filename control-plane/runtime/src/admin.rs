use crate::server::{empty, text, Body};
use futures::future;
use hyper::{Request, Response};
use prometheus_client::registry::Registry;
use std::{convert::Infallible, sync::Arc};
use tokio::sync::watch;
use tracing::{trace, warn};

const METRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves the process's liveness, readiness and metrics endpoints.
#[derive(Clone, Debug)]
pub struct Admin {
    ready: watch::Receiver<bool>,
    registry: Arc<Registry>,
}

// === impl Admin ===

impl Admin {
    pub fn new(ready: watch::Receiver<bool>, registry: Registry) -> Self {
        Self {
            ready,
            registry: Arc::new(registry),
        }
    }

    fn handle_ready(&self) -> Response<Body> {
        if *self.ready.borrow() {
            text(http::StatusCode::OK, "ready\n")
        } else {
            text(http::StatusCode::INTERNAL_SERVER_ERROR, "not ready\n")
        }
    }

    fn handle_metrics(&self) -> Response<Body> {
        let mut buf = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut buf, &self.registry) {
            warn!(%error, "Failed to encode metrics");
            return empty(http::StatusCode::INTERNAL_SERVER_ERROR);
        }
        Response::builder()
            .status(http::StatusCode::OK)
            .header(http::header::CONTENT_TYPE, METRICS_CONTENT_TYPE)
            .body(Body::from(buf))
            .expect("metrics response must be valid")
    }
}

impl<B> tower::Service<Request<B>> for Admin {
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
        trace!(method = %req.method(), path = %req.uri().path());
        if !matches!(*req.method(), http::Method::GET | http::Method::HEAD) {
            return future::ok(empty(http::StatusCode::METHOD_NOT_ALLOWED));
        }

        future::ok(match req.uri().path() {
            "/live" => text(http::StatusCode::OK, "live\n"),
            "/ready" => self.handle_ready(),
            "/metrics" => self.handle_metrics(),
            _ => empty(http::StatusCode::NOT_FOUND),
        })
    }
}
