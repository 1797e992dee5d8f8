use anyhow::Result;
use hyper::{body::Incoming, Request, Response};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use tokio::{net::TcpListener, time};
use tracing::{debug, info, warn};

pub(crate) type Body = http_body_util::Full<bytes::Bytes>;

/// Delays the next accept after a failure, e.g. when file descriptors are exhausted.
const ACCEPT_BACKOFF: time::Duration = time::Duration::from_millis(100);

/// Serves HTTP/1 requests on `listener` until a drain is signaled.
///
/// Each connection holds its own drain handle, so the drain completes only once in-flight
/// requests have been answered.
pub(crate) async fn serve<S>(listener: TcpListener, svc: S, drain: drain::Watch) -> Result<()>
where
    S: tower::Service<Request<Incoming>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP server listening");

    let shutdown = drain.clone().signaled();
    tokio::pin!(shutdown);
    loop {
        let (io, client) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            release = &mut shutdown => {
                debug!("Draining HTTP server");
                drop(release);
                return Ok(());
            }
        };

        let svc = TowerToHyperService::new(svc.clone());
        let drain = drain.clone();
        tokio::spawn(async move {
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(io), svc);
            tokio::pin!(conn);
            let res = tokio::select! {
                res = &mut conn => res,
                release = drain.signaled() => {
                    conn.as_mut().graceful_shutdown();
                    release.release_after(conn).await
                }
            };
            if let Err(error) = res {
                debug!(%client, %error, "Connection failed");
            }
        });
    }
}

pub(crate) fn text(status: http::StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(body))
        .expect("text response must be valid")
}

pub(crate) fn empty(status: http::StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .expect("empty response must be valid")
}
