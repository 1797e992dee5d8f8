use crate::{
    admin::Admin,
    core::{Authorize, HostPort, ServiceSelector, NODE_ID},
    discovery::SnapshotGateway,
    grpc::{self, ExtAuthzServer},
    log::{self, LogFormat},
    server,
    services_file::{Credentials, FileAuthorizer, FileSource},
    xds::{self, SnapshotCache, SyncMetrics, Synchronizer},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{fmt, net::SocketAddr, path::PathBuf};
use tokio::{net::TcpListener, sync::watch, time::Duration};
use tonic::transport::Server;
use tracing::{error, info, info_span, warn, Instrument};

/// Bounds how long servers may take to finish in-flight requests on shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Every proxy worker multiplexes its checks over a single connection.
const AUTHZ_MAX_CONCURRENT_STREAMS: u32 = 1_000_000;

#[derive(Debug, Parser)]
#[clap(
    name = "gateway-control-plane",
    about = "Configures an Envoy gateway from a service management API"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "gateway=info,warn",
        env = "GATEWAY_CONTROL_PLANE_LOG"
    )]
    log_level: String,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    /// The hostname or address at which proxies reach this control plane.
    #[clap(long, env = "HOSTNAME")]
    hostname: String,

    /// The management API access token.
    #[clap(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    access_token: Token,

    /// The management API base URL.
    #[clap(long, env = "MANAGEMENT_URL")]
    management_url: String,

    /// Restricts the gateway to a single service. All services are served when unset.
    #[clap(long, env = "SERVICE_ID")]
    service_id: Option<String>,

    /// The port on which proxies accept public traffic.
    #[clap(long, default_value = "10000")]
    public_port: u16,

    /// The port on which snapshots are served to proxies.
    #[clap(long, default_value = "18000")]
    xds_port: u16,

    /// Enables the admin server on the given address.
    #[clap(long)]
    admin_addr: Option<SocketAddr>,

    /// The port on which the external authorization service listens.
    #[clap(long, default_value = "9090")]
    auth_port: u16,

    #[clap(long, default_value = "60s", value_parser = parse_duration)]
    cache_ttl: Duration,

    #[clap(long, default_value = "30s", value_parser = parse_duration)]
    cache_refresh_interval: Duration,

    #[clap(long, default_value = "1000")]
    cache_entries_max: usize,

    #[clap(long, default_value = "2")]
    cache_update_retries: usize,

    #[clap(long, default_value = "5s", value_parser = parse_duration)]
    fetch_timeout: Duration,

    #[clap(long, default_value = "5s", value_parser = parse_duration)]
    authz_timeout: Duration,

    /// A JSON document describing the services to configure.
    #[clap(long, env = "SERVICES_FILE")]
    services_file: PathBuf,
}

#[derive(Clone)]
struct Token(String);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            hostname,
            access_token: Token(access_token),
            management_url,
            service_id,
            public_port,
            xds_port,
            admin_addr,
            auth_port,
            cache_ttl,
            cache_refresh_interval,
            cache_entries_max,
            cache_update_retries,
            fetch_timeout,
            authz_timeout,
            services_file,
        } = self;

        log::init(&log_level, log_format)?;

        if cache_refresh_interval >= cache_ttl {
            bail!(
                "--cache-refresh-interval ({cache_refresh_interval:?}) must be shorter than --cache-ttl ({cache_ttl:?})"
            );
        }

        let selector = ServiceSelector::from_service_id(service_id);
        let credentials = Credentials {
            management_url,
            access_token,
        };
        let cache = SnapshotCache::default();

        let mut prom = <Registry>::default();
        xds::metrics::register(prom.sub_registry_with_prefix("xds"), cache.clone());
        let sync_metrics = SyncMetrics::register(prom.sub_registry_with_prefix("sync"));
        let grpc_metrics = grpc::metrics::GrpcServerMetricsFamily::register(
            prom.sub_registry_with_prefix("grpc_server"),
        );
        let decision_metrics =
            grpc::metrics::DecisionMetrics::register(prom.sub_registry_with_prefix("authz"));

        let (drain_tx, drain_rx) = drain::channel();
        let (ready_tx, ready_rx) = watch::channel(false);

        // Bind all listeners before serving so that bind failures are fatal.
        let authz_listener = bind(SocketAddr::from(([0, 0, 0, 0], auth_port))).await?;
        let xds_listener = bind(SocketAddr::from(([0, 0, 0, 0], xds_port))).await?;
        let admin_listener = match admin_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };

        let authorizer = FileAuthorizer::new(services_file.clone(), credentials.clone());
        let authz = ExtAuthzServer::new(authorizer, authz_timeout, grpc_metrics, decision_metrics);
        tokio::spawn(
            log_failure(grpc(authz_listener, authz, drain_rx.clone()))
                .instrument(info_span!("ext_authz", port = auth_port)),
        );

        tokio::spawn(
            log_failure(server::serve(
                xds_listener,
                SnapshotGateway::new(cache.clone()),
                drain_rx.clone(),
            ))
            .instrument(info_span!("discovery", port = xds_port)),
        );

        if let Some(listener) = admin_listener {
            tokio::spawn(
                log_failure(server::serve(
                    listener,
                    Admin::new(ready_rx, prom),
                    drain_rx.clone(),
                ))
                .instrument(info_span!("admin")),
            );
        }
        let _ = ready_tx.send(true);

        let source = FileSource::new(
            services_file,
            credentials,
            cache_entries_max,
            cache_update_retries,
        );
        let params = xds::Params {
            node_id: NODE_ID.to_string(),
            selector,
            authz_addr: HostPort::new(hostname, auth_port),
            public_port,
            fetch_timeout,
            poll_interval: xds::poll_interval(cache_ttl, cache_refresh_interval),
        };
        let sync = tokio::spawn(
            Synchronizer::new(source, cache, params, sync_metrics)
                .run()
                .instrument(info_span!("sync")),
        );

        // Block the main task on the shutdown signal. Once it fires, stop polling and wait for
        // the servers to finish in-flight requests.
        drop(drain_rx);
        shutdown_signal().await?;
        info!("Received shutdown signal");
        sync.abort();
        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, drain_tx.drain())
            .await
            .is_err()
        {
            warn!(timeout = ?SHUTDOWN_GRACE_PERIOD, "Servers did not drain in time");
        }
        info!("Shutdown complete");
        Ok(())
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

async fn log_failure(server: impl Future<Output = Result<()>>) {
    if let Err(error) = server.await {
        error!(%error, "Server failed");
    }
}

async fn grpc<A>(listener: TcpListener, authz: ExtAuthzServer<A>, drain: drain::Watch) -> Result<()>
where
    A: Authorize + Send + Sync + 'static,
{
    let addr = listener.local_addr()?;
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .max_concurrent_streams(AUTHZ_MAX_CONCURRENT_STREAMS)
            .add_service(authz.svc())
            .serve_with_incoming_shutdown(
            tokio_stream::wrappers::TcpListenerStream::new(listener),
            close_rx.map(|_| {}),
        );
    }

    info!(%addr, "External authorization gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Parses a duration such as `500ms`, `30s`, `1m` or `2h`. Bare numbers are seconds.
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let n = digits
        .parse::<u64>()
        .with_context(|| format!("invalid duration: {s:?}"))?;
    let secs = |factor: u64| {
        n.checked_mul(factor)
            .map(Duration::from_secs)
            .with_context(|| format!("duration out of range: {s:?}"))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => secs(1),
        "m" => secs(60),
        "h" => secs(60 * 60),
        _ => bail!("invalid duration unit: {s:?}"),
    }
}

// === impl Token ===

impl std::str::FromStr for Token {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            bail!("access token must not be empty");
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 9] = [
        "gateway-control-plane",
        "--hostname=control-plane.example.com",
        "--access-token=secret",
        "--management-url=https://tenant-admin.example.com",
        "--services-file=/etc/gateway/services.json",
        "--cache-ttl=1m",
        "--cache-refresh-interval=30s",
        "--fetch-timeout=5s",
        "--authz-timeout=5s",
    ];

    #[test]
    fn parses_defaults() {
        let args = Args::try_parse_from(REQUIRED).expect("args must parse");
        assert_eq!(args.hostname, "control-plane.example.com");
        assert_eq!(args.public_port, 10000);
        assert_eq!(args.xds_port, 18000);
        assert_eq!(args.auth_port, 9090);
        assert_eq!(args.admin_addr, None);
        assert_eq!(args.cache_ttl, Duration::from_secs(60));
        assert_eq!(args.cache_refresh_interval, Duration::from_secs(30));
        assert_eq!(args.cache_entries_max, 1000);
        assert_eq!(args.cache_update_retries, 2);
        assert_eq!(args.log_format, LogFormat::Plain);
    }

    #[test]
    fn redacts_access_token() {
        let args = Args::try_parse_from(REQUIRED).expect("args must parse");
        assert_eq!(args.access_token.0, "secret");
        assert!(!format!("{args:?}").contains("secret"));
    }

    #[test]
    fn parses_overrides() {
        let args = Args::try_parse_from(REQUIRED.into_iter().chain([
            "--service-id=42",
            "--admin-addr=127.0.0.1:19001",
            "--log-format=json",
            "--cache-entries-max=10",
        ]))
        .expect("args must parse");
        assert_eq!(args.service_id.as_deref(), Some("42"));
        assert_eq!(
            args.admin_addr,
            Some(SocketAddr::from(([127, 0, 0, 1], 19001)))
        );
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.cache_entries_max, 10);
    }

    #[tokio::test]
    async fn authz_server_stops_on_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authz = ExtAuthzServer::new(
            FileAuthorizer::new(
                PathBuf::from("/nonexistent/services.json"),
                Credentials {
                    management_url: "https://tenant-admin.example.com".to_string(),
                    access_token: "secret".to_string(),
                },
            ),
            Duration::from_secs(1),
            grpc::metrics::GrpcServerMetricsFamily::register(&mut Registry::default()),
            grpc::metrics::DecisionMetrics::default(),
        );

        let (drain_tx, drain_rx) = drain::channel();
        let server = tokio::spawn(grpc(listener, authz, drain_rx));
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(5), drain_tx.drain())
            .await
            .expect("server must drain");
        server
            .await
            .unwrap()
            .expect("server must shut down cleanly");
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("1d").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("-1s").is_err());
    }
}
