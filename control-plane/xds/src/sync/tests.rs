use super::*;
use crate::SnapshotCache;
use anyhow::{anyhow, bail};
use futures::{future, prelude::*};
use gateway_control_plane_core::{Snapshot, NODE_ID};
use maplit::btreemap;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

type FetchResult = anyhow::Result<Vec<ServiceProxyConfig>>;

#[derive(Clone, Default)]
struct MockSource {
    responses: Arc<Mutex<VecDeque<FetchResult>>>,
    selectors: Arc<Mutex<Vec<ServiceSelector>>>,
}

struct PendingSource;

#[derive(Clone, Default)]
struct RejectingStore {
    attempts: Arc<AtomicUsize>,
}

fn mk_service(id: &str, version: u64) -> ServiceProxyConfig {
    ServiceProxyConfig {
        service_id: id.to_string(),
        access_token: "token".to_string(),
        management_url: "https://tenant-admin.example.com".to_string(),
        api_backend_url: format!("https://backend-{id}.example.com/v1"),
        proxy_endpoint_url: format!("https://edge-{id}.example.com"),
        version,
    }
}

fn params() -> Params {
    Params {
        node_id: NODE_ID.to_string(),
        selector: ServiceSelector::All,
        authz_addr: HostPort::new("control-plane.example.com", 9090),
        public_port: 10000,
        fetch_timeout: time::Duration::from_secs(5),
        poll_interval: poll_interval(time::Duration::from_secs(60), time::Duration::from_secs(30)),
    }
}

fn published(cache: &SnapshotCache) -> Option<Arc<Snapshot>> {
    cache.snapshot(NODE_ID)
}

// === impl MockSource ===

impl MockSource {
    fn push(&self, response: FetchResult) -> &Self {
        self.responses.lock().push_back(response);
        self
    }

    fn fetches(&self) -> usize {
        self.selectors.lock().len()
    }
}

#[async_trait::async_trait]
impl ProxyConfigSource for MockSource {
    async fn fetch(&self, selector: &ServiceSelector) -> FetchResult {
        self.selectors.lock().push(selector.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no response configured")))
    }
}

#[async_trait::async_trait]
impl ProxyConfigSource for PendingSource {
    async fn fetch(&self, _: &ServiceSelector) -> FetchResult {
        future::pending().await
    }
}

#[async_trait::async_trait]
impl SnapshotStore for RejectingStore {
    fn set_snapshot(&self, _: &str, _: Snapshot) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        bail!("snapshot store unavailable")
    }

    async fn first_request(&self) {}
}

// === tests ===

#[test]
fn poll_interval_precedes_cache_expiry() {
    assert_eq!(
        poll_interval(time::Duration::from_secs(60), time::Duration::from_secs(30)),
        time::Duration::from_secs(40)
    );
    // A refresh interval longer than the TTL doesn't underflow.
    assert_eq!(
        poll_interval(time::Duration::from_secs(10), time::Duration::from_secs(30)),
        time::Duration::from_secs(10)
    );
}

#[tokio::test]
async fn publishes_once_for_unchanged_version() {
    let source = MockSource::default();
    source
        .push(Ok(vec![mk_service("42", 3)]))
        .push(Ok(vec![mk_service("42", 3)]));
    let cache = SnapshotCache::default();
    let mut sync = Synchronizer::new(source, cache.clone(), params(), SyncMetrics::default());

    assert_eq!(sync.sync().await.unwrap(), Outcome::Published { version: 1 });
    assert_eq!(published(&cache).expect("must publish").version, "1");

    assert_eq!(sync.sync().await.unwrap(), Outcome::Unchanged);
    assert_eq!(published(&cache).expect("must publish").version, "1");
    assert_eq!(sync.state().snapshot_version(), 1);
    assert_eq!(
        sync.state().applied_versions(),
        Some(&btreemap! { "42".to_string() => 3 })
    );
}

#[tokio::test]
async fn snapshot_versions_increase_by_one() {
    let source = MockSource::default();
    for version in [3, 4, 9] {
        source.push(Ok(vec![mk_service("42", version)]));
    }
    let cache = SnapshotCache::default();
    let mut sync = Synchronizer::new(source, cache.clone(), params(), SyncMetrics::default());

    for expected in 1..=3 {
        assert_eq!(
            sync.sync().await.unwrap(),
            Outcome::Published { version: expected }
        );
        assert_eq!(
            published(&cache).expect("must publish").version,
            expected.to_string()
        );
    }
    assert_eq!(
        sync.state().applied_versions(),
        Some(&btreemap! { "42".to_string() => 9 })
    );
}

#[tokio::test]
async fn publishes_when_the_service_set_changes() {
    let source = MockSource::default();
    source
        .push(Ok(vec![mk_service("42", 3)]))
        .push(Ok(vec![mk_service("43", 1), mk_service("42", 3)]))
        .push(Ok(vec![mk_service("43", 1)]));
    let cache = SnapshotCache::default();
    let mut sync = Synchronizer::new(source, cache.clone(), params(), SyncMetrics::default());

    assert_eq!(sync.sync().await.unwrap(), Outcome::Published { version: 1 });
    assert_eq!(sync.sync().await.unwrap(), Outcome::Published { version: 2 });
    let snapshot = published(&cache).expect("must publish");
    // Services are ordered by id regardless of the source's ordering.
    let vhosts = snapshot.listeners[0]
        .virtual_hosts()
        .iter()
        .map(|vh| vh.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(vhosts, vec!["42", "43"]);

    assert_eq!(sync.sync().await.unwrap(), Outcome::Published { version: 3 });
    let snapshot = published(&cache).expect("must publish");
    assert_eq!(snapshot.routes.len(), 1);
    assert!(snapshot.cluster("backend-42_example_com").is_none());
}

#[tokio::test]
async fn first_cycle_publishes_without_services() {
    let source = MockSource::default();
    source.push(Ok(vec![])).push(Ok(vec![]));
    let cache = SnapshotCache::default();
    let mut sync = Synchronizer::new(source, cache.clone(), params(), SyncMetrics::default());

    assert_eq!(sync.sync().await.unwrap(), Outcome::Published { version: 1 });
    let snapshot = published(&cache).expect("must publish");
    assert!(snapshot.cluster("extauthz").is_some());
    assert_eq!(sync.sync().await.unwrap(), Outcome::Unchanged);
}

#[tokio::test]
async fn fetch_failure_keeps_previous_snapshot() {
    let source = MockSource::default();
    source
        .push(Ok(vec![mk_service("42", 3)]))
        .push(Err(anyhow!("management API unreachable")))
        .push(Ok(vec![mk_service("42", 3)]));
    let cache = SnapshotCache::default();
    let mut sync = Synchronizer::new(source, cache.clone(), params(), SyncMetrics::default());

    assert_eq!(sync.sync().await.unwrap(), Outcome::Published { version: 1 });
    assert!(matches!(sync.sync().await, Err(SyncError::Fetch(_))));
    assert_eq!(published(&cache).expect("must publish").version, "1");
    assert_eq!(sync.state().snapshot_version(), 1);
    assert_eq!(sync.sync().await.unwrap(), Outcome::Unchanged);
}

#[tokio::test(start_paused = true)]
async fn fetch_times_out() {
    let cache = SnapshotCache::default();
    let mut sync = Synchronizer::new(PendingSource, cache.clone(), params(), SyncMetrics::default());

    match sync.sync().await {
        Err(SyncError::FetchTimeout(timeout)) => {
            assert_eq!(timeout, time::Duration::from_secs(5))
        }
        res => panic!("unexpected result: {res:?}"),
    }
    assert!(published(&cache).is_none());
    assert_eq!(*sync.state(), SyncState::default());
}

#[tokio::test]
async fn invalid_service_aborts_the_cycle() {
    let mut invalid = mk_service("43", 1);
    invalid.api_backend_url = "ftp://backend.example.com".to_string();

    let source = MockSource::default();
    source
        .push(Ok(vec![mk_service("42", 3), invalid]))
        .push(Ok(vec![mk_service("42", 3)]));
    let cache = SnapshotCache::default();
    let mut sync = Synchronizer::new(source, cache.clone(), params(), SyncMetrics::default());

    assert!(matches!(
        sync.sync().await,
        Err(SyncError::Build(BuildError::InvalidBackendScheme { .. }))
    ));
    assert!(published(&cache).is_none());
    assert_eq!(*sync.state(), SyncState::default());

    assert_eq!(sync.sync().await.unwrap(), Outcome::Published { version: 1 });
}

#[tokio::test]
async fn duplicate_service_ids_abort_the_cycle() {
    let mut other = mk_service("42", 4);
    other.api_backend_url = "https://a.example.com".to_string();

    let source = MockSource::default();
    source
        .push(Ok(vec![mk_service("42", 3)]))
        .push(Ok(vec![mk_service("42", 5), other]));
    let mut reg = Registry::default();
    let metrics = SyncMetrics::register(reg.sub_registry_with_prefix("sync"));
    let cache = SnapshotCache::default();
    let mut sync = Synchronizer::new(source, cache.clone(), params(), metrics);

    assert_eq!(sync.sync().await.unwrap(), Outcome::Published { version: 1 });
    let state = sync.state().clone();

    match sync.sync().await {
        Err(SyncError::Build(BuildError::DuplicateService { service_id })) => {
            assert_eq!(service_id, "42")
        }
        res => panic!("unexpected result: {res:?}"),
    }
    // The previous snapshot stays in place.
    assert_eq!(*sync.state(), state);
    let snapshot = published(&cache).expect("must publish");
    assert_eq!(snapshot.version, "1");
    let vhosts = snapshot.listeners[0]
        .virtual_hosts()
        .iter()
        .map(|v| v.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(vhosts, vec!["42"]);

    let mut text = String::new();
    prometheus_client::encoding::text::encode(&mut text, &reg).expect("metrics must encode");
    assert!(
        text.contains(r#"sync_cycles_total{outcome="invalid_config"} 1"#),
        "{text}"
    );
}

#[tokio::test]
async fn publish_failure_does_not_advance_state() {
    let source = MockSource::default();
    source
        .push(Ok(vec![mk_service("42", 3)]))
        .push(Ok(vec![mk_service("42", 3)]));
    let store = RejectingStore::default();
    let mut sync = Synchronizer::new(source, store.clone(), params(), SyncMetrics::default());

    for _ in 0..2 {
        match sync.sync().await {
            Err(SyncError::Publish { version, .. }) => assert_eq!(version, 1),
            res => panic!("unexpected result: {res:?}"),
        }
        assert_eq!(*sync.state(), SyncState::default());
    }
    assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn records_cycle_outcomes() {
    let source = MockSource::default();
    source
        .push(Ok(vec![mk_service("42", 3)]))
        .push(Ok(vec![mk_service("42", 3)]))
        .push(Err(anyhow!("boom")));

    let mut reg = Registry::default();
    let metrics = SyncMetrics::register(reg.sub_registry_with_prefix("sync"));
    let mut sync = Synchronizer::new(source, SnapshotCache::default(), params(), metrics);
    for _ in 0..3 {
        let _ = sync.sync().await;
    }

    let mut text = String::new();
    prometheus_client::encoding::text::encode(&mut text, &reg).expect("metrics must encode");
    for outcome in ["published", "unchanged", "fetch_failed"] {
        let line = format!("sync_cycles_total{{outcome=\"{outcome}\"}} 1");
        assert!(text.contains(&line), "missing {line:?} in {text}");
    }
}

#[tokio::test(start_paused = true)]
async fn run_waits_for_the_first_request() {
    let source = MockSource::default();
    source
        .push(Ok(vec![mk_service("42", 3)]))
        .push(Ok(vec![mk_service("42", 4)]));
    let cache = SnapshotCache::default();
    let sync = Synchronizer::new(source.clone(), cache.clone(), params(), SyncMetrics::default());
    let task = tokio::spawn(sync.run());

    time::sleep(time::Duration::from_secs(3600)).await;
    assert_eq!(source.fetches(), 0, "must not poll before a proxy connects");
    assert!(published(&cache).is_none());

    let mut updates = cache.watch(Some(NODE_ID));
    let first = updates.next().await.expect("must publish");
    assert_eq!(first.version, "1");

    let second = updates.next().await.expect("must publish");
    assert_eq!(second.version, "2");
    assert_eq!(source.fetches(), 2);

    task.abort();
}
