use super::*;
use crate::configurer::HaProxyConfigurer;
use crate::test_support::{
    mapping, FakeConfigurer, FakeMonitor, FakeRegistry, FakeReloader, FakeTokenProvider,
};
use tcp_router_core::{BackendAddr, BackendEndpoint, ModificationTag, RoutingKey};

const DEFAULT_TTL: Duration = Duration::from_secs(120);

struct Harness {
    handle: UpdaterHandle,
    configurer: Arc<FakeConfigurer>,
    registry: Arc<FakeRegistry>,
    tokens: Arc<FakeTokenProvider>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        let configurer = FakeConfigurer::new();
        let registry = FakeRegistry::new();
        let tokens = FakeTokenProvider::new();
        let (updater, handle) = Updater::new(
            RoutingTable::new(DEFAULT_TTL),
            configurer.clone(),
            registry.clone(),
            tokens.clone(),
            Duration::from_secs(5),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(updater.run(shutdown.clone()));
        Self {
            handle,
            configurer,
            registry,
            tokens,
            shutdown,
            task,
        }
    }
}

fn added(port: u16, host: &str, backend_port: u16) -> RoutingEvent {
    RoutingEvent::EndpointAdded {
        key: RoutingKey::new(port),
        endpoint: BackendEndpoint::new(host, backend_port),
    }
}

fn members(snapshot: &RoutingSnapshot, port: u16) -> Vec<BackendAddr> {
    snapshot
        .backends(&RoutingKey::new(port))
        .map(|backends| backends.iter().map(BackendEndpoint::addr).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_resync_then_upsert_configures_once_each() {
    let h = Harness::start();
    h.registry.set_routes(vec![mapping(5000, "10.0.0.1", 60000)]);

    h.handle.resync().await.unwrap();
    assert_eq!(h.configurer.attempts(), 1);
    let configured = h.configurer.last().unwrap();
    assert_eq!(
        members(&configured, 5000),
        vec![BackendAddr::new("10.0.0.1", 60000)]
    );

    h.handle.apply(added(5000, "10.0.0.2", 60001)).await.unwrap();
    assert_eq!(h.configurer.attempts(), 2);
    assert_eq!(
        members(&h.configurer.last().unwrap(), 5000),
        vec![
            BackendAddr::new("10.0.0.1", 60000),
            BackendAddr::new("10.0.0.2", 60001)
        ]
    );
    assert_eq!(*h.handle.snapshot(), h.configurer.last().unwrap());
}

#[tokio::test]
async fn test_ttl_refresh_does_not_configure() {
    let h = Harness::start();
    h.handle.apply(added(5000, "10.0.0.1", 60000)).await.unwrap();
    h.handle.apply(added(5000, "10.0.0.1", 60000)).await.unwrap();
    assert_eq!(h.configurer.attempts(), 1);
}

#[tokio::test]
async fn test_repeated_resync_is_idempotent() {
    let h = Harness::start();
    h.registry.set_routes(vec![
        mapping(5000, "10.0.0.1", 60000),
        mapping(6000, "10.0.0.3", 60002),
    ]);

    h.handle.resync().await.unwrap();
    h.handle.resync().await.unwrap();
    assert_eq!(h.configurer.attempts(), 1);
    assert_eq!(h.registry.fetches(), 2);
}

#[tokio::test]
async fn test_empty_first_resync_still_configures() {
    let h = Harness::start();
    h.registry.set_routes(vec![]);

    h.handle.resync().await.unwrap();
    assert_eq!(h.configurer.attempts(), 1);
    assert!(h.configurer.last().unwrap().is_empty());

    h.handle.resync().await.unwrap();
    assert_eq!(h.configurer.attempts(), 1);
}

#[tokio::test]
async fn test_prune_before_first_resync_leaves_load_balancer_alone() {
    let h = Harness::start();
    h.handle.prune_stale_routes().await.unwrap();
    assert_eq!(h.configurer.attempts(), 0);
}

#[tokio::test]
async fn test_resync_removes_listeners_missing_from_registry() {
    let h = Harness::start();
    h.handle.apply(added(7000, "10.0.0.7", 60007)).await.unwrap();
    h.registry.set_routes(vec![mapping(5000, "10.0.0.1", 60000)]);

    h.handle.resync().await.unwrap();
    let snapshot = h.handle.snapshot();
    assert!(!snapshot.contains_key(&RoutingKey::new(7000)));
    assert!(snapshot.contains_key(&RoutingKey::new(5000)));
}

#[tokio::test]
async fn test_failed_resync_leaves_table_unchanged() {
    let h = Harness::start();
    h.handle.apply(added(5000, "10.0.0.1", 60000)).await.unwrap();
    let before = h.handle.snapshot();

    h.registry.fail_fetch(RegistryError::Stream("connection reset".to_string()));
    let result = h.handle.resync().await;

    assert!(matches!(result, Err(UpdaterError::Registry(_))));
    assert_eq!(h.handle.snapshot(), before);
    assert_eq!(h.configurer.attempts(), 1);
}

#[tokio::test]
async fn test_unauthorized_fetch_refreshes_token_once() {
    let h = Harness::start();
    h.registry.set_routes(vec![mapping(5000, "10.0.0.1", 60000)]);
    h.registry.fail_fetch(RegistryError::Unauthorized);

    h.handle.resync().await.unwrap();
    assert_eq!(h.tokens.forced_refreshes(), 1);
    assert_eq!(h.registry.fetches(), 2);
    assert!(h.handle.snapshot().contains_key(&RoutingKey::new(5000)));
}

#[tokio::test]
async fn test_repeated_unauthorized_fails_resync() {
    let h = Harness::start();
    h.registry.fail_fetch(RegistryError::Unauthorized);
    h.registry.fail_fetch(RegistryError::Unauthorized);

    let result = h.handle.resync().await;
    assert!(matches!(
        result,
        Err(UpdaterError::Registry(RegistryError::Unauthorized))
    ));
    assert_eq!(h.registry.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_registry_times_out() {
    let h = Harness::start();
    h.registry.set_fetch_delay(Duration::from_secs(60));

    let result = h.handle.resync().await;
    assert!(matches!(
        result,
        Err(UpdaterError::Registry(RegistryError::Timeout(_)))
    ));
}

#[tokio::test]
async fn test_failed_configure_is_retried_on_next_pass() {
    let h = Harness::start();
    h.configurer.set_failing(true);
    h.handle.apply(added(5000, "10.0.0.1", 60000)).await.unwrap();
    assert_eq!(h.configurer.attempts(), 1);

    // The table keeps the change even though the load balancer did not get it.
    assert!(h.handle.snapshot().contains_key(&RoutingKey::new(5000)));

    h.configurer.set_failing(false);
    h.handle.prune_stale_routes().await.unwrap();
    assert_eq!(h.configurer.attempts(), 2);

    h.handle.prune_stale_routes().await.unwrap();
    assert_eq!(h.configurer.attempts(), 2);
}

#[tokio::test]
async fn test_failed_configure_is_retried_by_unchanged_resync() {
    let h = Harness::start();
    h.registry.set_routes(vec![mapping(5000, "10.0.0.1", 60000)]);
    h.configurer.set_failing(true);
    h.handle.resync().await.unwrap();

    h.configurer.set_failing(false);
    h.handle.resync().await.unwrap();
    assert_eq!(h.configurer.attempts(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_applies_for_disjoint_keys() {
    let h = Harness::start();

    let tasks: Vec<_> = (0..50u16)
        .map(|i| {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.apply(added(5000 + i, "10.0.0.1", 60000 + i)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.len(), 50);
    assert_eq!(snapshot.backend_count(), 50);
    assert_eq!(h.configurer.attempts(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_prune_drops_expired_and_keeps_listener() {
    let h = Harness::start();
    h.handle
        .apply(RoutingEvent::EndpointAdded {
            key: RoutingKey::new(5000),
            endpoint: BackendEndpoint::new("10.0.0.1", 60000).with_ttl(Duration::from_secs(5)),
        })
        .await
        .unwrap();
    h.handle.apply(added(5000, "10.0.0.2", 60001)).await.unwrap();

    time::advance(Duration::from_secs(6)).await;
    h.handle.prune_stale_routes().await.unwrap();

    let snapshot = h.handle.snapshot();
    assert_eq!(
        members(&snapshot, 5000),
        vec![BackendAddr::new("10.0.0.2", 60001)]
    );
    assert_eq!(h.configurer.attempts(), 3);

    time::advance(DEFAULT_TTL).await;
    h.handle.prune_stale_routes().await.unwrap();
    let snapshot = h.handle.snapshot();
    assert!(snapshot.contains_key(&RoutingKey::new(5000)));
    assert!(members(&snapshot, 5000).is_empty());
}

#[tokio::test]
async fn test_stale_delete_is_ignored() {
    let h = Harness::start();
    h.handle
        .apply(RoutingEvent::EndpointAdded {
            key: RoutingKey::new(5000),
            endpoint: BackendEndpoint::new("10.0.0.1", 60000)
                .with_tag(ModificationTag::new("epoch", 5)),
        })
        .await
        .unwrap();
    h.handle
        .apply(RoutingEvent::EndpointRemoved {
            key: RoutingKey::new(5000),
            endpoint: BackendEndpoint::new("10.0.0.1", 60000)
                .with_tag(ModificationTag::new("epoch", 4)),
        })
        .await
        .unwrap();

    assert_eq!(members(&h.handle.snapshot(), 5000).len(), 1);
    assert_eq!(h.configurer.attempts(), 1);
}

#[tokio::test]
async fn test_handle_fails_after_shutdown() {
    let h = Harness::start();
    h.shutdown.cancel();
    h.task.await.unwrap();

    let result = h.handle.apply(added(5000, "10.0.0.1", 60000)).await;
    assert!(matches!(result, Err(UpdaterError::Closed)));
}

#[tokio::test]
async fn test_resync_writes_haproxy_config() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.cfg");
    std::fs::write(&base, "global\n").unwrap();
    let config_file = dir.path().join("haproxy.cfg");
    let configurer = HaProxyConfigurer::new(
        &base,
        config_file.clone(),
        FakeMonitor::new(true),
        FakeReloader::new(false),
    )
    .unwrap();

    let registry = FakeRegistry::new();
    registry.set_routes(vec![mapping(5000, "10.0.0.1", 60000)]);
    let (updater, handle) = Updater::new(
        RoutingTable::new(DEFAULT_TTL),
        Arc::new(configurer),
        registry,
        FakeTokenProvider::new(),
        Duration::from_secs(5),
    );
    tokio::spawn(updater.run(CancellationToken::new()));

    handle.resync().await.unwrap();
    let written = std::fs::read_to_string(&config_file).unwrap();
    assert!(written.contains(
        "listen listen_cfg_5000\n  mode tcp\n  bind :5000\n  server server_10.0.0.1_60000 10.0.0.1:60000\n"
    ));
}
