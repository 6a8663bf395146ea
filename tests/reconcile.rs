//! End-to-end reconciliation against a fake Consul agent
//!
//! These tests wire the real `ConsulClient`, `ChangeWatcher`, `StateSyncer`
//! and `Reconciler` together. Consul is an in-process HTTP server that
//! implements blocking queries; Kubernetes is an in-memory `ClusterClient`.
//! They tell the story of a service being registered, changed and removed
//! upstream, and of the cluster following along.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use consul_sync::consul::{ChangeWatcher, ConsulClient, ConsulConfig};
use consul_sync::health::Readiness;
use consul_sync::kubernetes::{
    ClusterClient, HttpRoute, ManagedEndpointSlice, RouteBinding, RouteConfig, StateSyncer,
};
use consul_sync::metrics::InMemoryMetrics;
use consul_sync::reconciler::Reconciler;
use consul_sync::retry::BackoffConfig;
use consul_sync::Error;

const NAMESPACE: &str = "network";

// =============================================================================
// Fake Consul agent
// =============================================================================

#[derive(Clone, Debug)]
struct Registration {
    address: String,
    port: i64,
    tags: Vec<String>,
    passing: bool,
}

/// Catalog with blocking-query support: a query whose index is current
/// waits for the next change (or the requested wait) before answering.
#[derive(Clone)]
struct FakeConsul {
    services: Arc<Mutex<BTreeMap<String, Vec<Registration>>>>,
    index: Arc<watch::Sender<u64>>,
}

#[derive(Deserialize)]
struct CatalogQuery {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    wait: Option<String>,
    #[serde(default)]
    tag: Option<String>,
}

impl FakeConsul {
    fn new() -> Self {
        let (tx, _) = watch::channel(1);
        Self {
            services: Arc::default(),
            index: Arc::new(tx),
        }
    }

    fn register(&self, name: &str, instances: &[(&str, i64, &[&str])]) {
        let registrations = instances
            .iter()
            .map(|(address, port, tags)| Registration {
                address: address.to_string(),
                port: *port,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                passing: true,
            })
            .collect();
        self.services
            .lock()
            .unwrap()
            .insert(name.to_string(), registrations);
        self.index.send_modify(|i| *i += 1);
    }

    fn fail_checks(&self, name: &str) {
        if let Some(regs) = self.services.lock().unwrap().get_mut(name) {
            regs.iter_mut().for_each(|r| r.passing = false);
        }
        self.index.send_modify(|i| *i += 1);
    }

    fn deregister(&self, name: &str) {
        self.services.lock().unwrap().remove(name);
        self.index.send_modify(|i| *i += 1);
    }

    async fn start(&self) -> SocketAddr {
        let app = Router::new()
            .route("/v1/catalog/services", get(catalog))
            .route("/v1/health/service/{name}", get(health))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

async fn catalog(State(consul): State<FakeConsul>, Query(q): Query<CatalogQuery>) -> Response {
    let mut changes = consul.index.subscribe();
    let current = *changes.borrow();
    if q.index > 0 && q.index >= current {
        let wait = q
            .wait
            .as_deref()
            .and_then(|w| w.trim_end_matches('s').parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(1));
        let _ = tokio::time::timeout(wait, changes.changed()).await;
    }

    let index = *consul.index.borrow();
    let services = consul.services.lock().unwrap().clone();
    let body: BTreeMap<String, Vec<String>> = services
        .into_iter()
        .map(|(name, regs)| {
            let tags: BTreeSet<String> = regs.into_iter().flat_map(|r| r.tags).collect();
            (name, tags.into_iter().collect::<Vec<_>>())
        })
        .filter(|(_, tags)| match &q.tag {
            Some(tag) => tags.contains(tag),
            None => true,
        })
        .collect();

    ([("X-Consul-Index", index.to_string())], Json(body)).into_response()
}

async fn health(State(consul): State<FakeConsul>, Path(name): Path<String>) -> Response {
    let services = consul.services.lock().unwrap().clone();
    let Some(regs) = services.get(&name) else {
        return (StatusCode::OK, Json(json!([]))).into_response();
    };
    let entries: Vec<_> = regs
        .iter()
        .filter(|r| r.passing)
        .map(|r| {
            json!({
                "Node": {"Address": "192.168.0.1"},
                "Service": {
                    "Service": name,
                    "Address": r.address,
                    "Port": r.port,
                    "Tags": r.tags,
                }
            })
        })
        .collect();
    (StatusCode::OK, Json(entries)).into_response()
}

// =============================================================================
// In-memory cluster
// =============================================================================

#[derive(Default)]
struct Objects {
    services: BTreeMap<String, Service>,
    slices: BTreeMap<String, EndpointSlice>,
    routes: BTreeMap<String, HttpRoute>,
}

#[derive(Clone, Default)]
struct MemoryCluster {
    objects: Arc<Mutex<Objects>>,
}

impl MemoryCluster {
    fn services(&self) -> Vec<String> {
        self.objects.lock().unwrap().services.keys().cloned().collect()
    }

    fn routes(&self) -> Vec<String> {
        self.objects.lock().unwrap().routes.keys().cloned().collect()
    }

    fn endpoint_addresses(&self, service: &str) -> Vec<String> {
        let objects = self.objects.lock().unwrap();
        objects
            .slices
            .get(&format!("{service}-consul"))
            .map(|slice| {
                slice
                    .endpoints
                    .iter()
                    .flat_map(|e| e.addresses.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn service_port(&self, service: &str) -> Option<i32> {
        let objects = self.objects.lock().unwrap();
        let spec = objects.services.get(service)?.spec.as_ref()?;
        spec.ports.as_ref()?.first().map(|p| p.port)
    }

    fn remove_service_out_of_band(&self, name: &str) {
        let mut objects = self.objects.lock().unwrap();
        objects.services.remove(name);
        objects.slices.remove(&format!("{name}-consul"));
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn apply_service(&self, service: &Service) -> Result<(), Error> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.objects.lock().unwrap().services.insert(name, service.clone());
        Ok(())
    }

    async fn apply_endpoint_slice(&self, slice: &EndpointSlice) -> Result<(), Error> {
        let name = slice.metadata.name.clone().unwrap_or_default();
        self.objects.lock().unwrap().slices.insert(name, slice.clone());
        Ok(())
    }

    async fn apply_http_route(&self, route: &HttpRoute) -> Result<(), Error> {
        self.objects
            .lock()
            .unwrap()
            .routes
            .insert(route.metadata.name.clone(), route.clone());
        Ok(())
    }

    async fn list_managed_services(&self) -> Result<Vec<String>, Error> {
        Ok(self.services())
    }

    async fn list_managed_endpoint_slices(&self) -> Result<Vec<ManagedEndpointSlice>, Error> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .slices
            .iter()
            .map(|(name, slice)| ManagedEndpointSlice {
                name: name.clone(),
                service: slice
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get("kubernetes.io/service-name").cloned()),
            })
            .collect())
    }

    async fn list_managed_http_routes(&self) -> Result<Vec<String>, Error> {
        Ok(self.routes())
    }

    async fn delete_service(&self, name: &str) -> Result<(), Error> {
        self.objects.lock().unwrap().services.remove(name);
        Ok(())
    }

    async fn delete_endpoint_slice(&self, name: &str) -> Result<(), Error> {
        self.objects.lock().unwrap().slices.remove(name);
        Ok(())
    }

    async fn delete_http_route(&self, name: &str) -> Result<(), Error> {
        self.objects.lock().unwrap().routes.remove(name);
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Running {
    cluster: MemoryCluster,
    readiness: Readiness,
    metrics: Arc<InMemoryMetrics>,
    token: CancellationToken,
    handle: JoinHandle<Result<(), Error>>,
}

impl Running {
    async fn stop(self) {
        self.token.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("reconciler did not stop after cancellation")
            .unwrap()
            .unwrap();
    }
}

fn routes() -> RouteConfig {
    RouteConfig {
        enabled: true,
        domain_suffix: "k8s.example.io".to_string(),
        gateway_namespace: NAMESPACE.to_string(),
        listener: "https".to_string(),
        bindings: vec![
            RouteBinding::new("internal", "envoy-internal"),
            RouteBinding::new("external", "envoy-external"),
        ],
    }
}

fn start(consul_addr: &str, resync: Duration) -> Running {
    let mut config = ConsulConfig::new(consul_addr, "kubernetes");
    config.wait = Duration::from_secs(1);
    config.request_timeout = Duration::from_secs(5);
    let consul = ConsulClient::new(config).unwrap();

    let cluster = MemoryCluster::default();
    let metrics = Arc::new(InMemoryMetrics::new());
    let readiness = Readiness::new();

    let watcher = ChangeWatcher::new(Arc::new(consul), metrics.clone()).with_backoff(
        BackoffConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            multiplier: 2,
        },
    );
    let syncer = StateSyncer::new(
        Arc::new(cluster.clone()),
        NAMESPACE,
        routes(),
        metrics.clone(),
    );
    let reconciler = Reconciler::new(watcher, syncer, readiness.clone(), metrics.clone(), resync);

    let token = CancellationToken::new();
    let handle = tokio::spawn(reconciler.run(token.clone()));

    Running {
        cluster,
        readiness,
        metrics,
        token,
        handle,
    }
}

/// Poll `condition` until it holds, failing after five seconds
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Stories
// =============================================================================

/// Story: a service registered in Consul shows up in the cluster, follows
/// its instance and tag changes, and is removed once deregistered.
#[tokio::test]
async fn story_service_lifecycle_follows_consul() {
    let consul = FakeConsul::new();
    consul.register(
        "web",
        &[("10.0.0.1", 8080, &["kubernetes", "internal"][..])],
    );
    consul.register("ignored", &[("10.0.0.9", 80, &["other"][..])]);
    let addr = consul.start().await;

    let running = start(&format!("http://{addr}"), Duration::from_secs(3600));
    let cluster = running.cluster.clone();

    // Chapter 1: the first snapshot creates Service, EndpointSlice and route
    eventually("web to be synced", || cluster.services() == names(&["web"])).await;
    assert_eq!(cluster.routes(), names(&["web-envoy-internal"]));
    assert_eq!(cluster.service_port("web"), Some(8080));
    let readiness = running.readiness.clone();
    eventually("readiness", || readiness.is_ready()).await;

    // Chapter 2: a second instance and the external tag arrive
    consul.register(
        "web",
        &[
            ("10.0.0.1", 8080, &["kubernetes", "internal"][..]),
            ("10.0.0.2", 8080, &["kubernetes", "internal", "external"][..]),
        ],
    );
    eventually("second endpoint", || {
        cluster.endpoint_addresses("web") == names(&["10.0.0.1", "10.0.0.2"])
    })
    .await;
    eventually("external route", || {
        cluster.routes() == names(&["web-envoy-external", "web-envoy-internal"])
    })
    .await;

    // Chapter 3: the service loses all healthy instances and is torn down
    consul.fail_checks("web");
    eventually("web to be torn down", || cluster.services().is_empty()).await;
    assert!(cluster.routes().is_empty());

    // Chapter 4: it comes back, then is deregistered for good
    consul.register("web", &[("10.0.0.3", 9090, &["kubernetes"][..])]);
    eventually("web to return", || cluster.service_port("web") == Some(9090)).await;
    assert!(cluster.routes().is_empty());

    consul.deregister("web");
    eventually("web to be deleted", || cluster.services().is_empty()).await;

    assert_eq!(running.metrics.snapshot().reconcile_error, 0);
    running.stop().await;
}

/// Story: someone deletes a managed Service by hand; the next resync puts
/// it back even though Consul never changed.
#[tokio::test]
async fn story_resync_repairs_out_of_band_changes() {
    let consul = FakeConsul::new();
    consul.register("api", &[("10.1.0.1", 7000, &["kubernetes"][..])]);
    let addr = consul.start().await;

    let running = start(&format!("http://{addr}"), Duration::from_millis(300));
    let cluster = running.cluster.clone();

    eventually("api to be synced", || cluster.services() == names(&["api"])).await;

    cluster.remove_service_out_of_band("api");
    assert!(cluster.services().is_empty());

    eventually("resync to restore api", || cluster.services() == names(&["api"])).await;
    assert_eq!(cluster.endpoint_addresses("api"), names(&["10.1.0.1"]));

    running.stop().await;
}

/// Story: Consul is unreachable. Nothing is synced, readiness stays down,
/// every resync counts as a failed reconciliation, and shutdown is prompt.
#[tokio::test]
async fn story_consul_unreachable() {
    // Bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let running = start(&format!("http://{addr}"), Duration::from_millis(100));
    let metrics = running.metrics.clone();

    eventually("failed resyncs to be counted", || {
        metrics.snapshot().reconcile_error >= 2
    })
    .await;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.reconcile_success, 0);
    assert!(snapshot.registry_errors >= 2);
    assert!(!running.readiness.is_ready());
    assert!(running.cluster.services().is_empty());

    running.stop().await;
}
