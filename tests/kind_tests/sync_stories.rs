//! Syncer stories against a real API server
//!
//! Server-side apply must be idempotent, label-scoped cleanup must leave
//! hand-made objects alone, and a removed service must take its
//! EndpointSlice with it.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;

use consul_sync::consul::{ServiceInstance, ServiceState};
use consul_sync::kubernetes::RouteConfig;

use super::helpers::TestNamespace;

// =============================================================================
// Fixtures
// =============================================================================

fn state(name: &str, addresses: &[&str], port: i64) -> ServiceState {
    ServiceState::new(
        name,
        addresses
            .iter()
            .map(|address| ServiceInstance {
                service_name: name.to_string(),
                address: address.to_string(),
                port,
                tags: BTreeSet::new(),
            })
            .collect(),
    )
}

fn handmade(name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Stories
// =============================================================================

/// Story: the first sync creates a headless Service and its EndpointSlice;
/// syncing the same snapshot again leaves the objects' generation alone.
#[tokio::test]
#[ignore]
async fn story_apply_is_idempotent_on_a_real_cluster() {
    let ns = TestNamespace::create("consul-sync-apply").await;
    let (syncer, _) = ns.syncer(RouteConfig::disabled());
    let snapshot = vec![state("web", &["10.0.0.1", "10.0.0.2"], 8080)];

    syncer.sync(&snapshot).await.unwrap();

    let svc = ns.services().get("web").await.unwrap();
    let spec = svc.spec.clone().unwrap();
    assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
    assert_eq!(spec.ports.unwrap()[0].port, 8080);

    let slice = ns.endpoint_slices().get("web-consul").await.unwrap();
    assert_eq!(slice.endpoints.len(), 2);
    assert_eq!(slice.address_type, "IPv4");

    let summary = syncer.sync(&snapshot).await.unwrap();
    assert_eq!(summary.deleted, 0);
    let again = ns.services().get("web").await.unwrap();
    assert_eq!(again.metadata.resource_version, svc.metadata.resource_version);

    ns.delete().await;
}

/// Story: a service disappears from Consul. Its Service and EndpointSlice
/// are deleted, while a Service someone created by hand survives.
#[tokio::test]
#[ignore]
async fn story_cleanup_only_touches_managed_objects() {
    let ns = TestNamespace::create("consul-sync-cleanup").await;
    let (syncer, _) = ns.syncer(RouteConfig::disabled());

    ns.services()
        .create(&PostParams::default(), &handmade("handmade"))
        .await
        .unwrap();

    syncer
        .sync(&[state("web", &["10.0.0.1"], 80), state("api", &["10.0.0.2"], 81)])
        .await
        .unwrap();
    assert_eq!(ns.service_names().await, vec!["api", "handmade", "web"]);

    let summary = syncer.sync(&[state("api", &["10.0.0.2"], 81)]).await.unwrap();
    assert_eq!(summary.deleted, 1);
    assert_eq!(ns.service_names().await, vec!["api", "handmade"]);
    assert!(ns.endpoint_slices().get_opt("web-consul").await.unwrap().is_none());

    ns.delete().await;
}

/// Story: the port changes in Consul and the Service follows.
#[tokio::test]
#[ignore]
async fn story_port_change_updates_the_service() {
    let ns = TestNamespace::create("consul-sync-port").await;
    let (syncer, metrics) = ns.syncer(RouteConfig::disabled());

    syncer.sync(&[state("web", &["10.0.0.1"], 8080)]).await.unwrap();
    syncer.sync(&[state("web", &["10.0.0.1"], 9090)]).await.unwrap();

    let svc = ns.services().get("web").await.unwrap();
    assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 9090);
    let slice = ns.endpoint_slices().get("web-consul").await.unwrap();
    assert_eq!(slice.ports.unwrap()[0].port, Some(9090));
    assert_eq!(metrics.snapshot().orchestrator_errors, 0);

    ns.delete().await;
}
