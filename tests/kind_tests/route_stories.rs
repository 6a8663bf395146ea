//! HTTPRoute stories; the cluster needs the Gateway API CRDs
//!
//! ```bash
//! kubectl apply -f https://github.com/kubernetes-sigs/gateway-api/releases/download/v1.2.0/standard-install.yaml
//! ```

use std::collections::BTreeSet;

use kube::api::{Api, DynamicObject};

use consul_sync::consul::{ServiceInstance, ServiceState};
use consul_sync::kubernetes::{HttpRoute, RouteBinding, RouteConfig};

use super::helpers::TestNamespace;

fn tagged(name: &str, tags: &[&str]) -> ServiceState {
    ServiceState::new(
        name,
        vec![ServiceInstance {
            service_name: name.to_string(),
            address: "10.0.0.1".to_string(),
            port: 8080,
            tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
        }],
    )
}

fn routes(namespace: &str) -> RouteConfig {
    RouteConfig {
        enabled: true,
        domain_suffix: "k8s.example.io".to_string(),
        gateway_namespace: namespace.to_string(),
        listener: "https".to_string(),
        bindings: vec![
            RouteBinding::new("internal", "envoy-internal"),
            RouteBinding::new("external", "envoy-external"),
        ],
    }
}

async fn route_names(ns: &TestNamespace) -> Vec<String> {
    let api: Api<DynamicObject> =
        Api::namespaced_with(ns.client.clone(), &ns.name, &HttpRoute::api_resource());
    let mut names: Vec<String> = api
        .list(&Default::default())
        .await
        .unwrap()
        .items
        .into_iter()
        .filter_map(|r| r.metadata.name)
        .collect();
    names.sort();
    names
}

/// Story: tags pick gateways; dropping a tag drops the route, and dropping
/// the service drops everything.
#[tokio::test]
#[ignore]
async fn story_routes_follow_tags() {
    let ns = TestNamespace::create("consul-sync-routes").await;
    let (syncer, _) = ns.syncer(routes(&ns.name));

    syncer
        .sync(&[tagged("web", &["internal", "external"])])
        .await
        .unwrap();
    assert_eq!(
        route_names(&ns).await,
        vec!["web-envoy-external", "web-envoy-internal"]
    );

    syncer.sync(&[tagged("web", &["internal"])]).await.unwrap();
    assert_eq!(route_names(&ns).await, vec!["web-envoy-internal"]);

    syncer.sync(&[]).await.unwrap();
    assert!(route_names(&ns).await.is_empty());
    assert!(ns.service_names().await.is_empty());

    ns.delete().await;
}
