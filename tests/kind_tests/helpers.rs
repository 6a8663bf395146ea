//! Shared setup for cluster-backed tests

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use k8s_openapi::api::core::v1::{Namespace, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;

use consul_sync::kubernetes::{create_client, KubeClusterClient, RouteConfig, StateSyncer};
use consul_sync::metrics::InMemoryMetrics;

/// A namespace that lives for one test
pub struct TestNamespace {
    pub client: Client,
    pub name: String,
}

impl TestNamespace {
    /// Connect with the current kubeconfig and create a fresh namespace
    pub async fn create(prefix: &str) -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let client = create_client()
            .await
            .expect("a cluster must be reachable through the current kubeconfig");

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        let name = format!("{prefix}-{nanos:x}");

        let namespaces: Api<Namespace> = Api::all(client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        namespaces
            .create(&PostParams::default(), &ns)
            .await
            .expect("failed to create test namespace");

        Self { client, name }
    }

    /// Syncer bound to this namespace
    pub fn syncer(&self, routes: RouteConfig) -> (StateSyncer, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let cluster = KubeClusterClient::new(self.client.clone(), &self.name);
        let syncer = StateSyncer::new(Arc::new(cluster), &self.name, routes, metrics.clone());
        (syncer, metrics)
    }

    pub fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.name)
    }

    pub fn endpoint_slices(&self) -> Api<EndpointSlice> {
        Api::namespaced(self.client.clone(), &self.name)
    }

    /// Names of every Service in the namespace, managed or not
    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services()
            .list(&Default::default())
            .await
            .unwrap()
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect();
        names.sort();
        names
    }

    pub async fn delete(self) {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let _ = namespaces.delete(&self.name, &DeleteParams::default()).await;
    }
}
