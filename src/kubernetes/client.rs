//! Kubernetes API seam for the syncer
//!
//! [`ClusterClient`] is the narrow set of calls the syncer makes: server-side
//! apply of the three derived kinds, label-scoped listing, and delete by name.
//! [`KubeClusterClient`] is the real implementation, bound to one namespace.

use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::{Client, Config, ResourceExt};
use tracing::debug;

use super::resources::HttpRoute;
use super::{managed_selector, FIELD_MANAGER, LABEL_SERVICE_NAME};
use crate::Error;

/// Connection timeout for the Kubernetes client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for the Kubernetes client
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a client from in-cluster config or the local kubeconfig
pub async fn create_client() -> Result<Client, Error> {
    let mut config = Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {e}"))
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {e}"))
    })
}

/// A managed EndpointSlice and the Service it belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedEndpointSlice {
    /// EndpointSlice name
    pub name: String,
    /// Value of `kubernetes.io/service-name`, if set
    pub service: Option<String>,
}

impl ManagedEndpointSlice {
    fn from_slice(slice: &EndpointSlice) -> Self {
        Self {
            name: slice.name_any(),
            service: slice.labels().get(LABEL_SERVICE_NAME).cloned(),
        }
    }
}

/// Operations the syncer performs against the cluster
///
/// Every call is scoped to the namespace the implementation was built for.
/// Listing returns only objects carrying the managed-by label. Deleting an
/// object that is already gone succeeds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create or update a Service with server-side apply
    async fn apply_service(&self, service: &Service) -> Result<(), Error>;

    /// Create or update an EndpointSlice with server-side apply
    async fn apply_endpoint_slice(&self, slice: &EndpointSlice) -> Result<(), Error>;

    /// Create or update an HTTPRoute with server-side apply
    async fn apply_http_route(&self, route: &HttpRoute) -> Result<(), Error>;

    /// Names of managed Services
    async fn list_managed_services(&self) -> Result<Vec<String>, Error>;

    /// Managed EndpointSlices with their owning service
    async fn list_managed_endpoint_slices(&self) -> Result<Vec<ManagedEndpointSlice>, Error>;

    /// Names of managed HTTPRoutes
    async fn list_managed_http_routes(&self) -> Result<Vec<String>, Error>;

    /// Delete a Service by name
    async fn delete_service(&self, name: &str) -> Result<(), Error>;

    /// Delete an EndpointSlice by name
    async fn delete_endpoint_slice(&self, name: &str) -> Result<(), Error>;

    /// Delete an HTTPRoute by name
    async fn delete_http_route(&self, name: &str) -> Result<(), Error>;
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl KubeClusterClient {
    /// Bind a client to the namespace derived objects live in
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn endpoint_slices(&self) -> Api<EndpointSlice> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn http_routes(&self) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            &self.namespace,
            &HttpRoute::api_resource(),
        )
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER)
    }

    fn managed() -> ListParams {
        ListParams::default().labels(&managed_selector())
    }
}

/// Treat a 404 on delete as success
fn ignore_not_found(result: Result<(), kube::Error>) -> Result<(), Error> {
    match result.map_err(Error::from) {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn object_name(service: &Service) -> Result<&str, Error> {
    service
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("apply_service", "service has no name"))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn apply_service(&self, service: &Service) -> Result<(), Error> {
        let name = object_name(service)?;
        self.services()
            .patch(name, &Self::apply_params(), &Patch::Apply(service))
            .await?;
        debug!(service = %name, "applied service");
        Ok(())
    }

    async fn apply_endpoint_slice(&self, slice: &EndpointSlice) -> Result<(), Error> {
        let name = slice.metadata.name.as_deref().ok_or_else(|| {
            Error::internal_with_context("apply_endpoint_slice", "endpointslice has no name")
        })?;
        self.endpoint_slices()
            .patch(name, &Self::apply_params(), &Patch::Apply(slice))
            .await?;
        debug!(endpointslice = %name, "applied endpointslice");
        Ok(())
    }

    async fn apply_http_route(&self, route: &HttpRoute) -> Result<(), Error> {
        let name = &route.metadata.name;
        self.http_routes()
            .patch(name, &Self::apply_params(), &Patch::Apply(route))
            .await?;
        debug!(route = %name, "applied httproute");
        Ok(())
    }

    async fn list_managed_services(&self) -> Result<Vec<String>, Error> {
        let list = self.services().list(&Self::managed()).await?;
        Ok(list.items.iter().map(|s| s.name_any()).collect())
    }

    async fn list_managed_endpoint_slices(&self) -> Result<Vec<ManagedEndpointSlice>, Error> {
        let list = self.endpoint_slices().list(&Self::managed()).await?;
        Ok(list.items.iter().map(ManagedEndpointSlice::from_slice).collect())
    }

    async fn list_managed_http_routes(&self) -> Result<Vec<String>, Error> {
        let list = self.http_routes().list(&Self::managed()).await?;
        Ok(list.items.iter().map(|r| r.name_any()).collect())
    }

    async fn delete_service(&self, name: &str) -> Result<(), Error> {
        ignore_not_found(
            self.services()
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn delete_endpoint_slice(&self, name: &str) -> Result<(), Error> {
        ignore_not_found(
            self.endpoint_slices()
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn delete_http_route(&self, name: &str) -> Result<(), Error> {
        ignore_not_found(
            self.http_routes()
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }
}
