//! Projects Consul snapshots onto Kubernetes objects
//!
//! [`StateSyncer::sync`] is a pure function of the snapshot it is given: it
//! applies every desired object with server-side apply and deletes every
//! managed object the snapshot no longer wants. It keeps no memory between
//! calls, so watch-triggered and resync-triggered cycles behave the same.
//!
//! Failures are isolated per object. A failed apply is logged, counted and
//! joined into the returned error while the remaining services are still
//! processed.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use super::client::ClusterClient;
use super::resources::{build_http_route, Projection, RouteConfig};
use super::{endpoint_slice_name, route_name};
use crate::consul::ServiceState;
use crate::metrics::MetricsSink;
use crate::Error;

/// Counts from one successful sync
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Services whose Service and EndpointSlice were applied
    pub services: usize,
    /// Endpoints across all applied EndpointSlices
    pub endpoints: usize,
    /// HTTPRoutes applied
    pub routes: usize,
    /// Orphaned Services and HTTPRoutes deleted
    pub deleted: usize,
}

/// Names the current cycle wants to exist
#[derive(Debug, Default)]
struct DesiredSet {
    services: BTreeSet<String>,
    routes: BTreeSet<String>,
}

/// Makes the managed objects in one namespace match a snapshot
pub struct StateSyncer {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    routes: RouteConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl StateSyncer {
    /// Create a syncer for `namespace`
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        routes: RouteConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            routes,
            metrics,
        }
    }

    /// Apply desired objects for `states` and delete orphans.
    ///
    /// Services with no instances are left out of the desired set, so their
    /// objects are deleted. A service whose data cannot be projected is
    /// skipped with a warning and does not fail the cycle.
    #[instrument(skip_all, fields(services = states.len()))]
    pub async fn sync(&self, states: &[ServiceState]) -> Result<SyncSummary, Error> {
        let mut desired = DesiredSet::default();
        let mut summary = SyncSummary::default();
        let mut errors = Vec::new();

        for state in states {
            if state.instances.is_empty() {
                warn!(service = %state.name, "skipping service with no healthy instances");
                continue;
            }

            let projection = match Projection::build(state, &self.namespace) {
                Ok(projection) => projection,
                Err(e) => {
                    warn!(service = %state.name, error = %e, "skipping service");
                    continue;
                }
            };

            desired.services.insert(projection.name.clone());
            let gateways = self.gateways_for(state);
            // Registered before applying so a failed apply never deletes a live route
            for gateway in &gateways {
                desired.routes.insert(route_name(&projection.name, gateway));
            }

            if let Err(e) = self
                .apply_projection(&projection, &gateways, &mut summary, &mut errors)
                .await
            {
                self.metrics.record_orchestrator_error();
                error!(service = %projection.name, error = %e, "failed to sync service, skipping");
                errors.push(e);
            }
        }

        summary.deleted += self.cleanup_services(&desired, &mut errors).await;
        self.cleanup_endpoint_slices(&desired).await;
        if self.routes.enabled {
            summary.deleted += self.cleanup_routes(&desired, &mut errors).await;
        }

        self.metrics.set_synced_services(summary.services as u64);
        self.metrics.set_synced_endpoints(summary.endpoints as u64);
        if self.routes.enabled {
            self.metrics.set_synced_routes(summary.routes as u64);
        }

        match Error::join(errors) {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn gateways_for(&self, state: &ServiceState) -> Vec<String> {
        if !self.routes.enabled {
            return Vec::new();
        }
        self.routes
            .bindings
            .iter()
            .filter(|binding| state.has_tag(&binding.tag))
            .map(|binding| binding.gateway.clone())
            .collect()
    }

    /// Apply Service, then EndpointSlice, then routes.
    ///
    /// A Service or EndpointSlice failure aborts this service and is
    /// returned. Route failures are recorded in `errors` and the remaining
    /// routes are still applied.
    async fn apply_projection(
        &self,
        projection: &Projection,
        gateways: &[String],
        summary: &mut SyncSummary,
        errors: &mut Vec<Error>,
    ) -> Result<(), Error> {
        self.client
            .apply_service(&projection.service)
            .await
            .map_err(|e| Error::apply("Service", &projection.name, e))?;

        self.client
            .apply_endpoint_slice(&projection.endpoint_slice)
            .await
            .map_err(|e| Error::apply("EndpointSlice", endpoint_slice_name(&projection.name), e))?;

        summary.services += 1;
        summary.endpoints += projection.endpoint_count;

        for gateway in gateways {
            let route = build_http_route(
                &projection.name,
                &self.namespace,
                projection.port,
                gateway,
                &self.routes,
            );
            match self.client.apply_http_route(&route).await {
                Ok(()) => {
                    summary.routes += 1;
                    info!(
                        route = %route.metadata.name,
                        gateway = %gateway,
                        hostname = %self.routes.hostname(&projection.name),
                        "applied httproute"
                    );
                }
                Err(e) => {
                    self.metrics.record_orchestrator_error();
                    error!(route = %route.metadata.name, error = %e, "failed to apply httproute, skipping");
                    errors.push(Error::apply("HTTPRoute", &route.metadata.name, e));
                }
            }
        }

        info!(
            service = %projection.name,
            endpoints = projection.endpoint_count,
            "synced service"
        );
        Ok(())
    }

    /// Delete managed Services that are not desired.
    ///
    /// A failed listing or a failed delete is surfaced.
    async fn cleanup_services(&self, desired: &DesiredSet, errors: &mut Vec<Error>) -> usize {
        let existing = match self.client.list_managed_services().await {
            Ok(names) => names,
            Err(e) => {
                self.metrics.record_orchestrator_error();
                error!(error = %e, "failed to list managed services");
                errors.push(e);
                return 0;
            }
        };

        let mut deleted = 0;
        for name in existing.iter().filter(|n| !desired.services.contains(*n)) {
            info!(service = %name, "deleting orphaned service");
            match self.client.delete_service(name).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    self.metrics.record_orchestrator_error();
                    error!(service = %name, error = %e, "failed to delete service");
                    errors.push(Error::delete("Service", name, e));
                }
            }
        }
        deleted
    }

    /// Delete managed EndpointSlices whose service is not desired.
    ///
    /// Slices are swept on their own rather than alongside their Service, so
    /// one left behind by a failed delete is retried on the next cycle even
    /// after the Service is gone. Failures are only logged.
    async fn cleanup_endpoint_slices(&self, desired: &DesiredSet) {
        let existing = match self.client.list_managed_endpoint_slices().await {
            Ok(slices) => slices,
            Err(e) => {
                self.metrics.record_orchestrator_error();
                error!(error = %e, "failed to list managed endpointslices");
                return;
            }
        };

        let orphans = existing.iter().filter(|slice| {
            !matches!(&slice.service, Some(service) if desired.services.contains(service))
        });
        for slice in orphans {
            info!(endpointslice = %slice.name, "deleting orphaned endpointslice");
            if let Err(e) = self.client.delete_endpoint_slice(&slice.name).await {
                self.metrics.record_orchestrator_error();
                error!(endpointslice = %slice.name, error = %e, "failed to delete endpointslice");
            }
        }
    }

    /// Delete managed HTTPRoutes that are not desired. Delete failures are only logged.
    async fn cleanup_routes(&self, desired: &DesiredSet, errors: &mut Vec<Error>) -> usize {
        let existing = match self.client.list_managed_http_routes().await {
            Ok(names) => names,
            Err(e) => {
                self.metrics.record_orchestrator_error();
                error!(error = %e, "failed to list managed httproutes");
                errors.push(e);
                return 0;
            }
        };

        let mut deleted = 0;
        for name in existing.iter().filter(|n| !desired.routes.contains(*n)) {
            info!(route = %name, "deleting orphaned httproute");
            match self.client.delete_http_route(name).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    self.metrics.record_orchestrator_error();
                    error!(route = %name, error = %e, "failed to delete httproute");
                }
            }
        }
        deleted
    }
}
