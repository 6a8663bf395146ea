//! Kubernetes side of the synchronizer
//!
//! - [`resources`] - typed builders for the derived objects
//! - [`client`] - apply/list/delete seam over the Kubernetes API
//! - [`syncer`] - turns a Consul snapshot into applies and orphan deletes
//!
//! Every derived object carries `app.kubernetes.io/managed-by=consul-sync`.
//! Listing and deletion are scoped by that label, so objects created by
//! hand are never touched.

pub mod client;
pub mod resources;
pub mod syncer;

pub use client::{create_client, ClusterClient, KubeClusterClient, ManagedEndpointSlice};
pub use resources::{HttpRoute, RouteBinding, RouteConfig};
pub use syncer::{StateSyncer, SyncSummary};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "consul-sync";

/// Label marking objects owned by this process
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of [`LABEL_MANAGED_BY`]
pub const MANAGED_BY: &str = "consul-sync";
/// Label carrying the sanitized service name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Label linking an EndpointSlice to its Service
pub const LABEL_SERVICE_NAME: &str = "kubernetes.io/service-name";
/// EndpointSlice controller ownership label
pub const LABEL_ENDPOINTSLICE_MANAGED_BY: &str = "endpointslice.kubernetes.io/managed-by";

/// Suffix appended to the Service name to name its EndpointSlice
pub const ENDPOINT_SLICE_SUFFIX: &str = "-consul";
/// Name of the single Service / EndpointSlice port
pub const PORT_NAME: &str = "http";
/// Longest name allowed for a Service (DNS-1035 label)
pub const MAX_NAME_LENGTH: usize = 63;

/// Label selector matching every managed object
pub fn managed_selector() -> String {
    format!("{LABEL_MANAGED_BY}={MANAGED_BY}")
}

/// Convert a Consul service name into a legal Kubernetes object name.
///
/// Lowercases, turns every run of characters outside `[a-z0-9]` into a single
/// hyphen, strips leading/trailing hyphens and truncates to 63 characters.
/// Applying it twice gives the same result as applying it once. Distinct
/// Consul names can collide (`web_api` and `web-api`); the later one wins.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(MAX_NAME_LENGTH));
    let mut pending_hyphen = false;

    for c in name.chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    if out.len() > MAX_NAME_LENGTH {
        out.truncate(MAX_NAME_LENGTH);
        let trimmed = out.trim_end_matches('-').len();
        out.truncate(trimmed);
    }
    out
}

/// EndpointSlice name for a sanitized service name
pub fn endpoint_slice_name(service: &str) -> String {
    format!("{service}{ENDPOINT_SLICE_SUFFIX}")
}

/// HTTPRoute name for a sanitized service name and gateway
pub fn route_name(service: &str, gateway: &str) -> String {
    format!("{service}-{gateway}")
}
