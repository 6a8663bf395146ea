//! Typed builders for the objects derived from one Consul service
//!
//! A [`Projection`] is everything one `ServiceState` turns into: a headless
//! Service, one EndpointSlice and zero or more HTTPRoutes. Building it is
//! pure; applying it is the syncer's job.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as KubeObjectMeta;
use kube::api::ApiResource;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{
    endpoint_slice_name, route_name, sanitize_name, LABEL_ENDPOINTSLICE_MANAGED_BY,
    LABEL_MANAGED_BY, LABEL_NAME, LABEL_SERVICE_NAME, MANAGED_BY, PORT_NAME,
};
use crate::consul::{ServiceInstance, ServiceState};
use crate::Error;

const PROTOCOL_TCP: &str = "TCP";

// =============================================================================
// Route configuration
// =============================================================================

/// Binds a Consul tag to the gateway its routes attach to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteBinding {
    /// Tag that opts a service into this gateway
    pub tag: String,
    /// Gateway name
    pub gateway: String,
}

impl RouteBinding {
    /// Create a binding
    pub fn new(tag: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            gateway: gateway.into(),
        }
    }
}

/// Settings for generated HTTPRoutes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteConfig {
    /// Whether routes are generated and cleaned up at all
    pub enabled: bool,
    /// Hostnames are `<service>.<domain_suffix>`
    pub domain_suffix: String,
    /// Namespace of the gateways
    pub gateway_namespace: String,
    /// Listener (sectionName) on each gateway
    pub listener: String,
    /// Tag to gateway bindings, checked in order
    pub bindings: Vec<RouteBinding>,
}

impl RouteConfig {
    /// Route generation turned off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            domain_suffix: String::new(),
            gateway_namespace: String::new(),
            listener: String::new(),
            bindings: Vec::new(),
        }
    }

    /// Hostname served for a sanitized service name
    pub fn hostname(&self, service: &str) -> String {
        format!("{service}.{}", self.domain_suffix)
    }
}

// =============================================================================
// HTTPRoute types
// =============================================================================

/// Metadata for the HTTPRoute document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Metadata carrying the managed-by marker and the service name label
    pub fn managed(name: impl Into<String>, namespace: impl Into<String>, service: &str) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: managed_labels(service),
        }
    }
}

/// Gateway API HTTPRoute, limited to the fields this process sets
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    /// API version (gateway.networking.k8s.io/v1)
    #[serde(default = "HttpRoute::default_api_version")]
    pub api_version: String,
    /// Resource kind (HTTPRoute)
    #[serde(default = "HttpRoute::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// HTTPRoute specification
    pub spec: HttpRouteSpec,
}

impl HttpRoute {
    /// API group and version
    pub const API_VERSION: &'static str = "gateway.networking.k8s.io/v1";
    /// Kind
    pub const KIND: &'static str = "HTTPRoute";
    const GROUP: &'static str = "gateway.networking.k8s.io";
    const VERSION: &'static str = "v1";
    const PLURAL: &'static str = "httproutes";

    fn default_api_version() -> String {
        Self::API_VERSION.to_string()
    }

    fn default_kind() -> String {
        Self::KIND.to_string()
    }

    /// Create a new HTTPRoute
    pub fn new(metadata: ObjectMeta, spec: HttpRouteSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }

    /// API resource for use with `Api<DynamicObject>`
    pub fn api_resource() -> ApiResource {
        ApiResource {
            group: Self::GROUP.to_string(),
            version: Self::VERSION.to_string(),
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            plural: Self::PLURAL.to_string(),
        }
    }
}

/// HTTPRoute spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteSpec {
    /// Parent gateway references
    pub parent_refs: Vec<ParentRef>,
    /// Hostnames to match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,
    /// Routing rules
    pub rules: Vec<HttpRouteRule>,
}

/// Parent reference to a gateway listener
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    /// Gateway name
    pub name: String,
    /// Gateway namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Listener section name to bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
}

/// HTTPRoute rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteRule {
    /// Backend references
    pub backend_refs: Vec<BackendRef>,
}

/// Backend reference to a Service port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendRef {
    /// Service name
    pub name: String,
    /// Service port
    pub port: i32,
}

// =============================================================================
// Projection
// =============================================================================

/// Everything one Consul service projects into
#[derive(Clone, Debug)]
pub struct Projection {
    /// Sanitized name shared by the Service and its labels
    pub name: String,
    /// Port taken from the first instance
    pub port: i32,
    /// Headless Service
    pub service: Service,
    /// EndpointSlice listing the instances
    pub endpoint_slice: EndpointSlice,
    /// Number of endpoints in the slice
    pub endpoint_count: usize,
}

impl Projection {
    /// Build the Service and EndpointSlice for a service with instances.
    ///
    /// Fails with `InvalidServiceData` when the name sanitizes to nothing,
    /// there are no instances, or the first instance's port is out of range.
    pub fn build(state: &ServiceState, namespace: &str) -> Result<Self, Error> {
        let name = sanitize_name(&state.name);
        if name.is_empty() {
            return Err(Error::invalid_service(
                &state.name,
                "name has no characters valid in a Kubernetes name",
            ));
        }
        let first = state
            .instances
            .first()
            .ok_or_else(|| Error::invalid_service(&state.name, "no healthy instances"))?;
        let port = validate_port(&state.name, first.port)?;

        let endpoint_slice = build_endpoint_slice(&name, namespace, port, &state.instances)?;
        let endpoint_count = endpoint_slice.endpoints.len();

        Ok(Self {
            service: build_service(&name, namespace, port),
            endpoint_slice,
            endpoint_count,
            name,
            port,
        })
    }
}

/// Check a registered port fits a Kubernetes port number
pub fn validate_port(service: &str, port: i64) -> Result<i32, Error> {
    match i32::try_from(port) {
        Ok(p) if (1..=65535).contains(&p) => Ok(p),
        _ => Err(Error::invalid_service(
            service,
            format!("port {port} is outside 1-65535"),
        )),
    }
}

fn managed_labels(service: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_NAME.to_string(), service.to_string()),
    ])
}

/// Headless ClusterIP Service with a single TCP port named `http`
pub fn build_service(name: &str, namespace: &str, port: i32) -> Service {
    Service {
        metadata: KubeObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels(name)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_string()),
                port,
                protocol: Some(PROTOCOL_TCP.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Address family of an instance address, as EndpointSlice names it
pub fn address_type(address: &str) -> &'static str {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => "IPv4",
        Ok(IpAddr::V6(_)) => "IPv6",
        Err(_) => "FQDN",
    }
}

/// EndpointSlice with one ready endpoint per instance.
///
/// A slice holds a single address family, taken from the first instance.
/// Instances of another family are left out with a warning.
pub fn build_endpoint_slice(
    name: &str,
    namespace: &str,
    port: i32,
    instances: &[ServiceInstance],
) -> Result<EndpointSlice, Error> {
    let family = instances
        .iter()
        .find(|i| !i.address.is_empty())
        .map(|i| address_type(&i.address))
        .ok_or_else(|| Error::invalid_service(name, "no instance has an address"))?;

    let endpoints = instances
        .iter()
        .filter(|instance| {
            if instance.address.is_empty() {
                warn!(service = %name, "skipping instance without address");
                return false;
            }
            let kind = address_type(&instance.address);
            if kind != family {
                warn!(
                    service = %name,
                    address = %instance.address,
                    address_type = kind,
                    slice_address_type = family,
                    "skipping instance with mismatched address type"
                );
                return false;
            }
            true
        })
        .map(|instance| Endpoint {
            addresses: vec![instance.address.clone()],
            conditions: Some(EndpointConditions {
                ready: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    let mut labels = managed_labels(name);
    labels.insert(LABEL_SERVICE_NAME.to_string(), name.to_string());
    labels.insert(
        LABEL_ENDPOINTSLICE_MANAGED_BY.to_string(),
        MANAGED_BY.to_string(),
    );

    Ok(EndpointSlice {
        metadata: KubeObjectMeta {
            name: Some(endpoint_slice_name(name)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        address_type: family.to_string(),
        endpoints,
        ports: Some(vec![EndpointPort {
            name: Some(PORT_NAME.to_string()),
            port: Some(port),
            protocol: Some(PROTOCOL_TCP.to_string()),
            ..Default::default()
        }]),
    })
}

/// HTTPRoute sending `<service>.<suffix>` through one gateway listener to the Service
pub fn build_http_route(
    service: &str,
    namespace: &str,
    port: i32,
    gateway: &str,
    routes: &RouteConfig,
) -> HttpRoute {
    HttpRoute::new(
        ObjectMeta::managed(route_name(service, gateway), namespace, service),
        HttpRouteSpec {
            parent_refs: vec![ParentRef {
                name: gateway.to_string(),
                namespace: Some(routes.gateway_namespace.clone()),
                section_name: Some(routes.listener.clone()),
            }],
            hostnames: vec![routes.hostname(service)],
            rules: vec![HttpRouteRule {
                backend_refs: vec![BackendRef {
                    name: service.to_string(),
                    port,
                }],
            }],
        },
    )
}
