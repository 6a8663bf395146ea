//! Consul side of the synchronizer
//!
//! - [`client`] - HTTP access to the catalog and health endpoints
//! - [`watcher`] - blocking-query loop that emits full snapshots on change

pub mod client;
pub mod watcher;

use std::collections::BTreeSet;
use std::fmt;

pub use client::{CatalogPage, ConsulClient, ConsulConfig, RegistryClient};
pub use watcher::ChangeWatcher;

/// Name of Consul's own catalog entry, never projected
pub const CONSUL_SERVICE_NAME: &str = "consul";

/// A single healthy instance of a Consul service.
///
/// Built fresh from every health query and never mutated afterwards. The
/// port is kept as reported so that out-of-range values reach the syncer,
/// which skips the service instead of failing the whole fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Registry service name
    pub service_name: String,
    /// IP or hostname; the node address when the service registered none
    pub address: String,
    /// Port as registered
    pub port: i64,
    /// Registration tags
    pub tags: BTreeSet<String>,
}

/// A Consul service and its currently passing instances.
///
/// An empty instance list is a real state (no healthy backends) and is
/// different from the service being absent from a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceState {
    /// Registry service name
    pub name: String,
    /// Passing instances in the order Consul returned them
    pub instances: Vec<ServiceInstance>,
}

impl ServiceState {
    /// Create a state
    pub fn new(name: impl Into<String>, instances: Vec<ServiceInstance>) -> Self {
        Self {
            name: name.into(),
            instances,
        }
    }

    /// A service that exists but has no passing instances (or could not be fetched)
    pub fn without_instances(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Whether any instance carries the tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.instances.iter().any(|i| i.tags.contains(tag))
    }
}

/// Consul's `X-Consul-Index` for blocking queries.
///
/// Zero only ever appears before the first query; every index read from a
/// response is at least 1, since querying with 0 returns immediately and
/// would spin the watcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChangeIndex(u64);

impl ChangeIndex {
    /// Non-blocking index used for the first query and for resyncs
    pub const NONE: ChangeIndex = ChangeIndex(0);

    /// Smallest index a response can yield
    pub const FLOOR: ChangeIndex = ChangeIndex(1);

    /// Wrap a raw index, coercing zero to [`FLOOR`](Self::FLOOR)
    pub fn new(raw: u64) -> Self {
        Self(raw.max(Self::FLOOR.0))
    }

    /// Parse the response header value; missing or garbage reads as the floor
    pub fn from_header(value: Option<&str>) -> Self {
        value
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Self::new)
            .unwrap_or(Self::FLOOR)
    }

    /// Raw value for the `index` query parameter
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Whether no query has completed yet
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ChangeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
