//! consul-sync - one-way projection of Consul services into Kubernetes
//!
//! Consul is the source of truth. For every passing service carrying the
//! configured tag, consul-sync keeps a headless Service, an EndpointSlice and
//! optionally Gateway API HTTPRoutes in one namespace, and deletes what it
//! created once the service goes away.
//!
//! # Architecture
//!
//! Data flows one way:
//!
//! ```text
//! ConsulClient -> ChangeWatcher -> Reconciler -> StateSyncer -> Kubernetes API
//! ```
//!
//! The watcher turns Consul blocking queries into a stream of full snapshots.
//! The reconciler serializes those with a periodic full resync, which covers
//! changes blocking queries can miss. The syncer is stateless: each call
//! applies the snapshot and deletes orphans.
//!
//! # Modules
//!
//! - [`consul`] - Consul HTTP client and change watcher
//! - [`kubernetes`] - object builders, cluster client and the syncer
//! - [`reconciler`] - the loop tying watch, resync and sync together
//! - [`health`] - readiness flag and `/healthz`, `/readyz`, `/version`, `/metrics`
//! - [`metrics`] - metric sink handed to the components
//! - [`config`] - flags and environment
//! - [`telemetry`] - logging, metrics registry and OTLP export
//! - [`retry`] - exponential backoff
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod config;
pub mod consul;
pub mod error;
pub mod health;
pub mod kubernetes;
pub mod metrics;
pub mod reconciler;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
