//! Metrics for consul-sync observability
//!
//! The reconciliation core only sees the [`MetricsSink`] trait, handed to it
//! at construction time. `main` wires in [`OtelMetrics`], built from the
//! process meter; tests and embedders can use [`InMemoryMetrics`].
//!
//! Exported instruments:
//! - `consul_sync_services_total` / `consul_sync_endpoints_total` /
//!   `consul_sync_httproutes_total` gauges (state after the last sync)
//! - `consul_sync_reconcile_total{status}` counter
//! - `consul_sync_consul_errors_total` / `consul_sync_kubernetes_errors_total` counters

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Outcome label for a reconciliation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Sync completed without any error
    Success,
    /// Sync reported an error, or the resync fetch failed
    Error,
}

impl ReconcileOutcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Sink for everything the reconciliation core measures.
pub trait MetricsSink: Send + Sync {
    /// Number of services projected by the last sync
    fn set_synced_services(&self, count: u64);
    /// Number of endpoints written by the last sync
    fn set_synced_endpoints(&self, count: u64);
    /// Number of HTTPRoutes applied by the last sync
    fn set_synced_routes(&self, count: u64);
    /// One reconciliation cycle finished
    fn record_reconcile(&self, outcome: ReconcileOutcome);
    /// A Consul request failed
    fn record_registry_error(&self);
    /// A Kubernetes API call failed
    fn record_orchestrator_error(&self);
}

/// OpenTelemetry-backed metrics.
pub struct OtelMetrics {
    synced_services: Gauge<u64>,
    synced_endpoints: Gauge<u64>,
    synced_routes: Gauge<u64>,
    reconcile_total: Counter<u64>,
    consul_errors: Counter<u64>,
    kubernetes_errors: Counter<u64>,
}

impl OtelMetrics {
    /// Build all instruments from the given meter
    pub fn new(meter: &Meter) -> Self {
        Self {
            synced_services: meter
                .u64_gauge("consul_sync_services_total")
                .with_description("Number of currently synced services")
                .with_unit("{services}")
                .build(),
            synced_endpoints: meter
                .u64_gauge("consul_sync_endpoints_total")
                .with_description("Total number of endpoints across all synced services")
                .with_unit("{endpoints}")
                .build(),
            synced_routes: meter
                .u64_gauge("consul_sync_httproutes_total")
                .with_description("Number of currently synced HTTPRoutes")
                .with_unit("{routes}")
                .build(),
            reconcile_total: meter
                .u64_counter("consul_sync_reconcile_total")
                .with_description("Total reconciliations performed")
                .with_unit("{reconciliations}")
                .build(),
            consul_errors: meter
                .u64_counter("consul_sync_consul_errors_total")
                .with_description("Total errors communicating with Consul")
                .with_unit("{errors}")
                .build(),
            kubernetes_errors: meter
                .u64_counter("consul_sync_kubernetes_errors_total")
                .with_description("Total errors communicating with the Kubernetes API")
                .with_unit("{errors}")
                .build(),
        }
    }
}

impl MetricsSink for OtelMetrics {
    fn set_synced_services(&self, count: u64) {
        self.synced_services.record(count, &[]);
    }

    fn set_synced_endpoints(&self, count: u64) {
        self.synced_endpoints.record(count, &[]);
    }

    fn set_synced_routes(&self, count: u64) {
        self.synced_routes.record(count, &[]);
    }

    fn record_reconcile(&self, outcome: ReconcileOutcome) {
        self.reconcile_total
            .add(1, &[KeyValue::new("status", outcome.as_str())]);
    }

    fn record_registry_error(&self) {
        self.consul_errors.add(1, &[]);
    }

    fn record_orchestrator_error(&self) {
        self.kubernetes_errors.add(1, &[]);
    }
}

/// Point-in-time view of [`InMemoryMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Last synced service count
    pub synced_services: u64,
    /// Last synced endpoint count
    pub synced_endpoints: u64,
    /// Last synced route count
    pub synced_routes: u64,
    /// Successful reconciliations
    pub reconcile_success: u64,
    /// Failed reconciliations
    pub reconcile_error: u64,
    /// Consul errors
    pub registry_errors: u64,
    /// Kubernetes errors
    pub orchestrator_errors: u64,
}

/// Metrics kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    synced_services: AtomicU64,
    synced_endpoints: AtomicU64,
    synced_routes: AtomicU64,
    reconcile_success: AtomicU64,
    reconcile_error: AtomicU64,
    registry_errors: AtomicU64,
    orchestrator_errors: AtomicU64,
}

impl InMemoryMetrics {
    /// Create a sink with every value at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            synced_services: self.synced_services.load(Ordering::Relaxed),
            synced_endpoints: self.synced_endpoints.load(Ordering::Relaxed),
            synced_routes: self.synced_routes.load(Ordering::Relaxed),
            reconcile_success: self.reconcile_success.load(Ordering::Relaxed),
            reconcile_error: self.reconcile_error.load(Ordering::Relaxed),
            registry_errors: self.registry_errors.load(Ordering::Relaxed),
            orchestrator_errors: self.orchestrator_errors.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn set_synced_services(&self, count: u64) {
        self.synced_services.store(count, Ordering::Relaxed);
    }

    fn set_synced_endpoints(&self, count: u64) {
        self.synced_endpoints.store(count, Ordering::Relaxed);
    }

    fn set_synced_routes(&self, count: u64) {
        self.synced_routes.store(count, Ordering::Relaxed);
    }

    fn record_reconcile(&self, outcome: ReconcileOutcome) {
        let counter = match outcome {
            ReconcileOutcome::Success => &self.reconcile_success,
            ReconcileOutcome::Error => &self.reconcile_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_registry_error(&self) {
        self.registry_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_orchestrator_error(&self) {
        self.orchestrator_errors.fetch_add(1, Ordering::Relaxed);
    }
}
