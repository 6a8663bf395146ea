//! Change watcher built on Consul blocking queries
//!
//! A background task long-polls the catalog with the last seen index. When
//! the index moves (or on the very first answer) it fetches the passing
//! instances of every listed service and hands the complete snapshot to the
//! consumer through a single-slot channel: while the consumer is still busy
//! with the previous snapshot the next send waits, which keeps the watcher
//! at the consumer's pace without an unbounded queue.
//!
//! The index only moves forward within one watch. An answer with a lower
//! index means Consul started over, and the watch restarts from a
//! non-blocking query. Blocking queries can still miss changes across agent
//! restarts, so the reconciler also calls [`ChangeWatcher::fetch_all_now`] on
//! a timer.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ChangeIndex, RegistryClient, ServiceState};
use crate::metrics::MetricsSink;
use crate::retry::{Backoff, BackoffConfig};
use crate::Error;

/// Concurrent health queries per snapshot
const MAX_CONCURRENT_FETCHES: usize = 8;

/// Receiving end of [`ChangeWatcher::watch`]
pub type SnapshotReceiver = mpsc::Receiver<Vec<ServiceState>>;

/// Emits full service snapshots whenever the Consul catalog changes.
#[derive(Clone)]
pub struct ChangeWatcher {
    client: Arc<dyn RegistryClient>,
    metrics: Arc<dyn MetricsSink>,
    backoff: BackoffConfig,
}

impl ChangeWatcher {
    /// Create a watcher with the default 1s..30s backoff
    pub fn new(client: Arc<dyn RegistryClient>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            client,
            metrics,
            backoff: BackoffConfig::default(),
        }
    }

    /// Override the failure backoff
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start the watch loop in the background.
    ///
    /// The returned channel holds at most one pending snapshot. It closes
    /// when `token` is cancelled.
    pub fn watch(&self, token: CancellationToken) -> SnapshotReceiver {
        let (tx, rx) = mpsc::channel(1);
        let watcher = self.clone();
        tokio::spawn(async move {
            watcher.run(tx, token).await;
            debug!("consul watch loop exited");
        });
        rx
    }

    async fn run(self, tx: mpsc::Sender<Vec<ServiceState>>, token: CancellationToken) {
        let mut index = ChangeIndex::NONE;
        let mut backoff = Backoff::new(self.backoff.clone());

        loop {
            let listed = tokio::select! {
                _ = token.cancelled() => return,
                res = self.client.list_services(index) => res,
            };

            let page = match listed {
                Ok(page) => page,
                Err(e) => {
                    let delay = backoff.next_delay();
                    self.metrics.record_registry_error();
                    error!(error = %e, backoff_ms = delay.as_millis() as u64, "failed to list consul services");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };
            backoff.reset();

            if !index.is_none() && page.index < index {
                // Consul restarted or lost its raft state; start over with a
                // non-blocking query instead of waiting for the old index
                warn!(
                    previous = %index,
                    returned = %page.index,
                    "consul index went backwards, restarting watch"
                );
                index = ChangeIndex::NONE;
                continue;
            }
            if !index.is_none() && page.index == index {
                continue;
            }
            index = page.index;

            info!(services = ?page.names, index = %index, "consul services changed");

            let states = tokio::select! {
                _ = token.cancelled() => return,
                states = self.fetch_states(page.names, "watch") => states,
            };

            tokio::select! {
                _ = token.cancelled() => return,
                sent = tx.send(states) => {
                    if sent.is_err() {
                        debug!("snapshot receiver dropped");
                        return;
                    }
                }
            }
        }
    }

    /// Fetch the complete current picture without a blocking query.
    ///
    /// Used by the periodic resync; the change index is neither read nor
    /// updated.
    pub async fn fetch_all_now(&self) -> Result<Vec<ServiceState>, Error> {
        let page = self
            .client
            .list_services(ChangeIndex::NONE)
            .await
            .inspect_err(|_| self.metrics.record_registry_error())?;
        Ok(self.fetch_states(page.names, "resync").await)
    }

    /// Fetch instances for every name, keeping the catalog order.
    ///
    /// A service whose instances cannot be fetched is still reported, with
    /// no instances: dropping it would make its objects look orphaned.
    async fn fetch_states(&self, names: Vec<String>, trigger: &'static str) -> Vec<ServiceState> {
        stream::iter(names)
            .map(|name| async move {
                match self.client.service_instances(&name).await {
                    Ok(instances) => ServiceState::new(name, instances),
                    Err(e) => {
                        self.metrics.record_registry_error();
                        error!(service = %name, trigger, error = %e, "failed to get service instances");
                        ServiceState::without_instances(name)
                    }
                }
            })
            .buffered(MAX_CONCURRENT_FETCHES)
            .collect()
            .await
    }
}
