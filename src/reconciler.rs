//! Reconcile loop
//!
//! One consumer task drives every sync. It waits on two sources, the
//! watcher's snapshot channel and a fixed resync timer, so at most one sync
//! is ever in flight. Timer ticks that fall due during a sync collapse into a
//! single tick on the next iteration. A due tick is served before a pending
//! snapshot, so a churning catalog cannot postpone the resync.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::consul::{ChangeWatcher, ServiceState};
use crate::health::Readiness;
use crate::kubernetes::StateSyncer;
use crate::metrics::{MetricsSink, ReconcileOutcome};
use crate::Error;

/// What started a reconciliation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// The watcher saw the catalog change
    Watch,
    /// The resync timer fired
    Resync,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Watch => write!(f, "watch"),
            Trigger::Resync => write!(f, "resync"),
        }
    }
}

/// Serializes watch- and timer-triggered syncs
pub struct Reconciler {
    watcher: ChangeWatcher,
    syncer: StateSyncer,
    readiness: Readiness,
    metrics: Arc<dyn MetricsSink>,
    resync_interval: Duration,
}

impl Reconciler {
    /// Create a reconciler; nothing runs until [`run`](Self::run)
    pub fn new(
        watcher: ChangeWatcher,
        syncer: StateSyncer,
        readiness: Readiness,
        metrics: Arc<dyn MetricsSink>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            watcher,
            syncer,
            readiness,
            metrics,
            resync_interval,
        }
    }

    /// Run until `token` is cancelled.
    ///
    /// The first resync fires one interval after start; the watcher's
    /// initial snapshot covers startup.
    pub async fn run(self, token: CancellationToken) -> Result<(), Error> {
        info!(
            resync_interval_secs = self.resync_interval.as_secs(),
            "starting reconciler"
        );

        let mut snapshots = self.watcher.watch(token.child_token());
        let mut resync = interval_at(Instant::now() + self.resync_interval, self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                _ = resync.tick() => self.resync(&token).await,

                snapshot = snapshots.recv() => match snapshot {
                    Some(states) => self.reconcile(Trigger::Watch, &states, &token).await,
                    None if token.is_cancelled() => break,
                    None => {
                        return Err(Error::internal_with_context(
                            "reconciler",
                            "consul watch stream closed unexpectedly",
                        ));
                    }
                },
            }
        }

        info!("reconciler stopped");
        Ok(())
    }

    /// Fetch everything and sync; a failed fetch skips the cycle
    async fn resync(&self, token: &CancellationToken) {
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            res = self.watcher.fetch_all_now() => res,
        };

        match fetched {
            Ok(states) => self.reconcile(Trigger::Resync, &states, token).await,
            Err(e) => {
                self.metrics.record_reconcile(ReconcileOutcome::Error);
                warn!(trigger = %Trigger::Resync, error = %e, "resync fetch failed, skipping cycle");
            }
        }
    }

    async fn reconcile(&self, trigger: Trigger, states: &[ServiceState], token: &CancellationToken) {
        info!(trigger = %trigger, services = states.len(), "reconciling");

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(trigger = %trigger, "reconciliation interrupted by shutdown");
                return;
            }
            res = self.syncer.sync(states) => res,
        };

        match result {
            Ok(summary) => {
                self.metrics.record_reconcile(ReconcileOutcome::Success);
                self.readiness.mark_ready();
                info!(
                    trigger = %trigger,
                    services = summary.services,
                    endpoints = summary.endpoints,
                    routes = summary.routes,
                    deleted = summary.deleted,
                    outcome = ReconcileOutcome::Success.as_str(),
                    "reconciliation complete"
                );
            }
            Err(e) => {
                self.metrics.record_reconcile(ReconcileOutcome::Error);
                error!(
                    trigger = %trigger,
                    outcome = ReconcileOutcome::Error.as_str(),
                    error = %e,
                    "reconciliation failed"
                );
            }
        }
    }
}
