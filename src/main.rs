//! consul-sync binary

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use consul_sync::config::Config;
use consul_sync::consul::{ChangeWatcher, ConsulClient};
use consul_sync::health::{self, BuildInfo, Readiness};
use consul_sync::kubernetes::{create_client, KubeClusterClient, StateSyncer};
use consul_sync::metrics::{MetricsSink, OtelMetrics};
use consul_sync::reconciler::Reconciler;
use consul_sync::telemetry::{init_telemetry, TelemetryConfig};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CONSUL_SYNC_GIT_COMMIT"),
    ")"
);

/// Sync Consul services into Kubernetes Services, EndpointSlices and HTTPRoutes
#[derive(Parser, Debug)]
#[command(name = "consul-sync", version = VERSION, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let config = cli.config;

    let registry =
        init_telemetry(TelemetryConfig::default()).context("failed to initialize telemetry")?;
    config.validate()?;

    let build = BuildInfo::current();
    info!(
        version = %build.version,
        commit = %build.commit,
        consul_addr = %config.consul_addr,
        consul_tag = %config.consul_tag,
        target_namespace = %config.target_namespace,
        resync_interval_secs = config.resync_interval.as_secs(),
        enable_httproutes = config.enable_httproutes,
        "starting consul-sync"
    );

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    let kube = create_client()
        .await
        .context("failed to create kubernetes client")?;
    let metrics: Arc<dyn MetricsSink> =
        Arc::new(OtelMetrics::new(&opentelemetry::global::meter("consul-sync")));

    let consul = ConsulClient::new(config.consul_config()).context("invalid consul settings")?;
    let watcher = ChangeWatcher::new(Arc::new(consul), metrics.clone());
    let syncer = StateSyncer::new(
        Arc::new(KubeClusterClient::new(kube, &config.target_namespace)),
        &config.target_namespace,
        config.route_config(),
        metrics.clone(),
    );

    let readiness = Readiness::new();
    let health_server = {
        let readiness = readiness.clone();
        let token = token.clone();
        let addr = config.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, readiness, build, registry, token.clone()).await {
                error!(error = %e, "health server error");
                token.cancel();
            }
        })
    };

    let reconciler = Reconciler::new(
        watcher,
        syncer,
        readiness,
        metrics,
        config.resync_interval,
    );
    let result = reconciler.run(token.clone()).await;
    token.cancel();

    if let Err(e) = health_server.await {
        error!(error = %e, "health server task failed");
    }

    result.context("reconciler failed")?;
    info!("consul-sync stopped");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
        _ = token.cancelled() => return,
    }

    info!("shutdown signal received");
    token.cancel();
}
