//! exportd-controller: common reconciler binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::CustomResourceExt;
use tracing::{info, warn};

use exportd_common::api::{create_client, KubeClusterApi};
use exportd_common::crd::{NfsExport, NfsExportClass, NfsExportContent};
use exportd_common::events::KubeEventPublisher;
use exportd_common::leader_election::LeaderElector;
use exportd_common::queue::{RateLimiter, WorkQueue};
use exportd_common::telemetry;
use exportd_common::EXPORTD_SYSTEM_NAMESPACE;
use exportd_controller::controller::{CommonConfig, CommonController};
use exportd_controller::runner;

/// Common reconciler for NfsExport objects.
#[derive(Parser, Debug)]
#[command(name = "exportd-controller", version, about)]
struct Cli {
    /// Print the CRD manifests and exit.
    #[arg(long)]
    crd: bool,

    /// Interval between full re-syncs of the caches.
    #[arg(long, default_value = "15m", value_parser = humantime::parse_duration)]
    resync_period: Duration,

    /// Number of concurrent reconcile workers per queue.
    #[arg(long, default_value_t = 10)]
    workers: usize,

    /// Initial retry delay of the queue rate limiters.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    retry_interval_start: Duration,

    /// Maximum retry delay of the queue rate limiters.
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    retry_interval_max: Duration,

    /// Label contents with the owning node for node-local volumes.
    #[arg(long)]
    enable_distributed_export: bool,

    /// Record the source volume mode on created contents and reject its
    /// mutation in the webhook.
    #[arg(long)]
    prevent_volume_mode_conversion: bool,

    /// Use leader election.
    #[arg(long)]
    leader_election: bool,

    /// Namespace for the leader-election lease.
    #[arg(long, default_value = EXPORTD_SYSTEM_NAMESPACE)]
    leader_election_namespace: String,

    /// Address of the metrics endpoint.
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: std::net::SocketAddr,

    /// Path to a kubeconfig; in-cluster configuration when unset.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [
            serde_yaml::to_string(&NfsExport::crd())?,
            serde_yaml::to_string(&NfsExportContent::crd())?,
            serde_yaml::to_string(&NfsExportClass::crd())?,
        ] {
            println!("---");
            println!("{crd}");
        }
        return Ok(());
    }

    telemetry::init_logging(cli.json_logs);
    info!("Starting exportd-controller");

    let client = create_client(cli.kubeconfig.as_deref()).await?;

    let metrics = exportd_metrics::OperationMetrics::new();
    let _resync = metrics.spawn_in_flight_resync();
    {
        let metrics = Arc::clone(&metrics);
        let addr = cli.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = exportd_metrics::serve(metrics, addr).await {
                warn!(error = %e, "metrics server exited");
            }
        });
    }

    let _leader_guard = if cli.leader_election {
        let identity = std::env::var("POD_NAME")
            .unwrap_or_else(|_| format!("exportd-controller-{}", std::process::id()));
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            "exportd-controller-leader",
            &cli.leader_election_namespace,
            &identity,
        ));
        Some(elector.acquire().await?)
    } else {
        None
    };

    let limiter = RateLimiter::new(cli.retry_interval_start, cli.retry_interval_max);
    let controller = Arc::new(CommonController::new(
        Arc::new(KubeClusterApi::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client.clone(), "exportd-controller")),
        metrics,
        WorkQueue::new(limiter),
        WorkQueue::new(limiter),
        CommonConfig {
            enable_distributed_export: cli.enable_distributed_export,
            prevent_volume_mode_conversion: cli.prevent_volume_mode_conversion,
        },
    ));

    runner::run(controller, client, cli.workers, cli.resync_period, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    Ok(())
}
