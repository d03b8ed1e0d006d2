//! exportd-sidecar: driver-facing reconciler binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use exportd_common::api::{create_client, KubeClusterApi};
use exportd_common::events::KubeEventPublisher;
use exportd_common::leader_election::LeaderElector;
use exportd_common::queue::{RateLimiter, WorkQueue};
use exportd_common::telemetry;
use exportd_common::EXPORTD_SYSTEM_NAMESPACE;
use exportd_sidecar::controller::{SidecarConfig, SidecarController};
use exportd_sidecar::exporter::GrpcExportDriver;
use exportd_sidecar::handler::ContentHandler;
use exportd_sidecar::runner;

/// Sidecar reconciler for NfsExportContent objects.
#[derive(Parser, Debug)]
#[command(name = "exportd-sidecar", version, about)]
struct Cli {
    /// gRPC endpoint of the storage driver.
    #[arg(long, default_value = "http://127.0.0.1:9010")]
    driver_endpoint: String,

    /// Name of the driver this sidecar serves.
    #[arg(long)]
    driver_name: String,

    /// Timeout applied to every driver RPC.
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    rpc_timeout: Duration,

    /// Interval between full re-syncs of the content cache.
    #[arg(long, default_value = "15m", value_parser = humantime::parse_duration)]
    resync_period: Duration,

    /// Number of concurrent reconcile workers.
    #[arg(long, default_value_t = 10)]
    workers: usize,

    /// Initial retry delay of the queue rate limiter.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    retry_interval_start: Duration,

    /// Maximum retry delay of the queue rate limiter.
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    retry_interval_max: Duration,

    /// Prefix of driver-side export names.
    #[arg(long, default_value = "export")]
    export_name_prefix: String,

    /// Truncate the UID part of export names to this many characters after
    /// stripping dashes; -1 keeps the full UID.
    #[arg(long, default_value_t = -1)]
    export_name_uuid_length: i32,

    /// Inject export name/namespace/content name into CreateExport
    /// parameters. Strict drivers may reject unknown keys.
    #[arg(long)]
    extra_create_metadata: bool,

    /// Use leader election (one active sidecar per driver).
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
    telemetry::init_logging(cli.json_logs);

    info!(
        driver = %cli.driver_name,
        endpoint = %cli.driver_endpoint,
        "Starting exportd-sidecar"
    );

    let client = create_client(cli.kubeconfig.as_deref()).await?;

    let driver = GrpcExportDriver::connect(&cli.driver_endpoint)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to driver: {e}"))?;

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
            .unwrap_or_else(|_| format!("exportd-sidecar-{}", std::process::id()));
        let lease_name = format!("exportd-sidecar-{}", cli.driver_name.replace('.', "-"));
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &lease_name,
            &cli.leader_election_namespace,
            &identity,
        ));
        Some(elector.acquire().await?)
    } else {
        None
    };

    let handler = ContentHandler::new(
        Arc::new(driver),
        cli.rpc_timeout,
        cli.export_name_prefix.clone(),
        cli.export_name_uuid_length,
    );
    let queue = WorkQueue::new(RateLimiter::new(
        cli.retry_interval_start,
        cli.retry_interval_max,
    ));
    let controller = Arc::new(SidecarController::new(
        Arc::new(KubeClusterApi::new(client.clone())),
        Arc::new(KubeEventPublisher::new(
            client.clone(),
            &format!("exportd-sidecar {}", cli.driver_name),
        )),
        handler,
        queue,
        SidecarConfig {
            driver_name: cli.driver_name,
            extra_create_metadata: cli.extra_create_metadata,
        },
    ));

    runner::run(controller, client, cli.workers, cli.resync_period, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    Ok(())
}
