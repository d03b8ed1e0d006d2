//! exportd-webhook: validating admission webhook binary.
//!
//! Serves plain HTTP; TLS termination is left to the serving infrastructure
//! in front of the pod (the admission registration requires HTTPS).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use exportd_common::api::create_client;
use exportd_common::telemetry;
use exportd_webhook::server::{webhook_router, WebhookState};

/// Validating admission webhook for exportd resources.
#[derive(Parser, Debug)]
#[command(name = "exportd-webhook", version, about)]
struct Cli {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8443")]
    listen_addr: std::net::SocketAddr,

    /// Reject sourceVolumeMode mutation on contents.
    #[arg(long)]
    prevent_volume_mode_conversion: bool,

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

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let state = Arc::new(WebhookState::new(
        client,
        cli.prevent_volume_mode_conversion,
    ));

    info!(addr = %cli.listen_addr, "Starting exportd-webhook");
    let listener = tokio::net::TcpListener::bind(cli.listen_addr).await?;
    axum::serve(listener, webhook_router(state)).await?;
    Ok(())
}
