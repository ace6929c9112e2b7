//! runsync - syncs console runs onto Kubernetes Jobs

use clap::Parser;
use kube::Client;

use runsync_common::telemetry::{init_telemetry, TelemetryConfig};
use runsync_operator::crds::{crd_yaml, ensure_crds_installed};
use runsync_operator::{runner, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS client is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             TLS connections to the API server and console cannot be made.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = crd_yaml().map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!("runsync controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CRDs: {}", e))?;

    runner::run(cli, client).await
}
