use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use pvc_clone_upload::config::ProxyConfig;
use pvc_clone_upload::metrics::Metrics;
use pvc_clone_upload::proxy;
use pvc_clone_upload::telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();

    let config = ProxyConfig::parse();

    info!(addr = %config.bind_addr, "starting pvc-clone-upload upload-proxy");

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let metrics = Arc::new(Metrics::new());
    let state = proxy::build_state(client, &config, metrics.clone())
        .context("failed to build proxy state")?;

    proxy::run(state, config).await.context("upload proxy exited with an error")
}
