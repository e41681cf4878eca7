use std::sync::Arc;

use actix_web::{get, web, App, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use pvc_clone_upload::config::ReconcilerConfig;
use pvc_clone_upload::metrics::Metrics;
use pvc_clone_upload::reconciler::{self, Context as ReconcilerContext};
use pvc_clone_upload::telemetry;
use tracing::info;

#[get("/healthz")]
async fn healthz() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

#[get("/metrics")]
async fn metrics_route(metrics: web::Data<Metrics>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics.encode())
}

async fn run_metrics_server(addr: String, metrics: Arc<Metrics>) -> std::io::Result<()> {
    let data = web::Data::from(metrics);
    HttpServer::new(move || App::new().app_data(data.clone()).service(healthz).service(metrics_route))
        .bind(addr)?
        .run()
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();

    let config = ReconcilerConfig::parse();

    info!("starting pvc-clone-upload clone-reconciler");
    info!(requeue_secs = config.reconcile_requeue_secs, "reconcile requeue interval");

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let metrics = Arc::new(Metrics::new());
    let metrics_server = tokio::spawn(run_metrics_server(config.metrics_bind_addr.clone(), metrics.clone()));

    let ctx = ReconcilerContext::new(client, &config, metrics)
        .context("failed to build reconciler context")?;

    reconciler::run(ctx).await;
    metrics_server.abort();
    Ok(())
}
