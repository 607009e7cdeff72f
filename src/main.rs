use anpr_gateway::{datastore, server, Config, IngestContext};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting ANPR Gateway"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Connect the datastore (PostgreSQL, falling back to SQLite)
    let store = datastore::connect(&config.database)
        .await
        .context("Failed to initialize datastore")?;

    info!(backend = store.backend_name(), "Datastore ready");

    let resync = config.storage.resync_on_start;
    let host = config.http.host.clone();
    let port = config.http.port;

    let ctx = Arc::new(IngestContext::new(config, store).context("Failed to build context")?);

    if resync {
        let recovered = ctx
            .gateway
            .resync()
            .await
            .context("Failed to resync datastore from JSON artifacts")?;
        info!(recovered, "Datastore resync complete");
    }

    server::start_server(ctx, &host, port).await
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}
