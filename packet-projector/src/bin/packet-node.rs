//! Packet node binary: ledger plus projected read model

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use packet_ledger::{InMemoryVault, Ledger, Metrics};
use packet_projector::{spawn_projector, Projector, ReadModel, RocksEntityStore};
use serde::Deserialize;
use std::sync::Arc;

/// Node configuration file: `[ledger]` and `[projector]` tables
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeConfig {
    ledger: packet_ledger::Config,
    projector: packet_projector::Config,
    /// JSON log lines instead of text
    log_json: bool,
}

impl NodeConfig {
    fn load() -> anyhow::Result<Self> {
        match std::env::args().nth(1).or_else(|| std::env::var("PACKET_NODE_CONFIG").ok()) {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config {}", path))?;
                toml::from_str(&content).with_context(|| format!("parsing config {}", path))
            }
            None => Ok(Self {
                ledger: packet_ledger::Config::from_env()?,
                projector: packet_projector::Config::from_env()?,
                log_json: std::env::var("PACKET_NODE_LOG_JSON").is_ok(),
            }),
        }
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> Response {
    match metrics.export() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to export metrics: {}", e),
        )
            .into_response(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::load()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        service = %config.ledger.service_name,
        version = %config.ledger.service_version,
        "Starting packet node"
    );

    // Balances are process-local; the ledger restores the escrow its open
    // packets still hold
    let vault = Arc::new(InMemoryVault::new());
    let ledger = Arc::new(Ledger::open(config.ledger.clone(), vault).context("opening ledger")?);
    let store = Arc::new(RocksEntityStore::open(&config.projector).context("opening entity store")?);

    // Subscribe before catching up; overlap is absorbed as duplicates
    let feed = ledger.subscribe();
    let mut projector = Projector::new(store.clone(), &config.projector)?;
    projector.catch_up(ledger.as_ref(), config.projector.catch_up_page)?;

    let handle = spawn_projector(projector, feed, ledger.clone(), &config.projector);
    let reads = ReadModel::new(store, config.projector.list_limit);

    let stats = handle.sync().await?;
    tracing::info!(
        cursor = stats.cursor,
        open_packets = reads.list_open_packets()?.len(),
        "Read model ready"
    );

    let listener = tokio::net::TcpListener::bind(&config.ledger.metrics_listen_addr)
        .await
        .with_context(|| format!("binding metrics on {}", config.ledger.metrics_listen_addr))?;
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(ledger.metrics().clone());
    tracing::info!(addr = %config.ledger.metrics_listen_addr, "Serving Prometheus metrics");
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down packet node");
    metrics_server.abort();
    let stats = handle.sync().await?;
    handle.shutdown().await?;
    ledger.flush()?;

    tracing::info!(stats = %serde_json::to_string(&stats)?, "Projector final stats");
    Ok(())
}
