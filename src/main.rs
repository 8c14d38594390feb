//! Agent entrypoint: configuration, persistence, cluster client, runbooks,
//! and the HTTP server with graceful shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use medic::cluster::KubeCluster;
use medic::config::Config;
use medic::dedup::{self, IncidentProcessor};
use medic::llm::OpenAiClient;
use medic::runbook::RunbookTable;
use medic::server;
use medic::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting medic v{}", env!("CARGO_PKG_VERSION"));
    let config = Arc::new(Config::from_env()?);

    let store = Store::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    info!("database ready");

    let kube_client = kube::Client::try_default()
        .await
        .context("building cluster client")?;
    let cluster = Arc::new(KubeCluster::new(kube_client));
    info!("connected to cluster control plane");

    let runbooks = Arc::new(
        RunbookTable::load_dir(&config.runbook_dir)
            .with_context(|| format!("loading runbooks from {}", config.runbook_dir.display()))?,
    );
    dedup::lint_gate_aliases(&runbooks).map_err(anyhow::Error::msg)?;
    info!(count = runbooks.len(), "runbooks loaded");

    let llm = Arc::new(OpenAiClient::new(
        config.openai_api_key.clone(),
        config.openai_model.clone(),
    ));

    let processor = Arc::new(IncidentProcessor {
        store,
        cluster,
        llm,
        runbooks,
        config: config.clone(),
    });

    let app = server::build_router(processor);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, mode = %config.agent_mode, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("agent stopped");
    Ok(())
}

fn init_tracing() {
    let default_level = std::env::var("LOG_LEVEL")
        .map(|l| l.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        () = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
