use anyhow::Context;
use clap::Parser;
use confab::cache::{self, Cache};
use confab::config::load_config;
use confab::status::{self, StatusState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "confab-status", version, author)]
/// The session-placement and token-issuance service.
struct StatusCli {
    /// Path to the deployment config file.
    #[arg(long, default_value = "config.yaml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = StatusCli::parse();
    let cfg = load_config(&cli.config)?;

    let cache = Cache::connect(cfg.cache.addr(), cache::POOL_SIZE)
        .await
        .context("failed to open cache pool")?;
    let state = Arc::new(StatusState::new(
        cache.clone(),
        cfg.status.chat_servers.clone(),
    ));

    let listener = TcpListener::bind((cfg.status.host.as_str(), cfg.status.port))
        .await
        .context("failed to bind status listener")?;
    info!(
        port = cfg.status.port,
        chat_servers = cfg.status.chat_servers.len(),
        "status server listening"
    );

    status::run(listener, state, tokio::signal::ctrl_c()).await;

    cache.close();
    info!("status server stopped");
    Ok(())
}
