use anyhow::Context;
use clap::Parser;
use confab::cache::{self, Cache};
use confab::config::load_config;
use confab::gate::{self, GateState};
use confab::rpc::{StatusClient, VerifyClient};
use confab::store::Store;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "confab-gate", version, author)]
/// The HTTP front door for account and verification flows.
struct GateCli {
    /// Path to the deployment config file.
    #[arg(long, default_value = "config.yaml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = GateCli::parse();
    let cfg = load_config(&cli.config)?;

    let store = Store::connect(&cfg.db)
        .await
        .context("failed to open database pool")?;
    let cache = Cache::connect(cfg.cache.addr(), cache::POOL_SIZE)
        .await
        .context("failed to open cache pool")?;
    let status = StatusClient::new(cfg.status.addr());
    let verify = VerifyClient::new(cfg.verify.addr());

    info!(port = cfg.gate.port, "gate server starting");
    gate::run(
        &cfg.gate,
        GateState {
            store: store.clone(),
            cache: cache.clone(),
            status: status.clone(),
            verify: verify.clone(),
        },
    )
    .await?;

    store.close();
    cache.close();
    status.close();
    verify.close();
    info!("gate server stopped");
    Ok(())
}
