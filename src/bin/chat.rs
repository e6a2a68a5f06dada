use anyhow::Context;
use clap::Parser;
use confab::cache::{self, Cache};
use confab::config::load_config;
use confab::dispatch::{self, ChatContext};
use confab::io_pool::IoPool;
use confab::rpc::{self, PeerClient, StatusClient};
use confab::server::{self, SessionTable};
use confab::store::Store;
use confab::users::UserMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "confab-chat", version, author)]
/// The persistent chat message service.
struct ChatCli {
    /// Path to the deployment config file.
    #[arg(long, default_value = "config.yaml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = ChatCli::parse();
    let cfg = load_config(&cli.config)?;

    let store = Store::connect(&cfg.db)
        .await
        .context("failed to open database pool")?;
    let cache = Cache::connect(cfg.cache.addr(), cache::POOL_SIZE)
        .await
        .context("failed to open cache pool")?;

    let users = Arc::new(UserMap::with_route(cache.clone(), cfg.chat.name.clone()));
    let status = StatusClient::new(cfg.status.addr());
    let peers: HashMap<String, PeerClient> = cfg
        .chat
        .peers
        .iter()
        .map(|peer| (peer.name.clone(), PeerClient::new(peer.addr())))
        .collect();

    let ctx = Arc::new(ChatContext {
        store: store.clone(),
        cache: cache.clone(),
        users: Arc::clone(&users),
        status: status.clone(),
        peers,
        self_name: cfg.chat.name.clone(),
        offline_policy: cfg.chat.offline_messages,
    });
    let (dispatch_tx, dispatcher) = dispatch::start(Arc::clone(&ctx));

    let io_pool = IoPool::new(cfg.chat.io_threads).context("failed to start io pool")?;
    let sessions = Arc::new(SessionTable::new());

    let client_listener = TcpListener::bind((cfg.chat.host.as_str(), cfg.chat.port))
        .await
        .context("failed to bind chat listener")?;
    let peer_listener = TcpListener::bind((cfg.chat.host.as_str(), cfg.chat.rpc_port))
        .await
        .context("failed to bind peer listener")?;
    info!(
        name = cfg.chat.name.as_str(),
        port = cfg.chat.port,
        rpc_port = cfg.chat.rpc_port,
        io_threads = io_pool.size(),
        "chat server listening"
    );

    // One SIGINT fans out to every listener through this token, so teardown
    // happens in a fixed order below.
    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received");
            stop.cancel();
        });
    }

    let peer_task = tokio::spawn(rpc::serve_peer_notifications(
        peer_listener,
        Arc::clone(&users),
        stop.clone().cancelled_owned(),
    ));

    server::run(
        client_listener,
        &io_pool,
        Arc::clone(&sessions),
        Arc::clone(&users),
        dispatch_tx,
        stop.clone().cancelled_owned(),
    )
    .await;

    // Sessions are drained; the dispatcher queue empties itself once the
    // last producer is gone, then the backends close and the loops join.
    let _ = peer_task.await;
    let _ = dispatcher.await;

    store.close();
    cache.close();
    status.close();
    for peer in ctx.peers.values() {
        peer.close();
    }
    io_pool.shutdown();

    info!("chat server stopped");
    Ok(())
}
