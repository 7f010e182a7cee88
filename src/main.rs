use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clap::Parser;
use replicated_cache::CacheNode;
use replicated_cache::cache::handlers::*;
use replicated_cache::cache::protocol::*;
use replicated_cache::config::CacheConfig;
use replicated_cache::membership::service::MembershipService;
use replicated_cache::membership::types::Address;
use replicated_cache::transport::CommandHandler;
use replicated_cache::transport::http::{ENDPOINT_RPC, HttpTransport, handle_rpc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// A node of the replicated cache cluster.
#[derive(Parser, Debug)]
#[command(name = "cache-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Gossip (UDP) address; the HTTP API listens on the same IP, port + 1000
    #[arg(long)]
    bind: SocketAddr,

    /// Gossip address of an existing member, repeatable
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,

    /// Member name, generated when omitted
    #[arg(long)]
    name: Option<String>,

    /// Path to a TOML cache configuration
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::default(),
    };

    tracing::info!("Starting node on {}", cli.bind);
    if !cli.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", cli.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    let http_port = cli.bind.port() + 1000;
    let http_addr = SocketAddr::new(cli.bind.ip(), http_port);
    let address = cli.name.map(Address::new).unwrap_or_else(Address::random);

    // 1. Membership (UDP gossip):
    let membership =
        MembershipService::new(address, cli.bind, http_addr, cli.seeds.clone()).await?;
    tracing::info!("Node address: {}", membership.local_node.address);

    // 2. Cache node over the HTTP transport:
    let transport = Arc::new(HttpTransport::new(membership.clone()));
    let cache = CacheNode::new(config, transport)?;
    let handler: Arc<dyn CommandHandler> = cache.handler();

    // 3. HTTP Router:
    let app = Router::new()
        .route(ENDPOINT_PUT, post(handle_put))
        .route(ENDPOINT_GET, get(handle_get))
        .route(ENDPOINT_GET_ALL, post(handle_get_all))
        .route(ENDPOINT_PUT_ALL, post(handle_put_all))
        .route(ENDPOINT_REMOVE, post(handle_remove))
        .route(ENDPOINT_CLEAR, post(handle_clear))
        .route(ENDPOINT_TX, post(handle_tx))
        .route(ENDPOINT_TOPOLOGY, get(handle_topology))
        .route(ENDPOINT_REBALANCING, post(handle_rebalancing))
        .route(ENDPOINT_RPC, post(handle_rpc))
        .layer(Extension(cache.clone()))
        .layer(Extension(handler));

    // 4. Spawn membership service and topology manager:
    let service_clone = membership.clone();
    tokio::spawn(async move {
        service_clone.start().await;
    });
    cache.start();

    // 5. Spawn stats reporter:
    let stats_service = membership.clone();
    let stats_cache = cache.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_service.get_alive_members();
            let topology = stats_cache.topology();
            tracing::info!(
                "Cluster stats: {} alive nodes, topology {} (view {}), {} local entries",
                alive.len(),
                topology.topology_id,
                topology.view_id,
                stats_cache.local_size()
            );
            for node in alive {
                tracing::info!(
                    "  - {} gossip={} http={} (inc={})",
                    node.address,
                    node.gossip_addr,
                    node.http_addr,
                    node.incarnation
                );
            }
        }
    });

    // 6. Start HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
