use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use mg_mcp::pool::{BackendConnector, ConnectionPool};
use mg_mcp::NamespaceAggregator;
use mg_server::{build_router, seed, AppState};
use mg_store::{BootstrapConfig, DefinitionStore, MemoryStore};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "metagate", about = "MCP aggregation gateway", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:12009")]
    bind: SocketAddr,

    /// Bootstrap config file (TOML). Starts empty when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Idle seconds before a backend connection is drained.
    #[arg(long, default_value_t = 300)]
    idle_timeout_secs: u64,

    /// Seconds between idle/rate-limit sweeps.
    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mg_server=debug,mg_mcp=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => BootstrapConfig::load(path)?,
        None => BootstrapConfig::default(),
    };

    let store: Arc<dyn DefinitionStore> = Arc::new(MemoryStore::from_config(&config)?);
    let pool = Arc::new(ConnectionPool::new(Arc::new(BackendConnector)));
    let aggregator = Arc::new(NamespaceAggregator::new(store.clone(), pool.clone()));
    let state = AppState::new(store, pool.clone(), aggregator);

    seed::seed_and_warm(&state, config.seed.as_ref()).await;

    // Background sweeps: idle backend connections and expired rate windows.
    {
        let state = state.clone();
        let idle_timeout = Duration::from_secs(args.idle_timeout_secs);
        let mut interval =
            tokio::time::interval(Duration::from_secs(args.sweep_interval_secs.max(1)));
        tokio::spawn(async move {
            interval.tick().await;
            loop {
                interval.tick().await;
                let drained = state.pool.sweep_idle(idle_timeout, Instant::now()).await;
                if drained > 0 {
                    tracing::info!("Drained {} idle backend connection(s)", drained);
                }
                state.rate_limiter.sweep(chrono::Utc::now());
            }
        });
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("metagate listening on {}", args.bind);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    pool.shutdown().await;
    Ok(())
}
