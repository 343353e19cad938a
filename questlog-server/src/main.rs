//! questlog server
//!
//! Follows the character/quest contract on chain and keeps the off-chain
//! store in sync with it.

mod config;
mod server;
mod shutdown;
mod state;

use clap::Parser;
use config::{ConfigLoader, get_database_url};
use questlog_core::chain::{ChainWatcher, JsonRpcTransport, WatcherHandle};
use questlog_core::persistence::PgPersistence;
use questlog_core::pipeline::Pipeline;
use server::{build_router, run_server};
use shutdown::spawn_shutdown_broadcaster;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// questlog - chain event ingestion for the character/quest contract
#[derive(Parser, Debug)]
#[command(name = "questlog-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./questlog.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,
}

/// Upper bound for letting the queue finish in-flight events on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    // Parse command line arguments
    let args = Args::parse();

    tracing::info!("Starting questlog-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_loader = ConfigLoader::new(&args.config, args.listen);
    let config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    // Get database URL from environment
    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    // Connect to the store, retrying a bounded number of times
    tracing::info!("Connecting to database...");
    let store = PgPersistence::connect(&config.store.with_url(database_url))
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;

    // Run migrations if requested
    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(store.pool())
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    let pool = store.pool().clone();
    let store = Arc::new(store);
    let pipeline = Pipeline::new(config.queue.clone(), store.clone());

    // Chain watcher feeding the queue
    let transport = Arc::new(JsonRpcTransport::new(config.chain.rpc_url.clone()));
    let mut watcher = ChainWatcher::new(transport, config.chain.watcher.clone());
    pipeline.attach(&mut watcher);
    let (watcher_handle, command_rx) = WatcherHandle::channel(16);
    let auto_reprocess = config.chain.auto_reprocess_reorgs;
    watcher.on_reorg(move |block| {
        if auto_reprocess {
            tracing::warn!(block, "Reorg detected, requesting reprocessing");
            watcher_handle.reprocess();
        } else {
            tracing::error!(block, "Reorg detected, ingestion halted until resumed");
        }
    });
    let watcher_state = watcher.subscribe_state();

    let (shutdown_tx, shutdown_rx) = spawn_shutdown_broadcaster();
    let watcher_task = {
        let shutdown_tx = shutdown_tx.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = watcher.run(shutdown_rx, command_rx).await;
            if result.is_err() {
                // A dead watcher takes the whole process down
                shutdown_tx.send_replace(true);
            }
            result
        })
    };

    // Create application state
    let state = AppState::new(store, pipeline.clone(), watcher_state);

    // Run the server
    let router = build_router(state);
    tracing::info!("Starting HTTP server on {}", config.listen);
    let server_result = run_server(router, config.listen, shutdown_rx).await;

    // Whatever ended the server, stop the watcher too
    shutdown_tx.send_replace(true);
    let watcher_result = match watcher_task.await {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(e) => Err(anyhow::Error::from(e)),
    };
    if let Err(e) = &watcher_result {
        tracing::error!("Chain watcher stopped with error: {}", e);
    }

    // Let buffered events reach the store
    tracing::info!(pending = pipeline.queue().len(), "Draining event queue...");
    if tokio::time::timeout(DRAIN_TIMEOUT, pipeline.queue().wait_idle())
        .await
        .is_err()
    {
        tracing::warn!(
            pending = pipeline.queue().len(),
            "Queue did not drain in time, discarding remaining events"
        );
        pipeline.queue().clear();
    }

    // Close database connections gracefully
    tracing::info!("Closing database connections...");
    pool.close().await;
    tracing::info!("Server shutdown complete");

    server_result?;
    watcher_result
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
