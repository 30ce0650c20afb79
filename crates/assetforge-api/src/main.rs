//! assetforge API server

use anyhow::Context;
use assetforge_api::{AppState, routes};
use assetforge_config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH, SystemConfig, load_from_path};
use assetforge_db::{JobStore, MemoryJobStore, PgJobStore, create_pool, run_migrations};
use assetforge_providers::ProviderRegistry;
use assetforge_scheduler::{ProgressBroadcaster, Scheduler};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "assetforge-server")]
#[command(about = "Asset generation job server", version)]
struct Args {
    /// KDL configuration file
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Override the configured bind address
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    let config = Arc::new(config);

    let store = open_store(&config).await?;
    let registry = ProviderRegistry::from_config(&config);
    let scheduler = Scheduler::start(config.clone(), store, registry);
    let state = AppState::from_scheduler(&scheduler);
    let broadcaster = state.broadcaster.clone();

    // Build router
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.server.bind);
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broadcaster, scheduler.claim_stopper()))
        .await?;

    info!("Waiting for in-flight jobs");
    scheduler.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("ASSETFORGE_LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Explicit path, else `assetforge.kdl` if present, else built-in defaults.
fn load_config(path: Option<&Path>) -> anyhow::Result<SystemConfig> {
    match path {
        Some(path) => load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => load_from_path(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("failed to load config from {}", DEFAULT_CONFIG_PATH)),
        None => {
            warn!("No config file found; using defaults with no providers");
            Ok(SystemConfig::default())
        }
    }
}

async fn open_store(config: &SystemConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match &config.database {
        Some(database) => {
            info!("Connecting to database...");
            let pool = create_pool(&database.url, database.max_connections)
                .await
                .context("failed to connect to database")?;
            run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            info!("Database connected");
            Ok(Arc::new(PgJobStore::new(pool)))
        }
        None => {
            warn!("No database configured; jobs are kept in memory");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

/// Resolve on Ctrl-C. Workers stop claiming before live clients are told
/// the server is going away; in-flight jobs are awaited after serve returns.
async fn shutdown_signal(broadcaster: Arc<ProgressBroadcaster>, stop_claiming: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested; no new jobs will be claimed");
    stop_claiming.cancel();
    broadcaster.shutdown("Server is shutting down").await;
}
