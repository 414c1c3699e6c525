//! Eidolon server binary: wires the graph store, config store, event bus,
//! and task registry together and serves the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use eidolon_graph::{CypherGraphStore, GraphStore, GraphWriter, MemoryGraphStore};
use eidolon_scanner::NmapDriver;
use eidolon_server::orchestrator::{ScanRuntime, StageTimeouts};
use eidolon_server::routes;
use eidolon_server::settings::Settings;
use eidolon_server::state::AppState;
use eidolon_server::store::{ConfigStore, MemoryConfigStore, PostgresConfigStore};
use eidolon_server::{EventBus, TaskRegistry};

/// Eidolon - network discovery and analysis server
#[derive(Parser, Debug)]
#[command(name = "eidolon-server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Scan orchestrator and streaming task runtime")]
struct Cli {
    /// Address to listen on
    #[arg(long = "bind", env = "EIDOLON_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let settings = Settings::from_env();
    info!(scanner = %settings.scanner_bin, "eidolon server starting");

    let graph_store: Arc<dyn GraphStore> = match &settings.graph_url {
        Some(url) => Arc::new(
            CypherGraphStore::new(
                url,
                &settings.graph_database,
                &settings.graph_user,
                &settings.graph_password,
            )
            .context("failed to build graph store client")?,
        ),
        None => {
            warn!("GRAPH_URL not set, discovered assets stay in process memory");
            Arc::new(MemoryGraphStore::new())
        }
    };

    let config_store: Arc<dyn ConfigStore> = match &settings.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("failed to connect to the config database")?;
            let store = PostgresConfigStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("failed to prepare the config schema")?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, scan configs stay in process memory");
            Arc::new(MemoryConfigStore::new())
        }
    };

    let bus = EventBus::new(settings.queue_capacity);
    let registry = TaskRegistry::new(settings.task_retention);
    let _reaper = registry.spawn_reaper();

    let runtime = Arc::new(ScanRuntime {
        driver: Arc::new(NmapDriver::new(settings.scanner_bin.clone())),
        writer: Arc::new(GraphWriter::new(graph_store)),
        bus: bus.clone(),
        registry: registry.clone(),
        timeouts: StageTimeouts::default(),
    });
    let state = AppState::new(runtime, config_store);

    let listener = TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    info!(bind = %cli.bind, "listening");

    axum::serve(listener, routes::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Wait for ctrl-c, then cancel running scans and let their `cancelled`
/// events publish before the sockets close.
async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    let cancelled = state.registry.cancel_all();
    info!(count = cancelled.len(), "shutdown requested, cancelling running scans");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while state.registry.running_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    state.bus.shutdown();
}

/// Initialize logging based on CLI arguments
fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        tracing::Level::ERROR
    } else {
        match cli.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                    log_level,
                )),
        )
        .init();
}
