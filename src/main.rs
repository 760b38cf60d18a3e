use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

mod board;
mod config;
mod dashboard;
mod db;
mod error;
mod feed;
mod odds;

use board::persist::{JsonFileSessions, MemorySessions, SessionStores};
use board::BoardRuntime;
use config::Config;
use dashboard::AppState;
use db::Database;
use odds::SnapshotStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Open database
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);
    let store: Arc<dyn SnapshotStore> = Arc::new(db);

    let broadcaster_url = config.broadcaster_url()?;
    let source = feed::source_for(&broadcaster_url, &config.update_event_name)?;
    info!("Update feed: {} ({})", broadcaster_url, source.name());

    let sessions: Box<dyn SessionStores> = match &config.filter_state_dir {
        Some(dir) => {
            info!("Filter state: one file per session in {}", dir.display());
            Box::new(JsonFileSessions::new(dir))
        }
        None => {
            info!("Filter state kept in memory (FILTER_STATE_DIR unset)");
            Box::new(MemorySessions::default())
        }
    };

    let (runtime, board) = BoardRuntime::new(store, source, sessions, config.runtime());
    let runtime_task = runtime.spawn();

    // Start the board API server
    let app = dashboard::router(AppState {
        board: board.clone(),
        default_session: config.session_id.clone(),
    });
    let addr: SocketAddr = config
        .dashboard_addr
        .parse()
        .with_context(|| format!("Invalid DASHBOARD_ADDR {}", config.dashboard_addr))?;
    info!("Board API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run the API server until Ctrl-C
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    board.shutdown().await;
    runtime_task.await.context("Board runtime task failed")?;

    Ok(())
}
