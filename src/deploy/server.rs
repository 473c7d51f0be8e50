use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tracing::{error, info};

use super::api::{self, AppState};
use super::db::{DbHandle, DeployDb};
use super::dispatcher::{Dispatcher, launcher_for};
use super::status::StatusReporter;
use crate::config::DeployConfig;

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Start the JSON surface.
///
/// Before accepting requests, abandoned deployments are expired and
/// `pending` rows that never got a worker are relaunched.
pub async fn start_server(config: Arc<DeployConfig>) -> Result<()> {
    config.ensure_directories()?;
    let db = DbHandle::new(
        DeployDb::new(&config.db_path).context("Failed to initialize deployment database")?,
    );
    let launcher = launcher_for(db.clone(), config.clone())?;
    let dispatcher = Dispatcher::new(db.clone(), config.clone(), launcher.clone());

    let expired = dispatcher.sweep().await?;
    let resumed = dispatcher.resume_pending().await?;
    info!(expired = expired.len(), resumed, "startup recovery done");

    let state = Arc::new(AppState {
        reporter: StatusReporter::new(db.clone(), config.clone()),
        dispatcher,
        db,
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, launcher = ?config.launcher, "gitdeploy server listening");
    println!("gitdeploy running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("waiting for in-process deployments");
    launcher.join_all().await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
