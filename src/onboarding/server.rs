use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::reaper::{ReaperPolicy, run_reaper};
use super::runner::CommandRunner;
use crate::config::ServiceConfig;

/// Build the full application router (REST API and WebSocket).
pub fn build_router(state: Arc<AppState>, cors: bool) -> Router {
    let app = api::api_router().with_state(state);
    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the onboarding service and run until Ctrl+C or SIGTERM.
pub async fn start_server(config: ServiceConfig, runner: Arc<dyn CommandRunner>) -> Result<()> {
    tokio::fs::create_dir_all(&config.deployments.work_root)
        .await
        .with_context(|| {
            format!(
                "Failed to create work root {}",
                config.deployments.work_root.display()
            )
        })?;

    let state = Arc::new(AppState::new(&config, runner));

    let reaper = tokio::spawn(run_reaper(
        Arc::clone(&state.registry),
        config.deployments.reap_interval(),
        ReaperPolicy::from(&config.deployments),
    ));

    let app = build_router(state, config.server.cors);

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "Onboarding service listening");
    println!("Onboarding service running at http://{}", local_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    reaper.abort();
    served?;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutting down...");
}
