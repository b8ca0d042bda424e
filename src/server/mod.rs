pub mod handlers;
pub mod ui;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::assistant::Assistant;
use crate::session::SessionStore;

/// Shared state behind every request
#[derive(Clone)]
pub struct AppState {
    pub assistant: Arc<dyn Assistant>,
    pub sessions: Arc<SessionStore>,
}

impl AppState {
    pub fn new(assistant: Arc<dyn Assistant>, sessions: SessionStore) -> Self {
        Self {
            assistant,
            sessions: Arc::new(sessions),
        }
    }
}

/// All routes of the web UI and its JSON API
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ui::index))
        .route("/api/options", get(handlers::options))
        .route("/api/sessions", post(handlers::create_session))
        .route("/api/sessions/:id", get(handlers::get_session))
        .route("/api/sessions/:id/suggest", post(handlers::suggest))
        .route("/api/sessions/:id/transform", post(handlers::transform))
        .route("/api/sessions/:id/accept", post(handlers::accept))
        .with_state(state)
}

/// Serve until Ctrl-C
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
