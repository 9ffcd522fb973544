//! HTTP surface: the conversation endpoints, health and the farm dashboard.
//!
//! Handlers receive the [`AvaService`] through axum state; there are no globals.

mod dashboard;
mod handlers;

pub use dashboard::{degrade, Listing, Saved};
pub use handlers::{HistoryRequest, HistoryResponse};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::service::AvaService;

/// Shared application state handle
pub type SharedState = Arc<AvaService>;

/// All routes with request tracing.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/conversation", post(handlers::conversation))
        .route("/conversation/history", post(handlers::history))
        .route("/health", get(handlers::health))
        .route(
            "/farmers/:id/fields",
            get(dashboard::list_fields).post(dashboard::create_field),
        )
        .route("/fields/:id/crops", post(dashboard::add_crop))
        .route(
            "/farmers/:id/tasks",
            get(dashboard::list_tasks).post(dashboard::create_task),
        )
        .route("/farmers/:id/tasks/bulk", post(dashboard::create_tasks_bulk))
        .route("/tasks/:id/complete", post(dashboard::complete_task))
        .route("/farmers/:id/chat-history", get(dashboard::chat_history))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C, then return so the caller can shut the service down.
pub async fn serve(state: SharedState, addr: SocketAddr) -> AppResult<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| AppError::Config {
        message: format!("cannot bind {}: {}", addr, e),
    })?;
    let local = listener.local_addr().unwrap_or(addr);
    info!(addr = %local, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::Internal {
            message: format!("server error: {}", e),
        })
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
