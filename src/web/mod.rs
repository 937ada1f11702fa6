//! Operator HTTP API.
//!
//! A small read-mostly surface for inspecting services, incidents and queue
//! state, and for re-queueing retained failed jobs.

mod handlers;

pub use handlers::*;

use crate::db::Store;
use crate::queue::JobQueue;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub queue: Arc<dyn JobQueue>,
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/healthz", get(handlers::handle_health))
        .route("/api/services", get(handlers::handle_get_services))
        .route("/api/incidents", get(handlers::handle_get_incidents))
        .route("/api/queues", get(handlers::handle_get_queues))
        .route("/api/queues/{queue}/failed", get(handlers::handle_get_failed))
        .route(
            "/api/queues/{queue}/failed/{id}/retry",
            post(handlers::handle_retry_failed),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}

/// Operator API server.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(port: u16, store: Arc<Store>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            port,
            state: AppState { store, queue },
        }
    }

    /// Serve until `stop_rx` fires.
    pub async fn start(
        &self,
        mut stop_rx: broadcast::Receiver<()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Operator API listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.recv().await;
            })
            .await?;

        tracing::info!("Operator API stopped");
        Ok(())
    }
}
