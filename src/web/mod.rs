//! Web server module: RPC surface, bus ingress and status API.

mod handlers;

pub use handlers::*;

use crate::alert::AlertAgent;
use crate::bus::Bus;
use crate::config::ServerConfig;
use crate::db::Store;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub agent: Arc<AlertAgent>,
    pub bus: Arc<dyn Bus>,
    pub store: Arc<Store>,
}

/// HTTP front end for the watchdog.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        agent: Arc<AlertAgent>,
        bus: Arc<dyn Bus>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                agent,
                bus,
                store,
            },
        }
    }

    /// Build the router with all routes.
    pub(crate) fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            // RPC
            .route("/api/rpc/watch_topic", post(handlers::handle_watch_topic))
            .route("/api/rpc/watch_device", post(handlers::handle_watch_device))
            .route("/api/rpc/ignore_topic", post(handlers::handle_ignore_topic))
            // Bus ingress
            .route("/api/publish", post(handlers::handle_publish))
            // Health
            .route("/api/health", get(handlers::handle_health))
            .route("/api/health/alert", post(handlers::handle_remote_alert))
            .route("/api/alerts", get(handlers::handle_alerts))
            .route("/api/groups", get(handlers::handle_groups))
            // Availability log
            .route("/api/log/topics", get(handlers::handle_topic_log))
            .route("/api/log/runs", get(handlers::handle_agent_runs))
            .route("/api/report", get(handlers::handle_report))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
