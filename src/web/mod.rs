//! Web server module: the control surface for continuous tasks.

mod handlers;

use crate::config::AgentConfig;
use crate::scheduler::TaskRegistry;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
}

/// HTTP server exposing the continuous-task endpoints.
pub struct Server {
    config: AgentConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: AgentConfig, registry: Arc<TaskRegistry>) -> Self {
        Self {
            config,
            state: AppState { registry },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        let api = Router::new()
            .route("/continuous/start", post(handlers::handle_continuous_start))
            .route("/continuous/stop", post(handlers::handle_continuous_stop))
            .route("/continuous/status", get(handlers::handle_continuous_status))
            .route("/health", get(handlers::handle_health));

        Router::new()
            .nest("/api", api)
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.routes();

        tracing::info!("Control server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
