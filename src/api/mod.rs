mod auth;
mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::catalog::Catalog;
use crate::engine::Scheduler;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub scheduler: Scheduler,
    pub catalog: Arc<Catalog>,
    /// Basic auth username/password; `None` disables authentication.
    pub credentials: Option<(String, String)>,
}

/// Build the API router. Exposed so tests can drive it without a socket.
pub fn router(state: Arc<AppState>, max_body: usize) -> Router {
    Router::new()
        .route("/", get(handlers::usage))
        .route("/health", get(handlers::health))
        .route("/machines", get(handlers::list_machines))
        .route("/machines/{name}", get(handlers::get_machine))
        .route("/runs", get(handlers::list_runs))
        // GET/DELETE take a run id, POST takes a machine name.
        .route(
            "/runs/{id}",
            get(handlers::get_run)
                .delete(handlers::cancel_run)
                .post(handlers::run_machine),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_basic_auth,
        ))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server. Returns once Ctrl-C is received and
/// in-progress requests have completed.
pub async fn serve(host: &str, port: u16, state: Arc<AppState>, max_body: usize) -> Result<()> {
    let app = router(state, max_body);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Stepwise API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
