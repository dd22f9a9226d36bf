//! # Tessera Node
//!
//! Workflow orchestration node: compiles intents into workflows and runs
//! them against remote agents behind an HTTP API.

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod agents;
mod api;
mod config;
mod state;

use config::NodeConfig;
use state::AppState;

/// Run the Tessera node server.
pub async fn run_server(config: NodeConfig) -> anyhow::Result<()> {
    info!("🚀 Tessera Node starting...");

    let state = AppState::from_config(&config)?;
    if config.agents.is_empty() {
        info!("No agent endpoints configured; every step will fail with a missing agent");
    }

    // Build the router
    let app = create_router(state);

    info!("🌐 Listening on http://{}", config.addr);

    // Start the server
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router.
fn create_router(state: AppState) -> Router {
    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        // Workflow API
        .route("/api/v1/workflows", post(api::workflows::submit_workflow))
        .route(
            "/api/v1/workflows/:id",
            get(api::workflows::get_workflow).delete(api::workflows::cancel_workflow),
        )
        .route(
            "/api/v1/workflows/:id/progress",
            get(api::workflows::get_progress),
        )
        .route(
            "/api/v1/users/:user_id/workflows",
            get(api::workflows::list_user_workflows),
        )
        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing, RUST_LOG overrides the default level
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = NodeConfig::load()?;
    run_server(config).await
}
