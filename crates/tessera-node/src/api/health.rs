//! Health check endpoint.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tessera_core::AgentType;
use tracing::warn;

use crate::state::AppState;

/// Health check response.
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` when the workflow store cannot be read.
    pub status: String,
    pub version: String,
    /// Agent types this node can dispatch to.
    pub agents: Vec<AgentType>,
    /// Unknown while the store is unavailable.
    pub active_workflows: Option<usize>,
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, active_workflows) = match state.store().list_active().await {
        Ok(active) => ("healthy", Some(active.len())),
        Err(e) => {
            warn!(error = %e, "Workflow store unavailable");
            ("degraded", None)
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agents: state.executor.agent_types(),
        active_workflows,
    })
}
