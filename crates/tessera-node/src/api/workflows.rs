//! Workflow API endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_core::{
    ExecutionStatus, IntentType, OrchestrationRequest, Priority, RequestSource, StepId,
    TesseraError, UserIntent, WorkflowExecution, WorkflowId,
};
use tracing::{info, warn};

use crate::state::AppState;

type ApiError = (StatusCode, String);

/// Map a domain error to a status code and message.
fn api_error(err: TesseraError) -> ApiError {
    let status = match &err {
        TesseraError::RequestInvalid { .. } | TesseraError::CompilationFailed { .. } => {
            StatusCode::BAD_REQUEST
        }
        TesseraError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
        TesseraError::WorkflowTerminal { .. }
        | TesseraError::InvalidTransition { .. }
        | TesseraError::VersionConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn not_found(id: &WorkflowId) -> ApiError {
    (StatusCode::NOT_FOUND, format!("Workflow {} not found", id))
}

/// Request to orchestrate a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitWorkflowRequest {
    pub user_id: String,

    pub intent: UserIntent,

    #[serde(default)]
    pub context: serde_json::Value,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub source: RequestSource,
}

/// Response after submitting a workflow.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitWorkflowResponse {
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub step_ids: Vec<StepId>,
    pub message: String,
}

/// Progress snapshot of a workflow.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub progress: u8,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub in_flight: Vec<StepId>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// One line of a user's workflow list.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub intent_type: IntentType,
    pub status: ExecutionStatus,
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    pub error: Option<String>,
}

impl From<&WorkflowExecution> for WorkflowSummary {
    fn from(workflow: &WorkflowExecution) -> Self {
        Self {
            id: workflow.id.clone(),
            intent_type: workflow.intent_type.clone(),
            status: workflow.status,
            progress: workflow.metadata.progress,
            start_time: workflow.start_time,
            error: workflow.error.clone(),
        }
    }
}

/// Compile, store and start a workflow.
pub async fn submit_workflow(
    State(state): State<AppState>,
    Json(req): Json<SubmitWorkflowRequest>,
) -> Result<(StatusCode, Json<SubmitWorkflowResponse>), ApiError> {
    let request = OrchestrationRequest::builder(req.user_id, req.intent)
        .context(req.context)
        .priority(req.priority)
        .source(req.source)
        .build()
        .map_err(api_error)?;

    let workflow = state.engine.create_workflow(&request).map_err(api_error)?;
    let step_ids: Vec<StepId> = workflow.steps.iter().map(|s| s.id.clone()).collect();

    let workflow_id = state.executor.submit(workflow).await.map_err(api_error)?;
    state
        .executor
        .spawn(workflow_id.clone())
        .await
        .map_err(api_error)?;

    info!(workflow_id = %workflow_id, steps = step_ids.len(), "Workflow accepted");

    Ok((
        StatusCode::CREATED,
        Json(SubmitWorkflowResponse {
            workflow_id,
            status: ExecutionStatus::Pending,
            step_ids,
            message: "Workflow submitted successfully".to_string(),
        }),
    ))
}

/// Get the full workflow record.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowExecution>, ApiError> {
    let id = WorkflowId::new(id);
    let stored = state
        .store()
        .get(&id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| not_found(&id))?;

    Ok(Json(stored.workflow))
}

/// Get the progress of a workflow.
pub async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let id = WorkflowId::new(id);
    let workflow = state
        .store()
        .get(&id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| not_found(&id))?
        .workflow;

    Ok(Json(ProgressResponse {
        workflow_id: workflow.id,
        status: workflow.status,
        progress: workflow.metadata.progress,
        total_steps: workflow.metadata.total_steps,
        completed_steps: workflow.metadata.completed_steps,
        failed_steps: workflow.metadata.failed_steps,
        in_flight: workflow.in_flight.into_iter().collect(),
        estimated_completion: workflow.metadata.estimated_completion,
    }))
}

/// Cancel a workflow. Answers 204 only once the workflow is stored as
/// cancelled, and 409 when it finished first.
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = WorkflowId::new(id);

    state
        .executor
        .cancel(&id, "Cancelled by API request")
        .await
        .map_err(|e| {
            warn!(workflow_id = %id, error = %e, "Cancellation refused");
            api_error(e)
        })?;

    Ok(StatusCode::NO_CONTENT)
}

/// List a user's workflows, oldest first.
pub async fn list_user_workflows(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<WorkflowSummary>>, ApiError> {
    let workflows = state
        .store()
        .list_for_user(&user_id)
        .await
        .map_err(api_error)?;

    Ok(Json(workflows.iter().map(WorkflowSummary::from).collect()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum_test::TestServer;
    use serde_json::json;
    use tessera_core::AgentType;
    use tessera_executor::{Agent, AgentRegistry, AgentRequest, ExecutorConfig};

    use super::*;
    use crate::config::NodeConfig;

    struct Instant;

    #[async_trait]
    impl Agent for Instant {
        fn agent_type(&self) -> AgentType {
            AgentType::WarrantyClaim
        }

        async fn execute(&self, request: AgentRequest) -> tessera_core::Result<serde_json::Value> {
            Ok(json!({ "step": request.step_name }))
        }
    }

    struct Stuck;

    #[async_trait]
    impl Agent for Stuck {
        fn agent_type(&self) -> AgentType {
            AgentType::CashExtraction
        }

        async fn execute(&self, _request: AgentRequest) -> tessera_core::Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::Value::Null)
        }
    }

    fn server() -> TestServer {
        let config = NodeConfig {
            executor: ExecutorConfig {
                step_timeout_ms: 60_000,
                backoff_base_ms: 1,
                backoff_max_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let agents = AgentRegistry::new()
            .with(Arc::new(Instant))
            .with(Arc::new(Stuck));
        let state = AppState::with_agents(&config, agents).unwrap();
        TestServer::new(crate::create_router(state)).unwrap()
    }

    async fn submit(server: &TestServer, intent: &str) -> SubmitWorkflowResponse {
        let response = server
            .post("/api/v1/workflows")
            .json(&json!({
                "user_id": "u1",
                "intent": { "type": intent, "parameters": { "text": "fridge warranty" } },
                "priority": "high",
            }))
            .await;
        response.assert_status(StatusCode::CREATED);
        response.json::<SubmitWorkflowResponse>()
    }

    /// Poll until the workflow reaches a terminal status.
    async fn wait_terminal(server: &TestServer, id: &WorkflowId) -> ProgressResponse {
        for _ in 0..200 {
            let progress = server
                .get(&format!("/api/v1/workflows/{}/progress", id))
                .await
                .json::<ProgressResponse>();
            if progress.status.is_terminal() {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow {} did not finish", id);
    }

    #[tokio::test]
    async fn test_health() {
        let server = server();
        let response = server.get("/health").await;
        response.assert_status_ok();

        let body = response.json::<serde_json::Value>();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["agents"], json!(["warranty-claim", "cash-extraction"]));
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let server = server();
        let submitted = submit(&server, "claim_processing").await;
        assert_eq!(submitted.status, ExecutionStatus::Pending);
        assert_eq!(submitted.step_ids.len(), 2);

        let progress = wait_terminal(&server, &submitted.workflow_id).await;
        assert_eq!(progress.status, ExecutionStatus::Completed);
        assert_eq!(progress.progress, 100);
        assert!(progress.in_flight.is_empty());

        let workflow = server
            .get(&format!("/api/v1/workflows/{}", submitted.workflow_id))
            .await
            .json::<serde_json::Value>();
        assert_eq!(workflow["priority"], "high");
        assert_eq!(workflow["steps"][1]["output"]["step"], "Process Claims");
    }

    #[tokio::test]
    async fn test_unserved_agent_fails_workflow() {
        let server = server();
        let submitted = submit(&server, "data_sync").await;

        let progress = wait_terminal(&server, &submitted.workflow_id).await;
        assert_eq!(progress.status, ExecutionStatus::Failed);
        assert_eq!(progress.failed_steps, 1);
    }

    #[tokio::test]
    async fn test_invalid_intent_is_bad_request() {
        let server = server();
        let response = server
            .post("/api/v1/workflows")
            .json(&json!({
                "user_id": "u1",
                "intent": { "type": "user_query", "confidence": 7.5 },
            }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        let response = server
            .post("/api/v1/workflows")
            .json(&json!({ "user_id": "", "intent": { "type": "user_query" } }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let server = server();
        server
            .get("/api/v1/workflows/workflow-0-missing")
            .await
            .assert_status_not_found();
        server
            .get("/api/v1/workflows/workflow-0-missing/progress")
            .await
            .assert_status_not_found();
        server
            .delete("/api/v1/workflows/workflow-0-missing")
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn test_cancel_running_then_conflict() {
        let server = server();
        let submitted = submit(&server, "cash_extraction").await;
        let path = format!("/api/v1/workflows/{}", submitted.workflow_id);

        server.delete(&path).await.assert_status(StatusCode::NO_CONTENT);

        let progress = wait_terminal(&server, &submitted.workflow_id).await;
        assert_eq!(progress.status, ExecutionStatus::Cancelled);

        server.delete(&path).await.assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_list_user_workflows() {
        let server = server();
        submit(&server, "claim_processing").await;
        submit(&server, "bogus_intent").await;

        let list = server
            .get("/api/v1/users/u1/workflows")
            .await
            .json::<Vec<WorkflowSummary>>();
        assert_eq!(list.len(), 2);
        assert!(list
            .iter()
            .any(|w| w.intent_type == IntentType::from("bogus_intent")));

        let empty = server
            .get("/api/v1/users/nobody/workflows")
            .await
            .json::<Vec<WorkflowSummary>>();
        assert!(empty.is_empty());
    }
}
