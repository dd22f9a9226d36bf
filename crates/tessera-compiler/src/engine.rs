//! The workflow engine: compiles orchestration requests into workflows.

use std::collections::BTreeMap;

use serde_json::json;
use tessera_core::{
    log_agent_activity, OrchestrationRequest, Result, StepId, TesseraError, WorkflowExecution,
    WorkflowId, WorkflowStep,
};
use tracing::debug;

use crate::builders::{self, Link, StepTemplate};
use crate::compiler::{CompilerConfig, WorkflowCompiler};

const COMPONENT: &str = "WorkflowEngine";

/// Compiles requests into pending workflows, one builder per intent kind.
#[derive(Debug, Clone, Default)]
pub struct WorkflowEngine {
    config: CompilerConfig,
}

impl WorkflowEngine {
    /// Create a new engine with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new engine with custom configuration.
    pub fn with_config(config: CompilerConfig) -> Self {
        Self { config }
    }

    /// Compile `request` into a pending workflow.
    ///
    /// Unrecognized intents compile to the single-step default workflow.
    /// Any construction failure is logged and returned; a partially built
    /// workflow is never handed out.
    pub fn create_workflow(&self, request: &OrchestrationRequest) -> Result<WorkflowExecution> {
        log_agent_activity(
            COMPONENT,
            "Creating workflow",
            &json!({
                "userId": request.user_id,
                "requestId": request.id,
                "intentType": request.intent.intent_type,
            }),
        );

        match self.build(request) {
            Ok(workflow) => {
                log_agent_activity(
                    COMPONENT,
                    "Workflow created",
                    &json!({
                        "userId": request.user_id,
                        "workflowId": workflow.id,
                        "stepCount": workflow.steps.len(),
                    }),
                );
                Ok(workflow)
            }
            Err(err) => {
                log_agent_activity(
                    COMPONENT,
                    "Workflow creation failed",
                    &json!({
                        "userId": request.user_id,
                        "error": err.to_string(),
                    }),
                );
                Err(err)
            }
        }
    }

    fn build(&self, request: &OrchestrationRequest) -> Result<WorkflowExecution> {
        request.validate().map_err(|err| TesseraError::CompilationFailed {
            user_id: request.user_id.clone(),
            message: err.to_string(),
        })?;

        let templates = builders::steps_for(request);
        if templates.is_empty() || templates.len() > self.config.max_steps {
            return Err(TesseraError::CompilationFailed {
                user_id: request.user_id.clone(),
                message: format!(
                    "intent {} produced {} steps (allowed 1..={})",
                    request.intent.intent_type,
                    templates.len(),
                    self.config.max_steps
                ),
            });
        }

        let id = WorkflowId::generate();
        let (steps, dependencies) = materialize(&id, templates);
        debug!(workflow_id = %id, steps = steps.len(), "Materialized step templates");

        let workflow = WorkflowExecution::new(
            id,
            request,
            steps,
            dependencies,
            self.config.failure_policy,
        );
        workflow.validate_graph()?;
        Ok(workflow)
    }
}

/// Assign ids and turn `Link::Previous` into explicit dependency edges.
fn materialize(
    workflow_id: &WorkflowId,
    templates: Vec<StepTemplate>,
) -> (Vec<WorkflowStep>, BTreeMap<StepId, Vec<StepId>>) {
    let mut steps: Vec<WorkflowStep> = Vec::with_capacity(templates.len());
    let mut dependencies = BTreeMap::new();

    for (index, template) in templates.into_iter().enumerate() {
        let id = StepId::for_workflow(workflow_id, index + 1);
        let mut step = WorkflowStep::new(
            id.clone(),
            template.name,
            template.agent_type,
            template.input,
            template.max_retries,
        );

        if template.link == Link::Previous {
            if let Some(producer) = steps.last().map(|s| s.id.clone()) {
                step = step.with_producer(&producer);
                dependencies.insert(id, vec![producer]);
            }
        }

        steps.push(step);
    }

    (steps, dependencies)
}

impl WorkflowCompiler for WorkflowEngine {
    fn compile(&self, request: &OrchestrationRequest) -> Result<WorkflowExecution> {
        self.create_workflow(request)
    }

    fn config(&self) -> &CompilerConfig {
        &self.config
    }

    fn set_config(&mut self, config: CompilerConfig) {
        self.config = config;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use tessera_core::{AgentType, ExecutionStatus, FailurePolicy, IntentType, UserIntent};

    fn request(intent_type: &str) -> OrchestrationRequest {
        let intent = UserIntent::builder(intent_type).build().unwrap();
        OrchestrationRequest::builder("u1", intent).build().unwrap()
    }

    /// Agent sequence plus dependency shape expressed as step indices.
    fn shape(workflow: &WorkflowExecution) -> (Vec<AgentType>, Vec<Option<usize>>) {
        let agents = workflow.steps.iter().map(|s| s.agent_type).collect();
        let links = workflow
            .steps
            .iter()
            .map(|s| {
                s.input_dependency()
                    .and_then(|dep| workflow.steps.iter().position(|p| p.id.as_str() == dep))
            })
            .collect();
        (agents, links)
    }

    #[test]
    fn test_every_intent_compiles() {
        let engine = WorkflowEngine::new();
        let mut kinds: Vec<String> = IntentType::NAMED.iter().map(|k| k.to_string()).collect();
        kinds.push("bogus_intent".to_string());

        for kind in kinds {
            let workflow = engine.create_workflow(&request(&kind)).unwrap();
            assert!(!workflow.steps.is_empty(), "intent {}", kind);
            assert_eq!(workflow.status, ExecutionStatus::Pending);
            assert_eq!(workflow.metadata.total_steps, workflow.steps.len());
            assert_eq!(workflow.metadata.completed_steps, 0);
            assert_eq!(workflow.metadata.failed_steps, 0);
            assert_eq!(workflow.metadata.progress, 0);
            assert!(workflow.steps.iter().all(|s| s.status == ExecutionStatus::Pending));
            assert!(workflow.steps.iter().all(|s| s.retry_count == 0));
            assert!(workflow.steps.iter().all(|s| (1..=3).contains(&s.max_retries)));
            assert!(workflow.validate_graph().is_ok());
        }
    }

    #[test]
    fn test_purchase_detection_is_linear_chain() {
        let workflow = WorkflowEngine::new()
            .create_workflow(&request("purchase_detection"))
            .unwrap();

        assert_eq!(workflow.steps.len(), 4);
        assert!(workflow.steps[0].input_dependency().is_none());
        for pair in workflow.steps.windows(2) {
            assert_eq!(pair[1].input_dependency(), Some(pair[0].id.as_str()));
            assert_eq!(workflow.dependencies_of(&pair[1].id), &[pair[0].id.clone()]);
        }
        let retries: Vec<u32> = workflow.steps.iter().map(|s| s.max_retries).collect();
        assert_eq!(retries, vec![3, 2, 3, 2]);
    }

    #[test]
    fn test_data_sync_has_no_internal_dependencies() {
        let workflow = WorkflowEngine::new()
            .create_workflow(&request("data_sync"))
            .unwrap();

        assert_eq!(workflow.steps.len(), 3);
        let ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &workflow.steps {
            assert!(step.input_dependency().map_or(true, |dep| !ids.contains(dep)));
        }
        assert!(workflow.dependencies.is_empty());
    }

    #[test]
    fn test_unrecognized_intent_uses_default_workflow() {
        let workflow = WorkflowEngine::new()
            .create_workflow(&request("bogus_intent"))
            .unwrap();

        assert_eq!(workflow.steps.len(), 1);
        assert_eq!(workflow.steps[0].agent_type, AgentType::ProductIntelligence);
        assert_eq!(workflow.steps[0].max_retries, 1);
        assert_eq!(workflow.intent_type, IntentType::Other("bogus_intent".to_string()));
    }

    #[test]
    fn test_identical_requests_give_distinct_ids_same_shape() {
        let engine = WorkflowEngine::new();
        let request = request("purchase_detection");

        let first = engine.create_workflow(&request).unwrap();
        let second = engine.create_workflow(&request).unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.steps[0].id, second.steps[0].id);
        assert_eq!(shape(&first), shape(&second));
    }

    #[test]
    fn test_step_ids_unique_within_workflow() {
        let workflow = WorkflowEngine::new()
            .create_workflow(&request("purchase_detection"))
            .unwrap();
        let ids: HashSet<&StepId> = workflow.steps.iter().map(|s| &s.id).collect();
        assert_eq!(ids.len(), workflow.steps.len());
    }

    #[test]
    fn test_user_query_without_text() {
        let workflow = WorkflowEngine::new()
            .create_workflow(&request("user_query"))
            .unwrap();

        assert_eq!(workflow.steps.len(), 1);
        assert!(workflow.steps[0].input.get("query").is_none());
    }

    #[test]
    fn test_claim_processing_end_to_end() {
        let intent: UserIntent = serde_json::from_value(serde_json::json!({
            "type": "claim_processing",
            "parameters": {}
        }))
        .unwrap();
        let request = OrchestrationRequest::builder("u1", intent).build().unwrap();

        let workflow = WorkflowEngine::new().create_workflow(&request).unwrap();

        assert_eq!(workflow.user_id, "u1");
        assert_eq!(workflow.request_id, request.id);
        assert_eq!(workflow.status, ExecutionStatus::Pending);
        assert_eq!(workflow.metadata.progress, 0);

        let names: Vec<&str> = workflow.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Get Claimable Products", "Process Claims"]);
        assert!(workflow
            .steps
            .iter()
            .all(|s| s.agent_type == AgentType::WarrantyClaim));
        assert_eq!(
            workflow.steps[1].input_dependency(),
            Some(workflow.steps[0].id.as_str())
        );
        assert_eq!(workflow.steps[0].max_retries, 2);
        assert_eq!(workflow.steps[1].max_retries, 3);
    }

    #[test]
    fn test_request_is_not_mutated() {
        let request = request("warranty_research");
        let before = serde_json::to_value(&request).unwrap();
        WorkflowEngine::new().create_workflow(&request).unwrap();
        assert_eq!(serde_json::to_value(&request).unwrap(), before);
    }

    #[test]
    fn test_malformed_intent_is_compilation_error() {
        let mut request = request("data_sync");
        request.intent.confidence = 4.0;

        let result = WorkflowEngine::new().create_workflow(&request);
        assert!(matches!(result, Err(TesseraError::CompilationFailed { .. })));
    }

    #[test]
    fn test_step_limit_is_enforced() {
        let engine = WorkflowEngine::with_config(CompilerConfig {
            max_steps: 2,
            ..Default::default()
        });

        assert!(engine.create_workflow(&request("data_sync")).is_err());
        assert!(engine.create_workflow(&request("claim_processing")).is_ok());
    }

    #[test]
    fn test_failure_policy_is_stamped() {
        let mut engine = WorkflowEngine::new();
        engine.set_config(CompilerConfig {
            failure_policy: FailurePolicy::BestEffort,
            ..Default::default()
        });

        let workflow = engine.compile(&request("data_sync")).unwrap();
        assert_eq!(workflow.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(engine.config().failure_policy, FailurePolicy::BestEffort);
    }
}
