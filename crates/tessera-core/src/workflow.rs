//! Workflow aggregate and its steps.
//!
//! A [`WorkflowExecution`] is produced by the compiler in `pending` state and
//! afterwards mutated only through the transitions in [`crate::lifecycle`].
//! Dependencies between steps live in an explicit adjacency map so the graph
//! can be validated before anything is dispatched; dependent steps also carry
//! a `dependsOn` pointer inside their agent input.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TesseraError};
use crate::intent::IntentType;
use crate::request::OrchestrationRequest;
use crate::types::{AgentType, ExecutionStatus, Priority};

/// Key under which a dependent step's input names its producer.
pub const DEPENDS_ON_KEY: &str = "dependsOn";

const SUFFIX_LEN: usize = 9;
const SUFFIX_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

/// Workflow identifier, `workflow-<epoch-millis>-<random-suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn generate() -> Self {
        Self(format!(
            "workflow-{}-{}",
            Utc::now().timestamp_millis(),
            random_suffix()
        ))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The random part of the id, reused to scope step ids.
    pub fn suffix(&self) -> &str {
        self.0.rsplit('-').next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Step identifier, unique within its workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    /// `step-<index>-<workflow suffix>`: the index keeps ids unique inside a
    /// workflow, the suffix keeps them apart across workflows.
    pub fn for_workflow(workflow_id: &WorkflowId, index: usize) -> Self {
        Self(format!("step-{}-{}", index, workflow_id.suffix()))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an exhausted step affects the rest of its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first exhausted step fails the workflow and cancels everything
    /// that has not finished.
    #[default]
    FailFast,
    /// Only the exhausted step's transitive dependents are cancelled;
    /// independent branches run to completion. The workflow still ends
    /// `failed` because not every step completed.
    BestEffort,
}

/// One unit of dispatch, bound to a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,

    /// Human-readable label.
    pub name: String,

    pub agent_type: AgentType,

    pub status: ExecutionStatus,

    /// Payload handed to the agent. Always a JSON object.
    pub input: serde_json::Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    pub retry_count: u32,

    pub max_retries: u32,
}

impl WorkflowStep {
    /// Create a pending step with a fresh retry budget.
    pub fn new(
        id: StepId,
        name: impl Into<String>,
        agent_type: AgentType,
        input: serde_json::Map<String, serde_json::Value>,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            agent_type,
            status: ExecutionStatus::Pending,
            input: serde_json::Value::Object(input),
            output: None,
            error: None,
            start_time: None,
            end_time: None,
            retry_count: 0,
            max_retries,
        }
    }

    /// Record the producing step in the agent input.
    pub fn with_producer(mut self, producer: &StepId) -> Self {
        if let Some(input) = self.input.as_object_mut() {
            input.insert(
                DEPENDS_ON_KEY.to_string(),
                serde_json::Value::String(producer.to_string()),
            );
        }
        self
    }

    /// The producer named in the agent input, if any.
    pub fn input_dependency(&self) -> Option<&str> {
        self.input.get(DEPENDS_ON_KEY).and_then(|v| v.as_str())
    }

    /// Whether another failure would still be retried.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Wall-clock time of the latest attempt, once it ended.
    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.start_time?;
        let end = self.end_time?;
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}

/// Progress counters derived from the steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkflowMetadata {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,

    /// Percent of steps completed (0-100).
    pub progress: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl WorkflowMetadata {
    /// Fresh counters for a workflow with `total_steps` steps.
    pub fn new(total_steps: usize) -> Self {
        Self {
            total_steps,
            ..Default::default()
        }
    }
}

/// The compiled workflow and its execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: WorkflowId,

    pub request_id: Uuid,

    pub user_id: String,

    /// Intent the workflow was compiled from.
    pub intent_type: IntentType,

    pub priority: Priority,

    pub status: ExecutionStatus,

    /// Steps in declaration order. Execution order follows `dependencies`.
    pub steps: Vec<WorkflowStep>,

    /// Adjacency map: step id -> ids of the steps it waits on.
    pub dependencies: BTreeMap<StepId, Vec<StepId>>,

    /// Steps currently dispatched.
    pub in_flight: BTreeSet<StepId>,

    pub start_time: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub failure_policy: FailurePolicy,

    pub metadata: WorkflowMetadata,
}

impl WorkflowExecution {
    /// Assemble a pending workflow for `request`.
    ///
    /// `dependencies` lists, per step, the steps it waits on. Steps without
    /// an entry are independent.
    pub fn new(
        id: WorkflowId,
        request: &OrchestrationRequest,
        steps: Vec<WorkflowStep>,
        dependencies: BTreeMap<StepId, Vec<StepId>>,
        failure_policy: FailurePolicy,
    ) -> Self {
        let metadata = WorkflowMetadata::new(steps.len());
        Self {
            id,
            request_id: request.id,
            user_id: request.user_id.clone(),
            intent_type: request.intent.intent_type.normalized(),
            priority: request.priority,
            status: ExecutionStatus::Pending,
            steps,
            dependencies,
            in_flight: BTreeSet::new(),
            start_time: Utc::now(),
            end_time: None,
            total_duration_ms: None,
            error: None,
            failure_policy,
            metadata,
        }
    }

    /// Get a step by id.
    pub fn step(&self, id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub(crate) fn step_index(&self, id: &StepId) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| &s.id == id)
            .ok_or_else(|| TesseraError::StepNotFound {
                workflow_id: self.id.to_string(),
                step_id: id.to_string(),
            })
    }

    /// Ids of the steps `id` waits on.
    pub fn dependencies_of(&self, id: &StepId) -> &[StepId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ids of the steps that wait on `id`, directly or transitively.
    pub fn dependents_of(&self, id: &StepId) -> BTreeSet<StepId> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([id.clone()]);

        while let Some(current) = queue.pop_front() {
            for (step, producers) in &self.dependencies {
                if producers.contains(&current) && found.insert(step.clone()) {
                    queue.push_back(step.clone());
                }
            }
        }

        found
    }

    /// Whether every producer of `id` has completed.
    pub fn dependencies_satisfied(&self, id: &StepId) -> bool {
        self.dependencies_of(id).iter().all(|producer| {
            self.step(producer)
                .map_or(false, |s| s.status == ExecutionStatus::Completed)
        })
    }

    /// Steps that can be dispatched right now.
    pub fn ready_steps(&self) -> Vec<StepId> {
        if self.status != ExecutionStatus::Running {
            return Vec::new();
        }

        self.steps
            .iter()
            .filter(|s| matches!(s.status, ExecutionStatus::Pending | ExecutionStatus::Retrying))
            .filter(|s| !self.in_flight.contains(&s.id))
            .filter(|s| self.dependencies_satisfied(&s.id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Check ids are unique, every dependency resolves and the graph is acyclic.
    pub fn validate_graph(&self) -> Result<()> {
        self.topological_order().map(|_| ())
    }

    /// Step ids ordered so that producers precede their dependents.
    pub fn topological_order(&self) -> Result<Vec<StepId>> {
        let invalid = |message: String| TesseraError::InvalidGraph {
            workflow_id: self.id.to_string(),
            message,
        };

        let mut in_degree: HashMap<&StepId, usize> = HashMap::new();
        for step in &self.steps {
            if in_degree.insert(&step.id, 0).is_some() {
                return Err(invalid(format!("duplicate step id {}", step.id)));
            }
        }

        for (step, producers) in &self.dependencies {
            if !in_degree.contains_key(step) {
                return Err(invalid(format!("dependencies declared for unknown step {}", step)));
            }
            for producer in producers {
                if producer == step {
                    return Err(invalid(format!("step {} depends on itself", step)));
                }
                if !in_degree.contains_key(producer) {
                    return Err(invalid(format!("step {} depends on unknown step {}", step, producer)));
                }
            }
            if let Some(degree) = in_degree.get_mut(step) {
                *degree = producers.len();
            }
        }

        // Kahn's algorithm, seeded in declaration order.
        let mut queue: VecDeque<&StepId> = self
            .steps
            .iter()
            .map(|s| &s.id)
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            for step in &self.steps {
                if self.dependencies_of(&step.id).contains(id) {
                    if let Some(degree) = in_degree.get_mut(&step.id) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(&step.id);
                        }
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            return Err(invalid("dependency cycle detected".to_string()));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::UserIntent;

    fn request() -> OrchestrationRequest {
        let intent = UserIntent::builder("product_enrichment").build().unwrap();
        OrchestrationRequest::builder("u1", intent).build().unwrap()
    }

    fn chain(len: usize) -> WorkflowExecution {
        let id = WorkflowId::generate();
        let mut steps = Vec::new();
        let mut dependencies = BTreeMap::new();
        for index in 0..len {
            let step_id = StepId::for_workflow(&id, index + 1);
            let mut step = WorkflowStep::new(
                step_id.clone(),
                format!("Step {}", index + 1),
                AgentType::ProductIntelligence,
                serde_json::Map::new(),
                2,
            );
            if let Some(previous) = steps.last().map(|s: &WorkflowStep| s.id.clone()) {
                step = step.with_producer(&previous);
                dependencies.insert(step_id, vec![previous]);
            }
            steps.push(step);
        }
        WorkflowExecution::new(id, &request(), steps, dependencies, FailurePolicy::FailFast)
    }

    #[test]
    fn test_workflow_id_format() {
        let id = WorkflowId::generate();
        let parts: Vec<&str> = id.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "workflow");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert_eq!(id.suffix(), parts[2]);
    }

    #[test]
    fn test_step_ids_are_scoped_to_workflow() {
        let a = WorkflowId::new("workflow-1-aaaaaaaaa");
        let b = WorkflowId::new("workflow-1-bbbbbbbbb");
        assert_eq!(StepId::for_workflow(&a, 1).as_str(), "step-1-aaaaaaaaa");
        assert_ne!(StepId::for_workflow(&a, 1), StepId::for_workflow(&b, 1));
        assert_ne!(StepId::for_workflow(&a, 1), StepId::for_workflow(&a, 2));
    }

    #[test]
    fn test_with_producer_sets_input_pointer() {
        let producer = StepId::new("step-1-x");
        let step = WorkflowStep::new(
            StepId::new("step-2-x"),
            "Enrich",
            AgentType::ProductIntelligence,
            serde_json::Map::new(),
            3,
        )
        .with_producer(&producer);
        assert_eq!(step.input_dependency(), Some("step-1-x"));
    }

    #[test]
    fn test_new_workflow_metadata() {
        let workflow = chain(3);
        assert_eq!(workflow.status, ExecutionStatus::Pending);
        assert_eq!(workflow.metadata.total_steps, 3);
        assert_eq!(workflow.metadata.completed_steps, 0);
        assert_eq!(workflow.metadata.progress, 0);
        assert!(workflow.end_time.is_none());
    }

    #[test]
    fn test_topological_order_follows_chain() {
        let workflow = chain(4);
        let order = workflow.topological_order().unwrap();
        let declared: Vec<StepId> = workflow.steps.iter().map(|s| s.id.clone()).collect();
        assert_eq!(order, declared);
    }

    #[test]
    fn test_dependents_are_transitive() {
        let workflow = chain(3);
        let first = workflow.steps[0].id.clone();
        let dependents = workflow.dependents_of(&first);
        assert_eq!(dependents.len(), 2);
        assert!(workflow.dependents_of(&workflow.steps[2].id).is_empty());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut workflow = chain(2);
        let first = workflow.steps[0].id.clone();
        let second = workflow.steps[1].id.clone();
        workflow.dependencies.insert(first, vec![second]);
        assert!(matches!(
            workflow.validate_graph(),
            Err(TesseraError::InvalidGraph { .. })
        ));
    }

    #[test]
    fn test_missing_reference_is_rejected() {
        let mut workflow = chain(1);
        let only = workflow.steps[0].id.clone();
        workflow
            .dependencies
            .insert(only, vec![StepId::new("step-9-missing")]);
        assert!(workflow.validate_graph().is_err());
    }

    #[test]
    fn test_ready_steps_requires_running_workflow() {
        let mut workflow = chain(2);
        assert!(workflow.ready_steps().is_empty());
        workflow.status = ExecutionStatus::Running;
        assert_eq!(workflow.ready_steps(), vec![workflow.steps[0].id.clone()]);
    }
}
