//! Agent contract and registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_core::{AgentType, Result, StepId, WorkflowId};

/// Everything an agent receives for one attempt of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub step_name: String,
    pub user_id: String,

    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u32,

    /// The step input as compiled.
    pub input: serde_json::Value,

    /// Outputs of the steps this one depends on.
    #[serde(default)]
    pub dependency_outputs: BTreeMap<StepId, serde_json::Value>,
}

/// A worker that handles steps for one agent type.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The agent type this handler serves.
    fn agent_type(&self) -> AgentType;

    /// Run one attempt. Return a recoverable error to have the step retried.
    async fn execute(&self, request: AgentRequest) -> Result<serde_json::Value>;
}

/// Lookup table from agent type to handler.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentType, Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any handler for the same type.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.agent_type(), agent);
    }

    /// Builder-style registration.
    pub fn with(mut self, agent: Arc<dyn Agent>) -> Self {
        self.register(agent);
        self
    }

    /// Get the handler for an agent type.
    pub fn get(&self, agent_type: AgentType) -> Option<Arc<dyn Agent>> {
        self.agents.get(&agent_type).cloned()
    }

    /// Registered agent types, sorted.
    pub fn agent_types(&self) -> Vec<AgentType> {
        let mut types: Vec<AgentType> = self.agents.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(AgentType);

    #[async_trait]
    impl Agent for Echo {
        fn agent_type(&self) -> AgentType {
            self.0
        }

        async fn execute(&self, request: AgentRequest) -> Result<serde_json::Value> {
            Ok(request.input)
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = AgentRegistry::new()
            .with(Arc::new(Echo(AgentType::RetailerApi)))
            .with(Arc::new(Echo(AgentType::BankIntegration)));

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.agent_types(),
            vec![AgentType::RetailerApi, AgentType::BankIntegration]
        );
        assert!(registry.get(AgentType::MobileApp).is_none());

        let agent = registry.get(AgentType::RetailerApi).unwrap();
        let output = agent
            .execute(AgentRequest {
                workflow_id: WorkflowId::new("workflow-1-a"),
                step_id: StepId::new("step-1-a"),
                step_name: "Retailer Sync".to_string(),
                user_id: "u1".to_string(),
                attempt: 1,
                input: serde_json::json!({ "action": "sync_retailers" }),
                dependency_outputs: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(output["action"], "sync_retailers");
    }
}
