//! Application state.

use std::sync::Arc;

use tessera_compiler::WorkflowEngine;
use tessera_core::Result;
use tessera_executor::{AgentRegistry, EventBus, Executor, InMemoryWorkflowStore, WorkflowStore};

use crate::agents::registry_from_endpoints;
use crate::config::NodeConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Compiles requests into workflows.
    pub engine: Arc<WorkflowEngine>,

    /// Runs workflows and owns the store and event bus.
    pub executor: Arc<Executor>,
}

impl AppState {
    /// Build the state described by `config`, with remote agents for every
    /// configured endpoint.
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        Self::with_agents(config, registry_from_endpoints(&config.agents))
    }

    /// Build the state with an explicit agent registry.
    pub fn with_agents(config: &NodeConfig, agents: AgentRegistry) -> Result<Self> {
        Self::with_store(config, agents, Arc::new(InMemoryWorkflowStore::new()))
    }

    /// Build the state on top of an existing workflow store.
    pub fn with_store(
        config: &NodeConfig,
        agents: AgentRegistry,
        store: Arc<dyn WorkflowStore>,
    ) -> Result<Self> {
        let executor = Executor::with_config(config.executor.clone(), agents, store)?
            .with_events(EventBus::new(config.event_capacity));

        Ok(Self {
            engine: Arc::new(WorkflowEngine::with_config(config.compiler.clone())),
            executor: Arc::new(executor),
        })
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        self.executor.store()
    }
}
