//! # Tessera Executor
//!
//! Runs compiled workflows: concurrent step dispatch to agents, per-step
//! timeouts, retries with backoff, cancellation, a versioned workflow store
//! and a broadcast event bus.

pub mod agent;
pub mod events;
pub mod executor;
pub mod store;

pub use agent::{Agent, AgentRegistry, AgentRequest};
pub use events::{EventBus, EventFilter, EventKind, EventSubscription, WorkflowEvent};
pub use executor::{Executor, ExecutorConfig};
pub use store::{InMemoryWorkflowStore, StoredWorkflow, WorkflowStore};
