//! # Tessera Core
//!
//! Core primitives for intent-driven workflow orchestration.
//!
//! This crate provides the fundamental building blocks:
//! - [`UserIntent`] - Classified description of the work a caller wants
//! - [`OrchestrationRequest`] - One request to orchestrate work for a user
//! - [`WorkflowExecution`] - Compiled steps plus their execution state
//! - [`TesseraError`] - Error types

pub mod activity;
pub mod error;
pub mod intent;
pub mod lifecycle;
pub mod request;
pub mod types;
pub mod workflow;

// Re-exports for convenience
pub use activity::log_agent_activity;
pub use error::{Result, TesseraError};
pub use intent::{Entity, EntityType, IntentBuilder, IntentType, UserIntent};
pub use lifecycle::FailureOutcome;
pub use request::{OrchestrationRequest, RequestBuilder, RequestSource};
pub use types::*;
pub use workflow::{
    FailurePolicy, StepId, WorkflowExecution, WorkflowId, WorkflowMetadata, WorkflowStep,
    DEPENDS_ON_KEY,
};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::error::{Result, TesseraError};
    pub use crate::intent::{IntentType, UserIntent};
    pub use crate::request::OrchestrationRequest;
    pub use crate::types::{AgentType, ExecutionStatus, Priority};
    pub use crate::workflow::{StepId, WorkflowExecution, WorkflowId, WorkflowStep};
}
