//! Error types for Tessera.

use thiserror::Error;

use crate::types::{AgentType, ExecutionStatus};

/// Main error type for Tessera operations.
#[derive(Error, Debug, Clone)]
pub enum TesseraError {
    /// The orchestration request or its intent is malformed.
    #[error("Request invalid: {message}")]
    RequestInvalid {
        request_id: Option<String>,
        message: String,
    },

    /// Step construction failed while compiling a workflow.
    #[error("Workflow compilation failed for user {user_id}: {message}")]
    CompilationFailed { user_id: String, message: String },

    /// The step dependency graph references unknown steps or contains a cycle.
    #[error("Invalid step graph in workflow {workflow_id}: {message}")]
    InvalidGraph {
        workflow_id: String,
        message: String,
    },

    /// A status transition that the state machine does not allow.
    #[error("Invalid transition for {subject}: {from:?} -> {to:?}")]
    InvalidTransition {
        subject: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// A step was asked to run before its producers completed.
    #[error("Step {step_id} is waiting on {pending_dependency}")]
    DependencyNotMet {
        step_id: String,
        pending_dependency: String,
    },

    /// The workflow already reached completed, failed or cancelled.
    #[error("Workflow {workflow_id} is already {status:?}")]
    WorkflowTerminal {
        workflow_id: String,
        status: ExecutionStatus,
    },

    /// Step id not present in the workflow.
    #[error("Step {step_id} not found in workflow {workflow_id}")]
    StepNotFound {
        workflow_id: String,
        step_id: String,
    },

    /// Workflow id not present in the store.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No handler is registered for the agent type.
    #[error("No agent registered for {0}")]
    AgentNotFound(AgentType),

    /// The agent returned an error.
    #[error("Agent {agent_type} failed: {message}")]
    AgentFailed {
        agent_type: AgentType,
        message: String,
        recoverable: bool,
    },

    /// Operation timed out.
    #[error("Operation timed out after {duration_ms}ms: {message}")]
    Timeout { duration_ms: u64, message: String },

    /// Optimistic concurrency check failed in the workflow store.
    #[error("Version conflict on workflow {workflow_id}: expected {expected}, found {actual}")]
    VersionConflict {
        workflow_id: String,
        expected: u64,
        actual: u64,
    },

    /// Configuration rejected at load or construction time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Returns true if a retry of the failed operation could succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TesseraError::AgentFailed { recoverable, .. } => *recoverable,
            TesseraError::Timeout { .. } => true,
            TesseraError::VersionConflict { .. } => true,
            _ => false,
        }
    }

    /// Returns the workflow ID if available.
    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            TesseraError::InvalidGraph { workflow_id, .. }
            | TesseraError::WorkflowTerminal { workflow_id, .. }
            | TesseraError::StepNotFound { workflow_id, .. }
            | TesseraError::VersionConflict { workflow_id, .. } => Some(workflow_id),
            TesseraError::WorkflowNotFound(id) => Some(id),
            _ => None,
        }
    }
}

/// Convenience Result type for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        TesseraError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let timeout = TesseraError::Timeout {
            duration_ms: 500,
            message: "agent".to_string(),
        };
        assert!(timeout.is_recoverable());

        let missing = TesseraError::AgentNotFound(AgentType::BankIntegration);
        assert!(!missing.is_recoverable());

        let permanent = TesseraError::AgentFailed {
            agent_type: AgentType::RetailerApi,
            message: "bad credentials".to_string(),
            recoverable: false,
        };
        assert!(!permanent.is_recoverable());
    }

    #[test]
    fn test_workflow_id_lookup() {
        let err = TesseraError::WorkflowNotFound("workflow-1-abc".to_string());
        assert_eq!(err.workflow_id(), Some("workflow-1-abc"));
        assert!(TesseraError::Internal("x".to_string()).workflow_id().is_none());
    }
}
