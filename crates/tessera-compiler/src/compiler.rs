//! Compiler trait and configuration.

use serde::{Deserialize, Serialize};
use tessera_core::{FailurePolicy, OrchestrationRequest, Result, WorkflowExecution};

/// Configuration for the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Maximum number of steps allowed in a compiled workflow.
    pub max_steps: usize,

    /// Failure policy stamped on every compiled workflow.
    pub failure_policy: FailurePolicy,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_steps: 16,
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

/// Trait for turning requests into workflows.
///
/// Compilation is synchronous and pure apart from logging, so implementors
/// can be shared freely between tasks.
pub trait WorkflowCompiler: Send + Sync {
    /// Compile a pending workflow for the request.
    fn compile(&self, request: &OrchestrationRequest) -> Result<WorkflowExecution>;

    /// Get the compiler configuration.
    fn config(&self) -> &CompilerConfig;

    /// Update the compiler configuration.
    fn set_config(&mut self, config: CompilerConfig);
}
