//! Structured activity logging shared by the compiler and the executor.

use tracing::info;

/// Emit an activity event for `component`. Fire-and-forget.
pub fn log_agent_activity(component: &str, message: &str, context: &serde_json::Value) {
    info!(
        target: "tessera::activity",
        component,
        context = %context,
        "{}",
        message
    );
}
