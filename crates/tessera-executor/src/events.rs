//! Workflow event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_core::{AgentType, StepId, WorkflowExecution, WorkflowId};
use tokio::sync::broadcast;
use tracing::debug;

/// Something that happened to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub workflow_id: WorkflowId,

    pub user_id: String,

    pub kind: EventKind,

    /// Workflow progress (0-100) right after the event.
    pub progress: u8,

    pub timestamp: DateTime<Utc>,
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    StepStarted {
        step_id: StepId,
        agent_type: AgentType,
        attempt: u32,
    },
    StepCompleted {
        step_id: StepId,
        duration_ms: Option<u64>,
    },
    StepRetrying {
        step_id: StepId,
        retry_count: u32,
        error: String,
    },
    StepFailed {
        step_id: StepId,
        error: String,
    },
    WorkflowCompleted,
    WorkflowFailed {
        error: String,
    },
    WorkflowCancelled {
        reason: String,
    },
}

impl EventKind {
    /// Stable name used for filtering.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::StepStarted { .. } => "step_started",
            EventKind::StepCompleted { .. } => "step_completed",
            EventKind::StepRetrying { .. } => "step_retrying",
            EventKind::StepFailed { .. } => "step_failed",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::WorkflowFailed { .. } => "workflow_failed",
            EventKind::WorkflowCancelled { .. } => "workflow_cancelled",
        }
    }

    /// Returns true for the events that close a workflow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowCompleted
                | EventKind::WorkflowFailed { .. }
                | EventKind::WorkflowCancelled { .. }
        )
    }
}

impl WorkflowEvent {
    /// Stamp `kind` with the workflow's identity and current progress.
    pub fn new(workflow: &WorkflowExecution, kind: EventKind) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            user_id: workflow.user_id.clone(),
            kind,
            progress: workflow.metadata.progress,
            timestamp: Utc::now(),
        }
    }
}

/// Filter for subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub workflow_id: Option<WorkflowId>,

    pub user_id: Option<String>,

    /// Event names to pass (see [`EventKind::name`]).
    pub kinds: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a filter for one workflow.
    pub fn workflow(id: WorkflowId) -> Self {
        Self {
            workflow_id: Some(id),
            ..Default::default()
        }
    }

    /// Create a filter for one user's workflows.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// Restrict to the given event names.
    pub fn with_kinds(mut self, kinds: &[&str]) -> Self {
        self.kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &WorkflowEvent) -> bool {
        if let Some(ref id) = self.workflow_id {
            if &event.workflow_id != id {
                return false;
            }
        }

        if let Some(ref user) = self.user_id {
            if &event.user_id != user {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds {
            if !kinds.iter().any(|k| k == event.kind.name()) {
                return false;
            }
        }

        true
    }
}

/// Receiver side of a filtered subscription.
pub struct EventSubscription {
    pub filter: EventFilter,
    receiver: broadcast::Receiver<WorkflowEvent>,
}

impl EventSubscription {
    /// Next matching event, or `None` once the bus is gone.
    ///
    /// Events dropped because this subscriber lagged are skipped.
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Broadcast bus for workflow events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events with a filter.
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription {
            filter,
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish an event. Returns the number of live subscribers.
    pub fn publish(&self, event: WorkflowEvent) -> usize {
        // Publishing with nobody listening is fine.
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(workflow: &str, user: &str, kind: EventKind) -> WorkflowEvent {
        WorkflowEvent {
            workflow_id: WorkflowId::new(workflow),
            user_id: user.to_string(),
            kind,
            progress: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_filter_by_workflow() {
        let filter = EventFilter::workflow(WorkflowId::new("workflow-1-a"));
        assert!(filter.matches(&event("workflow-1-a", "u1", EventKind::WorkflowStarted)));
        assert!(!filter.matches(&event("workflow-2-b", "u1", EventKind::WorkflowStarted)));
    }

    #[test]
    fn test_filter_by_user_and_kind() {
        let filter = EventFilter::user("u1").with_kinds(&["workflow_completed"]);
        assert!(filter.matches(&event("w", "u1", EventKind::WorkflowCompleted)));
        assert!(!filter.matches(&event("w", "u1", EventKind::WorkflowStarted)));
        assert!(!filter.matches(&event("w", "u2", EventKind::WorkflowCompleted)));
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(EventKind::WorkflowCancelled {
            reason: "user".to_string()
        }
        .is_terminal());
        assert!(!EventKind::StepFailed {
            step_id: StepId::new("s"),
            error: "e".to_string()
        }
        .is_terminal());
    }

    #[tokio::test]
    async fn test_subscription_skips_non_matching() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(EventFilter::workflow(WorkflowId::new("mine")));
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(event("other", "u1", EventKind::WorkflowStarted));
        bus.publish(event("mine", "u1", EventKind::WorkflowCompleted));

        let received = sub.next().await.unwrap();
        assert_eq!(received.workflow_id, WorkflowId::new("mine"));
        assert_eq!(received.kind, EventKind::WorkflowCompleted);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(event("w", "u", EventKind::WorkflowStarted)), 0);
    }
}
