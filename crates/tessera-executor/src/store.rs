//! Workflow store implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_core::{Result, TesseraError, WorkflowExecution, WorkflowId};
use tokio::sync::RwLock;

/// A workflow together with its store version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredWorkflow {
    pub workflow: WorkflowExecution,

    /// Version number (monotonically increasing per workflow).
    pub version: u64,

    /// Timestamp when this version was written.
    pub updated_at: DateTime<Utc>,
}

/// Trait for workflow stores.
///
/// Updates are optimistic: `save` only succeeds when the caller read the
/// latest version, which gives read-modify-write consistency per workflow.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert a new workflow. Returns its first version.
    async fn insert(&self, workflow: WorkflowExecution) -> Result<u64>;

    /// Get the current record for a workflow.
    async fn get(&self, id: &WorkflowId) -> Result<Option<StoredWorkflow>>;

    /// Replace a workflow if its stored version is still `expected_version`.
    async fn save(&self, workflow: &WorkflowExecution, expected_version: u64) -> Result<u64>;

    /// All workflows owned by a user, oldest first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<WorkflowExecution>>;

    /// Workflows that have not reached a terminal status.
    async fn list_active(&self) -> Result<Vec<WorkflowExecution>>;
}

/// In-memory implementation of WorkflowStore.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowStore {
    workflows: Arc<RwLock<HashMap<WorkflowId, StoredWorkflow>>>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory workflow store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored workflows.
    pub async fn len(&self) -> usize {
        self.workflows.read().await.len()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert(&self, workflow: WorkflowExecution) -> Result<u64> {
        let mut workflows = self.workflows.write().await;

        if let Some(existing) = workflows.get(&workflow.id) {
            return Err(TesseraError::VersionConflict {
                workflow_id: workflow.id.to_string(),
                expected: 0,
                actual: existing.version,
            });
        }

        workflows.insert(
            workflow.id.clone(),
            StoredWorkflow {
                workflow,
                version: 1,
                updated_at: Utc::now(),
            },
        );
        Ok(1)
    }

    async fn get(&self, id: &WorkflowId) -> Result<Option<StoredWorkflow>> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(id).cloned())
    }

    async fn save(&self, workflow: &WorkflowExecution, expected_version: u64) -> Result<u64> {
        let mut workflows = self.workflows.write().await;

        let stored = workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| TesseraError::WorkflowNotFound(workflow.id.to_string()))?;

        if stored.version != expected_version {
            return Err(TesseraError::VersionConflict {
                workflow_id: workflow.id.to_string(),
                expected: expected_version,
                actual: stored.version,
            });
        }

        stored.workflow = workflow.clone();
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(stored.version)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<WorkflowExecution>> {
        let workflows = self.workflows.read().await;

        let mut owned: Vec<WorkflowExecution> = workflows
            .values()
            .filter(|s| s.workflow.user_id == user_id)
            .map(|s| s.workflow.clone())
            .collect();
        owned.sort_by_key(|w| w.start_time);

        Ok(owned)
    }

    async fn list_active(&self) -> Result<Vec<WorkflowExecution>> {
        let workflows = self.workflows.read().await;

        Ok(workflows
            .values()
            .filter(|s| !s.workflow.status.is_terminal())
            .map(|s| s.workflow.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_compiler::WorkflowEngine;
    use tessera_core::{OrchestrationRequest, UserIntent};

    fn workflow(user: &str) -> WorkflowExecution {
        let intent = UserIntent::builder("cash_extraction").build().unwrap();
        let request = OrchestrationRequest::builder(user, intent).build().unwrap();
        WorkflowEngine::new().create_workflow(&request).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryWorkflowStore::new();
        let wf = workflow("u1");
        let id = wf.id.clone();

        assert_eq!(store.insert(wf).await.unwrap(), 1);

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.workflow.user_id, "u1");
        assert!(store.get(&WorkflowId::new("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let store = InMemoryWorkflowStore::new();
        let wf = workflow("u1");

        store.insert(wf.clone()).await.unwrap();
        assert!(matches!(
            store.insert(wf).await,
            Err(TesseraError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_save_checks_version() {
        let store = InMemoryWorkflowStore::new();
        let mut wf = workflow("u1");
        store.insert(wf.clone()).await.unwrap();

        wf.start().unwrap();
        let v2 = store.save(&wf, 1).await.unwrap();
        assert_eq!(v2, 2);

        let stale = store.save(&wf, 1).await;
        assert!(matches!(
            stale,
            Err(TesseraError::VersionConflict { expected: 1, actual: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_save_unknown_workflow() {
        let store = InMemoryWorkflowStore::new();
        let wf = workflow("u1");
        assert!(matches!(
            store.save(&wf, 1).await,
            Err(TesseraError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listing() {
        let store = InMemoryWorkflowStore::new();
        let mut done = workflow("u1");
        done.cancel("not needed").unwrap();

        store.insert(done).await.unwrap();
        store.insert(workflow("u1")).await.unwrap();
        store.insert(workflow("u2")).await.unwrap();

        assert_eq!(store.len().await, 3);
        assert_eq!(store.list_for_user("u1").await.unwrap().len(), 2);
        assert_eq!(store.list_for_user("nobody").await.unwrap().len(), 0);
        assert_eq!(store.list_active().await.unwrap().len(), 2);
    }
}
