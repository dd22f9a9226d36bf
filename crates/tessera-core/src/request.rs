//! Orchestration requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TesseraError};
use crate::intent::UserIntent;
use crate::types::Priority;

/// Where a request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestSource {
    /// Direct user interaction.
    #[default]
    User,
    /// Raised by another component of the system.
    System,
    /// Periodic job.
    Scheduled,
    /// Inbound third-party callback.
    Webhook,
}

/// One request to orchestrate work for a user.
///
/// Immutable once built; the compiler only ever borrows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub id: Uuid,

    pub user_id: String,

    pub intent: UserIntent,

    /// Session, device and preference data. Passed through untouched.
    #[serde(default)]
    pub context: serde_json::Value,

    #[serde(default)]
    pub priority: Priority,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub source: RequestSource,
}

impl OrchestrationRequest {
    /// Create a new RequestBuilder.
    pub fn builder(user_id: impl Into<String>, intent: UserIntent) -> RequestBuilder {
        RequestBuilder::new(user_id, intent)
    }

    /// Validate the request and its intent.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(TesseraError::RequestInvalid {
                request_id: Some(self.id.to_string()),
                message: "User id cannot be empty".to_string(),
            });
        }

        self.intent.validate().map_err(|err| match err {
            TesseraError::RequestInvalid { message, .. } => TesseraError::RequestInvalid {
                request_id: Some(self.id.to_string()),
                message,
            },
            other => other,
        })
    }
}

/// Builder for orchestration requests.
#[derive(Debug)]
pub struct RequestBuilder {
    user_id: String,
    intent: UserIntent,
    context: serde_json::Value,
    priority: Priority,
    source: RequestSource,
}

impl RequestBuilder {
    /// Create a new RequestBuilder.
    pub fn new(user_id: impl Into<String>, intent: UserIntent) -> Self {
        Self {
            user_id: user_id.into(),
            intent,
            context: serde_json::Value::Null,
            priority: Priority::default(),
            source: RequestSource::default(),
        }
    }

    /// Set the opaque context bag.
    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the source.
    pub fn source(mut self, source: RequestSource) -> Self {
        self.source = source;
        self
    }

    /// Build the request.
    pub fn build(self) -> Result<OrchestrationRequest> {
        let request = OrchestrationRequest {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            intent: self.intent,
            context: self.context,
            priority: self.priority,
            timestamp: Utc::now(),
            source: self.source,
        };
        request.validate()?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::IntentType;

    fn intent() -> UserIntent {
        UserIntent::builder(IntentType::DataSync).build().unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = OrchestrationRequest::builder("u1", intent())
            .priority(Priority::Urgent)
            .source(RequestSource::Scheduled)
            .context(serde_json::json!({ "device": "ios" }))
            .build()
            .unwrap();

        assert_eq!(request.user_id, "u1");
        assert_eq!(request.priority, Priority::Urgent);
        assert_eq!(request.source, RequestSource::Scheduled);
        assert_eq!(request.context["device"], "ios");
    }

    #[test]
    fn test_request_requires_user() {
        let result = OrchestrationRequest::builder("  ", intent()).build();
        assert!(matches!(result, Err(TesseraError::RequestInvalid { .. })));
    }

    #[test]
    fn test_request_validation_tags_request_id() {
        let mut request = OrchestrationRequest::builder("u1", intent()).build().unwrap();
        request.intent.confidence = -0.1;

        match request.validate() {
            Err(TesseraError::RequestInvalid { request_id, .. }) => {
                assert_eq!(request_id, Some(request.id.to_string()));
            }
            other => panic!("unexpected validation result: {:?}", other),
        }
    }
}
