//! Remote agents reached over HTTP.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::{AgentType, Result, TesseraError};
use tessera_executor::{Agent, AgentRegistry, AgentRequest};
use tracing::{debug, info};

/// Agent that POSTs the step request as JSON to a fixed endpoint and uses
/// the JSON response body as the step output.
///
/// Connection errors and 5xx answers are recoverable, 4xx answers are not.
#[derive(Clone)]
pub struct HttpAgent {
    agent_type: AgentType,
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpAgent {
    /// Agents built from one config share `http_client` and its pool.
    pub fn with_client(
        agent_type: AgentType,
        endpoint: impl Into<String>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            agent_type,
            endpoint: endpoint.into(),
            http_client,
        }
    }

    fn failure(&self, message: String, recoverable: bool) -> TesseraError {
        TesseraError::AgentFailed {
            agent_type: self.agent_type,
            message,
            recoverable,
        }
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    async fn execute(&self, request: AgentRequest) -> Result<serde_json::Value> {
        debug!(
            agent_type = %self.agent_type,
            step_id = %request.step_id,
            endpoint = %self.endpoint,
            "Calling remote agent"
        );

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.failure(e.to_string(), true))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.failure(
                format!("{} answered {}: {}", self.endpoint, status, body),
                status.is_server_error(),
            ));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| self.failure(format!("invalid response body: {}", e), false))
    }
}

/// Build a registry with one [`HttpAgent`] per configured endpoint.
pub fn registry_from_endpoints(endpoints: &BTreeMap<AgentType, String>) -> AgentRegistry {
    let http_client = reqwest::Client::new();
    let mut registry = AgentRegistry::new();

    for (agent_type, endpoint) in endpoints {
        info!(%agent_type, %endpoint, "Registering remote agent");
        registry.register(Arc::new(HttpAgent::with_client(
            *agent_type,
            endpoint.clone(),
            http_client.clone(),
        )));
    }

    registry
}
