//! Common types used across Tessera.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TesseraError;

/// Status shared by workflows and their steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Compiled, not yet dispatched.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed and will not be retried.
    Failed,
    /// Cancelled before it could finish.
    Cancelled,
    /// Failed once and waiting to be dispatched again.
    Retrying,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Returns true if work is in progress or queued for another attempt.
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::Retrying)
    }
}

/// Priority level for an orchestration request. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Processed when resources are available.
    Low,
    /// Normal priority (default).
    #[default]
    Medium,
    /// Processed before medium.
    High,
    /// Processed immediately.
    Urgent,
}

/// Agents a workflow step can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    EmailMonitoring,
    RetailerApi,
    BankIntegration,
    DuplicateDetection,
    ProductIntelligence,
    WarrantyIntelligence,
    WarrantyClaim,
    CashExtraction,
    BrowserExtension,
    MobileApp,
}

impl AgentType {
    /// Every agent type, in declaration order.
    pub const ALL: [AgentType; 10] = [
        AgentType::EmailMonitoring,
        AgentType::RetailerApi,
        AgentType::BankIntegration,
        AgentType::DuplicateDetection,
        AgentType::ProductIntelligence,
        AgentType::WarrantyIntelligence,
        AgentType::WarrantyClaim,
        AgentType::CashExtraction,
        AgentType::BrowserExtension,
        AgentType::MobileApp,
    ];

    /// The wire identifier of this agent type.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::EmailMonitoring => "email-monitoring",
            AgentType::RetailerApi => "retailer-api",
            AgentType::BankIntegration => "bank-integration",
            AgentType::DuplicateDetection => "duplicate-detection",
            AgentType::ProductIntelligence => "product-intelligence",
            AgentType::WarrantyIntelligence => "warranty-intelligence",
            AgentType::WarrantyClaim => "warranty-claim",
            AgentType::CashExtraction => "cash-extraction",
            AgentType::BrowserExtension => "browser-extension",
            AgentType::MobileApp => "mobile-app",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentType::ALL
            .into_iter()
            .find(|agent| agent.as_str() == s)
            .ok_or_else(|| TesseraError::Internal(format!("unknown agent type '{}'", s)))
    }
}
