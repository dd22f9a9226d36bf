//! Intent classification types.
//!
//! A [`UserIntent`] is what the classifier decided a caller wants done. The
//! compiler only looks at its [`IntentType`]; parameters and entities ride
//! along to the agents.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// What kind of work an intent asks for.
///
/// Unrecognized strings are preserved in [`IntentType::Other`] and routed to
/// the default workflow instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntentType {
    PurchaseDetection,
    ProductEnrichment,
    WarrantyResearch,
    ValueOptimization,
    ClaimProcessing,
    CashExtraction,
    MaintenanceScheduling,
    UserQuery,
    DataSync,
    /// Any other classification.
    Other(String),
}

impl IntentType {
    /// The nine named intent kinds.
    pub const NAMED: [IntentType; 9] = [
        IntentType::PurchaseDetection,
        IntentType::ProductEnrichment,
        IntentType::WarrantyResearch,
        IntentType::ValueOptimization,
        IntentType::ClaimProcessing,
        IntentType::CashExtraction,
        IntentType::MaintenanceScheduling,
        IntentType::UserQuery,
        IntentType::DataSync,
    ];

    /// The wire identifier of this intent kind.
    pub fn as_str(&self) -> &str {
        match self {
            IntentType::PurchaseDetection => "purchase_detection",
            IntentType::ProductEnrichment => "product_enrichment",
            IntentType::WarrantyResearch => "warranty_research",
            IntentType::ValueOptimization => "value_optimization",
            IntentType::ClaimProcessing => "claim_processing",
            IntentType::CashExtraction => "cash_extraction",
            IntentType::MaintenanceScheduling => "maintenance_scheduling",
            IntentType::UserQuery => "user_query",
            IntentType::DataSync => "data_sync",
            IntentType::Other(raw) => raw,
        }
    }

    /// Map an `Other` holding a named identifier to its named variant.
    pub fn normalized(&self) -> IntentType {
        match self {
            IntentType::Other(raw) => IntentType::from(raw.clone()),
            named => named.clone(),
        }
    }

    /// Returns true for classifications outside the named set.
    pub fn is_fallback(&self) -> bool {
        matches!(self.normalized(), IntentType::Other(_))
    }
}

impl From<String> for IntentType {
    fn from(raw: String) -> Self {
        IntentType::NAMED
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .unwrap_or(IntentType::Other(raw))
    }
}

impl From<&str> for IntentType {
    fn from(raw: &str) -> Self {
        IntentType::from(raw.to_string())
    }
}

impl From<IntentType> for String {
    fn from(kind: IntentType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of span the classifier extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Product,
    Retailer,
    Date,
    Price,
    Category,
    Brand,
}

/// A typed span extracted from the caller's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: EntityType,

    /// The extracted text.
    pub value: String,

    /// Start offset (inclusive).
    pub start: usize,

    /// End offset (exclusive).
    pub end: usize,

    pub confidence: f32,
}

/// Classification of an orchestration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIntent {
    #[serde(rename = "type")]
    pub intent_type: IntentType,

    /// Free-form action label.
    #[serde(default)]
    pub action: String,

    /// Free-form parameters specific to the intent.
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,

    /// Classifier confidence (0.0 to 1.0).
    #[serde(default = "full_confidence")]
    pub confidence: f32,

    #[serde(default)]
    pub entities: Vec<Entity>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn full_confidence() -> f32 {
    1.0
}

impl UserIntent {
    /// Create a new IntentBuilder.
    pub fn builder(intent_type: impl Into<IntentType>) -> IntentBuilder {
        IntentBuilder::new(intent_type)
    }

    /// Look up a string parameter.
    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    /// Validate the intent.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(TesseraError::RequestInvalid {
                request_id: None,
                message: format!("Intent confidence must be within [0, 1], got {}", self.confidence),
            });
        }

        if !self.parameters.is_object() && !self.parameters.is_null() {
            return Err(TesseraError::RequestInvalid {
                request_id: None,
                message: "Intent parameters must be a JSON object".to_string(),
            });
        }

        for entity in &self.entities {
            if entity.start > entity.end {
                return Err(TesseraError::RequestInvalid {
                    request_id: None,
                    message: format!(
                        "Entity '{}' has start {} after end {}",
                        entity.value, entity.start, entity.end
                    ),
                });
            }
            if !(0.0..=1.0).contains(&entity.confidence) {
                return Err(TesseraError::RequestInvalid {
                    request_id: None,
                    message: format!("Entity '{}' confidence out of range", entity.value),
                });
            }
        }

        Ok(())
    }
}

/// Builder for creating intents with a fluent API.
#[derive(Debug)]
pub struct IntentBuilder {
    intent_type: IntentType,
    action: String,
    parameters: serde_json::Map<String, serde_json::Value>,
    confidence: f32,
    entities: Vec<Entity>,
}

impl IntentBuilder {
    /// Create a new IntentBuilder.
    pub fn new(intent_type: impl Into<IntentType>) -> Self {
        Self {
            intent_type: intent_type.into().normalized(),
            action: String::new(),
            parameters: serde_json::Map::new(),
            confidence: 1.0,
            entities: Vec::new(),
        }
    }

    /// Set the action label.
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    /// Add a parameter.
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Set the classifier confidence.
    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Add an extracted entity.
    pub fn entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    /// Build and validate the intent.
    pub fn build(self) -> Result<UserIntent> {
        let intent = UserIntent {
            intent_type: self.intent_type,
            action: self.action,
            parameters: serde_json::Value::Object(self.parameters),
            confidence: self.confidence,
            entities: self.entities,
        };
        intent.validate()?;
        Ok(intent)
    }
}
