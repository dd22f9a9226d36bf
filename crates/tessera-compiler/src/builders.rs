//! Per-intent step builders.
//!
//! Each builder is a pure mapping from a request to step templates. Ids and
//! dependency links are assigned afterwards by the engine, so builders only
//! state whether a step follows the one declared before it.

use serde_json::{Map, Value};
use tessera_core::{AgentType, IntentType, OrchestrationRequest};

/// How a template relates to the step declared before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// No producer; may run as soon as the workflow starts.
    Independent,
    /// Waits for the previously declared step.
    Previous,
}

/// A step before ids are assigned.
#[derive(Debug, Clone)]
pub struct StepTemplate {
    pub name: &'static str,
    pub agent_type: AgentType,
    pub max_retries: u32,
    pub input: Map<String, Value>,
    pub link: Link,
}

impl StepTemplate {
    fn new(name: &'static str, agent_type: AgentType, max_retries: u32, input: Map<String, Value>) -> Self {
        Self {
            name,
            agent_type,
            max_retries,
            input,
            link: Link::Independent,
        }
    }

    fn after_previous(mut self) -> Self {
        self.link = Link::Previous;
        self
    }
}

/// Select the builder for the request's intent. An `Other` carrying a named
/// identifier gets that intent's builder.
pub fn steps_for(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    match request.intent.intent_type.normalized() {
        IntentType::PurchaseDetection => purchase_detection(request),
        IntentType::ProductEnrichment => product_enrichment(request),
        IntentType::WarrantyResearch => warranty_research(request),
        IntentType::ValueOptimization => value_optimization(request),
        IntentType::ClaimProcessing => claim_processing(request),
        IntentType::CashExtraction => cash_extraction(request),
        IntentType::MaintenanceScheduling => maintenance_scheduling(request),
        IntentType::UserQuery => user_query(request),
        IntentType::DataSync => data_sync(request),
        IntentType::Other(_) => default_processing(request),
    }
}

fn input(request: &OrchestrationRequest, action: &str) -> Map<String, Value> {
    let mut input = Map::new();
    input.insert("userId".to_string(), Value::String(request.user_id.clone()));
    input.insert("action".to_string(), Value::String(action.to_string()));
    input
}

/// Input for the first step of a chain, which also sees the intent parameters.
fn entry_input(request: &OrchestrationRequest, action: &str) -> Map<String, Value> {
    let mut input = input(request, action);
    input.insert("parameters".to_string(), request.intent.parameters.clone());
    input
}

/// `fetch -> act` pipeline on a single agent, retries 2 then 3.
fn fetch_then_act(
    request: &OrchestrationRequest,
    agent_type: AgentType,
    fetch: (&'static str, &str),
    act: (&'static str, &str),
) -> Vec<StepTemplate> {
    vec![
        StepTemplate::new(fetch.0, agent_type, 2, entry_input(request, fetch.1)),
        StepTemplate::new(act.0, agent_type, 3, input(request, act.1)).after_previous(),
    ]
}

fn purchase_detection(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    vec![
        StepTemplate::new(
            "Purchase Detection",
            AgentType::EmailMonitoring,
            3,
            entry_input(request, "detect_purchases"),
        ),
        StepTemplate::new(
            "Duplicate Detection",
            AgentType::DuplicateDetection,
            2,
            input(request, "check_duplicates"),
        )
        .after_previous(),
        StepTemplate::new(
            "Product Intelligence",
            AgentType::ProductIntelligence,
            3,
            input(request, "enrich_products"),
        )
        .after_previous(),
        StepTemplate::new(
            "Warranty Intelligence",
            AgentType::WarrantyIntelligence,
            2,
            input(request, "research_warranties"),
        )
        .after_previous(),
    ]
}

fn product_enrichment(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    fetch_then_act(
        request,
        AgentType::ProductIntelligence,
        ("Get Products", "get_products"),
        ("Enrich Products", "enrich_products"),
    )
}

fn warranty_research(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    fetch_then_act(
        request,
        AgentType::WarrantyIntelligence,
        ("Get Products", "get_products"),
        ("Research Warranties", "research_warranties"),
    )
}

fn value_optimization(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    fetch_then_act(
        request,
        AgentType::CashExtraction,
        ("Get Products", "get_products"),
        ("Find Value Opportunities", "find_value_opportunities"),
    )
}

fn claim_processing(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    fetch_then_act(
        request,
        AgentType::WarrantyClaim,
        ("Get Claimable Products", "get_claimable_products"),
        ("Process Claims", "process_claims"),
    )
}

fn cash_extraction(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    fetch_then_act(
        request,
        AgentType::CashExtraction,
        ("Get Products", "get_products"),
        ("Find Cash Opportunities", "find_cash_opportunities"),
    )
}

fn maintenance_scheduling(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    fetch_then_act(
        request,
        AgentType::ProductIntelligence,
        ("Get Products for Maintenance", "get_products_for_maintenance"),
        ("Schedule Maintenance", "schedule_maintenance"),
    )
}

fn user_query(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    let mut input = input(request, "process_query");
    if let Some(text) = request.intent.parameters.get("text") {
        input.insert("query".to_string(), text.clone());
    }
    if !request.intent.entities.is_empty() {
        if let Ok(entities) = serde_json::to_value(&request.intent.entities) {
            input.insert("entities".to_string(), entities);
        }
    }

    vec![StepTemplate::new(
        "Process Query",
        AgentType::ProductIntelligence,
        2,
        input,
    )]
}

/// Three independent sources, declared without links so they can fan out.
fn data_sync(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    vec![
        StepTemplate::new(
            "Email Sync",
            AgentType::EmailMonitoring,
            2,
            entry_input(request, "sync_email"),
        ),
        StepTemplate::new(
            "Retailer Sync",
            AgentType::RetailerApi,
            2,
            entry_input(request, "sync_retailers"),
        ),
        StepTemplate::new(
            "Bank Sync",
            AgentType::BankIntegration,
            2,
            entry_input(request, "sync_bank"),
        ),
    ]
}

fn default_processing(request: &OrchestrationRequest) -> Vec<StepTemplate> {
    let mut input = entry_input(request, "default_processing");
    input.insert(
        "intentType".to_string(),
        Value::String(request.intent.intent_type.to_string()),
    );

    vec![StepTemplate::new(
        "Default Processing",
        AgentType::ProductIntelligence,
        1,
        input,
    )]
}
