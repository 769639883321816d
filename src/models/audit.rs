use serde::{Deserialize, Serialize};

/// One append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub user_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    /// Decoded details payload; empty object when absent or undecodable.
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub timestamp: String,
}

/// Optional filters for audit log retrieval.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub success: Option<bool>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// Aggregate audit statistics over a time range.
#[derive(Debug, Serialize)]
pub struct AuditStatistics {
    pub total_events: i64,
    pub successful_events: i64,
    pub failed_events: i64,
    pub unique_users: i64,
    pub unique_actions: i64,
    pub unique_resource_types: i64,
    pub avg_execution_time: Option<f64>,
    pub first_event_time: Option<String>,
    pub last_event_time: Option<String>,
}

/// Per-(action, resource_type) event counts.
#[derive(Debug, Serialize)]
pub struct ActionSummary {
    pub action: String,
    pub resource_type: String,
    pub event_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub avg_execution_time: Option<f64>,
    pub last_occurrence: String,
}
