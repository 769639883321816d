use serde::{Deserialize, Serialize};

/// A keyword classification rule for dataflows.
///
/// Keywords are stored normalized (trimmed, lowercased, deduplicated);
/// match evaluation orders rules by priority DESC then rule_id ASC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorizationRule {
    pub rule_id: String,
    pub category: String,
    pub keywords: Vec<String>,
    pub priority: i64,
    pub is_active: bool,
    pub description: String,
}
