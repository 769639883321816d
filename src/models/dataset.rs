use serde::{Deserialize, Serialize};

/// A registered dataset from the metadata registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub source_agency: String,
    pub priority: i64,
    pub is_active: bool,
    /// Free-form metadata mapping; empty object when absent or undecodable.
    pub metadata: serde_json::Value,
    pub quality_score: f64,
    pub record_count: i64,
    pub created_at: String,
    pub updated_at: String,
    pub last_processed: Option<String>,
}

/// Registry-wide summary statistics.
#[derive(Debug, Serialize)]
pub struct DatasetSummary {
    pub total_datasets: i64,
    pub active_datasets: i64,
    pub categories: i64,
    pub total_records: i64,
    pub avg_quality_score: f64,
    pub last_processing: Option<String>,
}

/// Analytics-side statistics for one dataset.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsStats {
    pub row_count: i64,
    pub min_time_period: Option<String>,
    pub max_time_period: Option<String>,
}

/// Metadata augmented with the analytics view of the same dataset.
#[derive(Debug, Serialize)]
pub struct DatasetComplete {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub has_analytics_data: bool,
    pub analytics_stats: Option<AnalyticsStats>,
}
