use serde::{Deserialize, Serialize};

/// A single parsed SDMX observation bound for the analytics store.
///
/// `additional_attributes` carries every attribute seen on the observation
/// element and its children, keyed `<child_tag>_<attr>` (lowercased); the
/// observation element's own attributes are prefixed `obs_`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub dataset_id: String,
    pub record_id: i64,
    pub ingestion_timestamp: String,
    pub obs_value: String,
    pub time_period: String,
    pub additional_attributes: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ObservationRecord {
    pub fn attributes_json(&self) -> Option<String> {
        self.additional_attributes
            .as_ref()
            .map(|m| serde_json::Value::Object(m.clone()).to_string())
    }
}

/// A column-ordered tabular query result from the analytics store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryFrame {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_records(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (col, value) in self.columns.iter().zip(row.iter()) {
                    obj.insert(col.clone(), value.clone());
                }
                serde_json::Value::Object(obj)
            })
            .collect()
    }
}
