use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::analytics_db::AnalyticsDb;
use crate::metadata_db::{MetadataDb, ValueType};
use crate::models::dataset::{AnalyticsStats, Dataset, DatasetComplete};
use crate::models::observation::QueryFrame;

struct CachedPreference {
    value: Option<serde_json::Value>,
    cached_at: Instant,
}

/// Facade composing the metadata and analytics stores. This is the only
/// layer that runs cross-store operations or opens multi-table metadata
/// transactions.
pub struct UnifiedRepository {
    pub metadata: MetadataDb,
    pub analytics: AnalyticsDb,
    pref_cache: Mutex<HashMap<(String, String), CachedPreference>>,
}

impl UnifiedRepository {
    pub fn new(metadata: MetadataDb, analytics: AnalyticsDb) -> Self {
        Self {
            metadata,
            analytics,
            pref_cache: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory repository for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(
            MetadataDb::open_in_memory()?,
            AnalyticsDb::open_in_memory()?,
        ))
    }

    // ── Cross-store dataset operations ──

    /// Register a dataset in the metadata store and make sure the
    /// observation table exists for it on the analytics side.
    pub fn register_dataset_complete(
        &self,
        dataset_id: &str,
        name: &str,
        category: &str,
        description: &str,
        metadata: Option<&serde_json::Value>,
        source_agency: Option<&str>,
        priority: i64,
    ) -> anyhow::Result<bool> {
        let registered = self.metadata.register_dataset(
            dataset_id,
            name,
            category,
            description,
            metadata,
            source_agency,
            priority,
        )?;
        if !registered {
            return Ok(false);
        }
        self.analytics.ensure_observation_table()?;
        self.metadata.log_action(
            "dataset_registered",
            "dataset",
            None,
            Some(dataset_id),
            Some(&serde_json::json!({ "category": category, "priority": priority })),
            None,
            None,
            true,
            None,
            None,
        )?;
        Ok(true)
    }

    pub fn get_dataset_complete(&self, dataset_id: &str) -> anyhow::Result<Option<DatasetComplete>> {
        let Some(dataset) = self.metadata.get_dataset(dataset_id)? else {
            return Ok(None);
        };
        Ok(Some(self.augment_dataset(dataset)?))
    }

    pub fn list_datasets_complete(&self) -> anyhow::Result<Vec<DatasetComplete>> {
        let datasets = self.metadata.list_datasets(None, true, None, 0)?;
        datasets
            .into_iter()
            .map(|d| self.augment_dataset(d))
            .collect()
    }

    fn augment_dataset(&self, dataset: Dataset) -> anyhow::Result<DatasetComplete> {
        let row_count = self.analytics.count_by_dataset(&dataset.dataset_id)?;
        let analytics_stats = if row_count > 0 {
            let (min_time_period, max_time_period) =
                self.analytics.time_bounds(&dataset.dataset_id)?;
            Some(AnalyticsStats {
                row_count,
                min_time_period,
                max_time_period,
            })
        } else {
            None
        };
        Ok(DatasetComplete {
            dataset,
            has_analytics_data: row_count > 0,
            analytics_stats,
        })
    }

    /// Pass a query through to the analytics store, recording who ran it.
    pub fn execute_analytics_query(
        &self,
        sql: &str,
        params: &[&dyn duckdb::ToSql],
        user_id: Option<&str>,
    ) -> anyhow::Result<QueryFrame> {
        let started = Instant::now();
        let result = self.analytics.execute_query(sql, params);
        let elapsed_ms = started.elapsed().as_millis() as i64;
        self.metadata.log_action(
            "analytics_query",
            "analytics",
            user_id,
            None,
            Some(&serde_json::json!({ "sql": sql })),
            None,
            None,
            result.is_ok(),
            result.as_ref().err().map(|e| e.to_string()).as_deref(),
            Some(elapsed_ms),
        )?;
        result
    }

    /// Scoped metadata transaction: commit on success, rollback on any
    /// failure path.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        self.metadata.with_transaction(f)
    }

    // ── Cached user preferences ──

    /// Read a preference through a short-lived in-process cache. Entries are
    /// invalidated synchronously by the writing paths below.
    pub fn get_user_preference(
        &self,
        user_id: &str,
        key: &str,
        cache_minutes: u64,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let cache_key = (user_id.to_string(), key.to_string());
        let ttl = Duration::from_secs(cache_minutes * 60);
        {
            let cache = self.pref_cache.lock().unwrap();
            if let Some(entry) = cache.get(&cache_key) {
                if entry.cached_at.elapsed() < ttl {
                    return Ok(entry.value.clone());
                }
            }
        }

        let value = self.metadata.get_user_preference(user_id, key)?;
        let mut cache = self.pref_cache.lock().unwrap();
        cache.insert(
            cache_key,
            CachedPreference {
                value: value.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(value)
    }

    pub fn set_user_preference(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
        value_type: ValueType,
        is_encrypted: bool,
    ) -> anyhow::Result<bool> {
        let updated = self
            .metadata
            .set_user_preference(user_id, key, value, value_type, is_encrypted)?;
        if updated {
            let mut cache = self.pref_cache.lock().unwrap();
            cache.remove(&(user_id.to_string(), key.to_string()));
        }
        Ok(updated)
    }

    pub fn delete_user_preference(&self, user_id: &str, key: &str) -> anyhow::Result<bool> {
        let deleted = self.metadata.delete_user_preference(user_id, key)?;
        let mut cache = self.pref_cache.lock().unwrap();
        cache.remove(&(user_id.to_string(), key.to_string()));
        Ok(deleted)
    }

    // ── Audit convenience ──

    pub fn log_user_activity(
        &self,
        user_id: &str,
        action: &str,
        details: Option<&serde_json::Value>,
    ) -> anyhow::Result<bool> {
        self.metadata.log_action(
            action,
            "user_activity",
            Some(user_id),
            None,
            details,
            None,
            None,
            true,
            None,
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics_db::OBSERVATION_TABLE;
    use crate::models::observation::ObservationRecord;
    use serde_json::json;

    fn repo() -> UnifiedRepository {
        UnifiedRepository::open_in_memory().unwrap()
    }

    fn obs(dataset_id: &str, record_id: i64, value: &str, period: &str) -> ObservationRecord {
        ObservationRecord {
            dataset_id: dataset_id.to_string(),
            record_id,
            ingestion_timestamp: "2026-01-01T00:00:00.000000Z".to_string(),
            obs_value: value.to_string(),
            time_period: period.to_string(),
            additional_attributes: None,
        }
    }

    #[test]
    fn register_and_get_complete() {
        let repo = repo();
        assert!(repo
            .register_dataset_complete("101_1015", "Coltivazioni", "economia", "", None, None, 8)
            .unwrap());

        let complete = repo.get_dataset_complete("101_1015").unwrap().unwrap();
        assert!(!complete.has_analytics_data);
        assert!(complete.analytics_stats.is_none());

        repo.analytics
            .bulk_insert(
                OBSERVATION_TABLE,
                &[obs("101_1015", 0, "100", "2024"), obs("101_1015", 1, "200", "2024")],
            )
            .unwrap();

        let complete = repo.get_dataset_complete("101_1015").unwrap().unwrap();
        assert!(complete.has_analytics_data);
        let stats = complete.analytics_stats.unwrap();
        assert_eq!(stats.row_count, 2);
        assert_eq!(stats.min_time_period.as_deref(), Some("2024"));

        // Registration also produced an audit row.
        let logs = repo
            .metadata
            .get_audit_logs(&Default::default(), 10, 0)
            .unwrap();
        assert!(logs.iter().any(|l| l.action == "dataset_registered"));
    }

    #[test]
    fn analytics_query_is_audited() {
        let repo = repo();
        let frame = repo
            .execute_analytics_query("SELECT 1 AS one", &[], Some("analyst"))
            .unwrap();
        assert_eq!(frame.columns, vec!["one"]);

        let logs = repo
            .metadata
            .get_audit_logs(&Default::default(), 10, 0)
            .unwrap();
        assert_eq!(logs[0].action, "analytics_query");
        assert_eq!(logs[0].user_id.as_deref(), Some("analyst"));
    }

    #[test]
    fn preference_cache_serves_and_invalidates() {
        let repo = repo();
        repo.set_user_preference("u1", "theme", &json!("dark"), ValueType::String, false)
            .unwrap();
        assert_eq!(
            repo.get_user_preference("u1", "theme", 10).unwrap(),
            Some(json!("dark"))
        );

        // A direct store write bypasses the cache; the cached value remains
        // visible until invalidated by the repository write path.
        repo.metadata
            .set_user_preference("u1", "theme", &json!("light"), ValueType::String, false)
            .unwrap();
        assert_eq!(
            repo.get_user_preference("u1", "theme", 10).unwrap(),
            Some(json!("dark"))
        );

        // Writing through the repository invalidates synchronously.
        repo.set_user_preference("u1", "theme", &json!("solar"), ValueType::String, false)
            .unwrap();
        assert_eq!(
            repo.get_user_preference("u1", "theme", 10).unwrap(),
            Some(json!("solar"))
        );

        repo.delete_user_preference("u1", "theme").unwrap();
        assert_eq!(repo.get_user_preference("u1", "theme", 10).unwrap(), None);
    }
}
