use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::metadata_db::{ValueType, now_ts};
use crate::repository::UnifiedRepository;

fn policy_key(dataset_id: &str) -> String {
    format!("dataset.{dataset_id}.incremental_refresh_policy")
}

fn last_refresh_key(dataset_id: &str) -> String {
    format!("dataset.{dataset_id}.last_incremental_refresh")
}

/// Per-dataset incremental refresh policy, stored as JSON in the metadata
/// store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshPolicy {
    pub dataset_id: String,
    #[serde(default = "default_window_days")]
    pub incremental_window_days: i64,
    #[serde(default = "default_window_years")]
    pub historical_window_years: i64,
    #[serde(default = "default_frequency")]
    pub refresh_frequency: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: String,
}

fn default_window_days() -> i64 {
    30
}

fn default_window_years() -> i64 {
    2
}

fn default_frequency() -> String {
    "daily".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodChange {
    pub time_period: String,
    pub change_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerritoryChange {
    pub territory: String,
    pub change_count: i64,
}

/// Changes detected since a reference timestamp. The observation store is
/// append-only, so new and updated counters both equal the total.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeReport {
    pub has_changes: bool,
    pub total_changes: i64,
    pub new_records: i64,
    pub updated_records: i64,
    pub earliest_change: Option<String>,
    pub latest_change: Option<String>,
    pub affected_territories: i64,
    pub affected_periods: i64,
    pub change_summary: String,
    pub top_territories: Vec<TerritoryChange>,
    pub periods_affected: Vec<PeriodChange>,
}

/// Outcome of one refresh attempt. Exactly one of `error` / `skipped` /
/// success fields is meaningful.
#[derive(Debug, Serialize)]
pub struct RefreshResult {
    pub dataset_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub records_processed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes_detected: Option<ChangeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powerbi_push: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_pushed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_timestamp: Option<String>,
}

impl RefreshResult {
    fn base(dataset_id: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            error: None,
            skipped: None,
            records_processed: 0,
            changes_detected: None,
            powerbi_push: None,
            records_pushed: None,
            last_refresh: None,
            checked_at: None,
            refresh_timestamp: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RefreshStatus {
    pub dataset_id: String,
    pub policy_enabled: bool,
    pub refresh_frequency: String,
    pub last_refresh: String,
    pub next_scheduled_refresh: Option<String>,
    pub recent_changes: ChangeReport,
    pub status: String,
}

/// Best-effort push of delta rows to the PowerBI Service. Failures are
/// logged; local bookkeeping proceeds regardless.
#[async_trait]
pub trait PowerBiPush: Send + Sync {
    async fn push_rows(
        &self,
        powerbi_dataset_id: &str,
        rows: &[serde_json::Value],
    ) -> anyhow::Result<u64>;
}

/// Refresh policy CRUD plus delta-refresh execution.
pub struct IncrementalRefreshManager {
    repo: Arc<UnifiedRepository>,
    push_client: Option<Arc<dyn PowerBiPush>>,
}

impl IncrementalRefreshManager {
    pub fn new(repo: Arc<UnifiedRepository>, push_client: Option<Arc<dyn PowerBiPush>>) -> Self {
        Self { repo, push_client }
    }

    pub fn create_refresh_policy(
        &self,
        dataset_id: &str,
        incremental_window_days: i64,
        historical_window_years: i64,
        refresh_frequency: &str,
    ) -> anyhow::Result<RefreshPolicy> {
        let policy = RefreshPolicy {
            dataset_id: dataset_id.to_string(),
            incremental_window_days,
            historical_window_years,
            refresh_frequency: refresh_frequency.to_string(),
            enabled: true,
            created_at: now_ts(),
        };
        self.repo.metadata.set_config(
            &policy_key(dataset_id),
            &serde_json::to_value(&policy)?,
            ValueType::Json,
        )?;
        tracing::info!("refresh policy created for dataset {dataset_id}");
        Ok(policy)
    }

    pub fn get_refresh_policy(&self, dataset_id: &str) -> anyhow::Result<Option<RefreshPolicy>> {
        let Some(value) = self.repo.metadata.get_config(&policy_key(dataset_id))? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(policy) => Ok(Some(policy)),
            Err(e) => {
                tracing::warn!("undecodable refresh policy for {dataset_id}: {e}");
                Ok(None)
            }
        }
    }

    pub fn set_policy_enabled(&self, dataset_id: &str, enabled: bool) -> anyhow::Result<bool> {
        let Some(mut policy) = self.get_refresh_policy(dataset_id)? else {
            return Ok(false);
        };
        policy.enabled = enabled;
        self.repo.metadata.set_config(
            &policy_key(dataset_id),
            &serde_json::to_value(&policy)?,
            ValueType::Json,
        )
    }

    /// Changes since `since`, with top-10 territory and period breakdowns.
    pub fn detect_changes(&self, dataset_id: &str, since: &str) -> anyhow::Result<ChangeReport> {
        let total = self.repo.analytics.count_ingested_since(dataset_id, since)?;
        let (earliest, latest) = self.repo.analytics.change_bounds(dataset_id, since)?;
        let territories = self.repo.analytics.changes_by_territory(dataset_id, since)?;
        let periods = self.repo.analytics.changes_by_period(dataset_id, since)?;

        let summary = format!(
            "{total} total changes ({total} new, {total} updated) across {} territories",
            territories.len()
        );
        Ok(ChangeReport {
            has_changes: total > 0,
            total_changes: total,
            new_records: total,
            updated_records: total,
            earliest_change: earliest,
            latest_change: latest,
            affected_territories: territories.len() as i64,
            affected_periods: periods.len() as i64,
            change_summary: summary,
            top_territories: territories
                .into_iter()
                .map(|(territory, change_count)| TerritoryChange {
                    territory,
                    change_count,
                })
                .collect(),
            periods_affected: periods
                .into_iter()
                .map(|(time_period, change_count)| PeriodChange {
                    time_period,
                    change_count,
                })
                .collect(),
        })
    }

    /// Stored last-refresh timestamp, defaulting to 30 days back.
    fn last_refresh_timestamp(&self, dataset_id: &str) -> String {
        let stored = self
            .repo
            .metadata
            .get_config(&last_refresh_key(dataset_id))
            .ok()
            .flatten()
            .and_then(|v| v.as_str().map(str::to_string));
        stored.unwrap_or_else(|| {
            (chrono::Utc::now() - chrono::Duration::days(30))
                .format("%Y-%m-%dT%H:%M:%S%.6fZ")
                .to_string()
        })
    }

    pub async fn execute_incremental_refresh(
        &self,
        dataset_id: &str,
        powerbi_dataset_id: Option<&str>,
        force: bool,
    ) -> RefreshResult {
        match self.try_refresh(dataset_id, powerbi_dataset_id, force).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("incremental refresh failed for {dataset_id}: {e}");
                let mut result = RefreshResult::base(dataset_id);
                result.error = Some(e.to_string());
                result
            }
        }
    }

    async fn try_refresh(
        &self,
        dataset_id: &str,
        powerbi_dataset_id: Option<&str>,
        force: bool,
    ) -> anyhow::Result<RefreshResult> {
        let Some(policy) = self.get_refresh_policy(dataset_id)? else {
            let mut result = RefreshResult::base(dataset_id);
            result.error = Some(format!("No refresh policy found for {dataset_id}"));
            return Ok(result);
        };

        if !policy.enabled && !force {
            let mut result = RefreshResult::base(dataset_id);
            result.skipped = Some("Refresh policy disabled".to_string());
            return Ok(result);
        }

        let last_refresh = self.last_refresh_timestamp(dataset_id);
        let changes = self.detect_changes(dataset_id, &last_refresh)?;

        if !changes.has_changes && !force {
            let mut result = RefreshResult::base(dataset_id);
            result.skipped = Some("No changes detected".to_string());
            result.last_refresh = Some(last_refresh);
            result.checked_at = Some(now_ts());
            return Ok(result);
        }

        let delta = self
            .repo
            .analytics
            .fetch_ingested_since(dataset_id, &last_refresh, None)?;
        if delta.is_empty() {
            let mut result = RefreshResult::base(dataset_id);
            result.skipped = Some("No incremental data found".to_string());
            result.refresh_timestamp = Some(now_ts());
            return Ok(result);
        }

        let mut result = RefreshResult::base(dataset_id);
        result.records_processed = delta.rows.len() as i64;
        result.changes_detected = Some(changes);

        if let Some(push) = &self.push_client {
            let target = powerbi_dataset_id.unwrap_or(dataset_id);
            match push.push_rows(target, &delta.to_records()).await {
                Ok(pushed) => {
                    result.powerbi_push = Some("success".to_string());
                    result.records_pushed = Some(pushed);
                }
                Err(e) => {
                    tracing::warn!("PowerBI push failed for {dataset_id}: {e}");
                    result.powerbi_push = Some("failed".to_string());
                }
            }
        } else {
            result.powerbi_push = Some("skipped".to_string());
        }

        let refreshed_at = now_ts();
        self.repo.metadata.set_config(
            &last_refresh_key(dataset_id),
            &serde_json::json!(refreshed_at),
            ValueType::String,
        )?;
        result.refresh_timestamp = Some(refreshed_at);

        self.repo.metadata.log_action(
            "incremental_refresh",
            "dataset",
            Some("system"),
            Some(dataset_id),
            Some(&serde_json::json!({
                "records_processed": result.records_processed,
                "powerbi_push": result.powerbi_push,
            })),
            None,
            None,
            true,
            None,
            None,
        )?;

        tracing::info!("incremental refresh completed for {dataset_id}");
        Ok(result)
    }

    pub fn get_refresh_status(&self, dataset_id: &str) -> anyhow::Result<RefreshStatus> {
        let policy = self.get_refresh_policy(dataset_id)?;
        let last_refresh = self.last_refresh_timestamp(dataset_id);

        let week_ago = (chrono::Utc::now() - chrono::Duration::days(7))
            .format("%Y-%m-%dT%H:%M:%S%.6fZ")
            .to_string();
        let recent_changes = self.detect_changes(dataset_id, &week_ago)?;

        let next = policy
            .as_ref()
            .filter(|p| p.enabled)
            .and_then(|p| next_refresh_after(&last_refresh, &p.refresh_frequency));

        Ok(RefreshStatus {
            dataset_id: dataset_id.to_string(),
            policy_enabled: policy.as_ref().map(|p| p.enabled).unwrap_or(false),
            refresh_frequency: policy
                .as_ref()
                .map(|p| p.refresh_frequency.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            last_refresh,
            next_scheduled_refresh: next,
            recent_changes,
            status: if policy.map(|p| p.enabled).unwrap_or(false) {
                "active".to_string()
            } else {
                "inactive".to_string()
            },
        })
    }
}

/// Next scheduled refresh: frequency interval added to the last refresh.
fn next_refresh_after(last_refresh: &str, frequency: &str) -> Option<String> {
    let parsed = chrono::DateTime::parse_from_rfc3339(last_refresh).ok()?;
    let interval = match frequency {
        "daily" => chrono::Duration::days(1),
        "weekly" => chrono::Duration::weeks(1),
        "monthly" => chrono::Duration::days(30),
        _ => chrono::Duration::days(1),
    };
    Some(
        (parsed + interval)
            .with_timezone(&chrono::Utc)
            .format("%Y-%m-%dT%H:%M:%S%.6fZ")
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics_db::OBSERVATION_TABLE;
    use crate::models::observation::ObservationRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPush {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PowerBiPush for CountingPush {
        async fn push_rows(
            &self,
            _powerbi_dataset_id: &str,
            rows: &[serde_json::Value],
        ) -> anyhow::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(rows.len() as u64)
        }
    }

    fn obs(dataset_id: &str, record_id: i64, ts: &str) -> ObservationRecord {
        ObservationRecord {
            dataset_id: dataset_id.to_string(),
            record_id,
            ingestion_timestamp: ts.to_string(),
            obs_value: "1".to_string(),
            time_period: "2024".to_string(),
            additional_attributes: None,
        }
    }

    fn setup() -> (Arc<UnifiedRepository>, Arc<CountingPush>, IncrementalRefreshManager) {
        let repo = Arc::new(UnifiedRepository::open_in_memory().unwrap());
        repo.register_dataset_complete("101_1015", "Coltivazioni", "economia", "", None, None, 8)
            .unwrap();
        let push = Arc::new(CountingPush {
            calls: AtomicUsize::new(0),
        });
        let manager = IncrementalRefreshManager::new(repo.clone(), Some(push.clone()));
        (repo, push, manager)
    }

    #[test]
    fn policy_round_trip() {
        let (_repo, _push, manager) = setup();
        assert!(manager.get_refresh_policy("101_1015").unwrap().is_none());

        let policy = manager
            .create_refresh_policy("101_1015", 30, 2, "weekly")
            .unwrap();
        assert!(policy.enabled);

        let loaded = manager.get_refresh_policy("101_1015").unwrap().unwrap();
        assert_eq!(loaded.refresh_frequency, "weekly");
        assert_eq!(loaded.incremental_window_days, 30);

        assert!(manager.set_policy_enabled("101_1015", false).unwrap());
        assert!(!manager.get_refresh_policy("101_1015").unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn refresh_without_policy_errors() {
        let (_repo, _push, manager) = setup();
        let result = manager
            .execute_incremental_refresh("101_1015", None, false)
            .await;
        assert!(result.error.as_deref().unwrap_or("").contains("No refresh policy"));
    }

    #[tokio::test]
    async fn disabled_policy_skips_unless_forced() {
        let (repo, _push, manager) = setup();
        manager.create_refresh_policy("101_1015", 30, 2, "daily").unwrap();
        manager.set_policy_enabled("101_1015", false).unwrap();

        let result = manager
            .execute_incremental_refresh("101_1015", None, false)
            .await;
        assert_eq!(result.skipped.as_deref(), Some("Refresh policy disabled"));

        // Force with fresh rows proceeds.
        repo.analytics
            .bulk_insert(OBSERVATION_TABLE, &[obs("101_1015", 0, &now_ts())])
            .unwrap();
        let result = manager
            .execute_incremental_refresh("101_1015", None, true)
            .await;
        assert_eq!(result.records_processed, 1);
    }

    #[tokio::test]
    async fn delta_refresh_then_no_change_skip() {
        let (repo, push, manager) = setup();
        manager.create_refresh_policy("101_1015", 30, 2, "daily").unwrap();

        repo.analytics
            .bulk_insert(OBSERVATION_TABLE, &[obs("101_1015", 0, &now_ts())])
            .unwrap();

        let result = manager
            .execute_incremental_refresh("101_1015", None, false)
            .await;
        assert!(result.error.is_none());
        assert_eq!(result.records_processed, 1);
        assert!(result.changes_detected.as_ref().unwrap().has_changes);
        assert_eq!(result.powerbi_push.as_deref(), Some("success"));
        assert_eq!(result.records_pushed, Some(1));
        assert_eq!(push.calls.load(Ordering::SeqCst), 1);

        // Immediately again: nothing new since the bookmark moved.
        let second = manager
            .execute_incremental_refresh("101_1015", None, false)
            .await;
        assert_eq!(second.skipped.as_deref(), Some("No changes detected"));
        assert_eq!(push.calls.load(Ordering::SeqCst), 1);

        // The refresh left an audit trail.
        let logs = repo
            .metadata
            .get_audit_logs(&Default::default(), 20, 0)
            .unwrap();
        assert_eq!(
            logs.iter().filter(|l| l.action == "incremental_refresh").count(),
            1
        );
    }

    #[tokio::test]
    async fn push_failure_does_not_abort_bookkeeping() {
        struct FailingPush;
        #[async_trait]
        impl PowerBiPush for FailingPush {
            async fn push_rows(
                &self,
                _id: &str,
                _rows: &[serde_json::Value],
            ) -> anyhow::Result<u64> {
                anyhow::bail!("service unavailable")
            }
        }

        let repo = Arc::new(UnifiedRepository::open_in_memory().unwrap());
        repo.register_dataset_complete("d", "D", "economia", "", None, None, 5)
            .unwrap();
        let manager = IncrementalRefreshManager::new(repo.clone(), Some(Arc::new(FailingPush)));
        manager.create_refresh_policy("d", 30, 2, "daily").unwrap();
        repo.analytics
            .bulk_insert(OBSERVATION_TABLE, &[obs("d", 0, &now_ts())])
            .unwrap();

        let result = manager.execute_incremental_refresh("d", None, false).await;
        assert_eq!(result.powerbi_push.as_deref(), Some("failed"));
        assert!(result.refresh_timestamp.is_some());

        // Bookmark advanced despite the push failure.
        let second = manager.execute_incremental_refresh("d", None, false).await;
        assert_eq!(second.skipped.as_deref(), Some("No changes detected"));
    }

    #[test]
    fn refresh_status_computes_next_run() {
        let (repo, _push, manager) = setup();
        manager.create_refresh_policy("101_1015", 30, 2, "weekly").unwrap();
        repo.metadata
            .set_config(
                &last_refresh_key("101_1015"),
                &serde_json::json!("2026-01-01T00:00:00.000000Z"),
                ValueType::String,
            )
            .unwrap();

        let status = manager.get_refresh_status("101_1015").unwrap();
        assert!(status.policy_enabled);
        assert_eq!(status.status, "active");
        assert_eq!(
            status.next_scheduled_refresh.as_deref(),
            Some("2026-01-08T00:00:00.000000Z")
        );
    }
}
