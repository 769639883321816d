use std::sync::Arc;
use std::time::Duration;

use crate::config::MaintenanceConfig;
use crate::metadata_db::now_ts;
use crate::powerbi::incremental::IncrementalRefreshManager;
use crate::repository::UnifiedRepository;

/// Spawn the audit retention sweep as a background task (fire-and-forget).
pub fn spawn_audit_retention(repo: Arc<UnifiedRepository>, config: MaintenanceConfig) {
    if !config.enabled {
        tracing::info!("audit retention: disabled by config");
        return;
    }

    tokio::spawn(async move {
        // Wait 60s on startup to let the stores settle.
        tokio::time::sleep(Duration::from_secs(60)).await;
        tracing::info!(
            "audit retention: started (interval={}s, keep={}d)",
            config.interval_secs,
            config.audit_retention_days
        );

        let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
        loop {
            interval.tick().await;
            match repo.metadata.cleanup_old_logs(config.audit_retention_days) {
                Ok(0) => {}
                Ok(removed) => tracing::info!("audit retention: removed {removed} rows"),
                Err(e) => tracing::error!("audit retention error: {e}"),
            }
        }
    });
}

/// Spawn the incremental refresh scheduler: every tick it sweeps stored
/// refresh policies and executes the ones that are due.
pub fn spawn_refresh_scheduler(
    manager: Arc<IncrementalRefreshManager>,
    repo: Arc<UnifiedRepository>,
    interval_secs: u64,
) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        tracing::info!("refresh scheduler: started (interval={interval_secs}s)");

        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(e) = run_due_refreshes(&manager, &repo).await {
                tracing::error!("refresh scheduler error: {e}");
            }
        }
    });
}

async fn run_due_refreshes(
    manager: &IncrementalRefreshManager,
    repo: &UnifiedRepository,
) -> anyhow::Result<()> {
    let policies = repo
        .metadata
        .list_configs(Some("dataset.%.incremental_refresh_policy"))?;
    let now = now_ts();

    for (key, _) in policies {
        let Some(dataset_id) = key
            .strip_prefix("dataset.")
            .and_then(|rest| rest.strip_suffix(".incremental_refresh_policy"))
        else {
            continue;
        };

        let status = match manager.get_refresh_status(dataset_id) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("refresh scheduler: status failed for {dataset_id}: {e}");
                continue;
            }
        };
        if !status.policy_enabled {
            continue;
        }
        // ISO timestamps compare lexicographically.
        let due = status
            .next_scheduled_refresh
            .map(|next| next <= now)
            .unwrap_or(true);
        if !due {
            continue;
        }

        let result = manager
            .execute_incremental_refresh(dataset_id, None, false)
            .await;
        if let Some(error) = result.error {
            tracing::warn!("scheduled refresh failed for {dataset_id}: {error}");
        } else if let Some(reason) = result.skipped {
            tracing::debug!("scheduled refresh skipped for {dataset_id}: {reason}");
        } else {
            tracing::info!(
                "scheduled refresh for {dataset_id}: {} records",
                result.records_processed
            );
        }
    }
    Ok(())
}
