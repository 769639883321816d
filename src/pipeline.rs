use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;

use crate::analytics_db::OBSERVATION_TABLE;
use crate::config::IngestionConfig;
use crate::istat_client::{FetchData, FetchResponse, SdmxClient};
use crate::metadata_db::now_ts;
use crate::repository::UnifiedRepository;
use crate::sdmx;

/// Outcome of a single-dataset ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetResult {
    pub success: bool,
    pub dataset_id: String,
    pub records_processed: i64,
    pub skipped: bool,
    pub cancelled: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_records: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
    pub timestamp: String,
}

impl DatasetResult {
    fn base(dataset_id: &str) -> Self {
        Self {
            success: false,
            dataset_id: dataset_id.to_string(),
            records_processed: 0,
            skipped: false,
            cancelled: false,
            attempts: 0,
            existing_records: None,
            reason: None,
            error: None,
            data_source: None,
            timestamp: now_ts(),
        }
    }
}

/// Aggregate outcome of a batch run, in priority-set order.
#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub run_id: String,
    pub success: bool,
    pub total_datasets: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_seconds: f64,
    pub results: Vec<DatasetResult>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionError {
    pub dataset_id: String,
    pub error: String,
    pub timestamp: String,
}

#[derive(Default)]
struct IngestionStatus {
    last_run: Option<String>,
    datasets_processed: HashMap<String, DatasetResult>,
    errors: Vec<IngestionError>,
    total_records: i64,
}

/// Snapshot returned by `get_ingestion_status`.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub pipeline_status: String,
    pub priority_datasets: Vec<String>,
    pub last_run: Option<String>,
    pub total_datasets: usize,
    pub total_records_ingested: i64,
    pub recent_errors: Vec<IngestionError>,
    pub datasets_status: HashMap<String, DatasetResult>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HealthComponents,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct HealthComponents {
    pub metadata_store: bool,
    pub analytics_store: bool,
    pub istat_client: bool,
}

enum AttemptOutcome {
    Completed(i64),
    ParseFailed(String),
}

/// Priority-driven batch orchestrator: skip / fetch / parse / persist /
/// update-metadata, with retries and per-dataset locking.
pub struct IngestionPipeline {
    client: Arc<dyn SdmxClient>,
    repo: Arc<UnifiedRepository>,
    config: IngestionConfig,
    min_request_interval: Duration,
    status: Mutex<IngestionStatus>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_fetch_at: Mutex<Option<tokio::time::Instant>>,
    cancelled: AtomicBool,
}

impl IngestionPipeline {
    pub fn new(
        client: Arc<dyn SdmxClient>,
        repo: Arc<UnifiedRepository>,
        config: IngestionConfig,
        min_request_interval: Duration,
    ) -> Self {
        Self {
            client,
            repo,
            config,
            min_request_interval,
            status: Mutex::new(IngestionStatus::default()),
            locks: Mutex::new(HashMap::new()),
            next_fetch_at: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Request cancellation of in-flight work. The current step finishes;
    /// remaining work returns `cancelled` results.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Ingest every dataset in the priority set. Serial by default; with
    /// `max_concurrent > 1` an ordered buffered stream bounds parallelism
    /// while still reporting results in priority-set order.
    pub async fn ingest_all_priority_datasets(&self) -> BatchResult {
        tracing::info!(
            "starting ingestion of {} priority datasets",
            self.config.priority_datasets.len()
        );
        self.cancelled.store(false, Ordering::SeqCst);
        let started = tokio::time::Instant::now();

        let ids: Vec<String> = self
            .config
            .priority_datasets
            .iter()
            .map(|d| d.id.clone())
            .collect();

        let results: Vec<DatasetResult> = if self.config.max_concurrent <= 1 {
            let mut out = Vec::with_capacity(ids.len());
            for id in &ids {
                out.push(self.ingest_single_dataset(id).await);
            }
            out
        } else {
            futures_util::stream::iter(ids.iter().map(|id| self.ingest_single_dataset(id)))
                .buffered(self.config.max_concurrent)
                .collect()
                .await
        };

        let duration = started.elapsed().as_secs_f64();
        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;

        {
            let mut status = self.status.lock().unwrap();
            status.last_run = Some(now_ts());
            for result in &results {
                if let Some(ref error) = result.error {
                    status.errors.push(IngestionError {
                        dataset_id: result.dataset_id.clone(),
                        error: error.clone(),
                        timestamp: result.timestamp.clone(),
                    });
                }
                status
                    .datasets_processed
                    .insert(result.dataset_id.clone(), result.clone());
            }
            let keep_from = status.errors.len().saturating_sub(20);
            status.errors.drain(..keep_from);
        }

        tracing::info!(
            "batch ingestion completed: {successful}/{} successful in {duration:.1}s",
            results.len()
        );
        BatchResult {
            run_id: uuid::Uuid::new_v4().to_string(),
            success: failed == 0,
            total_datasets: results.len(),
            successful,
            failed,
            duration_seconds: duration,
            results,
            timestamp: now_ts(),
        }
    }

    /// The hot path: skip-if-fresh, then fetch → parse → persist → update
    /// metadata → audit, replaying all steps on transient failure.
    pub async fn ingest_single_dataset(&self, dataset_id: &str) -> DatasetResult {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(dataset_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        tracing::info!("starting ingestion for dataset {dataset_id}");

        // Skip-if-fresh: an active registration with stored observations
        // short-circuits before any outbound call.
        match self.check_fresh(dataset_id) {
            Ok(Some(existing)) => {
                tracing::info!(
                    "skipping {dataset_id}: {existing} records already present"
                );
                let mut result = DatasetResult::base(dataset_id);
                result.success = true;
                result.skipped = true;
                result.existing_records = Some(existing);
                result.reason = Some("Dataset already exists and is up-to-date".to_string());
                result.data_source = Some("cached".to_string());
                return result;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("skip check failed for {dataset_id}, proceeding: {e}");
            }
        }

        let retries = self.config.retries;
        for attempt in 0..=retries {
            if self.is_cancelled() {
                let mut result = DatasetResult::base(dataset_id);
                result.cancelled = true;
                result.attempts = attempt;
                result.error = Some("cancelled".to_string());
                return result;
            }

            match self.ingest_attempt(dataset_id).await {
                Ok(AttemptOutcome::Completed(records)) => {
                    tracing::info!("{dataset_id} ingested: {records} records");
                    let mut result = DatasetResult::base(dataset_id);
                    result.success = true;
                    result.records_processed = records;
                    result.attempts = attempt + 1;
                    result.data_source = Some("istat_api".to_string());
                    return result;
                }
                Ok(AttemptOutcome::ParseFailed(error)) => {
                    // Deterministic malformed payload: sentinel row written,
                    // metadata untouched, no retry.
                    let mut result = DatasetResult::base(dataset_id);
                    result.attempts = attempt + 1;
                    result.error = Some(error);
                    return result;
                }
                Err(e) => {
                    tracing::warn!("attempt {}/{} failed for {dataset_id}: {e}", attempt + 1, retries + 1);
                    if attempt == retries {
                        tracing::error!("all {} attempts failed for {dataset_id}", retries + 1);
                        let _ = self.repo.metadata.log_action(
                            "ingest_dataset",
                            "dataset",
                            None,
                            Some(dataset_id),
                            None,
                            None,
                            None,
                            false,
                            Some(&e.to_string()),
                            None,
                        );
                        let mut result = DatasetResult::base(dataset_id);
                        result.attempts = retries + 1;
                        result.error = Some(e.to_string());
                        return result;
                    }
                    let wait = Duration::from_secs(2u64.pow(attempt));
                    tracing::info!("retrying {dataset_id} in {}s", wait.as_secs());
                    tokio::time::sleep(wait).await;
                }
            }
        }

        let mut result = DatasetResult::base(dataset_id);
        result.error = Some("unexpected retry loop exit".to_string());
        result
    }

    fn check_fresh(&self, dataset_id: &str) -> anyhow::Result<Option<i64>> {
        let Some(dataset) = self.repo.metadata.get_dataset(dataset_id)? else {
            return Ok(None);
        };
        if !dataset.is_active {
            return Ok(None);
        }
        let count = self.repo.analytics.count_by_dataset(dataset_id)?;
        if count > 0 { Ok(Some(count)) } else { Ok(None) }
    }

    /// Honor the configured requests-per-hour spacing for outbound fetches.
    async fn rate_limit_pause(&self) {
        if self.min_request_interval.is_zero() {
            return;
        }
        let wait = {
            let mut next = self.next_fetch_at.lock().unwrap();
            let now = tokio::time::Instant::now();
            let at = next.unwrap_or(now).max(now);
            *next = Some(at + self.min_request_interval);
            at - now
        };
        if !wait.is_zero() {
            tracing::debug!("rate limit: pausing {:?} before next SDMX fetch", wait);
            tokio::time::sleep(wait).await;
        }
    }

    async fn ingest_attempt(&self, dataset_id: &str) -> anyhow::Result<AttemptOutcome> {
        // Step 1: fetch.
        self.rate_limit_pause().await;
        let response = self.client.fetch_dataset(dataset_id).await;
        let xml = validate_response(dataset_id, response)?;

        // Step 2: parse.
        let outcome = sdmx::parse_observations(dataset_id, &xml);

        // Step 3: ensure schema before the first insert.
        self.repo.analytics.ensure_observation_table()?;

        if outcome.parse_error {
            // Persist the sentinel so the failure is observable, then report
            // without touching registry stats.
            self.repo
                .analytics
                .bulk_insert(OBSERVATION_TABLE, &outcome.records)?;
            let error = outcome
                .records
                .first()
                .and_then(|r| r.additional_attributes.as_ref())
                .and_then(|a| a.get("parse_error"))
                .and_then(|v| v.as_str())
                .unwrap_or("XML parse failure")
                .to_string();
            self.repo.metadata.log_action(
                "ingest_dataset",
                "dataset",
                None,
                Some(dataset_id),
                Some(&serde_json::json!({ "parse_error": error })),
                None,
                None,
                false,
                Some(&error),
                None,
            )?;
            return Ok(AttemptOutcome::ParseFailed(format!("XML parse failure: {error}")));
        }

        // Step 4: persist.
        let inserted = self
            .repo
            .analytics
            .bulk_insert(OBSERVATION_TABLE, &outcome.records)? as i64;

        // Step 5: update registry stats.
        self.repo
            .metadata
            .update_dataset_stats(dataset_id, Some(inserted), None, Some(&now_ts()))?;

        // Step 6: audit.
        self.repo.metadata.log_action(
            "ingest_dataset",
            "dataset",
            None,
            Some(dataset_id),
            Some(&serde_json::json!({
                "records_processed": inserted,
                "truncated": outcome.truncated,
            })),
            None,
            None,
            true,
            None,
            None,
        )?;

        {
            let mut status = self.status.lock().unwrap();
            status.total_records += inserted;
        }
        Ok(AttemptOutcome::Completed(inserted))
    }

    pub fn get_ingestion_status(&self) -> StatusSnapshot {
        let status = self.status.lock().unwrap();
        let recent_errors: Vec<IngestionError> = status
            .errors
            .iter()
            .rev()
            .take(5)
            .rev()
            .cloned()
            .collect();
        StatusSnapshot {
            pipeline_status: if status.errors.is_empty() {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            priority_datasets: self
                .config
                .priority_datasets
                .iter()
                .map(|d| d.id.clone())
                .collect(),
            last_run: status.last_run.clone(),
            total_datasets: self.config.priority_datasets.len(),
            total_records_ingested: status.total_records,
            recent_errors,
            datasets_status: status.datasets_processed.clone(),
        }
    }

    /// Component reachability without performing any outbound fetch.
    pub fn health_check(&self) -> HealthStatus {
        let metadata_store = self.repo.metadata.dataset_summary().is_ok();
        let analytics_store = self.repo.analytics.ensure_observation_table().is_ok();
        let components = HealthComponents {
            metadata_store,
            analytics_store,
            istat_client: true,
        };
        HealthStatus {
            healthy: metadata_store && analytics_store,
            components,
            timestamp: now_ts(),
        }
    }
}

/// Validate the documented upstream response shapes; anything ambiguous is a
/// failure. A successful-but-empty payload degrades to a minimal document so
/// one sentinel row marks the dataset as seen.
fn validate_response(dataset_id: &str, response: FetchResponse) -> anyhow::Result<String> {
    if !response.success {
        let message = response
            .error_message
            .unwrap_or_else(|| "API returned success=false".to_string());
        anyhow::bail!("ISTAT API error: {message}");
    }
    match response.data {
        None => anyhow::bail!("empty data section received from ISTAT API"),
        Some(FetchData::Raw(xml)) => Ok(xml),
        Some(FetchData::Payload { status, content, size }) => {
            if status == "error" {
                anyhow::bail!("ISTAT API error status for {dataset_id}");
            }
            if status != "success" {
                anyhow::bail!("unexpected response status '{status}' for {dataset_id}");
            }
            match content {
                Some(xml) => {
                    tracing::info!("processing XML for {dataset_id} ({size} bytes)");
                    Ok(xml)
                }
                None => {
                    tracing::warn!("no XML content in successful response for {dataset_id}");
                    Ok(format!(
                        "<GenericData><DataSet id=\"{dataset_id}\"><Obs/></DataSet></GenericData>"
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriorityDataset;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    const TWO_OBS_XML: &str = r#"<GenericData><DataSet>
        <Obs><ObsDimension id="TIME_PERIOD" value="2024"/><ObsValue value="100"/></Obs>
        <Obs><ObsDimension id="TIME_PERIOD" value="2024"/><ObsValue value="200"/></Obs>
    </DataSet></GenericData>"#;

    struct MockClient {
        responses: Mutex<VecDeque<FetchResponse>>,
        calls: AtomicUsize,
    }

    impl MockClient {
        fn new(responses: Vec<FetchResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SdmxClient for MockClient {
        async fn fetch_dataset(&self, _dataset_id: &str) -> FetchResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| FetchResponse::failure("exhausted mock responses"))
        }
    }

    fn pipeline_with(client: Arc<MockClient>) -> IngestionPipeline {
        let repo = Arc::new(UnifiedRepository::open_in_memory().unwrap());
        repo.register_dataset_complete("101_1015", "Coltivazioni", "economia", "", None, None, 8)
            .unwrap();
        let config = IngestionConfig {
            priority_datasets: vec![PriorityDataset {
                id: "101_1015".to_string(),
                name: "Coltivazioni".to_string(),
            }],
            retries: 3,
            max_concurrent: 1,
        };
        IngestionPipeline::new(client, repo, config, Duration::ZERO)
    }

    #[tokio::test]
    async fn happy_path_ingestion() {
        let client = MockClient::new(vec![FetchResponse::with_content(TWO_OBS_XML.to_string())]);
        let pipeline = pipeline_with(client.clone());

        let result = pipeline.ingest_single_dataset("101_1015").await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.records_processed, 2);
        assert_eq!(result.attempts, 1);
        assert!(!result.skipped);

        assert_eq!(pipeline.repo.analytics.count_by_dataset("101_1015").unwrap(), 2);
        let ds = pipeline.repo.metadata.get_dataset("101_1015").unwrap().unwrap();
        assert_eq!(ds.record_count, 2);
        assert!(ds.last_processed.is_some());
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn skip_when_fresh_makes_no_upstream_call() {
        let client = MockClient::new(vec![FetchResponse::with_content(TWO_OBS_XML.to_string())]);
        let pipeline = pipeline_with(client.clone());

        let first = pipeline.ingest_single_dataset("101_1015").await;
        assert!(first.success);
        assert_eq!(client.call_count(), 1);

        let second = pipeline.ingest_single_dataset("101_1015").await;
        assert!(second.success);
        assert!(second.skipped);
        assert_eq!(second.existing_records, Some(2));
        assert_eq!(second.records_processed, 0);
        // Zero additional outbound calls.
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff() {
        let client = MockClient::new(vec![
            FetchResponse::failure("connection reset"),
            FetchResponse::failure("connection reset"),
            FetchResponse::with_content(TWO_OBS_XML.to_string()),
        ]);
        let pipeline = pipeline_with(client.clone());

        let started = tokio::time::Instant::now();
        let result = pipeline.ingest_single_dataset("101_1015").await;
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(client.call_count(), 3);
        // Backoff slept at least 1s + 2s (virtual time).
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_failure() {
        let client = MockClient::new(vec![
            FetchResponse::failure("boom"),
            FetchResponse::failure("boom"),
            FetchResponse::failure("boom"),
            FetchResponse::failure("boom"),
        ]);
        let pipeline = pipeline_with(client.clone());

        let result = pipeline.ingest_single_dataset("101_1015").await;
        assert!(!result.success);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.records_processed, 0);
        assert!(result.error.as_deref().unwrap_or("").contains("boom"));
        assert_eq!(client.call_count(), 4);

        // Exhaustion leaves a failed audit event behind.
        let logs = pipeline
            .repo
            .metadata
            .get_audit_logs(&Default::default(), 10, 0)
            .unwrap();
        assert!(logs.iter().any(|l| l.action == "ingest_dataset" && !l.success));
    }

    #[tokio::test]
    async fn malformed_payload_writes_sentinel_without_retry() {
        let client = MockClient::new(vec![FetchResponse::with_content(
            "<GenericData><Obs></GenericData>".to_string(),
        )]);
        let pipeline = pipeline_with(client.clone());

        let result = pipeline.ingest_single_dataset("101_1015").await;
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(client.call_count(), 1);

        // One sentinel row so the failure is observable in the store.
        assert_eq!(pipeline.repo.analytics.count_by_dataset("101_1015").unwrap(), 1);
        // Registry stats untouched.
        let ds = pipeline.repo.metadata.get_dataset("101_1015").unwrap().unwrap();
        assert_eq!(ds.record_count, 0);
    }

    #[tokio::test]
    async fn empty_success_writes_one_sentinel_then_skips() {
        let client = MockClient::new(vec![FetchResponse {
            success: true,
            data: Some(FetchData::Payload {
                status: "success".to_string(),
                content: None,
                size: 0,
            }),
            error_message: None,
        }]);
        let pipeline = pipeline_with(client.clone());

        let result = pipeline.ingest_single_dataset("101_1015").await;
        assert!(result.success);
        assert_eq!(result.records_processed, 1);

        let again = pipeline.ingest_single_dataset("101_1015").await;
        assert!(again.skipped);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn batch_reports_priority_order() {
        let repo = Arc::new(UnifiedRepository::open_in_memory().unwrap());
        let client = MockClient::new(vec![
            FetchResponse::with_content(TWO_OBS_XML.to_string()),
            FetchResponse::failure("down"),
            FetchResponse::failure("down"),
            FetchResponse::failure("down"),
            FetchResponse::failure("down"),
        ]);
        let config = IngestionConfig {
            priority_datasets: vec![
                PriorityDataset {
                    id: "a".to_string(),
                    name: "A".to_string(),
                },
                PriorityDataset {
                    id: "b".to_string(),
                    name: "B".to_string(),
                },
            ],
            retries: 3,
            max_concurrent: 1,
        };
        let pipeline = IngestionPipeline::new(client, repo, config, Duration::ZERO);

        tokio::time::pause();
        let batch = pipeline.ingest_all_priority_datasets().await;
        assert!(!batch.success);
        assert_eq!(batch.total_datasets, 2);
        assert_eq!(batch.successful, 1);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.results[0].dataset_id, "a");
        assert_eq!(batch.results[1].dataset_id, "b");

        let snapshot = pipeline.get_ingestion_status();
        assert_eq!(snapshot.pipeline_status, "degraded");
        assert_eq!(snapshot.recent_errors.len(), 1);
        assert!(snapshot.last_run.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_spaces_fetches() {
        let repo = Arc::new(UnifiedRepository::open_in_memory().unwrap());
        let client = MockClient::new(vec![
            FetchResponse::with_content(TWO_OBS_XML.to_string()),
            FetchResponse::with_content(TWO_OBS_XML.to_string()),
        ]);
        let config = IngestionConfig {
            priority_datasets: vec![
                PriorityDataset {
                    id: "a".to_string(),
                    name: "A".to_string(),
                },
                PriorityDataset {
                    id: "b".to_string(),
                    name: "B".to_string(),
                },
            ],
            retries: 0,
            max_concurrent: 1,
        };
        let pipeline =
            IngestionPipeline::new(client, repo, config, Duration::from_secs(30));

        let started = tokio::time::Instant::now();
        let batch = pipeline.ingest_all_priority_datasets().await;
        assert_eq!(batch.successful, 2);
        // Second fetch waited for the 30s spacing window.
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let client = MockClient::new(vec![]);
        let pipeline = pipeline_with(client);
        // Fresh repo but drop the registration so the skip check misses.
        pipeline.repo.metadata.deactivate_dataset("101_1015").unwrap();

        pipeline.cancel();
        let result = pipeline.ingest_single_dataset("101_1015").await;
        assert!(!result.success);
        assert!(result.cancelled);
    }

    #[test]
    fn response_shape_validation() {
        assert!(validate_response("d", FetchResponse::failure("nope")).is_err());
        assert!(
            validate_response(
                "d",
                FetchResponse {
                    success: true,
                    data: None,
                    error_message: None,
                },
            )
            .is_err()
        );
        assert!(
            validate_response(
                "d",
                FetchResponse {
                    success: true,
                    data: Some(FetchData::Payload {
                        status: "error".to_string(),
                        content: None,
                        size: 0,
                    }),
                    error_message: None,
                },
            )
            .is_err()
        );
        let raw = validate_response(
            "d",
            FetchResponse {
                success: true,
                data: Some(FetchData::Raw("<x/>".to_string())),
                error_message: None,
            },
        )
        .unwrap();
        assert_eq!(raw, "<x/>");
    }
}
