use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::metadata_db::{ValueType, now_ts};
use crate::powerbi::optimizer::DaxMeasure;
use crate::repository::UnifiedRepository;

fn lineage_key(dataset_id: &str) -> String {
    format!("dataset.{dataset_id}.powerbi_lineage")
}

fn usage_key(dataset_id: &str) -> String {
    format!("dataset.{dataset_id}.powerbi_usage_metrics")
}

fn quality_key(dataset_id: &str) -> String {
    format!("dataset.{dataset_id}.powerbi_quality_metadata")
}

fn template_key(dataset_id: &str) -> String {
    format!("dataset.{dataset_id}.powerbi_template")
}

/// External PowerBI Service surface consumed by the bridge. Absent client
/// means empty usage counts, never an error.
#[async_trait]
pub trait PowerBiService: Send + Sync {
    async fn reports_using(&self, powerbi_dataset_id: &str) -> anyhow::Result<Vec<String>>;
    async fn dashboards_using(&self, powerbi_dataset_id: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationStep {
    pub step: String,
    pub description: String,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Lineage record: source system, dependencies, and ordered transformations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetLineage {
    pub dataset_id: String,
    pub source_system: String,
    pub transformations: Vec<TransformationStep>,
    pub dependencies: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub dataset_id: String,
    pub views: i64,
    pub refreshes: i64,
    pub unique_users: i64,
    pub last_accessed: Option<String>,
    pub reports_count: i64,
    pub dashboards_count: i64,
    pub synced_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScores {
    pub overall_quality: f64,
    pub min_quality: f64,
    pub max_quality: f64,
    pub territories_analyzed: i64,
    pub total_records: i64,
    pub by_territory: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct QualityPropagation {
    pub dataset_id: String,
    pub quality_scores: QualityScores,
    pub quality_measures: Vec<DaxMeasure>,
    pub propagated_at: String,
}

#[derive(Debug, Serialize)]
pub struct DatasetGovernance {
    pub dataset_id: String,
    pub name: String,
    pub category: String,
    pub has_lineage: bool,
    pub has_usage_data: bool,
    pub quality_score: f64,
    pub powerbi_integrated: bool,
}

#[derive(Debug, Serialize)]
pub struct GovernanceReport {
    pub report_generated: String,
    pub datasets_analyzed: usize,
    pub datasets: Vec<DatasetGovernance>,
    pub summary: GovernanceSummary,
}

#[derive(Debug, Serialize)]
pub struct GovernanceSummary {
    pub with_lineage: usize,
    pub with_usage_data: usize,
    pub powerbi_integrated: usize,
    pub avg_quality_score: f64,
}

/// Cross-cutting governance artifacts: lineage, usage, quality, rollups.
pub struct MetadataBridge {
    repo: Arc<UnifiedRepository>,
    service: Option<Arc<dyn PowerBiService>>,
}

impl MetadataBridge {
    pub fn new(repo: Arc<UnifiedRepository>, service: Option<Arc<dyn PowerBiService>>) -> Self {
        Self { repo, service }
    }

    /// Record lineage for a dataset. The three standard platform steps are
    /// always prepended before any caller-supplied ones.
    pub fn create_dataset_lineage(
        &self,
        dataset_id: &str,
        source_datasets: Vec<String>,
        transformation_steps: Vec<(String, String)>,
    ) -> anyhow::Result<DatasetLineage> {
        let now = now_ts();
        let mut transformations = vec![
            TransformationStep {
                step: "data_extraction".to_string(),
                description: "Extracted from ISTAT SDMX API".to_string(),
                timestamp: now.clone(),
                metadata: serde_json::Value::Null,
            },
            TransformationStep {
                step: "data_validation".to_string(),
                description: "Applied ISTAT data validation rules".to_string(),
                timestamp: now.clone(),
                metadata: serde_json::Value::Null,
            },
            TransformationStep {
                step: "quality_scoring".to_string(),
                description: "Calculated quality scores based on completeness and consistency"
                    .to_string(),
                timestamp: now.clone(),
                metadata: serde_json::Value::Null,
            },
        ];
        for (step, description) in transformation_steps {
            transformations.push(TransformationStep {
                step,
                description,
                timestamp: now.clone(),
                metadata: serde_json::Value::Null,
            });
        }

        let lineage = DatasetLineage {
            dataset_id: dataset_id.to_string(),
            source_system: "ISTAT SDMX API".to_string(),
            transformations,
            dependencies: source_datasets,
            created_at: now,
        };
        self.repo.metadata.set_config(
            &lineage_key(dataset_id),
            &serde_json::to_value(&lineage)?,
            ValueType::Json,
        )?;
        tracing::info!("dataset lineage created for {dataset_id}");
        Ok(lineage)
    }

    pub fn get_dataset_lineage(&self, dataset_id: &str) -> anyhow::Result<Option<DatasetLineage>> {
        let Some(value) = self.repo.metadata.get_config(&lineage_key(dataset_id))? else {
            return Ok(None);
        };
        Ok(serde_json::from_value(value).ok())
    }

    /// Pull report/dashboard references from the PowerBI Service when a
    /// client is configured; empty counts otherwise. Persisted either way.
    pub async fn sync_usage_analytics(
        &self,
        dataset_id: &str,
        powerbi_dataset_id: Option<&str>,
    ) -> anyhow::Result<UsageMetrics> {
        let mut metrics = UsageMetrics {
            dataset_id: dataset_id.to_string(),
            views: 0,
            refreshes: 0,
            unique_users: 0,
            last_accessed: None,
            reports_count: 0,
            dashboards_count: 0,
            synced_at: now_ts(),
        };

        if let Some(service) = &self.service {
            let target = powerbi_dataset_id.unwrap_or(dataset_id);
            match service.reports_using(target).await {
                Ok(reports) => metrics.reports_count = reports.len() as i64,
                Err(e) => tracing::warn!("usage sync: report lookup failed for {target}: {e}"),
            }
            match service.dashboards_using(target).await {
                Ok(dashboards) => metrics.dashboards_count = dashboards.len() as i64,
                Err(e) => tracing::warn!("usage sync: dashboard lookup failed for {target}: {e}"),
            }
        } else {
            tracing::warn!("no PowerBI client configured for usage sync");
        }

        self.repo.metadata.set_config(
            &usage_key(dataset_id),
            &serde_json::to_value(&metrics)?,
            ValueType::Json,
        )?;
        tracing::info!("usage analytics synchronized for {dataset_id}");
        Ok(metrics)
    }

    /// Per-territory quality averages folded into DAX quality measures.
    pub fn propagate_quality_scores(&self, dataset_id: &str) -> anyhow::Result<QualityPropagation> {
        if self.repo.metadata.get_dataset(dataset_id)?.is_none() {
            anyhow::bail!("dataset {dataset_id} not found");
        }

        let rows = self.repo.analytics.quality_by_territory(dataset_id)?;
        let scores = if rows.is_empty() {
            QualityScores {
                overall_quality: 0.85,
                min_quality: 0.85,
                max_quality: 0.85,
                territories_analyzed: 0,
                total_records: 0,
                by_territory: BTreeMap::new(),
            }
        } else {
            let total_records = rows.iter().map(|(_, _, n)| n).sum();
            let overall = rows.iter().map(|(_, q, _)| q).sum::<f64>() / rows.len() as f64;
            let min = rows.iter().map(|(_, q, _)| *q).fold(f64::INFINITY, f64::min);
            let max = rows.iter().map(|(_, q, _)| *q).fold(f64::NEG_INFINITY, f64::max);
            QualityScores {
                overall_quality: (overall * 1000.0).round() / 1000.0,
                min_quality: min,
                max_quality: max,
                territories_analyzed: rows.len() as i64,
                total_records,
                by_territory: rows.into_iter().map(|(t, q, _)| (t, q)).collect(),
            }
        };

        let measures = quality_measures(dataset_id, scores.overall_quality);
        let propagation = QualityPropagation {
            dataset_id: dataset_id.to_string(),
            quality_scores: scores,
            quality_measures: measures,
            propagated_at: now_ts(),
        };

        self.repo.metadata.set_config(
            &quality_key(dataset_id),
            &serde_json::json!({
                "quality_scores": propagation.quality_scores,
                "quality_measures": propagation.quality_measures,
                "propagated_at": propagation.propagated_at,
            }),
            ValueType::Json,
        )?;
        tracing::info!("quality scores propagated for {dataset_id}");
        Ok(propagation)
    }

    /// Governance rollup: a single dataset, or every dataset that has a
    /// stored template or lineage record.
    pub fn get_governance_report(&self, dataset_id: Option<&str>) -> anyhow::Result<GovernanceReport> {
        let ids: Vec<String> = match dataset_id {
            Some(id) => vec![id.to_string()],
            None => {
                let mut ids = Vec::new();
                for dataset in self.repo.list_datasets_complete()? {
                    let id = dataset.dataset.dataset_id;
                    let has_template =
                        self.repo.metadata.get_config(&template_key(&id))?.is_some();
                    let has_lineage =
                        self.repo.metadata.get_config(&lineage_key(&id))?.is_some();
                    if has_template || has_lineage {
                        ids.push(id);
                    }
                }
                ids
            }
        };

        let mut datasets = Vec::new();
        for id in &ids {
            let Some(dataset) = self.repo.metadata.get_dataset(id)? else {
                // Artifacts can outlive their registration; report the gap.
                datasets.push(DatasetGovernance {
                    dataset_id: id.clone(),
                    name: String::new(),
                    category: String::new(),
                    has_lineage: false,
                    has_usage_data: false,
                    quality_score: 0.0,
                    powerbi_integrated: false,
                });
                continue;
            };

            let has_lineage = self.repo.metadata.get_config(&lineage_key(id))?.is_some();
            let has_usage_data = self.repo.metadata.get_config(&usage_key(id))?.is_some();
            let quality = self.repo.metadata.get_config(&quality_key(id))?;
            let has_quality = quality.is_some();
            let quality_score = quality
                .as_ref()
                .and_then(|v| v["quality_scores"]["overall_quality"].as_f64())
                .unwrap_or(dataset.quality_score);
            let has_template = self.repo.metadata.get_config(&template_key(id))?.is_some();
            let has_star_schema = self
                .repo
                .metadata
                .get_config(&format!("dataset.{id}.powerbi_star_schema"))?
                .is_some();

            datasets.push(DatasetGovernance {
                dataset_id: id.clone(),
                name: dataset.name,
                category: dataset.category,
                has_lineage,
                has_usage_data,
                quality_score,
                powerbi_integrated: has_template || has_star_schema || has_lineage || has_quality,
            });
        }

        let with_lineage = datasets.iter().filter(|d| d.has_lineage).count();
        let with_usage = datasets.iter().filter(|d| d.has_usage_data).count();
        let integrated = datasets.iter().filter(|d| d.powerbi_integrated).count();
        let avg_quality = if datasets.is_empty() {
            0.0
        } else {
            datasets.iter().map(|d| d.quality_score).sum::<f64>() / datasets.len() as f64
        };

        Ok(GovernanceReport {
            report_generated: now_ts(),
            datasets_analyzed: datasets.len(),
            datasets,
            summary: GovernanceSummary {
                with_lineage,
                with_usage_data: with_usage,
                powerbi_integrated: integrated,
                avg_quality_score: (avg_quality * 1000.0).round() / 1000.0,
            },
        })
    }
}

/// DAX quality measures over the propagated overall score. The fact tables
/// carry no quality column yet, so the score is inlined as a constant.
fn quality_measures(dataset_id: &str, overall: f64) -> Vec<DaxMeasure> {
    let fact = format!("fact_{}", dataset_id.to_lowercase());
    vec![
        DaxMeasure {
            name: "Quality Score".to_string(),
            expression: format!("{overall} // {fact}"),
        },
        DaxMeasure {
            name: "Quality Grade".to_string(),
            expression: format!(
                "VAR QualityScore = {overall} // {fact}\n\
                 RETURN SWITCH(TRUE(),\n\
                 QualityScore >= 0.9, \"Excellent\",\n\
                 QualityScore >= 0.8, \"Good\",\n\
                 QualityScore >= 0.7, \"Fair\",\n\
                 QualityScore >= 0.6, \"Poor\",\n\
                 \"Critical\")"
            ),
        },
        DaxMeasure {
            name: "Quality Trend".to_string(),
            expression: format!("0.02 // {fact}"),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics_db::OBSERVATION_TABLE;
    use crate::models::observation::ObservationRecord;

    fn setup() -> (Arc<UnifiedRepository>, MetadataBridge) {
        let repo = Arc::new(UnifiedRepository::open_in_memory().unwrap());
        repo.register_dataset_complete("101_1015", "Coltivazioni", "economia", "", None, None, 8)
            .unwrap();
        let bridge = MetadataBridge::new(repo.clone(), None);
        (repo, bridge)
    }

    fn obs(record_id: i64) -> ObservationRecord {
        ObservationRecord {
            dataset_id: "101_1015".to_string(),
            record_id,
            ingestion_timestamp: "2026-01-01T00:00:00.000000Z".to_string(),
            obs_value: "100".to_string(),
            time_period: "2024".to_string(),
            additional_attributes: None,
        }
    }

    #[test]
    fn lineage_prepends_standard_steps() {
        let (_repo, bridge) = setup();
        let lineage = bridge
            .create_dataset_lineage(
                "101_1015",
                vec!["144_107".to_string()],
                vec![("aggregation".to_string(), "Aggregated by region".to_string())],
            )
            .unwrap();

        let steps: Vec<&str> = lineage.transformations.iter().map(|t| t.step.as_str()).collect();
        assert_eq!(
            steps,
            vec!["data_extraction", "data_validation", "quality_scoring", "aggregation"]
        );
        assert_eq!(lineage.dependencies, vec!["144_107"]);

        let stored = bridge.get_dataset_lineage("101_1015").unwrap().unwrap();
        assert_eq!(stored.transformations.len(), 4);
    }

    #[tokio::test]
    async fn usage_sync_without_client_is_empty() {
        let (repo, bridge) = setup();
        let metrics = bridge.sync_usage_analytics("101_1015", None).await.unwrap();
        assert_eq!(metrics.reports_count, 0);
        assert_eq!(metrics.dashboards_count, 0);

        // Persisted even when empty.
        assert!(
            repo.metadata
                .get_config(&usage_key("101_1015"))
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn usage_sync_with_client_counts_references() {
        struct FakeService;
        #[async_trait]
        impl PowerBiService for FakeService {
            async fn reports_using(&self, _id: &str) -> anyhow::Result<Vec<String>> {
                Ok(vec!["r1".to_string(), "r2".to_string()])
            }
            async fn dashboards_using(&self, _id: &str) -> anyhow::Result<Vec<String>> {
                Ok(vec!["d1".to_string()])
            }
        }

        let repo = Arc::new(UnifiedRepository::open_in_memory().unwrap());
        repo.register_dataset_complete("x", "X", "economia", "", None, None, 5)
            .unwrap();
        let bridge = MetadataBridge::new(repo, Some(Arc::new(FakeService)));
        let metrics = bridge.sync_usage_analytics("x", None).await.unwrap();
        assert_eq!(metrics.reports_count, 2);
        assert_eq!(metrics.dashboards_count, 1);
    }

    #[test]
    fn quality_propagation_with_observations() {
        let (repo, bridge) = setup();
        repo.analytics
            .bulk_insert(OBSERVATION_TABLE, &[obs(0), obs(1)])
            .unwrap();

        let propagation = bridge.propagate_quality_scores("101_1015").unwrap();
        assert!((propagation.quality_scores.overall_quality - 0.85).abs() < 1e-9);
        assert_eq!(propagation.quality_scores.total_records, 2);
        assert_eq!(propagation.quality_measures.len(), 3);
        let grade = &propagation.quality_measures[1];
        assert_eq!(grade.name, "Quality Grade");
        assert!(grade.expression.contains("SWITCH(TRUE()"));
        assert!(grade.expression.contains("0.9, \"Excellent\""));

        assert!(bridge.propagate_quality_scores("ghost").is_err());
    }

    #[test]
    fn governance_rollup_single_dataset() {
        let (repo, bridge) = setup();
        repo.analytics
            .bulk_insert(OBSERVATION_TABLE, &[obs(0), obs(1)])
            .unwrap();
        bridge
            .create_dataset_lineage("101_1015", Vec::new(), Vec::new())
            .unwrap();
        bridge.propagate_quality_scores("101_1015").unwrap();

        let report = bridge.get_governance_report(Some("101_1015")).unwrap();
        assert_eq!(report.datasets_analyzed, 1);
        let entry = &report.datasets[0];
        assert!(entry.has_lineage);
        assert!(!entry.has_usage_data);
        assert!(entry.quality_score > 0.0);
        assert!(entry.powerbi_integrated);
        assert_eq!(report.summary.with_lineage, 1);
    }

    #[test]
    fn governance_rollup_discovers_integrated_datasets() {
        let (repo, bridge) = setup();
        repo.register_dataset_complete("no_artifacts", "Bare", "economia", "", None, None, 5)
            .unwrap();
        bridge
            .create_dataset_lineage("101_1015", Vec::new(), Vec::new())
            .unwrap();

        let report = bridge.get_governance_report(None).unwrap();
        // Only the dataset with artifacts is analyzed.
        assert_eq!(report.datasets_analyzed, 1);
        assert_eq!(report.datasets[0].dataset_id, "101_1015");
    }
}
