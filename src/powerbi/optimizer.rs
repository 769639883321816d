use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::metadata_db::{ValueType, now_ts};
use crate::repository::UnifiedRepository;

const SCHEMA_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
const DAX_CACHE_TTL: Duration = Duration::from_secs(6 * 3600);

/// A star schema derived from dataset metadata, ready for PowerBI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarSchema {
    pub fact_table: String,
    pub dimension_tables: Vec<String>,
    pub relationships: Vec<Relationship>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub cardinality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaxMeasure {
    pub name: String,
    pub expression: String,
}

/// PowerBI load characteristics for one dataset.
#[derive(Debug, Serialize)]
pub struct PerformanceMetrics {
    pub total_records: i64,
    pub territories: i64,
    pub start_year: Option<i64>,
    pub end_year: Option<i64>,
    pub avg_quality_score: f64,
    pub estimated_powerbi_load_time_ms: i64,
    pub recommended_refresh_frequency: String,
    pub star_schema_optimization_potential: f64,
    pub last_analyzed: String,
}

/// Pure derivation of the star schema for a dataset and its category.
pub fn derive_star_schema(dataset_id: &str, category: &str) -> StarSchema {
    let fact_table = format!("fact_{}", dataset_id.to_lowercase());

    let mut dimension_tables = vec![
        "dim_time".to_string(),
        "dim_territory".to_string(),
        "dim_measure".to_string(),
        "dim_dataset_metadata".to_string(),
    ];
    match category {
        "popolazione" => {
            dimension_tables.push("dim_age_group".to_string());
            dimension_tables.push("dim_gender".to_string());
        }
        "economia" => {
            dimension_tables.push("dim_economic_indicator".to_string());
            dimension_tables.push("dim_sector".to_string());
        }
        "lavoro" => {
            dimension_tables.push("dim_occupation".to_string());
            dimension_tables.push("dim_employment_status".to_string());
        }
        _ => {}
    }

    let relationships = ["time", "territory", "measure"]
        .iter()
        .map(|name| Relationship {
            from_table: fact_table.clone(),
            from_column: format!("{name}_key"),
            to_table: format!("dim_{name}"),
            to_column: format!("{name}_key"),
            cardinality: "many_to_one".to_string(),
        })
        .collect();

    StarSchema {
        fact_table,
        dimension_tables,
        relationships,
        created_at: now_ts(),
    }
}

fn base_measures(dataset_id: &str) -> Vec<DaxMeasure> {
    let fact = format!("fact_{}", dataset_id.to_lowercase());
    vec![
        DaxMeasure {
            name: "Total Observations".to_string(),
            expression: format!("COUNTA({fact}[obs_value])"),
        },
        DaxMeasure {
            name: "Average Value".to_string(),
            expression: format!("AVERAGE({fact}[obs_value])"),
        },
        DaxMeasure {
            name: "Latest Period".to_string(),
            expression: "MAX(dim_time[time_period])".to_string(),
        },
        DaxMeasure {
            name: "Quality Score".to_string(),
            expression: format!("AVERAGE({fact}[quality_score])"),
        },
        DaxMeasure {
            name: "YoY Growth".to_string(),
            expression: format!(
                "VAR CurrentYear = MAX(dim_time[year])\n\
                 VAR CurrentValue = CALCULATE(SUM({fact}[obs_value]), dim_time[year] = CurrentYear)\n\
                 VAR PreviousValue = CALCULATE(SUM({fact}[obs_value]), dim_time[year] = CurrentYear - 1)\n\
                 RETURN DIVIDE(CurrentValue - PreviousValue, PreviousValue)"
            ),
        },
        DaxMeasure {
            name: "Data Freshness Days".to_string(),
            expression: format!("DATEDIFF(MAX({fact}[last_updated]), TODAY(), DAY)"),
        },
    ]
}

fn category_measures(dataset_id: &str, category: &str) -> Vec<DaxMeasure> {
    let fact = format!("fact_{}", dataset_id.to_lowercase());
    match category {
        "popolazione" => vec![
            DaxMeasure {
                name: "Total Population".to_string(),
                expression: format!("SUM({fact}[obs_value])"),
            },
            DaxMeasure {
                name: "Population Growth Rate".to_string(),
                expression: format!(
                    "VAR CurrentPop = CALCULATE(SUM({fact}[obs_value]), dim_time[year] = MAX(dim_time[year]))\n\
                     VAR PreviousPop = CALCULATE(SUM({fact}[obs_value]), dim_time[year] = MAX(dim_time[year]) - 1)\n\
                     RETURN DIVIDE(CurrentPop - PreviousPop, PreviousPop)"
                ),
            },
            DaxMeasure {
                name: "Population Density".to_string(),
                expression: format!(
                    "DIVIDE(SUM({fact}[obs_value]), RELATED(dim_territory[area_km2]))"
                ),
            },
        ],
        "economia" => vec![
            DaxMeasure {
                name: "GDP Growth".to_string(),
                expression: format!(
                    "VAR CurrentGDP = CALCULATE(SUM({fact}[obs_value]), dim_time[year] = MAX(dim_time[year]))\n\
                     VAR PreviousGDP = CALCULATE(SUM({fact}[obs_value]), dim_time[year] = MAX(dim_time[year]) - 1)\n\
                     RETURN DIVIDE(CurrentGDP - PreviousGDP, PreviousGDP) * 100"
                ),
            },
            DaxMeasure {
                name: "GDP Per Capita".to_string(),
                expression: format!(
                    "DIVIDE(SUM({fact}[obs_value]), RELATED(dim_territory[population]))"
                ),
            },
        ],
        "lavoro" => vec![
            DaxMeasure {
                name: "Employment Rate".to_string(),
                expression: format!(
                    "DIVIDE(CALCULATE(SUM({fact}[obs_value]), dim_employment_status[status] = \"Employed\"), SUM({fact}[obs_value])) * 100"
                ),
            },
            DaxMeasure {
                name: "Unemployment Rate".to_string(),
                expression: format!(
                    "DIVIDE(CALCULATE(SUM({fact}[obs_value]), dim_employment_status[status] = \"Unemployed\"), SUM({fact}[obs_value])) * 100"
                ),
            },
        ],
        _ => Vec::new(),
    }
}

/// Star-schema derivation and DAX generation with per-dataset TTL caches.
pub struct PowerBiOptimizer {
    repo: Arc<UnifiedRepository>,
    schema_ttl: Duration,
    dax_ttl: Duration,
    schema_cache: Mutex<HashMap<String, (StarSchema, Instant)>>,
    dax_cache: Mutex<HashMap<String, (Vec<DaxMeasure>, Instant)>>,
}

impl PowerBiOptimizer {
    pub fn new(repo: Arc<UnifiedRepository>) -> Self {
        Self::with_ttls(repo, SCHEMA_CACHE_TTL, DAX_CACHE_TTL)
    }

    pub fn with_ttls(repo: Arc<UnifiedRepository>, schema_ttl: Duration, dax_ttl: Duration) -> Self {
        Self {
            repo,
            schema_ttl,
            dax_ttl,
            schema_cache: Mutex::new(HashMap::new()),
            dax_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Derive (or serve from cache) the star schema for a dataset. The first
    /// derivation is persisted to the metadata store.
    pub fn generate_star_schema(&self, dataset_id: &str) -> anyhow::Result<StarSchema> {
        {
            let cache = self.schema_cache.lock().unwrap();
            if let Some((schema, cached_at)) = cache.get(dataset_id) {
                if cached_at.elapsed() < self.schema_ttl {
                    tracing::debug!("returning cached star schema for {dataset_id}");
                    return Ok(schema.clone());
                }
            }
        }

        let Some(dataset) = self.repo.metadata.get_dataset(dataset_id)? else {
            anyhow::bail!("dataset {dataset_id} not found in metadata registry");
        };
        let schema = derive_star_schema(dataset_id, &dataset.category);

        self.repo.metadata.set_config(
            &format!("dataset.{dataset_id}.powerbi_star_schema"),
            &serde_json::to_value(&schema)?,
            ValueType::Json,
        )?;
        let mut cache = self.schema_cache.lock().unwrap();
        cache.insert(dataset_id.to_string(), (schema.clone(), Instant::now()));
        tracing::info!("star schema generated for dataset {dataset_id}");
        Ok(schema)
    }

    /// Drop the cached descriptor so the next call re-derives it.
    pub fn invalidate_star_schema(&self, dataset_id: &str) {
        let mut cache = self.schema_cache.lock().unwrap();
        cache.remove(dataset_id);
    }

    /// Base measures merged with the category-specific set, cached 6 h.
    pub fn get_standard_measures(&self, dataset_id: &str) -> anyhow::Result<Vec<DaxMeasure>> {
        {
            let cache = self.dax_cache.lock().unwrap();
            if let Some((measures, cached_at)) = cache.get(dataset_id) {
                if cached_at.elapsed() < self.dax_ttl {
                    return Ok(measures.clone());
                }
            }
        }

        let Some(dataset) = self.repo.metadata.get_dataset(dataset_id)? else {
            tracing::warn!("no metadata found for dataset {dataset_id}");
            return Ok(Vec::new());
        };

        let mut measures = base_measures(dataset_id);
        measures.extend(category_measures(dataset_id, &dataset.category));

        let mut cache = self.dax_cache.lock().unwrap();
        cache.insert(dataset_id.to_string(), (measures.clone(), Instant::now()));
        Ok(measures)
    }

    pub fn get_performance_metrics(&self, dataset_id: &str) -> anyhow::Result<PerformanceMetrics> {
        let Some(dataset) = self.repo.metadata.get_dataset(dataset_id)? else {
            anyhow::bail!("dataset {dataset_id} not found");
        };
        let stats = self.repo.analytics.observation_stats(dataset_id)?;

        let load_time = 100.0 + 0.01 * stats.total_records as f64;
        let optimization_potential = (stats.total_records as f64 / 100_000.0)
            * (stats.territories as f64 / 100.0);
        let optimization_potential =
            (optimization_potential.min(0.5) * 1000.0).round() / 1000.0;

        let recommended = if dataset.priority >= 8 {
            "daily".to_string()
        } else if dataset.priority >= 6 {
            "weekly".to_string()
        } else {
            dataset
                .metadata
                .get("update_frequency")
                .and_then(|v| v.as_str())
                .unwrap_or("monthly")
                .to_string()
        };

        Ok(PerformanceMetrics {
            total_records: stats.total_records,
            territories: stats.territories,
            start_year: stats.start_year,
            end_year: stats.end_year,
            avg_quality_score: if stats.total_records > 0 { 0.85 } else { 0.0 },
            estimated_powerbi_load_time_ms: load_time as i64,
            recommended_refresh_frequency: recommended,
            star_schema_optimization_potential: optimization_potential,
            last_analyzed: now_ts(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics_db::OBSERVATION_TABLE;
    use crate::models::observation::ObservationRecord;

    fn repo_with(dataset_id: &str, category: &str, priority: i64) -> Arc<UnifiedRepository> {
        let repo = Arc::new(UnifiedRepository::open_in_memory().unwrap());
        repo.register_dataset_complete(dataset_id, "Test", category, "", None, None, priority)
            .unwrap();
        repo
    }

    #[test]
    fn star_schema_for_economia() {
        let schema = derive_star_schema("101_1015", "economia");
        assert_eq!(schema.fact_table, "fact_101_1015");
        assert!(schema.dimension_tables.contains(&"dim_time".to_string()));
        assert!(schema.dimension_tables.contains(&"dim_sector".to_string()));
        assert!(!schema.dimension_tables.contains(&"dim_gender".to_string()));
        assert_eq!(schema.relationships.len(), 3);
        assert_eq!(schema.relationships[0].from_column, "time_key");
        assert_eq!(schema.relationships[0].cardinality, "many_to_one");
    }

    #[test]
    fn star_schema_category_dimensions() {
        assert!(
            derive_star_schema("x", "popolazione")
                .dimension_tables
                .contains(&"dim_age_group".to_string())
        );
        assert!(
            derive_star_schema("x", "lavoro")
                .dimension_tables
                .contains(&"dim_occupation".to_string())
        );
        assert_eq!(derive_star_schema("x", "altro").dimension_tables.len(), 4);
    }

    #[test]
    fn schema_cached_within_ttl_and_persisted() {
        let repo = repo_with("101_1015", "economia", 8);
        let optimizer = PowerBiOptimizer::new(repo.clone());

        let first = optimizer.generate_star_schema("101_1015").unwrap();
        // Category changes in the registry are not observed while cached.
        repo.metadata
            .register_dataset("101_1015", "Test", "popolazione", "", None, None, 8)
            .unwrap();
        let second = optimizer.generate_star_schema("101_1015").unwrap();
        assert_eq!(first, second);

        // Explicit invalidation re-derives with the new category.
        optimizer.invalidate_star_schema("101_1015");
        let third = optimizer.generate_star_schema("101_1015").unwrap();
        assert!(third.dimension_tables.contains(&"dim_gender".to_string()));

        // Persisted descriptor is readable from the metadata store.
        let stored = repo
            .metadata
            .get_config("dataset.101_1015.powerbi_star_schema")
            .unwrap()
            .unwrap();
        let stored: StarSchema = serde_json::from_value(stored).unwrap();
        assert_eq!(stored.fact_table, "fact_101_1015");
    }

    #[test]
    fn expired_cache_rederives() {
        let repo = repo_with("d", "economia", 5);
        let optimizer =
            PowerBiOptimizer::with_ttls(repo.clone(), Duration::ZERO, Duration::ZERO);
        optimizer.generate_star_schema("d").unwrap();
        repo.metadata
            .register_dataset("d", "Test", "lavoro", "", None, None, 5)
            .unwrap();
        // Zero TTL: every call re-derives.
        let schema = optimizer.generate_star_schema("d").unwrap();
        assert!(schema.dimension_tables.contains(&"dim_occupation".to_string()));
    }

    #[test]
    fn unknown_dataset_is_an_error() {
        let repo = Arc::new(UnifiedRepository::open_in_memory().unwrap());
        let optimizer = PowerBiOptimizer::new(repo);
        assert!(optimizer.generate_star_schema("ghost").is_err());
    }

    #[test]
    fn measures_merge_base_and_category() {
        let repo = repo_with("101_1015", "economia", 8);
        let optimizer = PowerBiOptimizer::new(repo);
        let measures = optimizer.get_standard_measures("101_1015").unwrap();
        let names: Vec<&str> = measures.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"Total Observations"));
        assert!(names.contains(&"YoY Growth"));
        assert!(names.contains(&"GDP Growth"));
        assert!(!names.contains(&"Employment Rate"));
        assert!(
            measures
                .iter()
                .find(|m| m.name == "Total Observations")
                .unwrap()
                .expression
                .contains("fact_101_1015")
        );
    }

    #[test]
    fn performance_metrics_formulas() {
        let repo = repo_with("d", "economia", 8);
        let records: Vec<ObservationRecord> = (0..100)
            .map(|i| ObservationRecord {
                dataset_id: "d".to_string(),
                record_id: i,
                ingestion_timestamp: "2026-01-01T00:00:00.000000Z".to_string(),
                obs_value: "1".to_string(),
                time_period: "2024".to_string(),
                additional_attributes: None,
            })
            .collect();
        repo.analytics.bulk_insert(OBSERVATION_TABLE, &records).unwrap();

        let optimizer = PowerBiOptimizer::new(repo.clone());
        let metrics = optimizer.get_performance_metrics("d").unwrap();
        assert_eq!(metrics.total_records, 100);
        assert_eq!(metrics.estimated_powerbi_load_time_ms, 101);
        assert_eq!(metrics.recommended_refresh_frequency, "daily");
        assert!((metrics.avg_quality_score - 0.85).abs() < 1e-9);
        assert!(metrics.star_schema_optimization_potential <= 0.5);

        // Lower priority falls back to the declared update frequency.
        repo.metadata
            .register_dataset(
                "d",
                "Test",
                "economia",
                "",
                Some(&serde_json::json!({"update_frequency": "quarterly"})),
                None,
                3,
            )
            .unwrap();
        let metrics = optimizer.get_performance_metrics("d").unwrap();
        assert_eq!(metrics.recommended_refresh_frequency, "quarterly");
    }
}
