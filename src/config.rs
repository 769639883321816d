use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `osservatorio.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub istat: IstatConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub powerbi: PowerBiConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite metadata database path.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    /// DuckDB analytics database path.
    #[serde(default = "default_duckdb_path")]
    pub duckdb_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            duckdb_path: default_duckdb_path(),
        }
    }
}

fn default_sqlite_path() -> String {
    "data/osservatorio_metadata.db".to_string()
}

fn default_duckdb_path() -> String {
    "data/osservatorio.duckdb".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IstatConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Requests per hour against the SDMX API.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Fetch timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for IstatConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            rate_limit: default_rate_limit(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://sdmx.istat.it/SDMXWS/rest".to_string()
}

fn default_rate_limit() -> u32 {
    50
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Priority dataset ids ingested on each batch run.
    #[serde(default = "default_priority_datasets")]
    pub priority_datasets: Vec<PriorityDataset>,
    /// Retry attempts per dataset after the first try.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Upper bound on datasets ingested in parallel within one batch.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            priority_datasets: default_priority_datasets(),
            retries: default_retries(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriorityDataset {
    pub id: String,
    pub name: String,
}

/// The seven MVP datasets; overridable in `osservatorio.toml`.
fn default_priority_datasets() -> Vec<PriorityDataset> {
    [
        ("101_1015", "Coltivazioni"),
        ("144_107", "Foi – weights until 2010"),
        ("115_333", "Indice della produzione industriale"),
        ("120_337", "Indice delle vendite del commercio al dettaglio"),
        ("143_222", "Indice dei prezzi all'importazione - dati mensili"),
        ("145_360", "Prezzi alla produzione dell'industria"),
        ("149_319", "Tensione contrattuale"),
    ]
    .into_iter()
    .map(|(id, name)| PriorityDataset {
        id: id.to_string(),
        name: name.to_string(),
    })
    .collect()
}

fn default_retries() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Rows per chunk in streaming mode.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Row count above which streaming is recommended.
    #[serde(default = "default_streaming_threshold")]
    pub streaming_threshold: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            streaming_threshold: default_streaming_threshold(),
        }
    }
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_streaming_threshold() -> u64 {
    50_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PowerBiConfig {
    /// Directory where generated .pbit archives are written.
    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,
}

impl Default for PowerBiConfig {
    fn default() -> Self {
        Self {
            templates_dir: default_templates_dir(),
        }
    }
}

fn default_templates_dir() -> String {
    "data/templates".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Audit rows older than this are purged by the retention sweep.
    #[serde(default = "default_audit_days")]
    pub audit_retention_days: u32,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            audit_retention_days: default_audit_days(),
            interval_secs: default_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_audit_days() -> u32 {
    90
}

fn default_interval() -> u64 {
    3600
}

impl AppConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Minimum spacing between outbound SDMX requests, derived from the
    /// hourly rate limit. A limit of 0 disables pacing.
    pub fn istat_min_request_interval(&self) -> std::time::Duration {
        if self.istat.rate_limit == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(3600.0 / self.istat.rate_limit as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_priority_set() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.ingestion.priority_datasets.len(), 7);
        assert_eq!(cfg.ingestion.priority_datasets[0].id, "101_1015");
        assert_eq!(cfg.ingestion.retries, 3);
        assert_eq!(cfg.export.chunk_size, 10_000);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [istat]
            rate_limit = 120

            [[ingestion.priority_datasets]]
            id = "22_289"
            name = "Popolazione residente"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.istat.rate_limit, 120);
        assert_eq!(cfg.ingestion.priority_datasets.len(), 1);
        assert_eq!(cfg.storage.sqlite_path, "data/osservatorio_metadata.db");
    }

    #[test]
    fn request_interval_from_rate_limit() {
        let mut cfg = AppConfig::default();
        cfg.istat.rate_limit = 3600;
        assert_eq!(cfg.istat_min_request_interval().as_secs(), 1);
        cfg.istat.rate_limit = 0;
        assert!(cfg.istat_min_request_interval().is_zero());
    }
}
