use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use std::sync::Mutex;

use crate::models::audit::{ActionSummary, AuditEvent, AuditFilter, AuditStatistics};
use crate::models::dataset::{Dataset, DatasetSummary};
use crate::models::rule::CategorizationRule;

pub const SCHEMA_VERSION: &str = "1.1.0";

/// Actions treated as security-relevant by `get_security_events`.
const SECURITY_ACTIONS: &[&str] = &[
    "LOGIN",
    "LOGOUT",
    "AUTH_FAIL",
    "ACCESS_DENIED",
    "PASSWORD_CHANGE",
];

/// UTC timestamp with microsecond precision, ISO-8601 with trailing Z.
pub(crate) fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Storage tag for config and preference payloads. Decoding is driven by the
/// tag at read time and never fails hard; malformed payloads degrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Json,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Json => "json",
        }
    }

    /// Unknown tags decode as plain strings.
    pub fn parse(s: &str) -> Self {
        match s {
            "number" | "integer" => ValueType::Number,
            "boolean" => ValueType::Boolean,
            "json" => ValueType::Json,
            _ => ValueType::String,
        }
    }
}

/// Decode a stored payload according to its type tag.
///
/// Degrade rules: invalid JSON becomes an empty mapping, an unparseable
/// number falls back to the raw string, booleans accept true/1/yes/on.
pub fn decode_typed(raw: &str, value_type: ValueType) -> serde_json::Value {
    match value_type {
        ValueType::String => serde_json::Value::String(raw.to_string()),
        ValueType::Boolean => {
            let truthy = matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes" | "on");
            serde_json::Value::Bool(truthy)
        }
        ValueType::Number => {
            if let Ok(i) = raw.parse::<i64>() {
                serde_json::Value::Number(i.into())
            } else if let Ok(f) = raw.parse::<f64>() {
                serde_json::Number::from_f64(f)
                    .map(serde_json::Value::Number)
                    .unwrap_or_else(|| serde_json::Value::String(raw.to_string()))
            } else {
                serde_json::Value::String(raw.to_string())
            }
        }
        ValueType::Json => serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new())),
    }
}

/// Encode a value for storage under the given type tag.
pub fn encode_typed(value: &serde_json::Value, value_type: ValueType) -> String {
    match value_type {
        ValueType::Json => value.to_string(),
        ValueType::Boolean => match value {
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::String(s) => s.to_lowercase(),
            other => other.to_string(),
        },
        _ => match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

/// Credential row without its hashes.
#[derive(Debug, serde::Serialize)]
pub struct CredentialInfo {
    pub service_name: String,
    pub endpoint_url: Option<String>,
    pub is_active: bool,
    pub rate_limit: i64,
    pub usage_count: i64,
    pub last_used: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
}

/// Transactional metadata store: dataset registry, configuration, user
/// preferences, API credentials, audit log, and categorization rules.
pub struct MetadataDb {
    conn: Mutex<Connection>,
}

impl MetadataDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, path)
    }

    /// In-memory store, used by tests and throwaway tooling.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, ":memory:")
    }

    fn from_connection(conn: Connection, path: &str) -> anyhow::Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA foreign_keys=ON; \
             PRAGMA synchronous=NORMAL; \
             PRAGMA cache_size=-65536; \
             PRAGMA temp_store=MEMORY; \
             PRAGMA busy_timeout=30000;",
        )?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations(path)?;
        Ok(db)
    }

    fn run_migrations(&self, db_path: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS dataset_registry (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                dataset_id     TEXT NOT NULL UNIQUE,
                name           TEXT NOT NULL,
                category       TEXT NOT NULL,
                description    TEXT NOT NULL DEFAULT '',
                source_agency  TEXT NOT NULL DEFAULT 'ISTAT',
                priority       INTEGER NOT NULL DEFAULT 5,
                is_active      INTEGER NOT NULL DEFAULT 1,
                metadata_json  TEXT,
                quality_score  REAL NOT NULL DEFAULT 0.0,
                record_count   INTEGER NOT NULL DEFAULT 0,
                last_processed TEXT,
                created_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_dataset_registry_category ON dataset_registry(category);
            CREATE INDEX IF NOT EXISTS idx_dataset_registry_priority ON dataset_registry(priority DESC);
            CREATE INDEX IF NOT EXISTS idx_dataset_registry_active ON dataset_registry(is_active);

            CREATE TABLE IF NOT EXISTS user_preferences (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id          TEXT NOT NULL,
                preference_key   TEXT NOT NULL,
                preference_value TEXT NOT NULL,
                preference_type  TEXT NOT NULL DEFAULT 'string',
                is_encrypted     INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                UNIQUE(user_id, preference_key)
            );
            CREATE INDEX IF NOT EXISTS idx_user_preferences_user ON user_preferences(user_id);

            CREATE TABLE IF NOT EXISTS api_credentials (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                service_name    TEXT NOT NULL UNIQUE,
                api_key_hash    TEXT NOT NULL,
                api_secret_hash TEXT,
                endpoint_url    TEXT,
                is_active       INTEGER NOT NULL DEFAULT 1,
                expires_at      TEXT,
                last_used       TEXT,
                usage_count     INTEGER NOT NULL DEFAULT 0,
                rate_limit      INTEGER NOT NULL DEFAULT 100,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_api_credentials_service ON api_credentials(service_name);
            CREATE INDEX IF NOT EXISTS idx_api_credentials_active ON api_credentials(is_active);

            CREATE TABLE IF NOT EXISTS audit_log (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id           TEXT,
                action            TEXT NOT NULL,
                resource_type     TEXT NOT NULL,
                resource_id       TEXT,
                details_json      TEXT,
                ip_address        TEXT,
                user_agent        TEXT,
                success           INTEGER NOT NULL DEFAULT 1,
                error_message     TEXT,
                execution_time_ms INTEGER,
                timestamp         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_audit_log_user ON audit_log(user_id);
            CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log(action);

            CREATE TABLE IF NOT EXISTS system_config (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                config_key   TEXT NOT NULL UNIQUE,
                config_value TEXT NOT NULL,
                config_type  TEXT NOT NULL DEFAULT 'string',
                description  TEXT NOT NULL DEFAULT '',
                is_sensitive INTEGER NOT NULL DEFAULT 0,
                environment  TEXT NOT NULL DEFAULT 'development',
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_system_config_key ON system_config(config_key, environment);

            CREATE TABLE IF NOT EXISTS categorization_rules (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id       TEXT NOT NULL UNIQUE,
                category      TEXT NOT NULL,
                keywords_json TEXT NOT NULL,
                priority      INTEGER NOT NULL DEFAULT 5,
                is_active     INTEGER NOT NULL DEFAULT 1,
                description   TEXT NOT NULL DEFAULT '',
                created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_categorization_category ON categorization_rules(category);
            CREATE INDEX IF NOT EXISTS idx_categorization_active ON categorization_rules(is_active);
            CREATE INDEX IF NOT EXISTS idx_categorization_priority ON categorization_rules(priority DESC);

            CREATE TABLE IF NOT EXISTS schema_migrations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                version     TEXT NOT NULL UNIQUE,
                description TEXT,
                applied_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            ",
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations (version, description) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, "SQLite metadata schema"],
        )?;

        // Default configuration rows; existing values are never overwritten.
        let defaults: &[(&str, String, &str, &str)] = &[
            (
                "database.sqlite.path",
                db_path.to_string(),
                "string",
                "SQLite metadata database path",
            ),
            (
                "database.duckdb.path",
                "data/osservatorio.duckdb".to_string(),
                "string",
                "DuckDB analytics database path",
            ),
            (
                "api.istat.rate_limit",
                "50".to_string(),
                "number",
                "ISTAT API rate limit per hour",
            ),
            (
                "api.istat.timeout",
                "30".to_string(),
                "number",
                "ISTAT API timeout in seconds",
            ),
            (
                "cache.default_ttl",
                "1800".to_string(),
                "number",
                "Default cache TTL in seconds",
            ),
            (
                "security.max_login_attempts",
                "5".to_string(),
                "number",
                "Maximum login attempts before lockout",
            ),
            (
                "logging.level",
                "INFO".to_string(),
                "string",
                "Application logging level",
            ),
            (
                "dashboard.refresh_interval",
                "300".to_string(),
                "number",
                "Dashboard refresh interval in seconds",
            ),
        ];
        for (key, value, ty, desc) in defaults {
            conn.execute(
                "INSERT OR IGNORE INTO system_config (config_key, config_value, config_type, description) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, value, ty, desc],
            )?;
        }

        // Default dataflow categorization rules.
        let default_rules: &[(&str, &str, &[&str], i64)] = &[
            (
                "rule_popolazione",
                "popolazione",
                &["popolazione", "demografia", "residenti", "abitanti", "natalita"],
                10,
            ),
            (
                "rule_economia",
                "economia",
                &["economia", "pil", "prezzi", "inflazione", "commercio", "produzione"],
                9,
            ),
            (
                "rule_lavoro",
                "lavoro",
                &["lavoro", "occupazione", "disoccupazione", "occupati", "contrattuale"],
                8,
            ),
            (
                "rule_territorio",
                "territorio",
                &["territorio", "comuni", "province", "regioni", "ambiente"],
                7,
            ),
            (
                "rule_istruzione",
                "istruzione",
                &["istruzione", "scuola", "universita", "studenti", "formazione"],
                6,
            ),
            (
                "rule_salute",
                "salute",
                &["salute", "sanita", "ospedali", "malattie", "mortalita"],
                5,
            ),
        ];
        for (rule_id, category, keywords, priority) in default_rules {
            let keywords_json = serde_json::to_string(keywords)?;
            conn.execute(
                "INSERT OR IGNORE INTO categorization_rules (rule_id, category, keywords_json, priority, description) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    rule_id,
                    category,
                    keywords_json,
                    priority,
                    format!("Default rule for category '{category}'")
                ],
            )?;
        }

        Ok(())
    }

    /// Run `f` inside a single SQLite transaction. Commits only when `f`
    /// returns Ok; any error rolls the transaction back on the way out.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    // ── Dataset operations ──

    pub fn register_dataset(
        &self,
        dataset_id: &str,
        name: &str,
        category: &str,
        description: &str,
        metadata: Option<&serde_json::Value>,
        source_agency: Option<&str>,
        priority: i64,
    ) -> anyhow::Result<bool> {
        if dataset_id.is_empty() || name.is_empty() {
            tracing::warn!("dataset registration rejected: id and name are required");
            return Ok(false);
        }
        if !(1..=10).contains(&priority) {
            tracing::warn!("dataset registration rejected: priority {priority} out of range 1-10");
            return Ok(false);
        }

        let metadata_json = metadata.map(|m| m.to_string());
        let agency = source_agency.unwrap_or("ISTAT");
        let now = now_ts();

        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "INSERT INTO dataset_registry \
             (dataset_id, name, category, description, metadata_json, source_agency, priority, is_active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8) \
             ON CONFLICT(dataset_id) DO UPDATE SET \
             name = ?2, category = ?3, description = ?4, metadata_json = ?5, \
             source_agency = ?6, priority = ?7, is_active = 1, updated_at = ?8",
            params![dataset_id, name, category, description, metadata_json, agency, priority, now],
        )?;
        Ok(count > 0)
    }

    fn dataset_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dataset> {
        let metadata_json: Option<String> = row.get(7)?;
        let metadata = metadata_json
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
        Ok(Dataset {
            dataset_id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            description: row.get(3)?,
            source_agency: row.get(4)?,
            priority: row.get(5)?,
            is_active: row.get(6)?,
            metadata,
            quality_score: row.get(8)?,
            record_count: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            last_processed: row.get(12)?,
        })
    }

    const DATASET_COLUMNS: &'static str =
        "dataset_id, name, category, description, source_agency, priority, is_active, \
         metadata_json, quality_score, record_count, created_at, updated_at, last_processed";

    pub fn get_dataset(&self, dataset_id: &str) -> anyhow::Result<Option<Dataset>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM dataset_registry WHERE dataset_id = ?1 AND is_active = 1",
            Self::DATASET_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![dataset_id], Self::dataset_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_datasets(
        &self,
        category: Option<&str>,
        active_only: bool,
        limit: Option<i64>,
        offset: i64,
    ) -> anyhow::Result<Vec<Dataset>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!(
            "SELECT {} FROM dataset_registry WHERE 1=1",
            Self::DATASET_COLUMNS
        );
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(cat) = category {
            sql.push_str(&format!(" AND category = ?{}", param_values.len() + 1));
            param_values.push(Box::new(cat.to_string()));
        }
        if active_only {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY priority DESC, name ASC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if offset > 0 {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), Self::dataset_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_dataset_stats(
        &self,
        dataset_id: &str,
        record_count: Option<i64>,
        quality_score: Option<f64>,
        last_processed: Option<&str>,
    ) -> anyhow::Result<bool> {
        let mut set_parts: Vec<String> = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(count) = record_count {
            set_parts.push(format!("record_count = ?{}", param_values.len() + 1));
            param_values.push(Box::new(count));
        }
        if let Some(score) = quality_score {
            set_parts.push(format!("quality_score = ?{}", param_values.len() + 1));
            param_values.push(Box::new(score));
        }
        if let Some(processed) = last_processed {
            set_parts.push(format!("last_processed = ?{}", param_values.len() + 1));
            param_values.push(Box::new(processed.to_string()));
        }
        if set_parts.is_empty() {
            tracing::warn!("no stats to update for dataset {dataset_id}");
            return Ok(false);
        }

        set_parts.push(format!("updated_at = ?{}", param_values.len() + 1));
        param_values.push(Box::new(now_ts()));
        let where_idx = param_values.len() + 1;
        param_values.push(Box::new(dataset_id.to_string()));

        let sql = format!(
            "UPDATE dataset_registry SET {} WHERE dataset_id = ?{where_idx}",
            set_parts.join(", ")
        );
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();

        let conn = self.conn.lock().unwrap();
        let count = conn.execute(&sql, params_ref.as_slice())?;
        Ok(count > 0)
    }

    pub fn deactivate_dataset(&self, dataset_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE dataset_registry SET is_active = 0, updated_at = ?2 WHERE dataset_id = ?1",
            params![dataset_id, now_ts()],
        )?;
        Ok(count > 0)
    }

    pub fn dataset_categories(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT category FROM dataset_registry \
             WHERE is_active = 1 AND category != '' ORDER BY category",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn dataset_summary(&self) -> anyhow::Result<DatasetSummary> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT COUNT(*), \
             COUNT(CASE WHEN is_active = 1 THEN 1 END), \
             COUNT(DISTINCT category), \
             COALESCE(SUM(record_count), 0), \
             COALESCE(AVG(quality_score), 0.0), \
             MAX(last_processed) \
             FROM dataset_registry",
        )?;
        let summary = stmt.query_row([], |row| {
            Ok(DatasetSummary {
                total_datasets: row.get(0)?,
                active_datasets: row.get(1)?,
                categories: row.get(2)?,
                total_records: row.get(3)?,
                avg_quality_score: row.get(4)?,
                last_processing: row.get(5)?,
            })
        })?;
        Ok(summary)
    }

    // ── Configuration operations ──

    pub fn set_config(
        &self,
        key: &str,
        value: &serde_json::Value,
        value_type: ValueType,
    ) -> anyhow::Result<bool> {
        if key.is_empty() {
            tracing::warn!("configuration key cannot be empty");
            return Ok(false);
        }
        let stored = encode_typed(value, value_type);
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "INSERT INTO system_config (config_key, config_value, config_type, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(config_key) DO UPDATE SET \
             config_value = ?2, config_type = ?3, updated_at = ?4",
            params![key, stored, value_type.as_str(), now_ts()],
        )?;
        Ok(count > 0)
    }

    pub fn get_config(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT config_value, config_type FROM system_config WHERE config_key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows
            .next()
            .transpose()?
            .map(|(raw, ty)| decode_typed(&raw, ValueType::parse(&ty))))
    }

    pub fn delete_config(&self, key: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM system_config WHERE config_key = ?1", params![key])?;
        Ok(count > 0)
    }

    /// List config entries, optionally filtered by a SQL LIKE pattern on the key.
    pub fn list_configs(
        &self,
        key_pattern: Option<&str>,
    ) -> anyhow::Result<Vec<(String, serde_json::Value)>> {
        let conn = self.conn.lock().unwrap();
        let (sql, pattern) = match key_pattern {
            Some(p) => (
                "SELECT config_key, config_value, config_type FROM system_config \
                 WHERE config_key LIKE ?1 ORDER BY config_key",
                Some(p.to_string()),
            ),
            None => (
                "SELECT config_key, config_value, config_type FROM system_config \
                 ORDER BY config_key",
                None,
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        };
        let raw_rows = match pattern {
            Some(p) => stmt
                .query_map(params![p], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>()?,
        };
        Ok(raw_rows
            .into_iter()
            .map(|(key, raw, ty)| {
                let value = decode_typed(&raw, ValueType::parse(&ty));
                (key, value)
            })
            .collect())
    }

    // ── User preference operations ──

    pub fn set_user_preference(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
        value_type: ValueType,
        is_encrypted: bool,
    ) -> anyhow::Result<bool> {
        if user_id.is_empty() || key.is_empty() {
            tracing::warn!("user preference rejected: user_id and key are required");
            return Ok(false);
        }
        let stored = encode_typed(value, value_type);
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "INSERT INTO user_preferences \
             (user_id, preference_key, preference_value, preference_type, is_encrypted, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(user_id, preference_key) DO UPDATE SET \
             preference_value = ?3, preference_type = ?4, is_encrypted = ?5, updated_at = ?6",
            params![user_id, key, stored, value_type.as_str(), is_encrypted, now_ts()],
        )?;
        Ok(count > 0)
    }

    pub fn get_user_preference(
        &self,
        user_id: &str,
        key: &str,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT preference_value, preference_type FROM user_preferences \
             WHERE user_id = ?1 AND preference_key = ?2",
        )?;
        let mut rows = stmt.query_map(params![user_id, key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows
            .next()
            .transpose()?
            .map(|(raw, ty)| decode_typed(&raw, ValueType::parse(&ty))))
    }

    pub fn get_user_preferences(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Vec<(String, serde_json::Value)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT preference_key, preference_value, preference_type FROM user_preferences \
             WHERE user_id = ?1 ORDER BY preference_key",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(key, raw, ty)| {
                let value = decode_typed(&raw, ValueType::parse(&ty));
                (key, value)
            })
            .collect())
    }

    pub fn delete_user_preference(&self, user_id: &str, key: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM user_preferences WHERE user_id = ?1 AND preference_key = ?2",
            params![user_id, key],
        )?;
        Ok(count > 0)
    }

    pub fn delete_all_user_preferences(&self, user_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM user_preferences WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(count > 0)
    }

    /// Set a batch of preferences atomically; all writes commit together or
    /// none of them do.
    pub fn bulk_set_preferences(
        &self,
        user_id: &str,
        prefs: &[(String, serde_json::Value, ValueType, bool)],
    ) -> anyhow::Result<bool> {
        if user_id.is_empty() || prefs.is_empty() {
            return Ok(false);
        }
        self.with_transaction(|tx| {
            let now = now_ts();
            for (key, value, value_type, is_encrypted) in prefs {
                if key.is_empty() {
                    anyhow::bail!("empty preference key in bulk set for user {user_id}");
                }
                let stored = encode_typed(value, *value_type);
                tx.execute(
                    "INSERT INTO user_preferences \
                     (user_id, preference_key, preference_value, preference_type, is_encrypted, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(user_id, preference_key) DO UPDATE SET \
                     preference_value = ?3, preference_type = ?4, is_encrypted = ?5, updated_at = ?6",
                    params![user_id, key, stored, value_type.as_str(), is_encrypted, now],
                )?;
            }
            Ok(true)
        })
    }

    // ── API credential operations ──

    pub fn store_api_credentials(
        &self,
        service_name: &str,
        api_key: &str,
        api_secret: Option<&str>,
        endpoint_url: Option<&str>,
        rate_limit: i64,
        expires_at: Option<&str>,
    ) -> anyhow::Result<bool> {
        if service_name.is_empty() || api_key.is_empty() {
            tracing::warn!("credential store rejected: service and key are required");
            return Ok(false);
        }
        let key_hash = hash_secret(api_key);
        let secret_hash = api_secret.map(hash_secret);
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "INSERT INTO api_credentials \
             (service_name, api_key_hash, api_secret_hash, endpoint_url, rate_limit, expires_at, is_active, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7) \
             ON CONFLICT(service_name) DO UPDATE SET \
             api_key_hash = ?2, api_secret_hash = ?3, endpoint_url = ?4, \
             rate_limit = ?5, expires_at = ?6, is_active = 1, updated_at = ?7",
            params![service_name, key_hash, secret_hash, endpoint_url, rate_limit, expires_at, now_ts()],
        )?;
        Ok(count > 0)
    }

    /// Verify a presented key for a named service. Expired or inactive
    /// credentials fail even when the hash matches.
    pub fn verify_api_credentials(
        &self,
        service_name: &str,
        presented_key: &str,
    ) -> anyhow::Result<bool> {
        let presented_hash = hash_secret(presented_key);
        let now = now_ts();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM api_credentials \
             WHERE service_name = ?1 AND api_key_hash = ?2 AND is_active = 1 \
             AND (expires_at IS NULL OR expires_at > ?3)",
        )?;
        let mut rows = stmt.query_map(params![service_name, presented_hash, now], |row| {
            row.get::<_, i64>(0)
        })?;
        let matched = rows.next().transpose()?;
        drop(rows);
        drop(stmt);

        match matched {
            Some(id) => {
                conn.execute(
                    "UPDATE api_credentials SET last_used = ?2, usage_count = usage_count + 1 WHERE id = ?1",
                    params![id, now],
                )?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Token-equivalent check for bearer auth: match a presented key against
    /// any active, unexpired credential. Returns the service name and its
    /// hourly rate limit on success.
    pub fn verify_api_key(&self, presented_key: &str) -> anyhow::Result<Option<(String, i64)>> {
        let presented_hash = hash_secret(presented_key);
        let now = now_ts();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, service_name, rate_limit FROM api_credentials \
             WHERE api_key_hash = ?1 AND is_active = 1 \
             AND (expires_at IS NULL OR expires_at > ?2)",
        )?;
        let mut rows = stmt.query_map(params![presented_hash, now], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let matched = rows.next().transpose()?;
        drop(rows);
        drop(stmt);

        match matched {
            Some((id, service, rate_limit)) => {
                conn.execute(
                    "UPDATE api_credentials SET last_used = ?2, usage_count = usage_count + 1 WHERE id = ?1",
                    params![id, now],
                )?;
                Ok(Some((service, rate_limit)))
            }
            None => Ok(None),
        }
    }

    /// Credential metadata for listings; hashes never leave the store.
    pub fn list_api_credentials(&self) -> anyhow::Result<Vec<CredentialInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT service_name, endpoint_url, is_active, rate_limit, usage_count, \
             last_used, expires_at, created_at \
             FROM api_credentials ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CredentialInfo {
                    service_name: row.get(0)?,
                    endpoint_url: row.get(1)?,
                    is_active: row.get(2)?,
                    rate_limit: row.get(3)?,
                    usage_count: row.get(4)?,
                    last_used: row.get(5)?,
                    expires_at: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn deactivate_api_credential(&self, service_name: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE api_credentials SET is_active = 0, updated_at = ?2 WHERE service_name = ?1",
            params![service_name, now_ts()],
        )?;
        Ok(count > 0)
    }

    // ── Audit operations ──

    pub fn log_action(
        &self,
        action: &str,
        resource_type: &str,
        user_id: Option<&str>,
        resource_id: Option<&str>,
        details: Option<&serde_json::Value>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
        success: bool,
        error_message: Option<&str>,
        execution_time_ms: Option<i64>,
    ) -> anyhow::Result<bool> {
        if action.is_empty() || resource_type.is_empty() {
            tracing::warn!("audit entry rejected: action and resource_type are required");
            return Ok(false);
        }
        let details_json = details.map(|d| d.to_string());
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "INSERT INTO audit_log \
             (user_id, action, resource_type, resource_id, details_json, ip_address, user_agent, \
              success, error_message, execution_time_ms, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                user_id,
                action,
                resource_type,
                resource_id,
                details_json,
                ip_address,
                user_agent,
                success,
                error_message,
                execution_time_ms,
                now_ts()
            ],
        )?;
        Ok(count > 0)
    }

    fn audit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
        let details_json: Option<String> = row.get(5)?;
        let details = details_json
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
        Ok(AuditEvent {
            id: row.get(0)?,
            user_id: row.get(1)?,
            action: row.get(2)?,
            resource_type: row.get(3)?,
            resource_id: row.get(4)?,
            details,
            ip_address: row.get(6)?,
            user_agent: row.get(7)?,
            success: row.get(8)?,
            error_message: row.get(9)?,
            execution_time_ms: row.get(10)?,
            timestamp: row.get(11)?,
        })
    }

    const AUDIT_COLUMNS: &'static str =
        "id, user_id, action, resource_type, resource_id, details_json, ip_address, user_agent, \
         success, error_message, execution_time_ms, timestamp";

    pub fn get_audit_logs(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<AuditEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("SELECT {} FROM audit_log WHERE 1=1", Self::AUDIT_COLUMNS);
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref user_id) = filter.user_id {
            sql.push_str(&format!(" AND user_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(user_id.clone()));
        }
        if let Some(ref action) = filter.action {
            sql.push_str(&format!(" AND action = ?{}", param_values.len() + 1));
            param_values.push(Box::new(action.clone()));
        }
        if let Some(ref resource_type) = filter.resource_type {
            sql.push_str(&format!(" AND resource_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(resource_type.clone()));
        }
        if let Some(ref resource_id) = filter.resource_id {
            sql.push_str(&format!(" AND resource_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(resource_id.clone()));
        }
        if let Some(success) = filter.success {
            sql.push_str(&format!(" AND success = ?{}", param_values.len() + 1));
            param_values.push(Box::new(success));
        }
        if let Some(ref start) = filter.start_time {
            sql.push_str(&format!(" AND timestamp >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(start.clone()));
        }
        if let Some(ref end) = filter.end_time {
            sql.push_str(&format!(" AND timestamp <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(end.clone()));
        }

        sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT {limit}"));
        if offset > 0 {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), Self::audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_audit_statistics(
        &self,
        start_time: Option<&str>,
        end_time: Option<&str>,
    ) -> anyhow::Result<AuditStatistics> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT COUNT(*), \
             COUNT(CASE WHEN success = 1 THEN 1 END), \
             COUNT(CASE WHEN success = 0 THEN 1 END), \
             COUNT(DISTINCT user_id), \
             COUNT(DISTINCT action), \
             COUNT(DISTINCT resource_type), \
             AVG(execution_time_ms), \
             MIN(timestamp), \
             MAX(timestamp) \
             FROM audit_log WHERE 1=1",
        );
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(start) = start_time {
            sql.push_str(&format!(" AND timestamp >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(start.to_string()));
        }
        if let Some(end) = end_time {
            sql.push_str(&format!(" AND timestamp <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(end.to_string()));
        }
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let stats = stmt.query_row(params_ref.as_slice(), |row| {
            Ok(AuditStatistics {
                total_events: row.get(0)?,
                successful_events: row.get(1)?,
                failed_events: row.get(2)?,
                unique_users: row.get(3)?,
                unique_actions: row.get(4)?,
                unique_resource_types: row.get(5)?,
                avg_execution_time: row.get(6)?,
                first_event_time: row.get(7)?,
                last_event_time: row.get(8)?,
            })
        })?;
        Ok(stats)
    }

    pub fn get_action_summary(
        &self,
        start_time: Option<&str>,
        end_time: Option<&str>,
    ) -> anyhow::Result<Vec<ActionSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT action, resource_type, COUNT(*), \
             COUNT(CASE WHEN success = 1 THEN 1 END), \
             COUNT(CASE WHEN success = 0 THEN 1 END), \
             AVG(execution_time_ms), \
             MAX(timestamp) \
             FROM audit_log WHERE 1=1",
        );
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(start) = start_time {
            sql.push_str(&format!(" AND timestamp >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(start.to_string()));
        }
        if let Some(end) = end_time {
            sql.push_str(&format!(" AND timestamp <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(end.to_string()));
        }
        sql.push_str(" GROUP BY action, resource_type ORDER BY COUNT(*) DESC");

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                Ok(ActionSummary {
                    action: row.get(0)?,
                    resource_type: row.get(1)?,
                    event_count: row.get(2)?,
                    success_count: row.get(3)?,
                    failure_count: row.get(4)?,
                    avg_execution_time: row.get(5)?,
                    last_occurrence: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_user_activity(
        &self,
        user_id: &str,
        start_time: Option<&str>,
        end_time: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<AuditEvent>> {
        let filter = AuditFilter {
            user_id: Some(user_id.to_string()),
            start_time: start_time.map(str::to_string),
            end_time: end_time.map(str::to_string),
            ..Default::default()
        };
        self.get_audit_logs(&filter, limit, 0)
    }

    /// Security events: one of the security actions, or any failed event.
    pub fn get_security_events(
        &self,
        start_time: Option<&str>,
        end_time: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<AuditEvent>> {
        let conn = self.conn.lock().unwrap();
        let placeholders = SECURITY_ACTIONS
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {} FROM audit_log WHERE (action IN ({placeholders}) OR success = 0)",
            Self::AUDIT_COLUMNS
        );
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = SECURITY_ACTIONS
            .iter()
            .map(|a| Box::new(a.to_string()) as Box<dyn rusqlite::types::ToSql>)
            .collect();
        if let Some(start) = start_time {
            sql.push_str(&format!(" AND timestamp >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(start.to_string()));
        }
        if let Some(end) = end_time {
            sql.push_str(&format!(" AND timestamp <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(end.to_string()));
        }
        sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT {limit}"));

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), Self::audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete audit rows older than the retention threshold. Returns the
    /// number of rows removed.
    pub fn cleanup_old_logs(&self, days_to_keep: u32) -> anyhow::Result<i64> {
        let threshold = (chrono::Utc::now() - chrono::Duration::days(days_to_keep as i64))
            .format("%Y-%m-%dT%H:%M:%S%.6fZ")
            .to_string();
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM audit_log WHERE timestamp < ?1",
            params![threshold],
        )?;
        Ok(count as i64)
    }

    // ── Categorization rule operations ──

    /// Trim, lowercase, and deduplicate a keyword list, dropping empties.
    fn normalize_keywords(keywords: &[String]) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        let mut normalized = Vec::new();
        for keyword in keywords {
            let k = keyword.trim().to_lowercase();
            if !k.is_empty() && seen.insert(k.clone()) {
                normalized.push(k);
            }
        }
        normalized
    }

    pub fn create_categorization_rule(
        &self,
        rule_id: &str,
        category: &str,
        keywords: &[String],
        priority: i64,
        description: &str,
    ) -> anyhow::Result<bool> {
        if rule_id.is_empty() || category.is_empty() {
            tracing::warn!("categorization rule rejected: rule_id and category are required");
            return Ok(false);
        }
        let normalized = Self::normalize_keywords(keywords);
        if normalized.is_empty() {
            tracing::warn!("categorization rule {rule_id} rejected: empty keyword set");
            return Ok(false);
        }
        let keywords_json = serde_json::to_string(&normalized)?;
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO categorization_rules (rule_id, category, keywords_json, priority, description) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rule_id, category, keywords_json, priority, description],
        );
        match result {
            Ok(count) => Ok(count > 0),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                tracing::warn!("categorization rule {rule_id} already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_categorization_rule(
        &self,
        rule_id: &str,
        category: Option<&str>,
        keywords: Option<&[String]>,
        priority: Option<i64>,
        is_active: Option<bool>,
        description: Option<&str>,
    ) -> anyhow::Result<bool> {
        let mut set_parts: Vec<String> = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(category) = category {
            set_parts.push(format!("category = ?{}", param_values.len() + 1));
            param_values.push(Box::new(category.to_string()));
        }
        if let Some(keywords) = keywords {
            let normalized = Self::normalize_keywords(keywords);
            if normalized.is_empty() {
                tracing::warn!("categorization rule {rule_id} update rejected: empty keyword set");
                return Ok(false);
            }
            set_parts.push(format!("keywords_json = ?{}", param_values.len() + 1));
            param_values.push(Box::new(serde_json::to_string(&normalized)?));
        }
        if let Some(priority) = priority {
            set_parts.push(format!("priority = ?{}", param_values.len() + 1));
            param_values.push(Box::new(priority));
        }
        if let Some(active) = is_active {
            set_parts.push(format!("is_active = ?{}", param_values.len() + 1));
            param_values.push(Box::new(active));
        }
        if let Some(description) = description {
            set_parts.push(format!("description = ?{}", param_values.len() + 1));
            param_values.push(Box::new(description.to_string()));
        }
        if set_parts.is_empty() {
            return Ok(false);
        }

        set_parts.push(format!("updated_at = ?{}", param_values.len() + 1));
        param_values.push(Box::new(now_ts()));
        let where_idx = param_values.len() + 1;
        param_values.push(Box::new(rule_id.to_string()));

        let sql = format!(
            "UPDATE categorization_rules SET {} WHERE rule_id = ?{where_idx}",
            set_parts.join(", ")
        );
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();

        let conn = self.conn.lock().unwrap();
        let count = conn.execute(&sql, params_ref.as_slice())?;
        Ok(count > 0)
    }

    pub fn delete_categorization_rule(&self, rule_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM categorization_rules WHERE rule_id = ?1",
            params![rule_id],
        )?;
        Ok(count > 0)
    }

    /// Rules ordered for match evaluation: priority DESC, then rule_id ASC.
    pub fn get_categorization_rules(
        &self,
        category: Option<&str>,
        active_only: bool,
    ) -> anyhow::Result<Vec<CategorizationRule>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT rule_id, category, keywords_json, priority, is_active, description \
             FROM categorization_rules WHERE 1=1",
        );
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(cat) = category {
            sql.push_str(&format!(" AND category = ?{}", param_values.len() + 1));
            param_values.push(Box::new(cat.to_string()));
        }
        if active_only {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY priority DESC, rule_id ASC");

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                let keywords_json: String = row.get(2)?;
                let keywords: Vec<String> =
                    serde_json::from_str(&keywords_json).unwrap_or_default();
                Ok(CategorizationRule {
                    rule_id: row.get(0)?,
                    category: row.get(1)?,
                    keywords,
                    priority: row.get(3)?,
                    is_active: row.get(4)?,
                    description: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
