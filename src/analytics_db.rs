use duckdb::Connection;
use duckdb::params;
use std::sync::Mutex;

use crate::models::observation::{ObservationRecord, QueryFrame};

/// The single observation table; `dataset_id` is the discriminator.
pub const OBSERVATION_TABLE: &str = "istat_observations";

/// SQL expression for the territory of an observation. The flat schema keeps
/// territory inside the attribute map when the upstream payload carries one.
const TERRITORY_EXPR: &str =
    "coalesce(json_extract_string(additional_attributes, '$.obs_ref_area'), 'unknown')";

/// Dataset-level statistics used for PowerBI performance estimates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ObservationStats {
    pub total_records: i64,
    pub territories: i64,
    pub start_year: Option<i64>,
    pub end_year: Option<i64>,
}

/// Append-oriented DuckDB store of normalized SDMX observations.
pub struct AnalyticsDb {
    conn: Mutex<Connection>,
}

impl AnalyticsDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_observation_table()?;
        Ok(db)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_observation_table()?;
        Ok(db)
    }

    /// Idempotent DDL for the observation schema; safe to run on every call.
    pub fn ensure_observation_table(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {OBSERVATION_TABLE} (
                dataset_id           VARCHAR NOT NULL,
                record_id            INTEGER NOT NULL,
                ingestion_timestamp  VARCHAR NOT NULL,
                obs_value            VARCHAR NOT NULL,
                time_period          VARCHAR NOT NULL,
                additional_attributes JSON
            );"
        ))?;
        Ok(())
    }

    /// Append a batch of observation rows. Rows are never updated in place.
    pub fn bulk_insert(&self, table: &str, records: &[ObservationRecord]) -> anyhow::Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();
        let mut appender = conn.appender(table)?;
        for record in records {
            appender.append_row(params![
                record.dataset_id,
                record.record_id,
                record.ingestion_timestamp,
                record.obs_value,
                record.time_period,
                record.attributes_json(),
            ])?;
        }
        appender.flush()?;
        tracing::debug!("inserted {} rows into {table}", records.len());
        Ok(records.len())
    }

    pub fn count_by_dataset(&self, dataset_id: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {OBSERVATION_TABLE} WHERE dataset_id = ?"),
            params![dataset_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Min and max time_period for a dataset, None when it has no rows.
    pub fn time_bounds(&self, dataset_id: &str) -> anyhow::Result<(Option<String>, Option<String>)> {
        let conn = self.conn.lock().unwrap();
        let bounds = conn.query_row(
            &format!(
                "SELECT MIN(time_period), MAX(time_period) \
                 FROM {OBSERVATION_TABLE} WHERE dataset_id = ? AND time_period != ''"
            ),
            params![dataset_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(bounds)
    }

    /// All observation rows for a dataset in the canonical column order.
    pub fn fetch_observations(
        &self,
        dataset_id: &str,
        limit: Option<i64>,
    ) -> anyhow::Result<QueryFrame> {
        let mut sql = format!(
            "SELECT dataset_id, record_id, obs_value, time_period, ingestion_timestamp, \
             CAST(additional_attributes AS VARCHAR) AS additional_attributes \
             FROM {OBSERVATION_TABLE} WHERE dataset_id = ? ORDER BY record_id"
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let params: [&dyn duckdb::ToSql; 1] = [&dataset_id];
        self.query_frame(&sql, &params)
    }

    /// Count of rows ingested after `since` (ISO timestamp).
    pub fn count_ingested_since(&self, dataset_id: &str, since: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {OBSERVATION_TABLE} \
                 WHERE dataset_id = ? AND ingestion_timestamp > ?"
            ),
            params![dataset_id, since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Earliest and latest ingestion timestamps after `since`.
    pub fn change_bounds(
        &self,
        dataset_id: &str,
        since: &str,
    ) -> anyhow::Result<(Option<String>, Option<String>)> {
        let conn = self.conn.lock().unwrap();
        let bounds = conn.query_row(
            &format!(
                "SELECT MIN(ingestion_timestamp), MAX(ingestion_timestamp) \
                 FROM {OBSERVATION_TABLE} WHERE dataset_id = ? AND ingestion_timestamp > ?"
            ),
            params![dataset_id, since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(bounds)
    }

    /// Top-10 changed time periods since `since`, most recent period first.
    pub fn changes_by_period(
        &self,
        dataset_id: &str,
        since: &str,
    ) -> anyhow::Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT time_period, COUNT(*) FROM {OBSERVATION_TABLE} \
             WHERE dataset_id = ? AND ingestion_timestamp > ? \
             GROUP BY time_period ORDER BY time_period DESC LIMIT 10"
        ))?;
        let rows = stmt
            .query_map(params![dataset_id, since], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Top-10 changed territories since `since`, by change count.
    pub fn changes_by_territory(
        &self,
        dataset_id: &str,
        since: &str,
    ) -> anyhow::Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TERRITORY_EXPR} AS territory, COUNT(*) FROM {OBSERVATION_TABLE} \
             WHERE dataset_id = ? AND ingestion_timestamp > ? \
             GROUP BY territory ORDER BY COUNT(*) DESC LIMIT 10"
        ))?;
        let rows = stmt
            .query_map(params![dataset_id, since], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delta rows since `since`, most recently ingested first.
    pub fn fetch_ingested_since(
        &self,
        dataset_id: &str,
        since: &str,
        limit: Option<i64>,
    ) -> anyhow::Result<QueryFrame> {
        let mut sql = format!(
            "SELECT dataset_id, record_id, obs_value, time_period, ingestion_timestamp, \
             CAST(additional_attributes AS VARCHAR) AS additional_attributes \
             FROM {OBSERVATION_TABLE} \
             WHERE dataset_id = ? AND ingestion_timestamp > ? \
             ORDER BY ingestion_timestamp DESC"
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let params: [&dyn duckdb::ToSql; 2] = [&dataset_id, &since];
        self.query_frame(&sql, &params)
    }

    /// Per-territory quality aggregates. The store has no quality column
    /// yet, so each non-empty group carries the platform-wide 0.85 constant.
    pub fn quality_by_territory(
        &self,
        dataset_id: &str,
    ) -> anyhow::Result<Vec<(String, f64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TERRITORY_EXPR} AS territory, CAST(0.85 AS DOUBLE), COUNT(*) \
             FROM {OBSERVATION_TABLE} \
             WHERE dataset_id = ? GROUP BY territory ORDER BY territory"
        ))?;
        let rows = stmt
            .query_map(params![dataset_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record/territory/year statistics for one dataset.
    pub fn observation_stats(&self, dataset_id: &str) -> anyhow::Result<ObservationStats> {
        let conn = self.conn.lock().unwrap();
        let stats = conn.query_row(
            &format!(
                "SELECT COUNT(*), COUNT(DISTINCT {TERRITORY_EXPR}), \
                 MIN(TRY_CAST(substr(time_period, 1, 4) AS INTEGER)), \
                 MAX(TRY_CAST(substr(time_period, 1, 4) AS INTEGER)) \
                 FROM {OBSERVATION_TABLE} WHERE dataset_id = ?"
            ),
            params![dataset_id],
            |row| {
                Ok(ObservationStats {
                    total_records: row.get(0)?,
                    territories: row.get(1)?,
                    start_year: row.get(2)?,
                    end_year: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Run a parameterized read query and collect the result as a frame.
    pub fn execute_query(
        &self,
        sql: &str,
        params: &[&dyn duckdb::ToSql],
    ) -> anyhow::Result<QueryFrame> {
        self.query_frame(sql, params)
    }

    fn query_frame(&self, sql: &str, params: &[&dyn duckdb::ToSql]) -> anyhow::Result<QueryFrame> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let mut rows_out: Vec<Vec<serde_json::Value>> = Vec::new();
        let mut rows = stmt.query(params)?;
        while let Some(row) = rows.next()? {
            let mut out = Vec::new();
            let mut idx = 0;
            loop {
                match row.get::<_, duckdb::types::Value>(idx) {
                    Ok(value) => out.push(duck_to_json(value)),
                    Err(_) => break,
                }
                idx += 1;
            }
            rows_out.push(out);
        }
        drop(rows);
        let columns = stmt
            .column_names()
            .into_iter()
            .map(|c| c.to_string())
            .collect();
        Ok(QueryFrame {
            columns,
            rows: rows_out,
        })
    }
}

fn duck_to_json(value: duckdb::types::Value) -> serde_json::Value {
    use duckdb::types::Value;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(b),
        Value::TinyInt(i) => serde_json::Value::from(i),
        Value::SmallInt(i) => serde_json::Value::from(i),
        Value::Int(i) => serde_json::Value::from(i),
        Value::BigInt(i) => serde_json::Value::from(i),
        Value::UTinyInt(i) => serde_json::Value::from(i),
        Value::USmallInt(i) => serde_json::Value::from(i),
        Value::UInt(i) => serde_json::Value::from(i),
        Value::UBigInt(i) => serde_json::Value::from(i),
        Value::Float(f) => serde_json::Value::from(f),
        Value::Double(f) => serde_json::Value::from(f),
        Value::Text(s) => serde_json::Value::String(s),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(dataset_id: &str, record_id: i64, value: &str, period: &str, ts: &str) -> ObservationRecord {
        ObservationRecord {
            dataset_id: dataset_id.to_string(),
            record_id,
            ingestion_timestamp: ts.to_string(),
            obs_value: value.to_string(),
            time_period: period.to_string(),
            additional_attributes: None,
        }
    }

    #[test]
    fn ensure_table_is_idempotent() {
        let db = AnalyticsDb::open_in_memory().unwrap();
        db.ensure_observation_table().unwrap();
        db.ensure_observation_table().unwrap();
        assert_eq!(db.count_by_dataset("none").unwrap(), 0);
    }

    #[test]
    fn bulk_insert_and_count() {
        let db = AnalyticsDb::open_in_memory().unwrap();
        let rows = vec![
            record("101_1015", 0, "100", "2024", "2026-01-01T00:00:00.000000Z"),
            record("101_1015", 1, "200", "2024", "2026-01-01T00:00:00.000000Z"),
            record("144_107", 0, "7", "2023", "2026-01-01T00:00:00.000000Z"),
        ];
        assert_eq!(db.bulk_insert(OBSERVATION_TABLE, &rows).unwrap(), 3);
        assert_eq!(db.count_by_dataset("101_1015").unwrap(), 2);
        assert_eq!(db.count_by_dataset("144_107").unwrap(), 1);

        let (min, max) = db.time_bounds("101_1015").unwrap();
        assert_eq!(min.as_deref(), Some("2024"));
        assert_eq!(max.as_deref(), Some("2024"));
    }

    #[test]
    fn fetch_observations_keeps_column_order() {
        let db = AnalyticsDb::open_in_memory().unwrap();
        db.bulk_insert(
            OBSERVATION_TABLE,
            &[record("d", 0, "1.5", "2024-Q2", "2026-01-01T00:00:00.000000Z")],
        )
        .unwrap();
        let frame = db.fetch_observations("d", None).unwrap();
        assert_eq!(
            frame.columns,
            vec![
                "dataset_id",
                "record_id",
                "obs_value",
                "time_period",
                "ingestion_timestamp",
                "additional_attributes"
            ]
        );
        assert_eq!(frame.rows.len(), 1);
        assert_eq!(frame.rows[0][2], serde_json::json!("1.5"));
    }

    #[test]
    fn change_detection_since_timestamp() {
        let db = AnalyticsDb::open_in_memory().unwrap();
        db.bulk_insert(
            OBSERVATION_TABLE,
            &[
                record("d", 0, "1", "2023", "2026-01-01T00:00:00.000000Z"),
                record("d", 1, "2", "2024", "2026-02-01T00:00:00.000000Z"),
                record("d", 2, "3", "2024", "2026-02-02T00:00:00.000000Z"),
            ],
        )
        .unwrap();

        let since = "2026-01-15T00:00:00.000000Z";
        assert_eq!(db.count_ingested_since("d", since).unwrap(), 2);
        let periods = db.changes_by_period("d", since).unwrap();
        assert_eq!(periods, vec![("2024".to_string(), 2)]);
        let delta = db.fetch_ingested_since("d", since, None).unwrap();
        assert_eq!(delta.rows.len(), 2);

        let (earliest, latest) = db.change_bounds("d", since).unwrap();
        assert_eq!(earliest.as_deref(), Some("2026-02-01T00:00:00.000000Z"));
        assert_eq!(latest.as_deref(), Some("2026-02-02T00:00:00.000000Z"));
    }

    #[test]
    fn territory_defaults_to_unknown() {
        let db = AnalyticsDb::open_in_memory().unwrap();
        let mut attrs = serde_json::Map::new();
        attrs.insert("obs_ref_area".to_string(), serde_json::json!("IT"));
        let mut with_territory = record("d", 0, "1", "2024", "2026-01-01T00:00:00.000000Z");
        with_territory.additional_attributes = Some(attrs);
        db.bulk_insert(
            OBSERVATION_TABLE,
            &[
                with_territory,
                record("d", 1, "2", "2024", "2026-01-01T00:00:00.000000Z"),
            ],
        )
        .unwrap();

        let mut territories = db
            .changes_by_territory("d", "2000-01-01T00:00:00.000000Z")
            .unwrap();
        territories.sort();
        assert_eq!(
            territories,
            vec![("IT".to_string(), 1), ("unknown".to_string(), 1)]
        );

        let quality = db.quality_by_territory("d").unwrap();
        assert_eq!(quality.len(), 2);
        assert!(quality.iter().all(|(_, q, _)| (*q - 0.85).abs() < 1e-9));
    }

    #[test]
    fn observation_stats_years() {
        let db = AnalyticsDb::open_in_memory().unwrap();
        db.bulk_insert(
            OBSERVATION_TABLE,
            &[
                record("d", 0, "1", "2021", "2026-01-01T00:00:00.000000Z"),
                record("d", 1, "2", "2024-Q2", "2026-01-01T00:00:00.000000Z"),
            ],
        )
        .unwrap();
        let stats = db.observation_stats("d").unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.start_year, Some(2021));
        assert_eq!(stats.end_year, Some(2024));
    }
}
