use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;

use crate::models::observation::QueryFrame;

/// Column-name fragments that mark a column as date-bearing.
const DATE_COLUMN_HINTS: &[&str] = &["time", "date", "anno", "year"];

/// Rows streamed per chunk; Parquet streams the finished file in 64 KiB slices.
pub const PARQUET_STREAM_SLICE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
    Parquet,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "csv" => Some(ExportFormat::Csv),
            "json" => Some(ExportFormat::Json),
            "parquet" => Some(ExportFormat::Parquet),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
            ExportFormat::Parquet => "application/octet-stream",
        }
    }

    pub fn file_extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => ".csv",
            ExportFormat::Json => ".json",
            ExportFormat::Parquet => ".parquet",
        }
    }

    /// Approximate serialized bytes per row, used for size estimates.
    fn bytes_per_row(self) -> u64 {
        match self {
            ExportFormat::Csv => 100,
            ExportFormat::Json => 150,
            ExportFormat::Parquet => 50,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet write failed: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

/// Optional projections and filters applied before serialization.
#[derive(Debug, Default, Clone)]
pub struct ExportFilters {
    /// Columns to keep; unknown names are ignored, empty keeps everything.
    pub columns: Vec<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<usize>,
}

/// A rendered export: ordered chunks plus response metadata. The buffered
/// body is the concatenation of the chunks, so streaming and buffered output
/// are byte-identical by construction.
#[derive(Debug)]
pub struct RenderedExport {
    pub chunks: Vec<Vec<u8>>,
    pub content_type: &'static str,
    pub filename: String,
    pub total_records: usize,
}

impl RenderedExport {
    pub fn buffered(self) -> Vec<u8> {
        self.chunks.concat()
    }
}

#[derive(Debug, Serialize)]
pub struct SizeEstimate {
    pub row_count: u64,
    pub estimated_sizes: EstimatedSizes,
    pub recommended_streaming: bool,
}

#[derive(Debug, Serialize)]
pub struct EstimatedSizes {
    pub csv_mb: f64,
    pub json_mb: f64,
    pub parquet_mb: f64,
}

/// Format-polymorphic serializer for observation frames.
pub struct Exporter {
    chunk_size: usize,
    streaming_threshold: u64,
}

impl Exporter {
    pub fn new(chunk_size: usize, streaming_threshold: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            streaming_threshold,
        }
    }

    /// Apply column projection, date range, and head limit, in that order.
    pub fn apply_filters(&self, frame: &QueryFrame, filters: &ExportFilters) -> QueryFrame {
        let mut result = project_columns(frame, &filters.columns);

        if filters.start_date.is_some() || filters.end_date.is_some() {
            if let Some(date_col) = find_date_column(&result.columns) {
                let start = filters.start_date.as_deref().and_then(coerce_date);
                let end = filters.end_date.as_deref().and_then(coerce_date);
                let before = result.rows.len();
                result.rows.retain(|row| {
                    match row.get(date_col).and_then(coerce_date_value) {
                        Some(date) => {
                            start.is_none_or(|s| date >= s) && end.is_none_or(|e| date <= e)
                        }
                        // Rows without a parseable date are dropped silently.
                        None => false,
                    }
                });
                let excluded = before - result.rows.len();
                if excluded > 0 {
                    tracing::warn!(
                        "date filter excluded {excluded} rows on column '{}'",
                        result.columns[date_col]
                    );
                }
            }
        }

        if let Some(limit) = filters.limit {
            result.rows.truncate(limit);
        }
        result
    }

    /// Serialize a frame into ordered chunks for the given format.
    pub fn render(
        &self,
        frame: &QueryFrame,
        format: ExportFormat,
        dataset_id: &str,
    ) -> Result<RenderedExport, ExportError> {
        let chunks = match format {
            ExportFormat::Csv => self.csv_chunks(frame)?,
            ExportFormat::Json => self.json_chunks(frame, dataset_id),
            ExportFormat::Parquet => parquet_chunks(frame)?,
        };
        tracing::info!(
            "exporting {} rows as {:?} for dataset {dataset_id}",
            frame.rows.len(),
            format
        );
        Ok(RenderedExport {
            chunks,
            content_type: format.content_type(),
            filename: export_filename(dataset_id, format),
            total_records: frame.rows.len(),
        })
    }

    pub fn estimate(&self, row_count: u64) -> SizeEstimate {
        let mb = |format: ExportFormat| {
            let bytes = row_count * format.bytes_per_row();
            (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
        };
        SizeEstimate {
            row_count,
            estimated_sizes: EstimatedSizes {
                csv_mb: mb(ExportFormat::Csv),
                json_mb: mb(ExportFormat::Json),
                parquet_mb: mb(ExportFormat::Parquet),
            },
            recommended_streaming: row_count > self.streaming_threshold,
        }
    }

    pub fn recommends_streaming(&self, row_count: u64) -> bool {
        row_count > self.streaming_threshold
    }

    /// First chunk is the header row; the rest carry data only.
    fn csv_chunks(&self, frame: &QueryFrame) -> Result<Vec<Vec<u8>>, ExportError> {
        if frame.rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut chunks = Vec::new();
        chunks.push(write_csv_records(&[frame.columns.clone()])?);
        for rows in frame.rows.chunks(self.chunk_size) {
            let records: Vec<Vec<String>> = rows
                .iter()
                .map(|row| row.iter().map(value_to_cell).collect())
                .collect();
            chunks.push(write_csv_records(&records)?);
        }
        Ok(chunks)
    }

    /// Envelope prelude, comma-delimited records, closing bracket.
    fn json_chunks(&self, frame: &QueryFrame, dataset_id: &str) -> Vec<Vec<u8>> {
        let metadata = serde_json::json!({
            "dataset_id": dataset_id,
            "exported_at": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            "total_records": frame.rows.len(),
            "columns": frame.columns,
        });
        let mut chunks = Vec::new();
        chunks.push(format!("{{\"metadata\":{metadata},\"data\":[").into_bytes());

        let records = frame.to_records();
        let mut first = true;
        for chunk in records.chunks(self.chunk_size) {
            let mut body = String::new();
            for record in chunk {
                if !first {
                    body.push(',');
                }
                first = false;
                body.push_str(&record.to_string());
            }
            chunks.push(body.into_bytes());
        }
        chunks.push(b"]}".to_vec());
        chunks
    }
}

fn project_columns(frame: &QueryFrame, requested: &[String]) -> QueryFrame {
    if requested.is_empty() {
        return frame.clone();
    }
    let indices: Vec<usize> = requested
        .iter()
        .filter_map(|c| frame.column_index(c))
        .collect();
    if indices.is_empty() {
        tracing::warn!("none of the requested columns {requested:?} exist; keeping all");
        return frame.clone();
    }
    QueryFrame {
        columns: indices.iter().map(|&i| frame.columns[i].clone()).collect(),
        rows: frame
            .rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(serde_json::Value::Null))
                    .collect()
            })
            .collect(),
    }
}

fn find_date_column(columns: &[String]) -> Option<usize> {
    columns.iter().position(|c| {
        let lower = c.to_lowercase();
        DATE_COLUMN_HINTS.iter().any(|hint| lower.contains(hint))
    })
}

fn coerce_date_value(value: &serde_json::Value) -> Option<NaiveDate> {
    match value {
        serde_json::Value::String(s) => coerce_date(s),
        serde_json::Value::Number(n) => {
            let year = n.as_i64()?;
            if (1000..=9999).contains(&year) {
                NaiveDate::from_ymd_opt(year as i32, 1, 1)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Lenient coercion of SDMX period literals and ISO dates:
/// `2024`, `2024-Q2`, `2024-03`, `2024-03-15`, or a timestamp prefix.
fn coerce_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()) {
        return NaiveDate::from_ymd_opt(s.parse().ok()?, 1, 1);
    }
    if s.len() == 7 {
        if let Some((year, rest)) = s.split_once('-') {
            let year: i32 = year.parse().ok()?;
            if let Some(q) = rest.strip_prefix('Q').or_else(|| rest.strip_prefix('q')) {
                let quarter: u32 = q.parse().ok()?;
                if (1..=4).contains(&quarter) {
                    return NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1);
                }
                return None;
            }
            let month: u32 = rest.parse().ok()?;
            return NaiveDate::from_ymd_opt(year, month, 1);
        }
    }
    if s.len() >= 10 {
        if let Ok(date) = NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d") {
            return Some(date);
        }
    }
    None
}

fn value_to_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn write_csv_records(records: &[Vec<String>]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    for record in records {
        writer.write_record(record)?;
    }
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| ExportError::Io(e.into_error()))
}

/// Build the full snappy-compressed Parquet file in memory, then slice it
/// into 64 KiB stream chunks.
fn parquet_chunks(frame: &QueryFrame) -> Result<Vec<Vec<u8>>, ExportError> {
    let bytes = parquet_bytes(frame)?;
    Ok(bytes
        .chunks(PARQUET_STREAM_SLICE)
        .map(|c| c.to_vec())
        .collect())
}

fn parquet_bytes(frame: &QueryFrame) -> Result<Vec<u8>, ExportError> {
    let fields: Vec<Field> = frame
        .columns
        .iter()
        .map(|c| Field::new(c, DataType::Utf8, true))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buf: Vec<u8> = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema.clone(), Some(props))?;
    if !frame.columns.is_empty() && !frame.rows.is_empty() {
        let arrays: Vec<ArrayRef> = (0..frame.columns.len())
            .map(|col| {
                let values: Vec<Option<String>> = frame
                    .rows
                    .iter()
                    .map(|row| match row.get(col) {
                        None | Some(serde_json::Value::Null) => None,
                        Some(v) => Some(value_to_cell(v)),
                    })
                    .collect();
                Arc::new(StringArray::from(values)) as ArrayRef
            })
            .collect();
        let batch = RecordBatch::try_new(schema, arrays)?;
        writer.write(&batch)?;
    }
    writer.close()?;
    Ok(buf)
}

fn export_filename(dataset_id: &str, format: ExportFormat) -> String {
    format!(
        "{dataset_id}_export_{}{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        format.file_extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame() -> QueryFrame {
        QueryFrame {
            columns: vec![
                "dataset_id".to_string(),
                "record_id".to_string(),
                "obs_value".to_string(),
                "time_period".to_string(),
            ],
            rows: vec![
                vec![json!("101_1015"), json!(0), json!("100"), json!("2024")],
                vec![json!("101_1015"), json!(1), json!("200"), json!("2024")],
                vec![json!("101_1015"), json!(2), json!("50"), json!("2023")],
            ],
        }
    }

    fn exporter() -> Exporter {
        Exporter::new(10_000, 50_000)
    }

    #[test]
    fn coerces_period_literals() {
        assert_eq!(coerce_date("2024"), NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(coerce_date("2024-Q2"), NaiveDate::from_ymd_opt(2024, 4, 1));
        assert_eq!(coerce_date("2024-03"), NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(coerce_date("2024-03-15"), NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(
            coerce_date("2024-03-15T10:00:00Z"),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(coerce_date("n/a"), None);
        assert_eq!(coerce_date("2024-Q7"), None);
    }

    #[test]
    fn filter_composition_matches_predicates() {
        let exporter = exporter();
        let filters = ExportFilters {
            columns: vec!["obs_value".to_string(), "time_period".to_string()],
            start_date: Some("2024-01-01".to_string()),
            end_date: None,
            limit: Some(1),
        };
        let filtered = exporter.apply_filters(&frame(), &filters);
        assert_eq!(filtered.columns, vec!["obs_value", "time_period"]);
        assert_eq!(filtered.rows.len(), 1);
        assert_eq!(filtered.rows[0][0], json!("100"));
    }

    #[test]
    fn invalid_columns_are_ignored() {
        let exporter = exporter();
        let filters = ExportFilters {
            columns: vec!["missing".to_string()],
            ..Default::default()
        };
        let filtered = exporter.apply_filters(&frame(), &filters);
        // No valid projection keeps every column.
        assert_eq!(filtered.columns.len(), 4);

        let partial = ExportFilters {
            columns: vec!["missing".to_string(), "obs_value".to_string()],
            ..Default::default()
        };
        let filtered = exporter.apply_filters(&frame(), &partial);
        assert_eq!(filtered.columns, vec!["obs_value"]);
    }

    #[test]
    fn date_filter_excludes_unparseable_rows() {
        let exporter = exporter();
        let mut f = frame();
        f.rows.push(vec![json!("101_1015"), json!(3), json!("1"), json!("n/a")]);
        let filters = ExportFilters {
            start_date: Some("2023-01-01".to_string()),
            end_date: Some("2024-12-31".to_string()),
            ..Default::default()
        };
        let filtered = exporter.apply_filters(&f, &filters);
        assert_eq!(filtered.rows.len(), 3);
    }

    #[test]
    fn csv_export_has_header_and_rows() {
        let exporter = exporter();
        let rendered = exporter.render(&frame(), ExportFormat::Csv, "101_1015").unwrap();
        let body = String::from_utf8(rendered.buffered()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "dataset_id,record_id,obs_value,time_period");
        assert_eq!(lines[1], "101_1015,0,100,2024");
    }

    #[test]
    fn csv_empty_is_empty_payload() {
        let exporter = exporter();
        let empty = QueryFrame {
            columns: frame().columns,
            rows: vec![],
        };
        let rendered = exporter.render(&empty, ExportFormat::Csv, "d").unwrap();
        assert!(rendered.buffered().is_empty());
    }

    #[test]
    fn json_envelope_round_trips() {
        let exporter = exporter();
        let rendered = exporter.render(&frame(), ExportFormat::Json, "101_1015").unwrap();
        let body = String::from_utf8(rendered.buffered()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["metadata"]["dataset_id"], json!("101_1015"));
        assert_eq!(parsed["metadata"]["total_records"], json!(3));
        assert_eq!(parsed["data"].as_array().unwrap().len(), 3);
        assert_eq!(parsed["data"][0]["obs_value"], json!("100"));
    }

    #[test]
    fn json_empty_envelope() {
        let exporter = exporter();
        let empty = QueryFrame::default();
        let rendered = exporter.render(&empty, ExportFormat::Json, "d").unwrap();
        let parsed: serde_json::Value =
            serde_json::from_slice(&rendered.buffered()).unwrap();
        assert_eq!(parsed["metadata"]["total_records"], json!(0));
        assert_eq!(parsed["data"], json!([]));
    }

    #[test]
    fn streaming_chunks_concatenate_to_buffered() {
        // Chunk size of 1 forces one chunk per row.
        let exporter = Exporter::new(1, 50_000);
        for format in [ExportFormat::Csv, ExportFormat::Json, ExportFormat::Parquet] {
            let rendered = exporter.render(&frame(), format, "101_1015").unwrap();
            assert!(rendered.chunks.len() > 1 || format == ExportFormat::Parquet);
            let concatenated: Vec<u8> = rendered.chunks.concat();
            // Same chunks back the buffered body.
            let rendered_again = RenderedExport {
                chunks: rendered.chunks,
                content_type: rendered.content_type,
                filename: rendered.filename,
                total_records: rendered.total_records,
            };
            assert_eq!(concatenated, rendered_again.buffered());
        }

        // Streamed JSON parses to the same records as a fresh buffered render.
        let rendered = exporter.render(&frame(), ExportFormat::Json, "101_1015").unwrap();
        let parsed: serde_json::Value =
            serde_json::from_slice(&rendered.buffered()).unwrap();
        assert_eq!(parsed["data"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn parquet_is_valid_even_when_empty() {
        let exporter = exporter();
        let rendered = exporter
            .render(&QueryFrame::default(), ExportFormat::Parquet, "d")
            .unwrap();
        let bytes = rendered.buffered();
        // Parquet magic at both ends.
        assert_eq!(&bytes[..4], b"PAR1");
        assert_eq!(&bytes[bytes.len() - 4..], b"PAR1");
    }

    #[test]
    fn parquet_round_trip() {
        let bytes = parquet_bytes(&frame()).unwrap();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, &bytes).unwrap();
        let file = tmp.reopen().unwrap();
        let reader = parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<_> = reader.collect::<Result<Vec<_>, _>>().unwrap();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 3);
        assert_eq!(batches[0].schema().field(2).name(), "obs_value");
    }

    #[test]
    fn size_estimates_use_per_format_coefficients() {
        let exporter = exporter();
        let estimate = exporter.estimate(100_000);
        assert_eq!(estimate.row_count, 100_000);
        assert!((estimate.estimated_sizes.csv_mb - 9.54).abs() < 0.01);
        assert!((estimate.estimated_sizes.json_mb - 14.31).abs() < 0.01);
        assert!((estimate.estimated_sizes.parquet_mb - 4.77).abs() < 0.01);
        assert!(estimate.recommended_streaming);
        assert!(!exporter.estimate(50_000).recommended_streaming);
    }

    #[test]
    fn filename_carries_extension() {
        let name = export_filename("101_1015", ExportFormat::Parquet);
        assert!(name.starts_with("101_1015_export_"));
        assert!(name.ends_with(".parquet"));
    }
}
