use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::AppState;
use crate::export::{ExportFilters, ExportFormat};

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: Option<String>,
    /// Comma-separated column projection.
    #[serde(default)]
    pub columns: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// `GET /api/datasets/{id}/export` — serialized observations with optional
/// filters, buffered or streamed.
pub async fn export_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, (StatusCode, String)> {
    let format = query.format.as_deref().unwrap_or("csv");
    let Some(format) = ExportFormat::parse(format) else {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unsupported format: {format}"),
        ));
    };

    let registered = state
        .repo
        .metadata
        .get_dataset(&dataset_id)
        .map_err(internal)?;
    if registered.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("dataset {dataset_id} not found")));
    }

    let frame = state
        .repo
        .analytics
        .fetch_observations(&dataset_id, None)
        .map_err(internal)?;

    let filters = ExportFilters {
        columns: query
            .columns
            .as_deref()
            .map(|c| {
                c.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        start_date: query.start_date,
        end_date: query.end_date,
        limit: query.limit,
    };
    let filtered = state.exporter.apply_filters(&frame, &filters);

    let stream_mode = query
        .stream
        .unwrap_or_else(|| state.exporter.recommends_streaming(filtered.rows.len() as u64));

    let rendered = state
        .exporter
        .render(&filtered, format, &dataset_id)
        .map_err(internal)?;

    let content_type = rendered.content_type;
    let disposition = format!("attachment; filename={}", rendered.filename);
    let body = if stream_mode {
        Body::from_stream(futures_util::stream::iter(
            rendered
                .chunks
                .into_iter()
                .map(Ok::<_, std::convert::Infallible>),
        ))
    } else {
        Body::from(rendered.buffered())
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(body)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// `GET /api/datasets/{id}/export/info` — columns, size estimates, and
/// streaming recommendation for one dataset.
pub async fn export_info(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(complete) = state
        .repo
        .get_dataset_complete(&dataset_id)
        .map_err(internal)?
    else {
        return Err((StatusCode::NOT_FOUND, format!("dataset {dataset_id} not found")));
    };

    let row_count = complete
        .analytics_stats
        .as_ref()
        .map(|s| s.row_count as u64)
        .unwrap_or(0);
    let estimate = state.exporter.estimate(row_count);
    let recommend_streaming = estimate.recommended_streaming;

    Ok(Json(serde_json::json!({
        "metadata": complete,
        "available_columns": [
            "dataset_id", "record_id", "obs_value", "time_period",
            "ingestion_timestamp", "additional_attributes",
        ],
        "size_estimates": estimate,
        "supported_formats": ["csv", "json", "parquet"],
        "recommendations": {
            "streaming": recommend_streaming,
        },
    })))
}

/// `GET /api/datasets/export/formats` — catalog of export formats.
pub async fn export_formats() -> impl IntoResponse {
    Json(serde_json::json!({
        "formats": [
            {
                "format": "csv",
                "content_type": "text/csv",
                "extension": ".csv",
                "description": "Comma-separated values with a header row",
            },
            {
                "format": "json",
                "content_type": "application/json",
                "extension": ".json",
                "description": "JSON envelope with export metadata and records",
            },
            {
                "format": "parquet",
                "content_type": "application/octet-stream",
                "extension": ".parquet",
                "description": "Snappy-compressed Apache Parquet",
            },
        ],
    }))
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("export failed: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
