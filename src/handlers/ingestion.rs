use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::AppState;

/// `POST /api/ingestion/run` — ingest the whole priority set. Partial
/// failures still return 200 with the per-dataset breakdown.
pub async fn run_batch(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.pipeline.ingest_all_priority_datasets().await;
    Json(result)
}

pub async fn run_single(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> impl IntoResponse {
    let result = state.pipeline.ingest_single_dataset(&dataset_id).await;
    Json(result)
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.get_ingestion_status())
}

pub async fn cancel(State(state): State<AppState>) -> impl IntoResponse {
    state.pipeline.cancel();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "cancelled": true })),
    )
}
