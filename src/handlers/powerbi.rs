use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::AppState;

pub async fn star_schema(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let schema = state
        .optimizer
        .generate_star_schema(&dataset_id)
        .map_err(not_found_or_internal)?;
    Ok(Json(schema))
}

pub async fn measures(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let measures = state
        .optimizer
        .get_standard_measures(&dataset_id)
        .map_err(not_found_or_internal)?;
    Ok(Json(serde_json::json!({
        "dataset_id": dataset_id,
        "measures": measures,
    })))
}

pub async fn performance(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let metrics = state
        .optimizer
        .get_performance_metrics(&dataset_id)
        .map_err(not_found_or_internal)?;
    Ok(Json(metrics))
}

#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequest {
    #[serde(default = "default_window_days")]
    pub incremental_window_days: i64,
    #[serde(default = "default_window_years")]
    pub historical_window_years: i64,
    #[serde(default = "default_frequency")]
    pub refresh_frequency: String,
}

fn default_window_days() -> i64 {
    30
}

fn default_window_years() -> i64 {
    2
}

fn default_frequency() -> String {
    "daily".to_string()
}

pub async fn create_refresh_policy(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Json(req): Json<CreatePolicyRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let policy = state
        .refresh_manager
        .create_refresh_policy(
            &dataset_id,
            req.incremental_window_days,
            req.historical_window_years,
            &req.refresh_frequency,
        )
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(policy)))
}

pub async fn get_refresh_policy(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(policy) = state
        .refresh_manager
        .get_refresh_policy(&dataset_id)
        .map_err(internal)?
    else {
        return Err((
            StatusCode::NOT_FOUND,
            format!("no refresh policy for {dataset_id}"),
        ));
    };
    Ok(Json(policy))
}

#[derive(Debug, Deserialize)]
pub struct RefreshQuery {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub powerbi_dataset_id: Option<String>,
}

pub async fn execute_refresh(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(query): Query<RefreshQuery>,
) -> impl IntoResponse {
    let result = state
        .refresh_manager
        .execute_incremental_refresh(
            &dataset_id,
            query.powerbi_dataset_id.as_deref(),
            query.force,
        )
        .await;
    Json(result)
}

pub async fn refresh_status(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let status = state
        .refresh_manager
        .get_refresh_status(&dataset_id)
        .map_err(internal)?;
    Ok(Json(status))
}

pub async fn generate_template(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let descriptor = state
        .template_generator
        .generate_template(&dataset_id, None)
        .map_err(not_found_or_internal)?;
    let path = state
        .template_generator
        .create_pbit_file(&descriptor)
        .map_err(internal)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "template_id": descriptor.template_id,
            "dataset_id": descriptor.dataset_id,
            "pbit_path": path.display().to_string(),
            "visualizations": descriptor.visualizations.len(),
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct LineageRequest {
    #[serde(default)]
    pub source_datasets: Vec<String>,
    /// Extra steps as (name, description) pairs appended after the standard
    /// extraction/validation/scoring prefix.
    #[serde(default)]
    pub transformation_steps: Vec<(String, String)>,
}

pub async fn create_lineage(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Json(req): Json<LineageRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let lineage = state
        .bridge
        .create_dataset_lineage(&dataset_id, req.source_datasets, req.transformation_steps)
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(lineage)))
}

pub async fn propagate_quality(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let propagation = state
        .bridge
        .propagate_quality_scores(&dataset_id)
        .map_err(not_found_or_internal)?;
    Ok(Json(propagation))
}

#[derive(Debug, Deserialize)]
pub struct UsageSyncQuery {
    #[serde(default)]
    pub powerbi_dataset_id: Option<String>,
}

pub async fn sync_usage(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(query): Query<UsageSyncQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let metrics = state
        .bridge
        .sync_usage_analytics(&dataset_id, query.powerbi_dataset_id.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(metrics))
}

#[derive(Debug, Deserialize)]
pub struct GovernanceQuery {
    #[serde(default)]
    pub dataset_id: Option<String>,
}

pub async fn governance_report(
    State(state): State<AppState>,
    Query(query): Query<GovernanceQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let report = state
        .bridge
        .get_governance_report(query.dataset_id.as_deref())
        .map_err(internal)?;
    Ok(Json(report))
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("powerbi operation failed: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn not_found_or_internal(e: anyhow::Error) -> (StatusCode, String) {
    let message = e.to_string();
    if message.contains("not found") {
        (StatusCode::NOT_FOUND, message)
    } else {
        tracing::error!("powerbi operation failed: {message}");
        (StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}
