use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::AppState;
use crate::categorization;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub async fn list_datasets(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let datasets = state
        .repo
        .metadata
        .list_datasets(
            query.category.as_deref(),
            true,
            query.limit,
            query.offset.unwrap_or(0),
        )
        .map_err(internal)?;
    let count = datasets.len();
    Ok(Json(serde_json::json!({
        "datasets": datasets,
        "count": count,
    })))
}

pub async fn get_dataset(
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
    Ok(Json(complete))
}

pub async fn dataset_summary(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let summary = state.repo.metadata.dataset_summary().map_err(internal)?;
    let categories = state.repo.metadata.dataset_categories().map_err(internal)?;
    Ok(Json(serde_json::json!({
        "summary": summary,
        "categories": categories,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub dataset_id: String,
    pub name: String,
    /// Derived from the categorization rules when absent.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub source_agency: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    5
}

pub async fn register_dataset(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let category = match req.category {
        Some(c) if !c.is_empty() => c,
        _ => categorization::categorize_dataflow(&state.repo.metadata, &req.name, &req.description)
            .map_err(internal)?,
    };

    let registered = state
        .repo
        .register_dataset_complete(
            &req.dataset_id,
            &req.name,
            &category,
            &req.description,
            req.metadata.as_ref(),
            req.source_agency.as_deref(),
            req.priority,
        )
        .map_err(internal)?;

    if !registered {
        return Err((
            StatusCode::BAD_REQUEST,
            "dataset registration rejected".to_string(),
        ));
    }
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "dataset_id": req.dataset_id,
            "category": category,
            "registered": true,
        })),
    ))
}

pub async fn deactivate_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let deactivated = state
        .repo
        .metadata
        .deactivate_dataset(&dataset_id)
        .map_err(internal)?;
    if !deactivated {
        return Err((StatusCode::NOT_FOUND, format!("dataset {dataset_id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("dataset operation failed: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
