use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::AppState;

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.health_check())
}
