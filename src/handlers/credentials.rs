use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::AppState;

fn generate_api_key() -> String {
    let mut rng = rand::rng();
    let chars: Vec<char> = "abcdefghijklmnopqrstuvwxyz0123456789".chars().collect();
    (0..64).map(|_| chars[rng.random_range(0..chars.len())]).collect()
}

#[derive(Debug, Deserialize)]
pub struct CreateCredentialRequest {
    pub service_name: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: i64,
    #[serde(default)]
    pub expires_at: Option<String>,
}

fn default_rate_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
pub struct CredentialCreated {
    pub service_name: String,
    /// Returned in full ONLY on creation; only the hash is stored.
    pub api_key: String,
    pub rate_limit: i64,
}

pub async fn list_credentials(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let credentials = state.repo.metadata.list_api_credentials().map_err(internal)?;
    Ok(Json(serde_json::json!({ "credentials": credentials })))
}

pub async fn create_credential(
    State(state): State<AppState>,
    Json(req): Json<CreateCredentialRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let api_key = generate_api_key();
    let stored = state
        .repo
        .metadata
        .store_api_credentials(
            &req.service_name,
            &api_key,
            None,
            req.endpoint_url.as_deref(),
            req.rate_limit,
            req.expires_at.as_deref(),
        )
        .map_err(internal)?;
    if !stored {
        return Err((
            StatusCode::BAD_REQUEST,
            "credential creation rejected".to_string(),
        ));
    }
    Ok((
        StatusCode::CREATED,
        Json(CredentialCreated {
            service_name: req.service_name,
            api_key,
            rate_limit: req.rate_limit,
        }),
    ))
}

pub async fn revoke_credential(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let revoked = state
        .repo
        .metadata
        .deactivate_api_credential(&service_name)
        .map_err(internal)?;
    if !revoked {
        return Err((StatusCode::NOT_FOUND, "not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("credential operation failed: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
