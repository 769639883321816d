use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::AppState;

/// Per-credential request counters over hourly windows.
#[derive(Default)]
pub struct RateLimiter {
    counters: Mutex<HashMap<String, (i64, i64)>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request for `service`; false once the hourly limit is hit.
    /// A limit of 0 or below disables the check.
    pub fn allow(&self, service: &str, rate_limit: i64) -> bool {
        if rate_limit <= 0 {
            return true;
        }
        let bucket = chrono::Utc::now().timestamp() / 3600;
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(service.to_string()).or_insert((bucket, 0));
        if entry.0 != bucket {
            *entry = (bucket, 0);
        }
        entry.1 += 1;
        entry.1 <= rate_limit
    }
}

/// Bearer-credential guard for mutating routes. The token is matched by
/// hash against active, unexpired credentials; failures leave an AUTH_FAIL
/// audit event behind.
pub async fn require_bearer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, (StatusCode, String)> {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return Err((
            StatusCode::UNAUTHORIZED,
            "missing bearer credential".to_string(),
        ));
    };

    match state.repo.metadata.verify_api_key(&token) {
        Ok(Some((service, rate_limit))) => {
            if !state.rate_limiter.allow(&service, rate_limit) {
                tracing::warn!("rate limit exceeded for credential '{service}'");
                return Err((
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate limit exceeded".to_string(),
                ));
            }
            Ok(next.run(req).await)
        }
        Ok(None) => {
            let _ = state.repo.metadata.log_action(
                "AUTH_FAIL",
                "credential",
                None,
                None,
                None,
                None,
                None,
                false,
                Some("invalid or expired bearer credential"),
                None,
            );
            Err((
                StatusCode::UNAUTHORIZED,
                "invalid or expired credential".to_string(),
            ))
        }
        Err(e) => {
            tracing::error!("credential verification failed: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, format!("auth error: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_caps_per_window() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("svc", 2));
        assert!(limiter.allow("svc", 2));
        assert!(!limiter.allow("svc", 2));
        // Another credential counts separately.
        assert!(limiter.allow("other", 2));
        // Zero disables limiting.
        assert!(limiter.allow("unlimited", 0));
    }
}
