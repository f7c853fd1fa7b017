use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced at the webhook HTTP boundary.
///
/// Authorization and validation failures map to 4xx responses; everything
/// downstream of the handoff is asynchronous and never reaches the caller.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("Rate limit exceeded for {tier} tier. Maximum {limit} requests per window.")]
    RateLimited {
        tier: &'static str,
        limit: u32,
        reset_ms: i64,
        retry_after_secs: i64,
    },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match self {
            WebhookError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, Json(json!({ "error": msg }))).into_response()
            }
            WebhookError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            WebhookError::RateLimited {
                tier,
                limit,
                reset_ms,
                retry_after_secs,
            } => {
                let reset_time = chrono::DateTime::from_timestamp_millis(reset_ms)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                let body = Json(json!({
                    "statusCode": 429,
                    "message": format!("Rate limit exceeded for {tier} tier. Maximum {limit} requests per window."),
                    "retryAfter": retry_after_secs,
                    "limit": limit,
                    "remaining": 0,
                    "resetTime": reset_time,
                    "tier": tier,
                }));
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                let headers = response.headers_mut();
                insert_header(headers, "Retry-After", retry_after_secs.to_string());
                insert_header(headers, "X-RateLimit-Limit", limit.to_string());
                insert_header(headers, "X-RateLimit-Remaining", "0".to_string());
                insert_header(headers, "X-RateLimit-Reset", reset_ms.to_string());
                insert_header(headers, "X-RateLimit-Reset-After", retry_after_secs.to_string());
                response
            }
            WebhookError::Internal(err) => {
                tracing::error!("internal error on webhook boundary: {err:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

pub(crate) fn insert_header(
    headers: &mut axum::http::HeaderMap,
    name: &'static str,
    value: String,
) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}
