use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use validator::Validate;

use crate::error::{WebhookError, insert_header};
use crate::metrics::{WebhookMetrics, WebhookMetricsSnapshot};
use crate::rate_limit::{MultiTierRateLimiter, RateLimitStatus, RequestScope, client_ip};
use crate::signature::WebhookSigner;
use crate::supervisor::ListenerSupervisor;
use crate::types::WebhookEvent;
use crate::webhook::WebhookProcessor;

const MAX_WEBHOOK_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub signer: Arc<WebhookSigner>,
    pub processor: Arc<WebhookProcessor>,
    pub metrics: Arc<WebhookMetrics>,
    pub limiter: Arc<MultiTierRateLimiter>,
    pub supervisor: Arc<ListenerSupervisor>,
}

pub fn router(state: AppState) -> Router {
    let webhook = Router::new()
        .route("/api/transactions/webhook", post(webhook_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .merge(webhook)
        .route(
            "/api/transactions/webhook/metrics",
            get(webhook_metrics_handler),
        )
        .route(
            "/api/transactions/rate-limit/status",
            get(rate_limit_status_handler),
        )
        .route("/api/health", get(health_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Buffers the body (the transaction tier keys on `txHash`), evaluates
/// all tiers, and only then lets the request through with the body
/// restored. Rejections carry Retry-After and the X-RateLimit-* set.
async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, WebhookError> {
    let (parts, body) = request.into_parts();
    let socket = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY_BYTES)
        .await
        .map_err(|err| WebhookError::Validation(format!("unreadable request body: {err}")))?;

    let tx_hash = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|value| {
            value
                .get("txHash")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    let scope = RequestScope {
        client_ip: client_ip(&parts.headers, socket),
        webhook_source: parts
            .headers
            .get("x-webhook-source")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        tx_hash,
    };

    let standing = state.limiter.check(&scope).map_err(|rejection| {
        WebhookError::RateLimited {
            tier: rejection.tier,
            limit: rejection.limit,
            reset_ms: rejection.reset_ms,
            retry_after_secs: rejection.retry_after_secs,
        }
    })?;

    let request = Request::from_parts(parts, Body::from(bytes));
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    insert_header(headers, "X-RateLimit-Limit", standing.limit.to_string());
    insert_header(
        headers,
        "X-RateLimit-Remaining",
        standing.remaining.to_string(),
    );
    insert_header(headers, "X-RateLimit-Reset", standing.reset_ms.to_string());

    Ok(response)
}

/// Webhook ingress: signature, then schema, then fire-and-forget handoff.
/// The 202 acknowledges the handoff only; callers never observe the
/// outcome of the asynchronous processing.
async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    let started = Instant::now();

    let result = accept_webhook(&state, &headers, &body);
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => state.metrics.record_success(elapsed_ms),
        Err(_) => state.metrics.record_failure(elapsed_ms),
    }
    result
}

fn accept_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<StatusCode, WebhookError> {
    let signature = headers
        .get("x-starknet-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            WebhookError::Unauthorized("Missing X-Starknet-Signature header".to_string())
        })?;

    if !state.signer.verify(signature, body)? {
        return Err(WebhookError::Unauthorized("Invalid signature".to_string()));
    }

    let event: WebhookEvent = serde_json::from_slice(body)
        .map_err(|err| WebhookError::Validation(format!("malformed webhook payload: {err}")))?;
    event
        .validate()
        .map_err(|err| WebhookError::Validation(err.to_string()))?;

    info!(tx_hash = %event.tx_hash, "received webhook event");
    state.processor.process_detached(event);

    Ok(StatusCode::ACCEPTED)
}

async fn webhook_metrics_handler(State(state): State<AppState>) -> Json<WebhookMetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn rate_limit_status_handler(State(state): State<AppState>) -> Json<RateLimitStatus> {
    Json(state.limiter.status())
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "listeners": state.supervisor.health(),
    }))
}

pub async fn serve(state: AppState, bind_address: &str) -> anyhow::Result<()> {
    let app = router(state);

    info!(bind_address, "starting web server");
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|err| anyhow::anyhow!("failed to bind to {bind_address}: {err}"))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|err| anyhow::anyhow!("web server error: {err}"))?;

    Ok(())
}
