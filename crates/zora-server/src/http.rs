use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;

use zora_core::SteeringMessage;
use zora_providers::Provider;
use zora_types::TaskSpec;

use crate::{client_ip, AppState};

const DEFAULT_SPA_PAGE: &str = "<!doctype html>\n<html><head><title>Zora</title></head>\
<body><h1>Zora engine</h1><p>The dashboard bundle is not installed; the API is live under \
<code>/api</code>.</p></body></html>";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/quota", get(quota))
        .route("/api/jobs", get(jobs))
        .route("/api/system", get(system))
        .route("/api/task", post(submit_task))
        .route("/api/steer", post(steer))
        .route("/api/retry-queue", get(retry_queue))
        .route("/api/events", get(events))
        .fallback(spa_fallback)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "dashboard API listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(request.extensions().get::<ConnectInfo<SocketAddr>>());
    if !state.rate_limiter.allow(ip) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"ok": false, "error": "Too many requests"})),
        )
            .into_response();
    }
    next.run(request).await
}

/// Auth posture of every provider; delegates to each adapter's checkAuth.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut providers = Vec::new();
    for provider in state.orchestrator.providers() {
        let auth = provider.check_auth().await;
        providers.push(json!({
            "name": provider.spec().name,
            "valid": auth.valid,
            "expiresAt": auth.expires_at,
            "canAutoRefresh": auth.can_auto_refresh,
        }));
    }
    Json(json!({"ok": true, "providers": providers}))
}

async fn quota(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut rows = Vec::new();
    for provider in state.orchestrator.providers() {
        rows.push(json!({
            "name": provider.spec().name,
            "auth": provider.check_auth().await,
            "quota": provider.get_quota_status().await,
            "usage": provider.get_usage().await,
            "costTier": provider.spec().cost_tier,
        }));
    }
    Json(json!({"ok": true, "providers": rows}))
}

async fn jobs(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let sessions = state
        .orchestrator
        .sessions()
        .list()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({"ok": true, "jobs": sessions})))
}

async fn system(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime_secs = (chrono::Utc::now() - state.orchestrator.started_at())
        .num_seconds()
        .max(0);
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    Json(json!({
        "ok": true,
        "uptime": uptime_secs,
        "memory": {"used": sys.used_memory(), "total": sys.total_memory()},
    }))
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    prompt: Option<String>,
    #[serde(rename = "modelPreference")]
    model_preference: Option<String>,
}

async fn submit_task(
    State(state): State<AppState>,
    Json(body): Json<TaskRequest>,
) -> Response {
    let Some(prompt) = body.prompt.filter(|p| !p.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "prompt is required"})),
        )
            .into_response();
    };
    if state.orchestrator.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ok": false, "error": "engine is shutting down"})),
        )
            .into_response();
    }
    let mut task = TaskSpec::new(prompt);
    task.model_preference = body.model_preference;
    match state.orchestrator.submit_task(task).await {
        Ok(job_id) => Json(json!({"ok": true, "jobId": job_id})).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ok": false, "error": err.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SteerRequest {
    #[serde(rename = "jobId")]
    job_id: Option<String>,
    message: Option<String>,
    author: Option<String>,
    source: Option<String>,
}

async fn steer(State(state): State<AppState>, Json(body): Json<SteerRequest>) -> Response {
    let (Some(job_id), Some(message)) = (
        body.job_id.filter(|v| !v.trim().is_empty()),
        body.message.filter(|v| !v.trim().is_empty()),
    ) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "jobId and message are required"})),
        )
            .into_response();
    };
    let steering = SteeringMessage::new(
        message,
        body.author.unwrap_or_else(|| "user".to_string()),
        body.source.unwrap_or_else(|| "dashboard".to_string()),
    );
    match state.orchestrator.steering().push(&job_id, steering).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn retry_queue(State(state): State<AppState>) -> Json<serde_json::Value> {
    let entries = state.orchestrator.retry_queue().entries().await;
    let dead = state.orchestrator.retry_queue().dead_letter().await;
    Json(json!({"ok": true, "entries": entries, "deadLetter": dead}))
}

fn sse_stream(
    state: AppState,
) -> impl Stream<Item = Result<SseEvent, std::convert::Infallible>> {
    let rx = state.orchestrator.event_bus().subscribe();
    let connected =
        tokio_stream::once(Ok(SseEvent::default().data(r#"{"type":"connected"}"#)));
    let live = BroadcastStream::new(rx).filter_map(|message| match message {
        Ok(envelope) => {
            let payload = serde_json::to_string(&envelope).unwrap_or_default();
            Some(Ok(SseEvent::default().data(payload)))
        }
        Err(_) => None,
    });
    connected.chain(live)
}

async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let sse = Sse::new(sse_stream(state))
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)));
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
}

async fn spa_fallback(State(state): State<AppState>, request: Request) -> Response {
    if request.uri().path().starts_with("/api/") {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": "not found"})),
        )
            .into_response();
    }
    match &state.spa_index {
        Some(path) => match tokio::fs::read_to_string(path).await {
            Ok(page) => Html(page).into_response(),
            Err(_) => Html(DEFAULT_SPA_PAGE.to_string()).into_response(),
        },
        None => Html(DEFAULT_SPA_PAGE.to_string()).into_response(),
    }
}
