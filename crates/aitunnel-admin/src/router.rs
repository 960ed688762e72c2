use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde::Deserialize;

use aitunnel_core::events::Event;
use aitunnel_core::state::AppState;

use crate::sse;

/// Recent log records returned by the snapshot endpoint.
const RECENT_LOG_COUNT: usize = 50;
/// Management requests are small JSON; anything bigger is a mistake.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub token: Option<String>,
    pub version: &'static str,
}

pub fn router(app: Arc<AppState>, token: Option<String>) -> Router {
    let state = AdminState {
        app,
        token,
        version: env!("CARGO_PKG_VERSION"),
    };

    Router::new()
        .route("/api/status", get(status))
        .route("/api/channels", get(list_channels))
        .route("/api/stats", get(stats))
        .route("/api/channels/{name}/toggle", post(toggle_channel))
        .route("/api/channels/{name}/keys", post(add_key))
        .route("/api/channels/{name}/keys/{index}", delete(remove_key))
        .route("/api/logs/recent", get(recent_logs))
        .route("/api/logs", get(sse::log_stream))
        .route("/api/config/reload", post(reload_config))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    req: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.token.as_deref() else {
        return Ok(next.run(req).await);
    };

    if bearer_token(req.headers()) == Some(expected) {
        return Ok(next.run(req).await);
    }
    // Browser EventSource cannot set headers, so the SSE route also
    // accepts the token as a query parameter.
    if req.uri().path() == "/api/logs" && query_token(req.uri()) == Some(expected.to_string()) {
        return Ok(next.run(req).await);
    }
    Err(StatusCode::UNAUTHORIZED)
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = value[prefix.len()..].trim();
        if !token.is_empty() {
            return Some(token);
        }
    }
    None
}

fn query_token(uri: &axum::http::Uri) -> Option<String> {
    let query = uri.query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" && !value.is_empty()).then(|| value.to_string())
    })
}

async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    let channels = state.app.channels();
    let healthy = channels
        .iter()
        .filter(|ch| ch.health() == aitunnel_core::Health::Healthy)
        .count();
    Json(serde_json::json!({
        "status": "running",
        "uptime": state.app.uptime_secs(),
        "channels": { "healthy": healthy, "total": channels.len() },
        "version": state.version,
    }))
}

async fn list_channels(State(state): State<AdminState>) -> impl IntoResponse {
    let summaries: Vec<_> = state
        .app
        .channels()
        .iter()
        .map(|ch| ch.summary())
        .collect();
    Json(summaries)
}

async fn stats(State(state): State<AdminState>) -> impl IntoResponse {
    let mut total: u64 = 0;
    let mut success: u64 = 0;
    let mut fail: u64 = 0;
    let mut per_channel = Vec::new();
    for channel in state.app.channels() {
        let stats = channel.stats();
        total += stats.total_requests;
        success += stats.success_count;
        fail += stats.fail_count;
        per_channel.push(serde_json::json!({
            "name": channel.name(),
            "totalRequests": stats.total_requests,
            "successCount": stats.success_count,
            "failCount": stats.fail_count,
            "successRate": success_rate(stats.success_count, stats.total_requests),
            "lastError": stats.last_error,
        }));
    }
    Json(serde_json::json!({
        "totalRequests": total,
        "successCount": success,
        "failCount": fail,
        "successRate": success_rate(success, total),
        "channels": per_channel,
    }))
}

fn success_rate(success: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    success as f64 / total as f64
}

async fn toggle_channel(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Response {
    let Some(channel) = state.app.channel(&name) else {
        return not_found("channel_not_found");
    };
    let enabled = channel.toggle();
    state.app.hub.info(
        "admin",
        format!(
            "channel {name} {}",
            if enabled { "enabled" } else { "disabled" }
        ),
    );
    Json(serde_json::json!({ "name": name, "enabled": enabled })).into_response()
}

#[derive(Debug, Deserialize)]
struct AddKeyBody {
    key: String,
}

async fn add_key(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(body): Json<AddKeyBody>,
) -> Response {
    let Some(channel) = state.app.channel(&name) else {
        return not_found("channel_not_found");
    };
    if body.key.trim().is_empty() {
        return bad_request("empty_key");
    }
    channel.add_key(body.key);
    state
        .app
        .hub
        .info("admin", format!("key added to channel {name}"));
    Json(serde_json::json!({
        "name": name,
        "totalKeys": channel.total_keys(),
        "aliveKeys": channel.alive_keys(),
    }))
    .into_response()
}

async fn remove_key(
    State(state): State<AdminState>,
    Path((name, index)): Path<(String, usize)>,
) -> Response {
    let Some(channel) = state.app.channel(&name) else {
        return not_found("channel_not_found");
    };
    if !channel.remove_key(index) {
        return bad_request("bad_key_index");
    }
    state
        .app
        .hub
        .info("admin", format!("key {index} removed from channel {name}"));
    Json(serde_json::json!({
        "name": name,
        "totalKeys": channel.total_keys(),
        "aliveKeys": channel.alive_keys(),
    }))
    .into_response()
}

async fn recent_logs(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.app.hub.recent(RECENT_LOG_COUNT))
}

async fn reload_config(State(state): State<AdminState>) -> impl IntoResponse {
    state.app.hub.emit(Event::ConfigReloadRequest);
    Json(serde_json::json!({ "ok": true }))
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
