//! HTTP request handlers.

use super::AppState;
use crate::alert::{AgentError, RemoteAlert, PEER_IDENTITY_HEADER, SERVER_KEY_HEADER};
use crate::bus::{Bus, PublishEvent};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_LIMIT: u32 = 100;

fn agent_error(e: AgentError) -> axum::response::Response {
    match e {
        AgentError::Config(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

// ============================================================================
// RPC
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WatchTopicRequest {
    pub group: String,
    pub topic: String,
    pub timeout: f64,
}

#[derive(Debug, Deserialize)]
pub struct WatchDeviceRequest {
    pub group: String,
    pub topic: String,
    pub timeout: f64,
    pub points: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct IgnoreTopicRequest {
    pub group: String,
    pub topic: String,
}

pub async fn handle_watch_topic(
    State(state): State<AppState>,
    Json(req): Json<WatchTopicRequest>,
) -> impl IntoResponse {
    match state.agent.watch_topic(&req.group, &req.topic, req.timeout) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => agent_error(e),
    }
}

pub async fn handle_watch_device(
    State(state): State<AppState>,
    Json(req): Json<WatchDeviceRequest>,
) -> impl IntoResponse {
    match state
        .agent
        .watch_device(&req.group, &req.topic, req.timeout, req.points)
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => agent_error(e),
    }
}

pub async fn handle_ignore_topic(
    State(state): State<AppState>,
    Json(req): Json<IgnoreTopicRequest>,
) -> impl IntoResponse {
    state.agent.ignore_topic(&req.group, &req.topic);
    StatusCode::NO_CONTENT
}

// ============================================================================
// Bus ingress
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub delivered: usize,
}

pub async fn handle_publish(
    State(state): State<AppState>,
    Json(event): Json<PublishEvent>,
) -> impl IntoResponse {
    if event.topic.is_empty() {
        return (StatusCode::BAD_REQUEST, "topic is required").into_response();
    }
    let delivered = state.bus.publish(&event);
    Json(PublishResponse { delivered }).into_response()
}

// ============================================================================
// Health & alerts
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.agent.health().status())
}

pub async fn handle_remote_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(alert): Json<RemoteAlert>,
) -> impl IntoResponse {
    if let Some(expected) = &state.config.server_key {
        let presented = headers
            .get(SERVER_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != expected.as_str() {
            tracing::warn!("Rejected remote alert {} with bad server key", alert.alert_key);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let origin = headers
        .get(PEER_IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    state
        .agent
        .health()
        .receive_remote(origin, &alert.alert_key, alert.status);
    StatusCode::NO_CONTENT.into_response()
}

pub async fn handle_alerts(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.agent.health().recent_alerts())
}

pub async fn handle_groups(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.agent.snapshots())
}

// ============================================================================
// Availability log
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TopicLogQuery {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn handle_topic_log(
    State(state): State<AppState>,
    Query(query): Query<TopicLogQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    match state.store.topic_log(query.topic.as_deref(), limit) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn handle_agent_runs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.store.agent_runs(query.limit.unwrap_or(DEFAULT_LIMIT)) {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub topic: String,
    #[serde(default)]
    pub hours: Option<u32>,
}

pub async fn handle_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let hours = query.hours.unwrap_or(24).max(1);
    let end = Utc::now();
    let start = end - ChronoDuration::hours(hours as i64);

    match state.store.downtime(&query.topic, start, end) {
        Ok(report) => Json(report).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
