use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use tg_core::{Operation, ResourceDimension, Tier};
use tg_memory::MemoryRecord;
use tg_stream::{FrameStatus, StreamHandle, Subscription, WireFrame};

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/sessions", post(create_session).get(list_sessions))
        .route("/api/v1/sessions/{id}", get(get_session).delete(terminate_session))
        .route("/api/v1/sessions/{id}/touch", post(touch_session))
        .route("/api/v1/sessions/{id}/quota", get(get_quota))
        .route("/api/v1/sessions/{id}/usage", post(track_usage))
        .route("/api/v1/sessions/{id}/rate/{operation}", post(check_rate))
        .route("/api/v1/sessions/{id}/memory", post(remember))
        .route("/api/v1/sessions/{id}/memory/search", post(recall))
}

pub fn stream_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/sessions/{id}/streams", post(open_stream).get(list_streams))
        .route("/api/v1/sessions/{id}/streams/{stream_id}", get(stream_status))
        .route("/api/v1/sessions/{id}/streams/{stream_id}/emit", post(emit))
        .route("/api/v1/sessions/{id}/streams/{stream_id}/complete", post(complete))
        .route("/api/v1/sessions/{id}/streams/{stream_id}/fail", post(fail))
        .route("/api/v1/sessions/{id}/streams/{stream_id}/cancel", post(cancel))
        .route("/api/v1/sessions/{id}/streams/{stream_id}/pause", post(pause))
        .route("/api/v1/sessions/{id}/streams/{stream_id}/resume", post(resume))
        .route("/api/v1/sessions/{id}/streams/{stream_id}/events", get(events))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    user_id: String,
    #[serde(default)]
    tier: Tier,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    user_id: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id must not be empty"));
    }
    let info = state.registry.create_session(req.user_id, req.tier, req.metadata)?;
    // a session whose saved memory no longer fits still starts
    if let Err(e) = state.registry.restore(&info.session_id).await {
        warn!(session_id = %info.session_id, error = %e, "Restoring session memory failed");
    }
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_sessions(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Json<Value> {
    let sessions = match query.user_id {
        Some(user_id) => state.registry.list_by_user(&user_id),
        None => state.registry.list(),
    };
    Json(json!({ "sessions": sessions }))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let session = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("Session not found: {id}")))?;
    Ok(Json(session.info()))
}

async fn terminate_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.registry.close(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn touch_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let session = state.registry.resolve(&id)?;
    Ok(Json(session.info()))
}

async fn get_quota(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let quota = state.registry.get_quota(&id)?;
    Ok(Json(json!({ "session_id": id, "quota": quota })))
}

#[derive(Debug, Deserialize)]
struct UsageRequest {
    dimension: ResourceDimension,
    amount: u64,
}

async fn track_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UsageRequest>,
) -> ApiResult<impl IntoResponse> {
    let usage = state.registry.track_usage(&id, req.dimension, req.amount)?;
    Ok(Json(usage))
}

async fn check_rate(
    State(state): State<AppState>,
    Path((id, operation)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let operation: Operation = operation.parse().map_err(ApiError::bad_request)?;
    let windows = state.registry.enforce_rate_limit(&id, operation)?;
    Ok(Json(json!({ "allowed": true, "operation": operation, "windows": windows })))
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Deserialize)]
struct RememberRequest {
    key: Option<String>,
    payload: String,
    embedding: Option<Vec<f32>>,
    importance: Option<f32>,
}

async fn remember(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RememberRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut record = MemoryRecord::new(req.payload);
    if let Some(key) = req.key {
        record = record.with_key(key);
    }
    if let Some(embedding) = req.embedding {
        record = record.with_embedding(embedding);
    }
    if let Some(importance) = req.importance {
        record = record.with_importance(importance);
    }
    let record_id = state.registry.remember(&id, record)?;
    Ok((StatusCode::CREATED, Json(json!({ "record_id": record_id }))))
}

#[derive(Debug, Deserialize)]
struct RecallRequest {
    embedding: Vec<f32>,
    #[serde(default = "default_k")]
    k: usize,
}

fn default_k() -> usize {
    5
}

async fn recall(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RecallRequest>,
) -> ApiResult<Json<Value>> {
    let hits = state.registry.recall(&id, &req.embedding, req.k)?;
    let results: Vec<Value> = hits
        .into_iter()
        .map(|(record, score)| {
            json!({
                "record_id": record.id,
                "key": record.key,
                "payload": String::from_utf8_lossy(&record.payload),
                "importance": record.importance,
                "score": score,
            })
        })
        .collect();
    Ok(Json(json!({ "results": results })))
}

// ============================================================================
// Streams
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenStreamRequest {
    #[serde(default = "default_stream_operation")]
    operation: Operation,
}

fn default_stream_operation() -> Operation {
    Operation::ChatStream
}

#[derive(Debug, Deserialize)]
struct EmitRequest {
    payload: String,
    #[serde(default)]
    replace: bool,
}

#[derive(Debug, Deserialize)]
struct FailRequest {
    error: String,
}

async fn open_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<OpenStreamRequest>,
) -> ApiResult<impl IntoResponse> {
    let handle = state.registry.stream_open(&id, req.operation)?;
    let body = json!({ "stream_id": handle.id(), "operation": handle.operation() });
    Ok((StatusCode::CREATED, Json(body)))
}

/// Streams of the session that are still open or paused.
async fn list_streams(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let streams = state.registry.active_streams(&id)?;
    Ok(Json(json!({ "session_id": id, "streams": streams })))
}

async fn stream_status(
    State(state): State<AppState>,
    Path((id, stream_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.stream_status(&id, &stream_id)?))
}

async fn emit(
    State(state): State<AppState>,
    Path((id, stream_id)): Path<(String, String)>,
    Json(req): Json<EmitRequest>,
) -> ApiResult<Json<Value>> {
    let sequence = state.registry.stream_emit(&id, &stream_id, &req.payload, req.replace)?;
    Ok(Json(json!({ "sequence": sequence })))
}

async fn complete(
    State(state): State<AppState>,
    Path((id, stream_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let sequence = state.registry.stream_complete(&id, &stream_id)?;
    Ok(Json(json!({ "sequence": sequence })))
}

async fn fail(
    State(state): State<AppState>,
    Path((id, stream_id)): Path<(String, String)>,
    Json(req): Json<FailRequest>,
) -> ApiResult<Json<Value>> {
    let sequence = state.registry.stream_fail(&id, &stream_id, &req.error)?;
    Ok(Json(json!({ "sequence": sequence })))
}

async fn cancel(
    State(state): State<AppState>,
    Path((id, stream_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let sequence = state.registry.stream_cancel(&id, &stream_id)?;
    Ok(Json(json!({ "sequence": sequence })))
}

async fn pause(
    State(state): State<AppState>,
    Path((id, stream_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let changed = state.registry.stream_pause(&id, &stream_id)?;
    Ok(Json(json!({ "stream_id": stream_id, "status": "paused", "changed": changed })))
}

async fn resume(
    State(state): State<AppState>,
    Path((id, stream_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let changed = state.registry.stream_resume(&id, &stream_id)?;
    Ok(Json(json!({ "stream_id": stream_id, "status": "open", "changed": changed })))
}

/// GET .../events
///
/// Server-sent events, one `data: {json}` frame per stream event. A client
/// connecting mid-stream first gets the cumulative output as a replace frame.
/// The connection ends after the terminal frame, or with an error frame if
/// nothing arrives within the subscribe timeout.
async fn events(
    State(state): State<AppState>,
    Path((id, stream_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let session = state.registry.resolve(&id)?;
    let handle = session.streams().handle(&stream_id)?;
    let subscription = handle.subscribe();
    debug!(session_id = %id, stream_id = %stream_id, "Starting SSE stream");

    let frames = frame_stream(subscription, handle, state.subscribe_timeout)
        .map(|frame| Event::default().json_data(frame));
    let keep_alive = KeepAlive::new().interval(state.keep_alive).text("keep-alive");
    Ok(Sse::new(frames).keep_alive(keep_alive).into_response())
}

fn frame_stream(
    subscription: Subscription,
    handle: StreamHandle,
    timeout: std::time::Duration,
) -> impl futures::Stream<Item = WireFrame> + Send {
    futures::stream::unfold(Some(subscription), move |subscription| {
        let handle = handle.clone();
        async move {
            let subscription = subscription?;
            match subscription.next_timeout(timeout).await {
                Ok(Some(event)) => {
                    let mut frame = WireFrame::from(&event);
                    if event.terminal {
                        frame = frame.with_tokens_per_second(handle.info().tokens_per_second);
                        return Some((frame, None));
                    }
                    Some((frame, Some(subscription)))
                }
                Ok(None) => None,
                Err(e) => {
                    let frame = WireFrame {
                        sequence: handle.info().sequence,
                        response: String::new(),
                        replace: false,
                        status: Some(FrameStatus::Error),
                        error: Some(e.to_string()),
                        tokens_per_second: None,
                    };
                    Some((frame, None))
                }
            }
        }
    })
}
