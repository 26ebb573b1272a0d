//! HTTP route handlers.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;
use watira_core::events::StreamEvent;
use watira_core::SessionId;
use watira_engine::{Fingerprint, TurnInput};
use watira_telemetry::LogQuery;

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub title: String,
}

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 200;

/// Health check.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.orchestrator.sessions();
    match sessions.list(1, 0) {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "activeRuns": state.runs.count(),
                "cachedArtifacts": state.cache.len(),
                "model": state.orchestrator.model_health(),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unhealthy", "error": e.to_string() })),
        ),
    }
}

/// Start a turn and stream its events as SSE.
///
/// The turn runs in its own task. Closing the connection drops the receiver,
/// which cancels the turn.
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err(ApiError::BadRequest("empty message".into()));
    }

    let cancel = CancellationToken::new();
    let (session_id, created, guard) = {
        let _admission = state.runs.admission();
        let (session_id, created) = state
            .orchestrator
            .open_session(req.session_id.as_ref(), &message)?;
        let guard = state.runs.start(session_id.clone(), cancel.clone());
        (session_id, created, guard)
    };

    let (tx, rx) = mpsc::channel::<StreamEvent>(state.config.event_buffer);
    let input = TurnInput {
        session_id: session_id.clone(),
        created,
        run_id: guard.run_id().clone(),
        message,
    };
    info!(session_id = %session_id, run_id = %input.run_id, created, "chat turn started");

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let _guard = guard;
        orchestrator.run_turn(input, tx, cancel).await;
    });

    let stream = ReceiverStream::new(rx)
        .map(|event| Event::default().event(event.event_type()).json_data(&event));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new().interval(Duration::from_secs(state.config.keep_alive_secs)),
    ))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let offset = params.offset.unwrap_or(0);
    let conversations = state.orchestrator.sessions().list(limit, offset)?;
    Ok(Json(serde_json::json!({ "conversations": conversations })))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.orchestrator.sessions().load(&id)?;
    Ok(Json(session))
}

pub async fn rename_conversation(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(req): Json<RenameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("empty title".into()));
    }
    let sessions = state.orchestrator.sessions();
    sessions.rename(&id, title)?;
    Ok(Json(sessions.get(&id)?))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    {
        let _admission = state.runs.admission();
        if state.runs.is_active(&id) {
            return Err(ApiError::Conflict("conversation has a turn in progress".into()));
        }
        state.orchestrator.sessions().delete(&id)?;
    }
    info!(session_id = %id, "conversation deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn abort_conversation(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    let aborted = state.runs.abort_session(&id);
    if aborted == 0 {
        // distinguish an idle conversation from an unknown one
        state.orchestrator.sessions().get(&id)?;
    }
    info!(session_id = %id, aborted, "abort requested");
    Ok(Json(serde_json::json!({ "aborted": aborted })))
}

/// Serve cached artifact bytes. Artifacts are immutable per fingerprint.
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Response, ApiError> {
    let fp = Fingerprint::parse(&raw)
        .ok_or_else(|| ApiError::BadRequest("malformed fingerprint".into()))?;
    let artifact = state
        .cache
        .get(&fp)
        .ok_or_else(|| ApiError::NotFound(format!("artifact not found: {fp}")))?;

    Ok((
        [
            (header::CONTENT_TYPE, artifact.mime_type.clone()),
            (header::CACHE_CONTROL, "public, max-age=31536000, immutable".to_string()),
        ],
        artifact.bytes.clone(),
    )
        .into_response())
}

/// Persisted warnings and errors, newest first. Filters: `level`,
/// `session_id`, `run_id`, `since`, `limit`.
pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let sink = state
        .logs
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("log persistence is disabled".into()))?;
    let logs = sink
        .query(&query)
        .map_err(|e| ApiError::Internal(format!("log query failed: {e}")))?;
    Ok(Json(serde_json::json!({ "logs": logs })))
}

/// Fallback for unknown routes.
pub async fn not_found() -> Result<(), ApiError> {
    Err(ApiError::NotFound("no such route".into()))
}
