//! # Operator HTTP API
//!
//! Thin wrappers over the session engine. Every mutating route commits the
//! transition, re-reads the room, hands the fresh view to the publisher and
//! returns it to the caller.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lib_common::core::LinkState;
use lib_common::sessions::model::RoomId;
use lib_common::{RoomError, RoomView};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;

use crate::rooms_logic::state::AppState;

/// # API Error
///
/// Wraps a `RoomError` and maps it to an HTTP status and a JSON body of the
/// form `{"errorType": ..., "message": ...}`.
#[derive(Debug)]
pub struct ApiError(pub RoomError);

impl From<RoomError> for ApiError {
    fn from(err: RoomError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RoomError::NotFound(_) => StatusCode::NOT_FOUND,
            RoomError::InvalidState { .. } | RoomError::Conflict(_) => StatusCode::CONFLICT,
            RoomError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RoomError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            RoomError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            warn!(error = %self.0, "Request rejected");
        }
        let body = json!({
            "errorType": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub room_id: RoomId,
    #[serde(default)]
    pub customer_id: Option<i64>,
    pub duration_seconds: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignResponse {
    pub session_id: Uuid,
    pub room: RoomView,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendRequest {
    pub delta_seconds: i64,
}

/// Re-reads the room and broadcasts it.
async fn publish_room(state: &AppState, room_id: RoomId) -> Result<RoomView, ApiError> {
    let view = state.engine.room_view(room_id).await?;
    state.broadcast(&view);
    Ok(view)
}

pub async fn assign_handler(
    State(state): State<AppState>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<AssignResponse> {
    let session_id = state
        .engine
        .assign(req.room_id, req.customer_id, req.duration_seconds)
        .await?;
    let room = publish_room(&state, req.room_id).await?;
    Ok(Json(AssignResponse { session_id, room }))
}

pub async fn pause_handler(State(state): State<AppState>, Path(room_id): Path<RoomId>) -> ApiResult<RoomView> {
    state.engine.pause(room_id).await?;
    Ok(Json(publish_room(&state, room_id).await?))
}

pub async fn resume_handler(State(state): State<AppState>, Path(room_id): Path<RoomId>) -> ApiResult<RoomView> {
    state.engine.resume(room_id).await?;
    Ok(Json(publish_room(&state, room_id).await?))
}

pub async fn cancel_handler(State(state): State<AppState>, Path(room_id): Path<RoomId>) -> ApiResult<RoomView> {
    state.engine.cancel(room_id).await?;
    Ok(Json(publish_room(&state, room_id).await?))
}

pub async fn finalize_handler(State(state): State<AppState>, Path(room_id): Path<RoomId>) -> ApiResult<RoomView> {
    state.engine.finalize(room_id).await?;
    Ok(Json(publish_room(&state, room_id).await?))
}

pub async fn extend_handler(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Json(req): Json<ExtendRequest>,
) -> ApiResult<RoomView> {
    state.engine.extend_or_reduce(room_id, req.delta_seconds).await?;
    Ok(Json(publish_room(&state, room_id).await?))
}

pub async fn room_handler(State(state): State<AppState>, Path(room_id): Path<RoomId>) -> ApiResult<RoomView> {
    Ok(Json(state.engine.room_view(room_id).await?))
}

/// # Health Check Endpoint
///
/// Reports the broker link state and the local fanout load. Always answers
/// 200 while the process is serving.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let broker = match state.link.state() {
        LinkState::Up => "up",
        LinkState::Connecting => "connecting",
        LinkState::Down => "down",
    };
    Json(json!({
        "status": "ok",
        "broker": broker,
        "viewers": state.registry.total_connections(),
        "consumers": state.supervisor.active_consumers().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (RoomError::NotFound("room 1".into()), StatusCode::NOT_FOUND),
            (RoomError::invalid_state(1, "pause", "session is paused"), StatusCode::CONFLICT),
            (RoomError::Conflict(1), StatusCode::CONFLICT),
            (RoomError::InvalidInput("duration".into()), StatusCode::BAD_REQUEST),
            (RoomError::Transport("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (RoomError::Internal("db".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
