//! Recorder control endpoints.
//!
//! Provides HTTP endpoints for:
//! - Listing recorders (GET /recorders)
//! - Starting a recorder for a room (POST /recorders)
//! - Inspecting one recorder (GET /recorders/{id})
//! - Stopping a recorder (DELETE /recorders/{id})
//! - Restarting a recorder in place (POST /recorders/{id}/restart)

use crate::api::error::{ApiError, ApiResult};
use crate::live::{LiveRoom, RoomId, StaticRoom};
use crate::recorders::{Manager, RecorderError, RecorderState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct RecordersState {
    pub manager: Arc<Manager>,
}

/// Request body for starting a recorder.
#[derive(Debug, Clone, Deserialize)]
pub struct AddRecorderRequest {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderView {
    pub id: RoomId,
    pub state: RecorderState,
}

/// Creates the recorder router.
pub fn router(state: RecordersState) -> Router {
    Router::new()
        .route("/", get(list_recorders).post(add_recorder))
        .route("/{id}", get(get_recorder).delete(remove_recorder))
        .route("/{id}/restart", post(restart_recorder))
        .with_state(state)
}

/// GET /recorders - List registered recorders.
async fn list_recorders(State(state): State<RecordersState>) -> Json<Vec<RecorderView>> {
    let cx = CancellationToken::new();
    let mut views = Vec::new();

    for id in state.manager.room_ids() {
        // Removed between the snapshot and the lookup
        if let Ok(recorder) = state.manager.get_recorder(&cx, &id).await {
            views.push(RecorderView {
                id,
                state: recorder.state().await,
            });
        }
    }

    Json(views)
}

/// POST /recorders - Start recording a room.
async fn add_recorder(
    State(state): State<RecordersState>,
    Json(request): Json<AddRecorderRequest>,
) -> ApiResult<(StatusCode, Json<RecorderView>)> {
    if request.id.trim().is_empty() || request.url.trim().is_empty() {
        return Err(ApiError::bad_request("Both id and url are required"));
    }

    let mut room = StaticRoom::new(request.id.as_str(), request.url);
    if let Some(name) = request.name {
        room = room.with_name(name);
    }
    let room: Arc<dyn LiveRoom> = Arc::new(room);
    let id = room.id();
    info!("Add recorder requested via API for room {}", id);

    let manager = Arc::clone(&state.manager);
    run_to_completion(async move { manager.add_recorder(&CancellationToken::new(), room).await })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RecorderView {
            id,
            state: RecorderState::Running,
        }),
    ))
}

/// GET /recorders/{id} - Get a single recorder.
async fn get_recorder(
    State(state): State<RecordersState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RecorderView>> {
    let id = RoomId::from(id);
    let recorder = state
        .manager
        .get_recorder(&CancellationToken::new(), &id)
        .await?;

    Ok(Json(RecorderView {
        id,
        state: recorder.state().await,
    }))
}

/// DELETE /recorders/{id} - Stop recording a room.
async fn remove_recorder(
    State(state): State<RecordersState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = RoomId::from(id);
    info!("Remove recorder requested via API for room {}", id);

    let manager = Arc::clone(&state.manager);
    run_to_completion(async move {
        manager
            .remove_recorder(&CancellationToken::new(), &id)
            .await
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /recorders/{id}/restart - Hand the room over to a fresh recorder.
async fn restart_recorder(
    State(state): State<RecordersState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RecorderView>> {
    let id = RoomId::from(id);
    let room = state.manager.get_room(&id)?;
    info!("Restart recorder requested via API for room {}", id);

    let manager = Arc::clone(&state.manager);
    run_to_completion(async move {
        manager
            .restart_recorder(&CancellationToken::new(), room)
            .await
    })
    .await?;

    Ok(Json(RecorderView {
        id,
        state: RecorderState::Running,
    }))
}

/// Drive a registry mutation on its own task so a dropped connection cannot
/// abandon it between `start` and registration.
async fn run_to_completion<F>(operation: F) -> ApiResult<()>
where
    F: Future<Output = Result<(), RecorderError>> + Send + 'static,
{
    tokio::spawn(operation)
        .await
        .map_err(|e| ApiError::internal(format!("Recorder task failed: {e}")))?
        .map_err(ApiError::from)
}
