use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use relay_protocol::{RunConfig, Thread, ThreadCreate, ThreadSearch};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

use super::total_header;
use crate::api::error::ApiResult;
use crate::api::extract::ValidJson;
use crate::api::state::AppState;

/// Body of `POST /threads/{thread_id}/state`.
#[derive(Debug, Deserialize)]
pub struct ThreadStateUpdate {
    pub values: Value,
}

/// Create a thread.
#[instrument(skip(state))]
pub async fn create_thread(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<ThreadCreate>,
) -> ApiResult<Json<Thread>> {
    let thread = state.store.create(payload).await?;
    info!(thread_id = %thread.thread_id, "Created thread");
    Ok(Json(thread))
}

/// Search threads. `X-Pagination-Total` carries the unpaginated match count.
#[instrument(skip(state))]
pub async fn search_threads(
    State(state): State<AppState>,
    ValidJson(query): ValidJson<ThreadSearch>,
) -> ApiResult<impl IntoResponse> {
    let threads = state.store.search(&query).await?;
    let total = state.store.count(&query).await?;
    Ok((total_header(total as usize), Json(threads)))
}

#[instrument(skip(state))]
pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<Thread>> {
    Ok(Json(state.store.get(&thread_id).await?))
}

/// Delete a thread and its runs.
#[instrument(skip(state))]
pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete(&thread_id).await?;
    info!(thread_id = %thread_id, "Deleted thread");
    Ok(StatusCode::NO_CONTENT)
}

/// Write values into the thread's graph state.
#[instrument(skip(state, payload))]
pub async fn update_thread_state(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    ValidJson(payload): ValidJson<ThreadStateUpdate>,
) -> ApiResult<Json<RunConfig>> {
    let config = state
        .store
        .update_state(&state.graphs, &thread_id, payload.values)
        .await?;
    Ok(Json(config))
}
