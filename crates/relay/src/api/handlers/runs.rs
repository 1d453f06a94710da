use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::IntoResponse,
};
use relay_protocol::{CancelAction, Run, RunListQuery, RunStreamPayload, StreamMode};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::api::error::ApiResult;
use crate::api::extract::{ValidJson, ValidQuery};
use crate::api::sse::run_sse;
use crate::api::state::AppState;

/// Query of `GET /threads/{thread_id}/runs/{run_id}/stream`.
#[derive(Debug, Default, Deserialize)]
pub struct JoinQuery {
    #[serde(default)]
    pub last_event_id: Option<String>,
    #[serde(default)]
    pub cancel_on_disconnect: bool,
    #[serde(default)]
    pub stream_mode: Option<StreamMode>,
}

/// Query of `POST /threads/{thread_id}/runs/{run_id}/cancel`.
#[derive(Debug, Default, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub action: CancelAction,
}

/// Start a run and stream its events.
#[instrument(skip(state, payload))]
pub async fn stream_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    ValidJson(payload): ValidJson<RunStreamPayload>,
) -> ApiResult<impl IntoResponse> {
    let assistant_id = payload.assistant_id.clone();
    let (run, stream) = state.runs.start_stream(&thread_id, payload).await?;
    let mut headers = HeaderMap::new();
    let location = format!("/threads/{}/runs/{}", thread_id, run.run_id);
    match HeaderValue::from_str(&location) {
        Ok(value) => {
            headers.insert(header::CONTENT_LOCATION, value);
        }
        Err(e) => warn!(location = %location, "Skipping Content-Location: {}", e),
    }

    info!(run_id = %run.run_id, assistant_id = %assistant_id, "Streaming run");
    Ok((headers, run_sse(stream, state.heartbeat_interval)))
}

/// Attach to a running (or recently finished) run.
///
/// The resume position comes from `last_event_id`, falling back to the
/// `Last-Event-ID` header browsers send on reconnect.
#[instrument(skip(state, headers))]
pub async fn join_run_stream(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    ValidQuery(query): ValidQuery<JoinQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let last_event_id = query.last_event_id.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });

    let stream = state
        .runs
        .join_stream(
            &thread_id,
            &run_id,
            last_event_id.as_deref(),
            query.cancel_on_disconnect,
            query.stream_mode,
        )
        .await?;
    Ok(run_sse(stream, state.heartbeat_interval))
}

/// Runs of a thread, newest first.
#[instrument(skip(state))]
pub async fn list_runs(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    ValidQuery(query): ValidQuery<RunListQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    state.store.get(&thread_id).await?;
    Ok(Json(state.store.list_runs(&thread_id, &query).await?))
}

/// Cancel a run: `204` once it has stopped when `wait=true`, otherwise `202`.
#[instrument(skip(state))]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    ValidQuery(query): ValidQuery<CancelQuery>,
) -> ApiResult<StatusCode> {
    state
        .runs
        .cancel_run(&thread_id, &run_id, query.wait, query.action)
        .await?;
    info!(run_id = %run_id, wait = query.wait, "Cancelled run");
    Ok(if query.wait {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::ACCEPTED
    })
}
