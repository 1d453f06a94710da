//! HTTP request handlers.

mod assistants;
mod runs;
mod threads;

use axum::{Json, extract::State, http::HeaderValue};
use serde::Serialize;

use crate::queue::QueueSnapshot;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

pub use assistants::{get_assistant_graph, search_assistants};
pub use runs::{cancel_run, join_run_stream, list_runs, stream_run};
pub use threads::{create_thread, delete_thread, get_thread, search_threads, update_thread_state};

/// Total number of matches, independent of pagination.
pub const PAGINATION_TOTAL: &str = "x-pagination-total";

fn total_header(total: usize) -> [(&'static str, HeaderValue); 1] {
    [(PAGINATION_TOTAL, HeaderValue::from(total))]
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Buffered contents of every live run queue.
pub async fn list_queues(State(state): State<AppState>) -> ApiResult<Json<Vec<QueueSnapshot>>> {
    Ok(Json(state.queues.all_queues_data().await?))
}

/// JSON 404 for unknown routes.
pub async fn not_found() -> ApiError {
    ApiError::not_found("no route matches this path")
}
