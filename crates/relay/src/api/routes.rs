//! API route definitions.

use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    // Tracing layer with request IDs and timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/queues", get(handlers::list_queues))
        // Assistants
        .route("/assistants/search", post(handlers::search_assistants))
        .route(
            "/assistants/{assistant_id}/graph",
            get(handlers::get_assistant_graph),
        )
        // Threads
        .route("/threads", post(handlers::create_thread))
        .route("/threads/search", post(handlers::search_threads))
        .route(
            "/threads/{thread_id}",
            get(handlers::get_thread).delete(handlers::delete_thread),
        )
        .route(
            "/threads/{thread_id}/state",
            post(handlers::update_thread_state),
        )
        // Runs
        .route("/threads/{thread_id}/runs", get(handlers::list_runs))
        .route(
            "/threads/{thread_id}/runs/stream",
            post(handlers::stream_run),
        )
        .route(
            "/threads/{thread_id}/runs/{run_id}/stream",
            get(handlers::join_run_stream),
        )
        .route(
            "/threads/{thread_id}/runs/{run_id}/cancel",
            post(handlers::cancel_run),
        )
        .fallback(handlers::not_found)
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

/// Build CORS layer from configured origins. No origins means any origin.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::DELETE,
        Method::OPTIONS,
    ];

    let headers = [
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        HeaderName::from_static("last-event-id"),
    ];

    let exposed = [
        header::CONTENT_LOCATION,
        HeaderName::from_static(handlers::PAGINATION_TOTAL),
    ];

    if state.cors_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers)
            .expose_headers(exposed);
    }

    let origins: Vec<HeaderValue> = state
        .cors_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        tracing::error!("CORS: All configured origins are invalid!");
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers(exposed)
}
