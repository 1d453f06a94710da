//! HTTP API module.
//!
//! Thread, run and assistant endpoints plus SSE run streams.

mod error;
mod extract;
mod handlers;
mod routes;
mod sse;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::PAGINATION_TOTAL;
pub use routes::create_router;
pub use sse::{run_sse, to_event};
pub use state::{AppState, DEFAULT_HEARTBEAT_INTERVAL};
