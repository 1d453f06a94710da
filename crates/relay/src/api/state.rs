//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::GraphRegistry;
use crate::queue::QueueManager;
use crate::runs::RunService;
use crate::store::ThreadStore;

/// Idle time after which an SSE stream sends a `ping` frame.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1500);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ThreadStore>,
    pub queues: Arc<QueueManager>,
    pub graphs: Arc<GraphRegistry>,
    pub runs: Arc<RunService>,
    pub heartbeat_interval: Duration,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl AppState {
    /// Wire the run service over the given store, queues and graphs.
    pub fn new(
        store: Arc<dyn ThreadStore>,
        queues: Arc<QueueManager>,
        graphs: Arc<GraphRegistry>,
    ) -> Self {
        let runs = Arc::new(RunService::new(
            Arc::clone(&store),
            Arc::clone(&queues),
            Arc::clone(&graphs),
        ));
        Self {
            store,
            queues,
            graphs,
            runs,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            cors_origins: Vec::new(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }
}
