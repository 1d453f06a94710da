use thiserror::Error;

use crate::engine::EngineError;
use crate::queue::QueueError;
use crate::store::StoreError;

pub type RunResult<T> = Result<T, RunError>;

/// Errors raised while starting, streaming or cancelling a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("run '{run_id}' not found in thread '{thread_id}'")]
    NotInThread { run_id: String, thread_id: String },
}

impl RunError {
    /// Error class reported in a `__stream_error__` event.
    pub fn event_name(&self) -> &str {
        match self {
            Self::Engine(e) => e.name(),
            Self::Store(_) => "StoreError",
            Self::Queue(_) => "QueueError",
            Self::NotInThread { .. } => "NotFoundError",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Engine(EngineError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_uses_engine_class() {
        let err = RunError::from(EngineError::execution("ValueError", "bad input"));
        assert_eq!(err.event_name(), "ValueError");
        assert_eq!(err.to_string(), "bad input");
        assert!(RunError::from(EngineError::Cancelled).is_cancelled());
    }
}
