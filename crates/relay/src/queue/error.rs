//! Queue error types.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur while pushing to or reading from a run queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No queue is registered under the id.
    #[error("queue with id '{0}' does not exist")]
    NotFound(String),

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The networked backend failed.
    #[error("queue backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueueError::NotFound("run-1".to_string());
        assert_eq!(err.to_string(), "queue with id 'run-1' does not exist");
    }
}
