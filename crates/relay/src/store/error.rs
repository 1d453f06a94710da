//! Thread store errors.

use thiserror::Error;

use crate::engine::EngineError;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors shared by every [`super::ThreadStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("thread with id '{0}' not found")]
    ThreadNotFound(String),

    #[error("run with id '{0}' not found")]
    RunNotFound(String),

    #[error("thread with id '{0}' already exists")]
    AlreadyExists(String),

    #[error("thread '{0}' is busy")]
    Busy(String),

    #[error("thread '{0}' has no graph_id in its metadata")]
    MissingGraph(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be turned back into a record.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ThreadNotFound(_)
                | Self::RunNotFound(_)
                | Self::MissingGraph(_)
                | Self::Engine(EngineError::GraphNotFound(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(StoreError::ThreadNotFound("t".into()).is_not_found());
        assert!(StoreError::Engine(EngineError::GraphNotFound("g".into())).is_not_found());
        assert!(!StoreError::Busy("t".into()).is_not_found());
        assert_eq!(
            StoreError::AlreadyExists("t1".into()).to_string(),
            "thread with id 't1' already exists"
        );
    }
}
