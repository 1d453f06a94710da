//! Thread and run persistence.
//!
//! All backends implement [`ThreadStore`] with identical error kinds and
//! filter semantics, so the orchestrator and HTTP layer never know which one
//! is in use. The backend is picked once at startup by [`create_store`].

mod error;
mod memory;
mod postgres;
mod rows;
mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_protocol::{
    MAX_SEARCH_LIMIT, Run, RunConfig, RunCreate, RunListQuery, RunPatch, Thread, ThreadCreate,
    ThreadPatch, ThreadSearch, ThreadStatus,
};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::db::{PostgresDatabase, SqliteDatabase};
use crate::engine::GraphRegistry;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryThreadStore;
pub use postgres::PostgresThreadStore;
pub use sqlite::SqliteThreadStore;

/// Persistence contract for threads and their runs.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Create the schema. Idempotent.
    async fn setup(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Create a thread, generating an id when none is given.
    ///
    /// An existing id is an error only with `if_exists = raise`; otherwise the
    /// stored thread is returned unchanged.
    async fn create(&self, input: ThreadCreate) -> StoreResult<Thread>;

    async fn get(&self, thread_id: &str) -> StoreResult<Thread>;

    async fn search(&self, query: &ThreadSearch) -> StoreResult<Vec<Thread>>;

    /// Number of threads matching the filters of `query`, ignoring pagination.
    async fn count(&self, query: &ThreadSearch) -> StoreResult<u64>;

    /// Write the fields carried by `patch`; other columns are left as stored.
    async fn set(&self, thread_id: &str, patch: ThreadPatch) -> StoreResult<Thread>;

    /// Like [`set`](Self::set), but fails with [`StoreError::Busy`] while a
    /// run holds the thread. The status check and the write are one step.
    async fn set_unless_busy(&self, thread_id: &str, patch: ThreadPatch) -> StoreResult<Thread>;

    /// Delete a thread and all of its runs.
    async fn delete(&self, thread_id: &str) -> StoreResult<()>;

    /// Write `values` into the thread's graph state and persist the snapshot.
    ///
    /// Fails with [`StoreError::Busy`] while a run holds the thread; nothing
    /// is written in that case.
    async fn update_state(
        &self,
        graphs: &GraphRegistry,
        thread_id: &str,
        values: Value,
    ) -> StoreResult<RunConfig> {
        let thread = self.get(thread_id).await?;
        if thread.status == ThreadStatus::Busy {
            return Err(StoreError::Busy(thread_id.to_string()));
        }
        let graph_id = thread
            .graph_id()
            .ok_or_else(|| StoreError::MissingGraph(thread_id.to_string()))?
            .to_string();
        let graph = graphs.get(&graph_id)?;

        let config = thread_config(thread_id, &graph_id);
        let next = graph.update_state(&config, values).await?;
        let snapshot = graph.get_state(&next).await?;
        self.set_unless_busy(thread_id, ThreadPatch::values(snapshot.values))
            .await?;

        Ok(RunConfig {
            configurable: next.configurable,
            ..Default::default()
        })
    }

    async fn create_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        input: RunCreate,
    ) -> StoreResult<Run>;

    async fn get_run(&self, run_id: &str) -> StoreResult<Run>;

    /// Runs of one thread, newest first.
    async fn list_runs(&self, thread_id: &str, query: &RunListQuery) -> StoreResult<Vec<Run>>;

    async fn update_run(&self, run_id: &str, patch: RunPatch) -> StoreResult<Run>;

    /// Apply `patch` only while the run is pending or running.
    ///
    /// A finished run is returned as stored.
    async fn update_unfinished_run(&self, run_id: &str, patch: RunPatch) -> StoreResult<Run>;
}

/// Which backend to build.
#[derive(Debug, Clone, Default)]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
        max_connections: u32,
    },
    Postgres {
        url: String,
        max_connections: u32,
    },
}

/// Build the configured store and apply its schema.
pub async fn create_store(config: StoreConfig) -> Result<Arc<dyn ThreadStore>> {
    let store: Arc<dyn ThreadStore> = match config {
        StoreConfig::Memory => Arc::new(MemoryThreadStore::new()),
        StoreConfig::Sqlite {
            path,
            max_connections,
        } => {
            let db = SqliteDatabase::new(&path, max_connections).await?;
            Arc::new(SqliteThreadStore::new(db.pool().clone()))
        }
        StoreConfig::Postgres {
            url,
            max_connections,
        } => {
            let db = PostgresDatabase::connect(&url, max_connections).await?;
            Arc::new(PostgresThreadStore::new(db.pool().clone()))
        }
    };
    store.setup().await?;
    Ok(store)
}

/// Base config addressing a thread's state in its graph.
pub fn thread_config(thread_id: &str, graph_id: &str) -> RunConfig {
    let mut config = RunConfig::default();
    config
        .configurable
        .insert("thread_id".into(), json!(thread_id));
    config.configurable.insert("graph_id".into(), json!(graph_id));
    config
}

/// Current time truncated to the microsecond precision every backend stores.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Reject out-of-range pagination before touching a backend.
pub(crate) fn check_limit(limit: Option<u32>) -> StoreResult<()> {
    match limit {
        Some(limit) if limit == 0 || limit > MAX_SEARCH_LIMIT => Err(StoreError::InvalidArgument(
            format!("limit must be between 1 and {MAX_SEARCH_LIMIT}"),
        )),
        _ => Ok(()),
    }
}
