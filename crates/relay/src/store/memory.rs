//! Process-local store. Nothing survives a restart.

use std::cmp::Ordering;

use async_trait::async_trait;
use relay_protocol::{
    IfExists, Metadata, Run, RunCreate, RunListQuery, RunPatch, RunStatus, SortOrder, Thread,
    ThreadCreate, ThreadPatch, ThreadSearch, ThreadSortBy, ThreadStatus,
};
use tokio::sync::RwLock;

use super::{StoreError, StoreResult, ThreadStore, check_limit, new_id, now};

#[derive(Default)]
struct Tables {
    /// Insertion order.
    threads: Vec<Thread>,
    runs: Vec<Run>,
}

/// In-memory [`ThreadStore`].
#[derive(Default)]
pub struct MemoryThreadStore {
    tables: RwLock<Tables>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn patch_thread(
        &self,
        thread_id: &str,
        patch: ThreadPatch,
        unless_busy: bool,
    ) -> StoreResult<Thread> {
        let mut tables = self.tables.write().await;
        let thread = tables
            .threads
            .iter_mut()
            .find(|t| t.thread_id == thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        if unless_busy && thread.status == ThreadStatus::Busy {
            return Err(StoreError::Busy(thread_id.to_string()));
        }
        thread.apply(patch, now());
        Ok(thread.clone())
    }

    async fn patch_run(
        &self,
        run_id: &str,
        patch: RunPatch,
        unfinished_only: bool,
    ) -> StoreResult<Run> {
        let mut tables = self.tables.write().await;
        let run = tables
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        if !(unfinished_only && run.status.is_finished()) {
            run.apply(patch, now());
        }
        Ok(run.clone())
    }
}

fn matches_search(thread: &Thread, query: &ThreadSearch) -> bool {
    if query.status.is_some_and(|status| thread.status != status) {
        return false;
    }
    match &query.metadata {
        Some(filter) => filter
            .iter()
            .all(|(key, value)| thread.metadata.get(key) == Some(value)),
        None => true,
    }
}

fn compare(a: &Thread, b: &Thread, sort_by: ThreadSortBy) -> Ordering {
    let primary = match sort_by {
        ThreadSortBy::ThreadId => Ordering::Equal,
        ThreadSortBy::Status => a.status.as_str().cmp(b.status.as_str()),
        ThreadSortBy::CreatedAt => a.created_at.cmp(&b.created_at),
        ThreadSortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
    };
    primary.then_with(|| a.thread_id.cmp(&b.thread_id))
}

fn page<T>(items: Vec<T>, offset: Option<u32>, limit: Option<u32>) -> Vec<T> {
    let offset = offset.unwrap_or(0) as usize;
    let limit = limit.map_or(usize::MAX, |limit| limit as usize);
    items.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn create(&self, input: ThreadCreate) -> StoreResult<Thread> {
        let mut tables = self.tables.write().await;
        let thread_id = input.thread_id.unwrap_or_else(new_id);

        if let Some(existing) = tables.threads.iter().find(|t| t.thread_id == thread_id) {
            return match input.if_exists.unwrap_or_default() {
                IfExists::Raise => Err(StoreError::AlreadyExists(thread_id)),
                IfExists::DoNothing => Ok(existing.clone()),
            };
        }

        let thread = Thread::new(thread_id, input.metadata.unwrap_or_default(), now());
        tables.threads.push(thread.clone());
        Ok(thread)
    }

    async fn get(&self, thread_id: &str) -> StoreResult<Thread> {
        self.tables
            .read()
            .await
            .threads
            .iter()
            .find(|t| t.thread_id == thread_id)
            .cloned()
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))
    }

    async fn search(&self, query: &ThreadSearch) -> StoreResult<Vec<Thread>> {
        check_limit(query.limit)?;
        let tables = self.tables.read().await;
        let mut found: Vec<Thread> = tables
            .threads
            .iter()
            .filter(|t| matches_search(t, query))
            .cloned()
            .collect();

        let sort_by = query.sort_by.unwrap_or_default();
        match query.sort_order.unwrap_or_default() {
            SortOrder::Asc => found.sort_by(|a, b| compare(a, b, sort_by)),
            SortOrder::Desc => found.sort_by(|a, b| compare(b, a, sort_by)),
        }
        Ok(page(found, query.offset, query.limit))
    }

    async fn count(&self, query: &ThreadSearch) -> StoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .threads
            .iter()
            .filter(|t| matches_search(t, query))
            .count() as u64)
    }

    async fn set(&self, thread_id: &str, patch: ThreadPatch) -> StoreResult<Thread> {
        self.patch_thread(thread_id, patch, false).await
    }

    async fn set_unless_busy(&self, thread_id: &str, patch: ThreadPatch) -> StoreResult<Thread> {
        self.patch_thread(thread_id, patch, true).await
    }

    async fn delete(&self, thread_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let before = tables.threads.len();
        tables.threads.retain(|t| t.thread_id != thread_id);
        if tables.threads.len() == before {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }
        tables.runs.retain(|r| r.thread_id != thread_id);
        Ok(())
    }

    async fn create_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        input: RunCreate,
    ) -> StoreResult<Run> {
        let mut tables = self.tables.write().await;
        if !tables.threads.iter().any(|t| t.thread_id == thread_id) {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }

        let at = now();
        let run = Run {
            run_id: new_id(),
            thread_id: thread_id.to_string(),
            assistant_id: assistant_id.to_string(),
            created_at: at,
            updated_at: at,
            status: RunStatus::Pending,
            metadata: input.metadata.unwrap_or_else(Metadata::new),
            multitask_strategy: input.multitask_strategy.unwrap_or_default(),
        };
        tables.runs.push(run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Run> {
        self.tables
            .read()
            .await
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    async fn list_runs(&self, thread_id: &str, query: &RunListQuery) -> StoreResult<Vec<Run>> {
        check_limit(query.limit)?;
        let tables = self.tables.read().await;
        let mut runs: Vec<Run> = tables
            .runs
            .iter()
            .filter(|r| r.thread_id == thread_id)
            .filter(|r| query.status.is_none_or(|status| r.status == status))
            .cloned()
            .collect();
        // Newest first; reverse insertion order breaks timestamp ties.
        runs.reverse();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(runs, query.offset, query.limit))
    }

    async fn update_run(&self, run_id: &str, patch: RunPatch) -> StoreResult<Run> {
        self.patch_run(run_id, patch, false).await
    }

    async fn update_unfinished_run(&self, run_id: &str, patch: RunPatch) -> StoreResult<Run> {
        self.patch_run(run_id, patch, true).await
    }
}
