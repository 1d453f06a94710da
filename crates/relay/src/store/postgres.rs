//! PostgreSQL-backed store. JSON columns are `jsonb`, read back as text.

use async_trait::async_trait;
use relay_protocol::{
    IfExists, Run, RunCreate, RunListQuery, RunPatch, RunStatus, Thread, ThreadCreate,
    ThreadPatch, ThreadSearch, ThreadStatus,
};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::rows::{RUN_COLUMNS, RunRow, ThreadRow, format_timestamp, values_text};
use super::{StoreError, StoreResult, ThreadStore, check_limit, new_id, now};

const THREAD_FIELDS: &str = r#"thread_id, created_at, updated_at, metadata::text AS metadata, status, "values"::text AS "values", interrupts::text AS interrupts"#;

const RUN_FIELDS: &str = "run_id, thread_id, assistant_id, created_at, updated_at, status, metadata::text AS metadata, multitask_strategy";

/// [`ThreadStore`] over a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PostgresThreadStore {
    pool: PgPool,
}

impl PostgresThreadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_thread(&self, thread_id: &str) -> StoreResult<Option<Thread>> {
        let row = sqlx::query_as::<_, ThreadRow>(&format!(
            "SELECT {THREAD_FIELDS} FROM threads WHERE thread_id = $1"
        ))
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Thread::try_from).transpose()
    }

    /// One `UPDATE ... RETURNING` over the columns `patch` carries.
    async fn update_thread(
        &self,
        thread_id: &str,
        patch: ThreadPatch,
        unless_busy: bool,
    ) -> StoreResult<Thread> {
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE threads SET updated_at = ");
        builder.push_bind(format_timestamp(now()));
        if let Some(status) = patch.status {
            builder.push(", status = ").push_bind(status.as_str());
        }
        if let Some(metadata) = &patch.metadata {
            builder
                .push(", metadata = ")
                .push_bind(serde_json::to_string(metadata)?)
                .push("::jsonb");
        }
        if patch.values.is_some() {
            builder
                .push(r#", "values" = "#)
                .push_bind(values_text(&patch.values)?)
                .push("::jsonb");
        }
        if let Some(interrupts) = &patch.interrupts {
            builder
                .push(", interrupts = ")
                .push_bind(serde_json::to_string(interrupts)?)
                .push("::jsonb");
        }
        builder.push(" WHERE thread_id = ").push_bind(thread_id);
        if unless_busy {
            builder
                .push(" AND status <> ")
                .push_bind(ThreadStatus::Busy.as_str());
        }
        builder.push(format!(" RETURNING {THREAD_FIELDS}"));

        let row = builder
            .build_query_as::<ThreadRow>()
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return Thread::try_from(row);
        }
        if unless_busy && self.fetch_thread(thread_id).await?.is_some() {
            return Err(StoreError::Busy(thread_id.to_string()));
        }
        Err(StoreError::ThreadNotFound(thread_id.to_string()))
    }

    async fn update_run_where(
        &self,
        run_id: &str,
        patch: RunPatch,
        unfinished_only: bool,
    ) -> StoreResult<Run> {
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE runs SET updated_at = ");
        builder.push_bind(format_timestamp(now()));
        if let Some(status) = patch.status {
            builder.push(", status = ").push_bind(status.as_str());
        }
        if let Some(metadata) = &patch.metadata {
            builder
                .push(", metadata = ")
                .push_bind(serde_json::to_string(metadata)?)
                .push("::jsonb");
        }
        builder.push(" WHERE run_id = ").push_bind(run_id);
        if unfinished_only {
            builder
                .push(" AND status IN (")
                .push_bind(RunStatus::Pending.as_str())
                .push(", ")
                .push_bind(RunStatus::Running.as_str())
                .push(")");
        }
        builder.push(format!(" RETURNING {RUN_FIELDS}"));

        let row = builder
            .build_query_as::<RunRow>()
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Run::try_from(row),
            // Missing, or already finished and left alone.
            None => self.get_run(run_id).await,
        }
    }
}

fn push_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    query: &ThreadSearch,
) -> StoreResult<()> {
    builder.push(" WHERE 1 = 1");
    if let Some(status) = query.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(metadata) = &query.metadata {
        for (key, value) in metadata {
            // jsonb `=` equates 1 with 1.0; the canonical text keeps them apart.
            builder
                .push(" AND (metadata -> ")
                .push_bind(key.clone())
                .push(")::text = (")
                .push_bind(serde_json::to_string(value)?)
                .push("::jsonb)::text");
        }
    }
    Ok(())
}

fn push_page(builder: &mut QueryBuilder<'_, Postgres>, limit: Option<u32>, offset: Option<u32>) {
    if let Some(limit) = limit {
        builder.push(" LIMIT ").push_bind(i64::from(limit));
    }
    if let Some(offset) = offset {
        builder.push(" OFFSET ").push_bind(i64::from(offset));
    }
}

#[async_trait]
impl ThreadStore for PostgresThreadStore {
    async fn setup(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations/postgres")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    async fn create(&self, input: ThreadCreate) -> StoreResult<Thread> {
        let thread_id = input.thread_id.unwrap_or_else(new_id);
        let thread = Thread::new(thread_id, input.metadata.unwrap_or_default(), now());

        let inserted = sqlx::query(
            r#"
            INSERT INTO threads (thread_id, created_at, updated_at, metadata, status, "values", interrupts)
            VALUES ($1, $2, $3, $4::jsonb, $5, NULL, $6::jsonb)
            ON CONFLICT (thread_id) DO NOTHING
            "#,
        )
        .bind(&thread.thread_id)
        .bind(format_timestamp(thread.created_at))
        .bind(format_timestamp(thread.updated_at))
        .bind(serde_json::to_string(&thread.metadata)?)
        .bind(thread.status.as_str())
        .bind(serde_json::to_string(&thread.interrupts)?)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(thread);
        }
        match input.if_exists.unwrap_or_default() {
            IfExists::Raise => Err(StoreError::AlreadyExists(thread.thread_id)),
            IfExists::DoNothing => self.get(&thread.thread_id).await,
        }
    }

    async fn get(&self, thread_id: &str) -> StoreResult<Thread> {
        self.fetch_thread(thread_id)
            .await?
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))
    }

    async fn search(&self, query: &ThreadSearch) -> StoreResult<Vec<Thread>> {
        check_limit(query.limit)?;
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {THREAD_FIELDS} FROM threads"));
        push_filters(&mut builder, query)?;

        let column = query.sort_by.unwrap_or_default().as_str();
        let order = query.sort_order.unwrap_or_default().as_str();
        builder.push(format!(" ORDER BY {column} {order}, thread_id {order}"));
        push_page(&mut builder, query.limit, query.offset);

        let rows = builder
            .build_query_as::<ThreadRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Thread::try_from).collect()
    }

    async fn count(&self, query: &ThreadSearch) -> StoreResult<u64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM threads");
        push_filters(&mut builder, query)?;
        let (count,): (i64,) = builder.build_query_as().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn set(&self, thread_id: &str, patch: ThreadPatch) -> StoreResult<Thread> {
        self.update_thread(thread_id, patch, false).await
    }

    async fn set_unless_busy(&self, thread_id: &str, patch: ThreadPatch) -> StoreResult<Thread> {
        self.update_thread(thread_id, patch, true).await
    }

    async fn delete(&self, thread_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM runs WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM threads WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        input: RunCreate,
    ) -> StoreResult<Run> {
        if self.fetch_thread(thread_id).await?.is_none() {
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
            metadata: input.metadata.unwrap_or_default(),
            multitask_strategy: input.multitask_strategy.unwrap_or_default(),
        };

        sqlx::query(&format!(
            "INSERT INTO runs ({RUN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb, $8)"
        ))
        .bind(&run.run_id)
        .bind(&run.thread_id)
        .bind(&run.assistant_id)
        .bind(format_timestamp(run.created_at))
        .bind(format_timestamp(run.updated_at))
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.metadata)?)
        .bind(run.multitask_strategy.as_str())
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Run> {
        let row = sqlx::query_as::<_, RunRow>(&format!("SELECT {RUN_FIELDS} FROM runs WHERE run_id = $1"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        Run::try_from(row)
    }

    async fn list_runs(&self, thread_id: &str, query: &RunListQuery) -> StoreResult<Vec<Run>> {
        check_limit(query.limit)?;
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {RUN_FIELDS} FROM runs WHERE thread_id = "));
        builder.push_bind(thread_id);
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder.push(" ORDER BY created_at DESC, run_id DESC");
        push_page(&mut builder, query.limit, query.offset);

        let rows = builder
            .build_query_as::<RunRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Run::try_from).collect()
    }

    async fn update_run(&self, run_id: &str, patch: RunPatch) -> StoreResult<Run> {
        self.update_run_where(run_id, patch, false).await
    }

    async fn update_unfinished_run(&self, run_id: &str, patch: RunPatch) -> StoreResult<Run> {
        self.update_run_where(run_id, patch, true).await
    }
}
