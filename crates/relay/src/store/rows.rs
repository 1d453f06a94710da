//! Row shapes shared by the SQL backends.
//!
//! Both backends select JSON columns as text and timestamps as fixed-width
//! RFC 3339 strings, so one set of row structs decodes either database.

use chrono::{DateTime, SecondsFormat, Utc};
use relay_protocol::{Metadata, Run, Thread};
use serde_json::Value;
use sqlx::FromRow;

use super::{StoreError, StoreResult};

pub(crate) const THREAD_COLUMNS: &str =
    r#"thread_id, created_at, updated_at, metadata, status, "values", interrupts"#;

pub(crate) const RUN_COLUMNS: &str = "run_id, thread_id, assistant_id, created_at, updated_at, status, metadata, multitask_strategy";

#[derive(Debug, FromRow)]
pub(crate) struct ThreadRow {
    pub thread_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub metadata: String,
    pub status: String,
    pub values: Option<String>,
    pub interrupts: String,
}

impl TryFrom<ThreadRow> for Thread {
    type Error = StoreError;

    fn try_from(row: ThreadRow) -> StoreResult<Self> {
        Ok(Thread {
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            metadata: parse_object(&row.metadata)?,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            values: row
                .values
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?
                .filter(|values| !values.is_null()),
            interrupts: parse_object(&row.interrupts)?,
            thread_id: row.thread_id,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct RunRow {
    pub run_id: String,
    pub thread_id: String,
    pub assistant_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub status: String,
    pub metadata: String,
    pub multitask_strategy: String,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> StoreResult<Self> {
        Ok(Run {
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            metadata: parse_object(&row.metadata)?,
            multitask_strategy: row.multitask_strategy.parse().map_err(StoreError::Corrupt)?,
            run_id: row.run_id,
            thread_id: row.thread_id,
            assistant_id: row.assistant_id,
        })
    }
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{text}': {e}")))
}

fn parse_object(text: &str) -> StoreResult<Metadata> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Metadata::new()),
        other => Err(StoreError::Corrupt(format!("expected JSON object, got {other}"))),
    }
}

/// JSON text for an optional snapshot; `None` and JSON null both store SQL NULL.
pub(crate) fn values_text(values: &Option<Value>) -> StoreResult<Option<String>> {
    match values {
        Some(Value::Null) | None => Ok(None),
        Some(values) => Ok(Some(serde_json::to_string(values)?)),
    }
}
