use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use relay_protocol::{Assistant, MAX_SEARCH_LIMIT, Metadata};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

use super::total_header;
use crate::api::error::{ApiError, ApiResult};
use crate::api::extract::{ValidJson, ValidQuery};
use crate::api::state::AppState;

/// Body of `POST /assistants/search`.
#[derive(Debug, Default, Deserialize)]
pub struct AssistantSearch {
    #[serde(default)]
    pub graph_id: Option<String>,
    /// Registered graphs carry no metadata, so any non-empty filter matches nothing.
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GraphQuery {
    #[serde(default)]
    pub xray: Option<String>,
}

/// Registered graphs exposed as assistants; the graph id doubles as the assistant id.
fn assistant(graph_id: &str) -> Assistant {
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    Assistant {
        assistant_id: graph_id.to_string(),
        graph_id: graph_id.to_string(),
        name: graph_id.to_string(),
        version: 1,
        config: json!({}),
        metadata: Metadata::new(),
        created_at: epoch,
        updated_at: epoch,
    }
}

#[instrument(skip(state))]
pub async fn search_assistants(
    State(state): State<AppState>,
    ValidJson(query): ValidJson<AssistantSearch>,
) -> ApiResult<impl IntoResponse> {
    if let Some(limit) = query.limit {
        if limit == 0 || limit > MAX_SEARCH_LIMIT {
            return Err(ApiError::validation(format!(
                "limit must be between 1 and {MAX_SEARCH_LIMIT}"
            )));
        }
    }
    let metadata_filter = query.metadata.as_ref().is_some_and(|m| !m.is_empty());

    let matching: Vec<Assistant> = state
        .graphs
        .ids()
        .filter(|id| query.graph_id.as_deref().is_none_or(|wanted| wanted == *id))
        .filter(|_| !metadata_filter)
        .map(assistant)
        .collect();

    let total = matching.len();
    let offset = query.offset.unwrap_or(0) as usize;
    let limit = query.limit.map_or(usize::MAX, |limit| limit as usize);
    let page: Vec<Assistant> = matching.into_iter().skip(offset).take(limit).collect();

    Ok((total_header(total), Json(page)))
}

/// Drawable description of a graph. `xray=true` includes subgraph internals.
#[instrument(skip(state))]
pub async fn get_assistant_graph(
    State(state): State<AppState>,
    Path(assistant_id): Path<String>,
    ValidQuery(query): ValidQuery<GraphQuery>,
) -> ApiResult<Json<Value>> {
    let xray = match query.xray.as_deref() {
        None | Some("false") => false,
        Some("true") => true,
        Some(other) => {
            return Err(ApiError::validation_with(
                "invalid query string",
                format!("xray must be true or false, got '{other}'"),
            ));
        }
    };
    let graph = state.graphs.get(&assistant_id)?;
    Ok(Json(graph.describe(xray).await?))
}
