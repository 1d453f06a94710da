//! Test utilities and common setup.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, Response, header},
};
use http_body_util::BodyExt;
use relay::api::{self, AppState};
use relay::engine::{EchoGraph, GraphRegistry};
use relay::queue::{MemoryQueueFactory, QueueManager};
use relay::store::MemoryThreadStore;
use serde_json::Value;
use tower::ServiceExt;

/// Application state over in-memory backends with an `echo` and a `slow` graph.
pub fn test_state() -> AppState {
    let graphs = GraphRegistry::new()
        .with("echo", Arc::new(EchoGraph::new()))
        .with(
            "slow",
            Arc::new(EchoGraph::new().with_chunk_delay(Duration::from_millis(50))),
        );
    let queues = QueueManager::with_removal_delay(
        Arc::new(MemoryQueueFactory::new()),
        Duration::from_millis(20),
    );
    AppState::new(
        Arc::new(MemoryThreadStore::new()),
        Arc::new(queues),
        Arc::new(graphs),
    )
    .with_heartbeat_interval(Duration::from_millis(200))
}

/// Create a test application with all services initialized.
pub fn test_app() -> Router {
    api::create_router(test_state())
}

pub fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

pub fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .body(Body::empty())
        .unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: String,
    pub data: Value,
}

/// Parse an SSE body, dropping `ping` heartbeats.
pub fn parse_sse(text: &str) -> Vec<SseFrame> {
    text.split("\n\n")
        .filter_map(|block| {
            let mut id = None;
            let mut event = None;
            let mut data = String::new();
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("id:") {
                    id = Some(rest.trim_start().to_string());
                } else if let Some(rest) = line.strip_prefix("event:") {
                    event = Some(rest.trim_start().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data.push_str(rest.trim_start());
                }
            }
            let event = event?;
            if event == "ping" {
                return None;
            }
            let data = serde_json::from_str(&data).unwrap_or(Value::Null);
            Some(SseFrame { id, event, data })
        })
        .collect()
}

/// Read an SSE response to its end, bounded so a stuck stream fails the test.
pub async fn sse_frames(response: Response<Body>) -> Vec<SseFrame> {
    let bytes = tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .expect("sse stream did not finish")
        .unwrap()
        .to_bytes();
    parse_sse(&String::from_utf8(bytes.to_vec()).unwrap())
}
