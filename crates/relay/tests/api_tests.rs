//! API integration tests.

use std::time::Duration;

use axum::http::{Method, StatusCode, header};
use relay::store::ThreadStore;
use relay_protocol::{ThreadPatch, ThreadStatus};
use serde_json::{Value, json};

mod common;
use common::{body_json, empty_request, json_request, send, sse_frames, test_app, test_state};

async fn create_thread(app: &axum::Router, body: Value) -> Value {
    let response = send(app, json_request(Method::POST, "/threads", &body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app();

    let response = send(&app, empty_request(Method::GET, "/health")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let app = test_app();

    let response = send(&app, empty_request(Method::GET, "/nope")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_thread_lifecycle() {
    let app = test_app();

    let created = create_thread(&app, json!({ "metadata": { "owner": "alice" } })).await;
    let thread_id = created["thread_id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "idle");
    assert_eq!(created["metadata"]["owner"], "alice");

    let response = send(&app, empty_request(Method::GET, &format!("/threads/{thread_id}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, created);

    let response = send(
        &app,
        empty_request(Method::DELETE, &format!("/threads/{thread_id}")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(&app, empty_request(Method::GET, &format!("/threads/{thread_id}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_create_existing_thread_raises_or_returns_existing() {
    let app = test_app();

    create_thread(&app, json!({ "thread_id": "fixed", "metadata": { "v": 1 } })).await;

    let response = send(
        &app,
        json_request(
            Method::POST,
            "/threads",
            &json!({ "thread_id": "fixed", "if_exists": "raise" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "CONFLICT");

    let existing = create_thread(
        &app,
        json!({ "thread_id": "fixed", "metadata": { "v": 2 } }),
    )
    .await;
    assert_eq!(existing["metadata"]["v"], 1);
}

#[tokio::test]
async fn test_search_threads_reports_total() {
    let app = test_app();

    for n in 0..3 {
        create_thread(&app, json!({ "metadata": { "team": "a", "n": n } })).await;
    }
    create_thread(&app, json!({ "metadata": { "team": "b" } })).await;

    let response = send(
        &app,
        json_request(
            Method::POST,
            "/threads/search",
            &json!({ "metadata": { "team": "a" }, "limit": 2 }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-pagination-total")
            .and_then(|v| v.to_str().ok()),
        Some("3")
    );
    let threads = body_json(response).await;
    let threads = threads.as_array().unwrap();
    assert_eq!(threads.len(), 2);
    assert!(threads.iter().all(|t| t["metadata"]["team"] == "a"));
}

#[tokio::test]
async fn test_invalid_body_is_validation_error() {
    let app = test_app();

    let response = send(
        &app,
        json_request(Method::POST, "/threads/search", &json!({ "limit": "ten" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert!(json["error"].is_string());
    assert!(json["details"].is_string());

    let response = send(
        &app,
        json_request(Method::POST, "/threads/search", &json!({ "limit": 0 })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stream_run_emits_metadata_values_end() {
    let state = test_state();
    let app = relay::api::create_router(state.clone());
    let thread = create_thread(&app, json!({})).await;
    let thread_id = thread["thread_id"].as_str().unwrap();

    let response = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{thread_id}/runs/stream"),
            &json!({
                "assistant_id": "echo",
                "input": { "messages": ["hello"] },
                "stream_mode": ["values", "updates"],
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"))
    );
    let location = response
        .headers()
        .get(header::CONTENT_LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(location.starts_with(&format!("/threads/{thread_id}/runs/")));

    let frames = sse_frames(response).await;
    let names: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
    assert_eq!(names.first(), Some(&"metadata"));
    assert!(names.contains(&"values"));
    assert!(names.contains(&"updates"));
    assert_eq!(names.last(), Some(&"__stream_end__"));
    assert_eq!(
        names.iter().filter(|n| n.starts_with("__stream_")).count(),
        1
    );
    assert!(frames.iter().all(|f| f.id.is_some()));

    let run_id = frames[0].data["run_id"].as_str().unwrap();
    assert!(location.ends_with(run_id));

    let thread = state.store.get(thread_id).await.unwrap();
    assert_eq!(thread.status, ThreadStatus::Idle);
    let messages = thread.values.unwrap()["messages"].as_array().unwrap().clone();
    assert_eq!(messages.last().unwrap()["content"], "hello");

    let response = send(
        &app,
        empty_request(Method::GET, &format!("/threads/{thread_id}/runs")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let runs = body_json(response).await;
    assert_eq!(runs[0]["run_id"], run_id);
    assert_eq!(runs[0]["status"], "success");
}

#[tokio::test]
async fn test_stream_run_unknown_thread_or_graph() {
    let app = test_app();

    let response = send(
        &app,
        json_request(
            Method::POST,
            "/threads/missing/runs/stream",
            &json!({ "assistant_id": "echo" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let thread = create_thread(&app, json!({})).await;
    let response = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{}/runs/stream", thread["thread_id"].as_str().unwrap()),
            &json!({ "assistant_id": "nope" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_failing_run_ends_with_stream_error() {
    let app = test_app();
    let thread = create_thread(&app, json!({})).await;
    let thread_id = thread["thread_id"].as_str().unwrap();

    let response = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{thread_id}/runs/stream"),
            &json!({ "assistant_id": "echo", "input": { "fail": "boom" } }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let frames = sse_frames(response).await;
    let last = frames.last().unwrap();
    assert_eq!(last.event, "__stream_error__");
    assert_eq!(last.data["error"], "ValueError");
    assert_eq!(last.data["message"], "boom");
}

#[tokio::test]
async fn test_cancel_with_wait_returns_no_content() {
    let state = test_state();
    let app = relay::api::create_router(state.clone());
    let thread = create_thread(&app, json!({})).await;
    let thread_id = thread["thread_id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{thread_id}/runs/stream"),
            &json!({
                "assistant_id": "slow",
                "input": { "messages": ["one two three four five six seven eight"] },
                "stream_mode": "messages",
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let location = response
        .headers()
        .get(header::CONTENT_LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let run_id = location.rsplit('/').next().unwrap().to_string();
    let consumer = tokio::spawn(sse_frames(response));

    tokio::time::sleep(Duration::from_millis(80)).await;
    let response = send(
        &app,
        empty_request(
            Method::POST,
            &format!("/threads/{thread_id}/runs/{run_id}/cancel?wait=true"),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let frames = consumer.await.unwrap();
    let last = frames.last().unwrap();
    assert_eq!(last.event, "__stream_cancel__");

    let run = state.store.get_run(&run_id).await.unwrap();
    assert_eq!(run.status.as_str(), "interrupted");
    let thread = state.store.get(&thread_id).await.unwrap();
    assert_eq!(thread.status, ThreadStatus::Idle);
}

#[tokio::test]
async fn test_cancel_run_of_other_thread_is_404() {
    let app = test_app();
    let thread = create_thread(&app, json!({})).await;
    let thread_id = thread["thread_id"].as_str().unwrap();

    let response = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{thread_id}/runs/stream"),
            &json!({ "assistant_id": "echo" }),
        ),
    )
    .await;
    let frames = sse_frames(response).await;
    let run_id = frames[0].data["run_id"].as_str().unwrap();

    let response = send(
        &app,
        empty_request(
            Method::POST,
            &format!("/threads/other/runs/{run_id}/cancel"),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_join_after_completion_yields_terminal() {
    let app = test_app();
    let thread = create_thread(&app, json!({})).await;
    let thread_id = thread["thread_id"].as_str().unwrap();

    let response = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{thread_id}/runs/stream"),
            &json!({ "assistant_id": "echo", "input": { "messages": ["hi"] } }),
        ),
    )
    .await;
    let frames = sse_frames(response).await;
    let run_id = frames[0].data["run_id"].as_str().unwrap();

    let response = send(
        &app,
        empty_request(
            Method::GET,
            &format!("/threads/{thread_id}/runs/{run_id}/stream"),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let joined = sse_frames(response).await;
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].event, "__stream_end__");

    // Last-Event-ID resumes from the buffer.
    let mut request = empty_request(
        Method::GET,
        &format!("/threads/{thread_id}/runs/{run_id}/stream"),
    );
    request
        .headers_mut()
        .insert("last-event-id", "0".parse().unwrap());
    let replayed = sse_frames(send(&app, request).await).await;
    assert!(replayed.len() > 1);
    assert_eq!(replayed.last().unwrap().event, "__stream_end__");
}

#[tokio::test]
async fn test_update_state_conflicts_while_busy() {
    let state = test_state();
    let app = relay::api::create_router(state.clone());
    let thread = create_thread(&app, json!({ "metadata": { "graph_id": "echo" } })).await;
    let thread_id = thread["thread_id"].as_str().unwrap();

    state
        .store
        .set(thread_id, ThreadPatch::status(ThreadStatus::Busy))
        .await
        .unwrap();
    let response = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{thread_id}/state"),
            &json!({ "values": { "topic": "rust" } }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(state.store.get(thread_id).await.unwrap().values.is_none());

    state
        .store
        .set(thread_id, ThreadPatch::status(ThreadStatus::Idle))
        .await
        .unwrap();
    let response = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{thread_id}/state"),
            &json!({ "values": { "topic": "rust" } }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let config = body_json(response).await;
    assert_eq!(config["configurable"]["thread_id"], thread_id);

    let thread = state.store.get(thread_id).await.unwrap();
    assert_eq!(thread.values.unwrap()["topic"], "rust");
}

#[tokio::test]
async fn test_update_state_without_graph_is_404() {
    let app = test_app();
    let thread = create_thread(&app, json!({})).await;

    let response = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{}/state", thread["thread_id"].as_str().unwrap()),
            &json!({ "values": {} }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_assistants_search_and_graph() {
    let app = test_app();

    let response = send(
        &app,
        json_request(Method::POST, "/assistants/search", &json!({})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-pagination-total")
            .and_then(|v| v.to_str().ok()),
        Some("2")
    );
    let assistants = body_json(response).await;
    let ids: Vec<&str> = assistants
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|a| a["assistant_id"].as_str())
        .collect();
    assert!(ids.contains(&"echo"));
    assert!(ids.contains(&"slow"));

    let response = send(
        &app,
        json_request(
            Method::POST,
            "/assistants/search",
            &json!({ "graph_id": "echo" }),
        ),
    )
    .await;
    let assistants = body_json(response).await;
    assert_eq!(assistants.as_array().unwrap().len(), 1);
    assert_eq!(assistants[0]["graph_id"], "echo");

    let response = send(
        &app,
        empty_request(Method::GET, "/assistants/echo/graph?xray=true"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["nodes"].is_array());

    let response = send(
        &app,
        empty_request(Method::GET, "/assistants/echo/graph?xray=maybe"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, empty_request(Method::GET, "/assistants/nope/graph")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queues_lists_live_runs() {
    let app = test_app();

    let response = send(&app, empty_request(Method::GET, "/queues")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));

    let thread = create_thread(&app, json!({})).await;
    let response = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{}/runs/stream", thread["thread_id"].as_str().unwrap()),
            &json!({ "assistant_id": "echo" }),
        ),
    )
    .await;
    let frames = sse_frames(response).await;
    let run_id = frames[0].data["run_id"].clone();

    // No reaper runs in tests, so the finished queue is still listed.
    let response = send(&app, empty_request(Method::GET, "/queues")).await;
    let queues = body_json(response).await;
    assert_eq!(queues[0]["id"], run_id);
    assert_eq!(
        queues[0]["messages"].as_array().unwrap().last().unwrap()["event"],
        "__stream_end__"
    );
}
