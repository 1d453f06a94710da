//! Behaviour every `ThreadStore` backend must share.
//!
//! PostgreSQL runs only when `RELAY_TEST_POSTGRES_URL` points at a database.

use std::sync::Arc;

use relay::db::SqliteDatabase;
use relay::engine::{EchoGraph, GraphRegistry};
use relay::store::{
    SqliteThreadStore, StoreConfig, StoreError, ThreadStore, create_store,
};
use relay_protocol::{
    IfExists, Metadata, RunCreate, RunListQuery, RunPatch, RunStatus, SortOrder, ThreadCreate,
    ThreadPatch, ThreadSearch, ThreadSortBy, ThreadStatus,
};
use serde_json::{Value, json};

fn metadata(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Unique tag so suites sharing a database do not see each other's rows.
fn tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn tagged(tag: &str) -> ThreadSearch {
    ThreadSearch {
        metadata: Some(metadata(json!({ "suite": tag }))),
        ..Default::default()
    }
}

async fn create_tagged(store: &dyn ThreadStore, tag: &str, id: &str, extra: Value) -> String {
    let mut meta = metadata(extra);
    meta.insert("suite".into(), json!(tag));
    store
        .create(ThreadCreate {
            thread_id: Some(format!("{tag}-{id}")),
            metadata: Some(meta),
            if_exists: None,
        })
        .await
        .unwrap()
        .thread_id
}

async fn thread_round_trip(store: &dyn ThreadStore) {
    let tag = tag();
    let created = store
        .create(ThreadCreate {
            metadata: Some(metadata(json!({ "suite": tag, "nested": { "a": [1, 2] } }))),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!created.thread_id.is_empty());
    assert_eq!(created.status, ThreadStatus::Idle);
    assert!(created.values.is_none());

    let fetched = store.get(&created.thread_id).await.unwrap();
    assert_eq!(fetched, created);

    let missing = store.get("no-such-thread").await;
    assert!(matches!(missing, Err(StoreError::ThreadNotFound(_))));
}

async fn create_existing(store: &dyn ThreadStore) {
    let tag = tag();
    let id = create_tagged(store, &tag, "dup", json!({ "v": 1 })).await;

    let raised = store
        .create(ThreadCreate {
            thread_id: Some(id.clone()),
            metadata: None,
            if_exists: Some(IfExists::Raise),
        })
        .await;
    assert!(matches!(raised, Err(StoreError::AlreadyExists(_))));

    let kept = store
        .create(ThreadCreate {
            thread_id: Some(id.clone()),
            metadata: Some(metadata(json!({ "v": 2 }))),
            if_exists: Some(IfExists::DoNothing),
        })
        .await
        .unwrap();
    assert_eq!(kept.metadata["v"], 1);
}

async fn search_filters_and_pages(store: &dyn ThreadStore) {
    let tag = tag();
    for (id, color) in [("a", "red"), ("b", "blue"), ("c", "red"), ("d", "red")] {
        create_tagged(store, &tag, id, json!({ "color": color })).await;
    }
    store
        .set(&format!("{tag}-c"), ThreadPatch::status(ThreadStatus::Busy))
        .await
        .unwrap();

    let mut red = tagged(&tag);
    red.metadata
        .as_mut()
        .unwrap()
        .insert("color".into(), json!("red"));
    red.sort_by = Some(ThreadSortBy::ThreadId);
    red.sort_order = Some(SortOrder::Desc);

    let ids: Vec<String> = store
        .search(&red)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.thread_id)
        .collect();
    assert_eq!(
        ids,
        vec![format!("{tag}-d"), format!("{tag}-c"), format!("{tag}-a")]
    );
    assert_eq!(store.count(&red).await.unwrap(), 3);

    let page = ThreadSearch {
        limit: Some(1),
        offset: Some(1),
        ..red.clone()
    };
    let ids: Vec<String> = store
        .search(&page)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.thread_id)
        .collect();
    assert_eq!(ids, vec![format!("{tag}-c")]);
    assert_eq!(store.count(&page).await.unwrap(), 3);

    let offset_only = ThreadSearch {
        offset: Some(2),
        ..red.clone()
    };
    assert_eq!(store.search(&offset_only).await.unwrap().len(), 1);

    let busy = ThreadSearch {
        status: Some(ThreadStatus::Busy),
        ..tagged(&tag)
    };
    let found = store.search(&busy).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].thread_id, format!("{tag}-c"));

    let absent_key = ThreadSearch {
        metadata: Some(metadata(json!({ "suite": tag, "shape": "round" }))),
        ..Default::default()
    };
    assert!(store.search(&absent_key).await.unwrap().is_empty());

    let too_many = ThreadSearch {
        limit: Some(0),
        ..tagged(&tag)
    };
    assert!(matches!(
        store.search(&too_many).await,
        Err(StoreError::InvalidArgument(_))
    ));
}

async fn metadata_filters_are_type_strict(store: &dyn ThreadStore) {
    let tag = tag();
    create_tagged(
        store,
        &tag,
        "typed",
        json!({ "flag": 1, "ratio": 1.5, "on": true, "label": "1" }),
    )
    .await;

    let cases = [
        (json!({ "flag": 1 }), 1),
        (json!({ "flag": true }), 0),
        (json!({ "flag": 1.0 }), 0),
        (json!({ "flag": "1" }), 0),
        (json!({ "ratio": 1.5 }), 1),
        (json!({ "on": true }), 1),
        (json!({ "on": 1 }), 0),
        (json!({ "label": "1" }), 1),
        (json!({ "label": 1 }), 0),
    ];
    for (filter, expected) in cases {
        let mut query = tagged(&tag);
        query
            .metadata
            .as_mut()
            .unwrap()
            .extend(metadata(filter.clone()));
        assert_eq!(
            store.count(&query).await.unwrap(),
            expected,
            "filter {filter}"
        );
        assert_eq!(store.search(&query).await.unwrap().len() as u64, expected);
    }
}

async fn patch_thread(store: &dyn ThreadStore) {
    let tag = tag();
    let id = create_tagged(store, &tag, "patch", json!({})).await;
    let before = store.get(&id).await.unwrap();

    let updated = store
        .set(&id, ThreadPatch::values(json!({ "messages": ["hi"] })))
        .await
        .unwrap();
    assert_eq!(updated.values, Some(json!({ "messages": ["hi"] })));
    assert!(updated.updated_at >= before.updated_at);
    assert_eq!(updated.created_at, before.created_at);

    let interrupted = store
        .set(
            &id,
            ThreadPatch::interrupts(metadata(json!({ "task": [{ "value": 1 }] }))),
        )
        .await
        .unwrap();
    assert_eq!(interrupted.interrupts["task"][0]["value"], 1);
    assert_eq!(store.get(&id).await.unwrap(), interrupted);

    let missing = store
        .set("no-such-thread", ThreadPatch::status(ThreadStatus::Busy))
        .await;
    assert!(matches!(missing, Err(StoreError::ThreadNotFound(_))));
}

async fn concurrent_patches_keep_each_column(store: &dyn ThreadStore) {
    let tag = tag();
    for n in 0..8 {
        let id = create_tagged(store, &tag, &format!("columns-{n}"), json!({})).await;
        let (values, status, interrupts) = tokio::join!(
            store.set(&id, ThreadPatch::values(json!({ "n": n }))),
            store.set(&id, ThreadPatch::status(ThreadStatus::Busy)),
            store.set(
                &id,
                ThreadPatch::interrupts(metadata(json!({ "task": [n] })))
            ),
        );
        values.unwrap();
        status.unwrap();
        interrupts.unwrap();

        let thread = store.get(&id).await.unwrap();
        assert_eq!(thread.values, Some(json!({ "n": n })));
        assert_eq!(thread.status, ThreadStatus::Busy);
        assert_eq!(thread.interrupts["task"], json!([n]));
        assert_eq!(thread.metadata["suite"], json!(tag));
    }
}

async fn set_unless_busy_refuses_busy_threads(store: &dyn ThreadStore) {
    let tag = tag();
    let id = create_tagged(store, &tag, "guarded", json!({})).await;

    let written = store
        .set_unless_busy(&id, ThreadPatch::values(json!({ "k": 1 })))
        .await
        .unwrap();
    assert_eq!(written.values, Some(json!({ "k": 1 })));

    store
        .set(&id, ThreadPatch::status(ThreadStatus::Busy))
        .await
        .unwrap();
    let refused = store
        .set_unless_busy(&id, ThreadPatch::values(json!({ "k": 2 })))
        .await;
    assert!(matches!(refused, Err(StoreError::Busy(_))));
    assert_eq!(
        store.get(&id).await.unwrap().values,
        Some(json!({ "k": 1 }))
    );

    let missing = store
        .set_unless_busy("no-such-thread", ThreadPatch::values(json!({})))
        .await;
    assert!(matches!(missing, Err(StoreError::ThreadNotFound(_))));
}

async fn finished_runs_stay_finished(store: &dyn ThreadStore) {
    let tag = tag();
    let id = create_tagged(store, &tag, "final", json!({})).await;
    let run = store
        .create_run(&id, "echo", RunCreate::default())
        .await
        .unwrap();

    let running = store
        .update_unfinished_run(&run.run_id, RunPatch::status(RunStatus::Running))
        .await
        .unwrap();
    assert_eq!(running.status, RunStatus::Running);

    store
        .update_run(&run.run_id, RunPatch::status(RunStatus::Success))
        .await
        .unwrap();
    let untouched = store
        .update_unfinished_run(&run.run_id, RunPatch::status(RunStatus::Interrupted))
        .await
        .unwrap();
    assert_eq!(untouched.status, RunStatus::Success);
    assert_eq!(
        store.get_run(&run.run_id).await.unwrap().status,
        RunStatus::Success
    );

    assert!(matches!(
        store
            .update_unfinished_run("no-such-run", RunPatch::status(RunStatus::Interrupted))
            .await,
        Err(StoreError::RunNotFound(_))
    ));
}

async fn runs_lifecycle(store: &dyn ThreadStore) {
    let tag = tag();
    let id = create_tagged(store, &tag, "runs", json!({})).await;

    let first = store
        .create_run(&id, "echo", RunCreate::default())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Pending);
    let second = store
        .create_run(
            &id,
            "echo",
            RunCreate {
                metadata: Some(metadata(json!({ "n": 2 }))),
                multitask_strategy: None,
            },
        )
        .await
        .unwrap();

    let finished = store
        .update_run(&first.run_id, RunPatch::status(RunStatus::Success))
        .await
        .unwrap();
    assert_eq!(finished.status, RunStatus::Success);
    assert_eq!(store.get_run(&first.run_id).await.unwrap(), finished);

    let all = store
        .list_runs(&id, &RunListQuery::default())
        .await
        .unwrap();
    let ids: Vec<&str> = all.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, vec![second.run_id.as_str(), first.run_id.as_str()]);

    let pending = store
        .list_runs(
            &id,
            &RunListQuery {
                status: Some(RunStatus::Pending),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].metadata["n"], 2);

    let orphan = store
        .create_run("no-such-thread", "echo", RunCreate::default())
        .await;
    assert!(matches!(orphan, Err(StoreError::ThreadNotFound(_))));
    assert!(matches!(
        store.get_run("no-such-run").await,
        Err(StoreError::RunNotFound(_))
    ));
}

async fn delete_cascades(store: &dyn ThreadStore) {
    let tag = tag();
    let id = create_tagged(store, &tag, "gone", json!({})).await;
    let run = store
        .create_run(&id, "echo", RunCreate::default())
        .await
        .unwrap();

    store.delete(&id).await.unwrap();
    assert!(store.get(&id).await.unwrap_err().is_not_found());
    assert!(store.get_run(&run.run_id).await.unwrap_err().is_not_found());
    assert!(matches!(
        store.delete(&id).await,
        Err(StoreError::ThreadNotFound(_))
    ));
}

async fn update_state_respects_busy(store: &dyn ThreadStore) {
    let graphs = GraphRegistry::new().with("echo", Arc::new(EchoGraph::new()));
    let tag = tag();
    let id = create_tagged(store, &tag, "state", json!({ "graph_id": "echo" })).await;

    store
        .set(&id, ThreadPatch::status(ThreadStatus::Busy))
        .await
        .unwrap();
    let busy = store.update_state(&graphs, &id, json!({ "k": 1 })).await;
    assert!(matches!(busy, Err(StoreError::Busy(_))));
    assert!(store.get(&id).await.unwrap().values.is_none());

    store
        .set(&id, ThreadPatch::status(ThreadStatus::Idle))
        .await
        .unwrap();
    let config = store
        .update_state(&graphs, &id, json!({ "k": 1 }))
        .await
        .unwrap();
    assert_eq!(config.configurable["thread_id"], json!(id));
    assert!(config.configurable.contains_key("checkpoint_id"));
    assert_eq!(store.get(&id).await.unwrap().values.unwrap()["k"], 1);

    let unbound = create_tagged(store, &tag, "unbound", json!({})).await;
    assert!(matches!(
        store.update_state(&graphs, &unbound, json!({})).await,
        Err(StoreError::MissingGraph(_))
    ));
}

async fn conformance(store: Arc<dyn ThreadStore>) {
    let store = store.as_ref();
    thread_round_trip(store).await;
    create_existing(store).await;
    search_filters_and_pages(store).await;
    metadata_filters_are_type_strict(store).await;
    patch_thread(store).await;
    concurrent_patches_keep_each_column(store).await;
    set_unless_busy_refuses_busy_threads(store).await;
    runs_lifecycle(store).await;
    finished_runs_stay_finished(store).await;
    delete_cascades(store).await;
    update_state_respects_busy(store).await;
}

#[tokio::test]
async fn memory_store_conforms() {
    conformance(create_store(StoreConfig::Memory).await.unwrap()).await;
}

#[tokio::test]
async fn sqlite_in_memory_store_conforms() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let store = SqliteThreadStore::new(db.pool().clone());
    store.setup().await.unwrap();
    conformance(Arc::new(store)).await;
}

#[tokio::test]
async fn sqlite_file_store_conforms() {
    let dir = tempfile::tempdir().unwrap();
    let store = create_store(StoreConfig::Sqlite {
        path: dir.path().join("relay.db"),
        max_connections: 4,
    })
    .await
    .unwrap();
    conformance(store).await;
}

#[tokio::test]
async fn postgres_store_conforms() {
    let Ok(url) = std::env::var("RELAY_TEST_POSTGRES_URL") else {
        eprintln!("RELAY_TEST_POSTGRES_URL not set, skipping");
        return;
    };
    let store = create_store(StoreConfig::Postgres {
        url,
        max_connections: 4,
    })
    .await
    .unwrap();
    conformance(store).await;
}
