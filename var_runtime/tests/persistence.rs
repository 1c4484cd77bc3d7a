mod common;

use any_spawner::Executor;
use common::{eventually, runtime, runtime_with_channel, FakeServer, MockApi};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use var_config::RuntimeOptions;
use var_runtime::{
    persistence::{session_key, MemoryStorage, StorageArea},
    prelude::*,
    RuntimeConfig, ANONYMOUS_SESSION,
};

fn extras() -> RequestExtras {
    RequestExtras::default()
}

fn on_tab(api: &MockApi, local: &MemoryStorage) -> Runtime {
    RuntimeConfig::builder()
        .api(Arc::new(api.clone()))
        .local_storage(Arc::new(local.clone()))
        .session_id("session-1")
        .build()
}

fn fast_writes(api: &MockApi) -> Runtime {
    RuntimeConfig::builder()
        .api(Arc::new(api.clone()))
        .options(RuntimeOptions::builder().persist_debounce_ms(20).build())
        .build()
}

#[tokio::test]
async fn persisted_values_sync_across_tabs() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    let first_tab = MemoryStorage::new();
    let second_tab = first_tab.open_tab();
    let first = on_tab(&api, &first_tab);
    let second = on_tab(&api, &second_tab);
    second.listen_storage(second_tab.events());

    let theme: AnyVariable = PlainVariable::new("theme", json!("light"))
        .persisted()
        .into();
    assert_eq!(second.resolve(&theme, &extras()).await, Ok(json!("light")));

    first.set(&theme, json!("dark"), &extras()).unwrap();
    // the writing tab sees its own write at once
    assert_eq!(
        first.try_resolve_sync(&theme, &extras()),
        Some(Ok(json!("dark")))
    );
    eventually(|| {
        second.try_resolve_sync(&theme, &extras()) == Some(Ok(json!("dark")))
    })
    .await;

    // a tab opened later starts from the stored value
    let third = on_tab(&api, &first_tab.open_tab());
    assert_eq!(third.resolve(&theme, &extras()).await, Ok(json!("dark")));
}

#[tokio::test]
async fn other_sessions_are_cleaned_up() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    let local = MemoryStorage::new();
    local.set(&session_key("stale", "theme"), "\"dark\"".into()).unwrap();
    local.set(&session_key("session-1", "theme"), "\"light\"".into()).unwrap();
    let runtime = on_tab(&api, &local);

    assert_eq!(runtime.clean_session_cache(), 1);
    assert_eq!(local.keys(), vec![session_key("session-1", "theme")]);
}

#[tokio::test]
async fn patches_must_follow_the_sequence() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    let runtime = runtime(&api);
    let counter: AnyVariable = PlainVariable::new("counter", Value::Null)
        .with_store("store", false)
        .into();
    runtime.resolve(&counter, &extras()).await.unwrap();
    let stores = runtime.backend_stores();

    // nothing to patch before the first full value
    assert!(stores.apply_patch("store", &json!([]), 1).is_err());

    stores.apply_value("store", json!({ "count": 1 }), 3);
    let replace =
        |n: i64| json!([{ "op": "replace", "path": "/count", "value": n }]);
    stores.apply_patch("store", &replace(2), 4).unwrap();
    assert_eq!(
        stores.apply_patch("store", &replace(9), 6),
        Err(RuntimeError::SequenceMismatch {
            store_uid: "store".into(),
            expected: Some(5),
            received: 6,
        })
    );
    assert_eq!(
        runtime.try_resolve_sync(&counter, &extras()),
        Some(Ok(json!({ "count": 2 })))
    );
    assert_eq!(stores.sequence("store"), Some(4));

    // a full value restarts the sequence
    stores.apply_value("store", json!({ "count": 10 }), 20);
    assert!(stores.apply_patch("store", &replace(11), 5).is_err());
    stores.apply_patch("store", &replace(11), 21).unwrap();
    assert_eq!(
        runtime.try_resolve_sync(&counter, &extras()),
        Some(Ok(json!({ "count": 11 })))
    );
}

#[tokio::test]
async fn store_pushes_arrive_over_the_channel() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    api.set_store("store", json!({ "count": 1 }), 3);
    let server = FakeServer::default();
    let runtime = runtime_with_channel(&api, &server).await;
    let first: AnyVariable = PlainVariable::new("first", Value::Null)
        .with_store("store", false)
        .into();
    let second: AnyVariable = PlainVariable::new("second", Value::Null)
        .with_store("store", true)
        .into();
    let extras = extras();
    runtime.resolve(&first, &extras).await.unwrap();
    runtime.resolve(&second, &extras).await.unwrap();
    eventually(|| runtime.backend_stores().sequence("store") == Some(3)).await;

    let patch = |n: i64, seq: u64| {
        json!({
            "store_uid": "store",
            "patches": [{ "op": "replace", "path": "/count", "value": n }],
            "sequence_number": seq
        })
    };
    server.push(patch(2, 4));
    // dropped: 5 is missing
    server.push(patch(9, 6));
    server.push(patch(5, 5));
    eventually(|| runtime.backend_stores().sequence("store") == Some(5)).await;

    for variable in [&first, &second] {
        assert_eq!(
            runtime.try_resolve_sync(variable, &extras),
            Some(Ok(json!({ "count": 5 })))
        );
    }

    server.push(json!({
        "store_uid": "store",
        "value": { "count": 100 },
        "sequence_number": 40
    }));
    eventually(|| {
        runtime.try_resolve_sync(&second, &extras)
            == Some(Ok(json!({ "count": 100 })))
    })
    .await;
    assert_eq!(api.store_reads(), vec!["store"]);
}

#[tokio::test]
async fn gaps_refetch_only_when_enabled() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    api.set_store("store", json!({ "count": 1 }), 1);
    let counter: AnyVariable = PlainVariable::new("counter", Value::Null)
        .with_store("store", false)
        .into();

    let runtime = runtime(&api);
    runtime.resolve(&counter, &extras()).await.unwrap();
    eventually(|| runtime.backend_stores().sequence("store") == Some(1)).await;
    assert!(runtime
        .backend_stores()
        .apply_patch("store", &json!([]), 3)
        .is_err());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(api.store_reads().len(), 1);

    let resyncing: Runtime = RuntimeConfig::builder()
        .api(Arc::new(api.clone()))
        .resync_on_mismatch(true)
        .build();
    resyncing.resolve(&counter, &extras()).await.unwrap();
    eventually(|| resyncing.backend_stores().sequence("store") == Some(1))
        .await;
    api.set_store("store", json!({ "count": 7 }), 8);
    assert!(resyncing
        .backend_stores()
        .apply_patch("store", &json!([]), 3)
        .is_err());
    eventually(|| resyncing.backend_stores().sequence("store") == Some(8))
        .await;
    assert_eq!(
        resyncing.try_resolve_sync(&counter, &extras()),
        Some(Ok(json!({ "count": 7 })))
    );
}

#[tokio::test]
async fn writes_are_debounced() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    let runtime = fast_writes(&api);
    let draft: AnyVariable = PlainVariable::new("draft", json!(""))
        .with_store("drafts", false)
        .into();
    let extras = RequestExtras::new().with_header("authorization", "alice");

    for text in ["h", "he", "hey"] {
        runtime.set(&draft, json!(text), &extras).unwrap();
    }
    assert_eq!(
        runtime.try_resolve_sync(&draft, &extras),
        Some(Ok(json!("hey")))
    );
    assert_eq!(runtime.backend_stores().pending_writes(), 1);
    eventually(|| !api.store_writes().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    // nothing is kept once the last write has gone out
    assert_eq!(runtime.backend_stores().pending_writes(), 0);

    let writes = api.store_writes();
    assert_eq!(writes.len(), 1);
    let (request, sent_with) = &writes[0];
    assert_eq!(request.values.get("drafts"), Some(&json!("hey")));
    assert_eq!(sent_with, &extras);
}

#[tokio::test]
async fn readonly_stores_are_never_written() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    let runtime = fast_writes(&api);
    let view: AnyVariable = PlainVariable::new("view", json!(0))
        .with_store("shared", true)
        .into();

    runtime.set(&view, json!(1), &extras()).unwrap();
    assert_eq!(runtime.try_resolve_sync(&view, &extras()), Some(Ok(json!(1))));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(api.store_writes().is_empty());
}

#[tokio::test]
async fn tabs_without_a_session_id_share_persisted_values() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    let first_tab = MemoryStorage::new();
    let second_tab = first_tab.open_tab();
    let on_default_tab = |local: &MemoryStorage| -> Runtime {
        RuntimeConfig::builder()
            .api(Arc::new(api.clone()))
            .local_storage(Arc::new(local.clone()))
            .build()
    };
    let first = on_default_tab(&first_tab);
    let second = on_default_tab(&second_tab);
    second.listen_storage(second_tab.events());
    assert_eq!(first.session_id(), ANONYMOUS_SESSION);

    let theme: AnyVariable = PlainVariable::new("theme", json!("light"))
        .persisted()
        .into();
    assert_eq!(second.resolve(&theme, &extras()).await, Ok(json!("light")));
    first.set(&theme, json!("dark"), &extras()).unwrap();
    eventually(|| {
        second.try_resolve_sync(&theme, &extras()) == Some(Ok(json!("dark")))
    })
    .await;

    // a second tab's cleanup keeps the shared keys
    assert_eq!(second.clean_session_cache(), 0);
    let third = on_default_tab(&first_tab.open_tab());
    assert_eq!(third.resolve(&theme, &extras()).await, Ok(json!("dark")));
}
