mod common;

use any_spawner::Executor;
use common::{runtime, within, MockApi};
use futures::future::join_all;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use var_client::{wire::DerivedVariableResponse, ClientError};
use var_runtime::{prelude::*, Location, RuntimeConfig};

fn extras() -> RequestExtras {
    RequestExtras::default()
}

#[tokio::test]
async fn identical_inputs_hit_the_cache() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    let runtime = runtime(&api);
    let x = PlainVariable::new("x", json!(2));
    let y = PlainVariable::new("y", json!(3));
    let sum: AnyVariable =
        DerivedVariable::new("sum", [x.clone().into(), y.into()]).into();

    assert_eq!(runtime.resolve(&sum, &extras()).await, Ok(json!(5.0)));
    // same inputs again after a round trip through another value
    runtime.set(&x.clone().into(), json!(4), &extras()).unwrap();
    assert_eq!(runtime.resolve(&sum, &extras()).await, Ok(json!(7.0)));
    runtime.set(&x.into(), json!(2), &extras()).unwrap();
    assert_eq!(runtime.resolve(&sum, &extras()).await, Ok(json!(5.0)));

    assert_eq!(api.derived_calls().len(), 2);
    assert_eq!(runtime.stats().cache_hits, 1);
}

#[tokio::test]
async fn concurrent_requests_share_one_call() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    api.set_delay(Duration::from_millis(50));
    let runtime = runtime(&api);
    let x = PlainVariable::new("x", json!(1));
    let double: AnyVariable = DerivedVariable::new("double", [x.into()])
        .cache(CachePolicy::None)
        .into();

    let extras = extras();
    let results =
        within(join_all((0..5).map(|_| runtime.resolve(&double, &extras))))
            .await;

    assert_eq!(api.derived_calls().len(), 1);
    assert!(results.iter().all(|r| r == &Ok(json!(1.0))));
}

#[tokio::test]
async fn concurrent_requests_share_one_error() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    api.set_delay(Duration::from_millis(50));
    api.on_derived(|_, _| {
        Err(ClientError::Status {
            status: 500,
            body: "boom".into(),
        })
    });
    let runtime = runtime(&api);
    let x = PlainVariable::new("x", json!(1));
    let failing: AnyVariable =
        DerivedVariable::new("failing", [x.into()]).into();

    let extras = extras();
    let results =
        within(join_all((0..3).map(|_| runtime.resolve(&failing, &extras))))
            .await;

    assert_eq!(api.derived_calls().len(), 1);
    let expected = Err(RuntimeError::Client(ClientError::Status {
        status: 500,
        body: "boom".into(),
    }));
    assert!(results.iter().all(|r| r == &expected));
    // the failure is not cached
    api.on_derived(|_, _| {
        Ok(DerivedVariableResponse::Value { value: json!("ok") })
    });
    runtime.reset(&failing).unwrap();
    assert_eq!(runtime.resolve(&failing, &extras).await, Ok(json!("ok")));
}

#[tokio::test]
async fn reset_cascades_and_bypasses_the_cache_once() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    let runtime = runtime(&api);
    let x = PlainVariable::new("x", json!(1));
    let x_var: AnyVariable = x.clone().into();
    let plus: AnyVariable =
        DerivedVariable::new("plus", [x_var.clone()]).into();
    let extras = extras();

    runtime.resolve(&plus, &extras).await.unwrap();
    runtime.set(&x_var, json!(10), &extras).unwrap();
    assert_eq!(runtime.resolve(&plus, &extras).await, Ok(json!(10.0)));
    assert_eq!(api.derived_calls().len(), 2);

    // back to the default: the value for `1` is cached, but the reset forces a
    // recompute
    runtime.reset(&x_var).unwrap();
    assert_eq!(runtime.try_resolve_sync(&x_var, &extras), Some(Ok(json!(1))));
    assert_eq!(runtime.resolve(&plus, &extras).await, Ok(json!(1.0)));
    let calls = api.derived_calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[2].1.force);

    // the bypass is one-shot
    runtime.set(&x_var, json!(10), &extras).unwrap();
    runtime.resolve(&plus, &extras).await.unwrap();
    assert_eq!(api.derived_calls().len(), 3);
}

#[tokio::test]
async fn readers_during_a_forced_refresh_get_the_fresh_value() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    api.set_delay(Duration::from_millis(50));
    let answers = Arc::new(AtomicU64::new(0));
    api.on_derived({
        let answers = Arc::clone(&answers);
        move |_, _| {
            let n = answers.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(DerivedVariableResponse::Value { value: json!(n) })
        }
    });
    let runtime = runtime(&api);
    let x: AnyVariable = PlainVariable::new("x", json!(2)).into();
    let latest: AnyVariable =
        DerivedVariable::new("latest", [x.clone()]).into();
    let extras = extras();

    assert_eq!(runtime.resolve(&latest, &extras).await, Ok(json!(1)));
    runtime.reset(&x).unwrap();
    // the second reader is not forced, but must not see the stale cache entry
    let (first, second) = within(async {
        futures::join!(
            runtime.resolve(&latest, &extras),
            runtime.resolve(&latest, &extras)
        )
    })
    .await;

    assert_eq!(first, Ok(json!(2)));
    assert_eq!(second, Ok(json!(2)));
    assert_eq!(api.derived_calls().len(), 2);
}

#[tokio::test]
async fn resetting_a_derived_variable_forces_only_that_variable() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    let runtime = runtime(&api);
    let x: AnyVariable = PlainVariable::new("x", json!(1)).into();
    let inner: AnyVariable = DerivedVariable::new("inner", [x]).into();
    let outer: AnyVariable =
        DerivedVariable::new("outer", [inner.clone()]).into();
    let extras = extras();

    runtime.resolve(&outer, &extras).await.unwrap();
    runtime.reset(&inner).unwrap();
    runtime.resolve(&outer, &extras).await.unwrap();

    let calls = api.derived_calls();
    let forced: Vec<_> = calls
        .iter()
        .filter(|(_, req)| req.force)
        .map(|(uid, _)| uid.as_str())
        .collect();
    assert_eq!(forced, ["inner"]);
    // `outer` was recomputed against the same input, so it came from the cache
    assert_eq!(runtime.stats().cache_hits, 1);
}

#[tokio::test]
async fn nested_derived_values_are_extracted() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    api.on_derived(|uid, req| {
        let value = match uid {
            "inner" => json!({ "data": { "value": req.values[0] } }),
            _ => json!(req.values[0].as_i64().unwrap_or_default() * 10),
        };
        Ok(DerivedVariableResponse::Value { value })
    });
    let runtime = runtime(&api);
    let x = PlainVariable::new("x", json!(5));
    let inner = DerivedVariable::new("inner", [x.into()]);
    let outer: AnyVariable =
        DerivedVariable::new("outer", [inner.get("data").get("value").into()])
            .into();

    assert_eq!(runtime.resolve(&outer, &extras()).await, Ok(json!(50)));
    let missing: AnyVariable =
        inner.get("data").get("nope").get("deeper").into();
    assert_eq!(runtime.resolve(&missing, &extras()).await, Ok(Value::Null));
}

#[tokio::test]
async fn dynamic_segments_pick_the_key() {
    _ = Executor::init_tokio();
    let runtime = runtime(&MockApi::default());
    let key = PlainVariable::new("key", json!("b"));
    let obj = PlainVariable::new("obj", json!({ "a": 1, "b": 2 }));
    let picked: AnyVariable = obj.get(AnyVariable::from(key.clone())).into();
    let extras = extras();

    assert_eq!(runtime.resolve(&picked, &extras).await, Ok(json!(2)));
    runtime.set(&key.clone().into(), Value::Null, &extras).unwrap();
    assert_eq!(
        runtime.try_resolve_sync(&picked, &extras),
        Some(Ok(Value::Null))
    );
    runtime.set(&key.into(), json!({}), &extras).unwrap();
    assert!(matches!(
        runtime.resolve(&picked, &extras).await,
        Err(RuntimeError::Variable(var_graph::VarError::InvalidPath { .. }))
    ));
}

#[tokio::test]
async fn cache_scopes() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    // every answer differs, so a repeated value can only come from the cache
    let answers = Arc::new(AtomicU64::new(0));
    api.on_derived({
        let answers = Arc::clone(&answers);
        move |_, _| {
            let n = answers.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(DerivedVariableResponse::Value { value: json!(n) })
        }
    });
    let runtime = runtime(&api);
    let x: AnyVariable = PlainVariable::new("x", json!(1)).into();
    let global: AnyVariable =
        DerivedVariable::new("global", [x.clone()]).into();
    let session: AnyVariable = DerivedVariable::new("session", [x.clone()])
        .cache(CachePolicy::Session)
        .into();
    let none: AnyVariable = DerivedVariable::new("none", [x.clone()])
        .cache(CachePolicy::None)
        .into();
    let extras = extras();

    let mut rounds = Vec::new();
    for input in [2, 3, 2] {
        runtime.set(&x, json!(input), &extras).unwrap();
        let mut round = Vec::new();
        for variable in [&global, &session, &none] {
            round.push(runtime.resolve(variable, &extras).await.unwrap());
        }
        rounds.push(round);
    }

    assert_eq!(rounds[0], vec![json!(1), json!(2), json!(3)]);
    assert_eq!(rounds[1], vec![json!(4), json!(5), json!(6)]);
    // back on x = 2: cached scopes answer from the first round
    assert_eq!(rounds[2], vec![json!(1), json!(2), json!(7)]);
    assert_eq!(api.derived_calls().len(), 7);
}

#[tokio::test]
async fn user_scope_is_per_extras() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    let runtime = runtime(&api);
    let x: AnyVariable = PlainVariable::new("x", json!(1)).into();
    let mine: AnyVariable = DerivedVariable::new("mine", [x])
        .cache(CachePolicy::User)
        .into();
    let alice = RequestExtras::new().with_header("authorization", "alice");
    let bob = RequestExtras::new().with_header("authorization", "bob");

    runtime.resolve(&mine, &alice).await.unwrap();
    runtime.resolve(&mine, &bob).await.unwrap();
    assert_eq!(api.derived_calls().len(), 2);

    // both cells recompute, both from their own cache entry
    runtime.store().mark_dirty(mine.uid(), false);
    runtime.resolve(&mine, &alice).await.unwrap();
    runtime.resolve(&mine, &bob).await.unwrap();
    assert_eq!(api.derived_calls().len(), 2);
    assert_eq!(runtime.stats().cache_hits, 2);
}

#[tokio::test]
async fn extras_partition_cells() {
    _ = Executor::init_tokio();
    let runtime = runtime(&MockApi::default());
    let x: AnyVariable = PlainVariable::new("x", json!(1)).into();
    let alice = RequestExtras::new().with_header("authorization", "alice");
    let bob = RequestExtras::new().with_header("authorization", "bob");

    runtime.set(&x, json!(2), &alice).unwrap();
    assert_eq!(runtime.resolve(&x, &alice).await, Ok(json!(2)));
    assert_eq!(runtime.resolve(&x, &bob).await, Ok(json!(1)));
}

#[tokio::test]
async fn url_variables_follow_the_location() {
    _ = Executor::init_tokio();
    let runtime: Runtime = RuntimeConfig::builder()
        .api(std::sync::Arc::new(MockApi::default()))
        .location(Location::parse("http://localhost/page?tab=2").unwrap())
        .build();
    let tab: AnyVariable = UrlVariable::new("tab", "tab", json!("1")).into();
    let extras = extras();

    assert_eq!(runtime.resolve(&tab, &extras).await, Ok(json!("2")));
    runtime.set(&tab, json!("3"), &extras).unwrap();
    assert_eq!(runtime.location().query("tab").as_deref(), Some("3"));

    runtime.navigate("/other").unwrap();
    assert_eq!(runtime.try_resolve_sync(&tab, &extras), Some(Ok(json!("1"))));
    runtime.navigate("/other?tab=5").unwrap();
    assert_eq!(runtime.try_resolve_sync(&tab, &extras), Some(Ok(json!("5"))));
}

#[tokio::test]
async fn state_variables_report_the_parent_status() {
    _ = Executor::init_tokio();
    let api = MockApi::default();
    api.on_derived(|_, _| {
        Err(ClientError::Status {
            status: 500,
            body: "boom".into(),
        })
    });
    let runtime = runtime(&api);
    let x: AnyVariable = PlainVariable::new("x", json!(1)).into();
    let failing: AnyVariable = DerivedVariable::new("failing", [x]).into();
    let state = |property: StateProperty| -> AnyVariable {
        StateVariable {
            uid: format!("failing-{property:?}").into(),
            parent: Box::new(failing.clone()),
            property,
        }
        .into()
    };
    let extras = extras();

    // nothing known yet: resolving it would need the server
    assert_eq!(
        runtime.try_resolve_sync(&state(StateProperty::Error), &extras),
        None
    );
    assert_eq!(
        runtime.resolve(&state(StateProperty::Error), &extras).await,
        Ok(json!(true))
    );
    assert_eq!(
        runtime.try_resolve_sync(&state(StateProperty::HasValue), &extras),
        Some(Ok(json!(false)))
    );
    assert_eq!(
        runtime.try_resolve_sync(&state(StateProperty::Loading), &extras),
        Some(Ok(json!(false)))
    );
}

#[tokio::test]
async fn unknown_uids_are_errors() {
    _ = Executor::init_tokio();
    let runtime = runtime(&MockApi::default());
    assert_eq!(
        runtime.resolve_uid("ghost", &extras()).await,
        Err(var_graph::VarError::UnresolvableVariable {
            uid: "ghost".into()
        }
        .into())
    );
}

#[tokio::test]
async fn nested_writes_update_the_parent() {
    _ = Executor::init_tokio();
    let runtime = runtime(&MockApi::default());
    let form =
        PlainVariable::new("form", json!({ "name": "a", "tags": [1, 2] }));
    let extras = extras();

    runtime
        .set(&form.get("name").into(), json!("b"), &extras)
        .unwrap();
    runtime
        .set(&form.get("tags").get("1").into(), json!(3), &extras)
        .unwrap();
    assert_eq!(
        runtime.resolve(&form.clone().into(), &extras).await,
        Ok(json!({ "name": "b", "tags": [1, 3] }))
    );
    assert!(runtime
        .set(&form.get("tags").get("9").into(), json!(0), &extras)
        .is_err());
}
