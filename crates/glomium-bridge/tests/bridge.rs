//! End-to-end bridge tests against the in-process toy engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use glomium_bridge::{
    Bridge, BridgeConfig, BridgeError, HostFunction, Object, ProtocolError, Value,
};
use glomium_test::{
    ToyEngine, init_test_tracing, test_gas_config, test_gas_descriptor, tiny_gas_config,
};
use serde_json::json;

fn bridge() -> (Bridge, Arc<ToyEngine>) {
    init_test_tracing();
    let engine = ToyEngine::new();
    let bridge = Bridge::new(engine.clone(), test_gas_config()).unwrap();
    (bridge, engine)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_values_round_trip() {
    let (bridge, _engine) = bridge();

    let cases = [
        json!(null),
        json!(true),
        json!(-12.5),
        json!("hello"),
        json!([1, "two", [3], null]),
        json!({"a": 1, "b": {"c": [true, false]}, "kind": "function"}),
    ];
    for case in cases {
        bridge.set("v", case.clone()).await.unwrap();
        let back = bridge.get("v").await.unwrap();
        assert_eq!(back.to_json(), Some(case));
    }

    bridge.set("u", ()).await.unwrap();
    assert!(bridge.get("u").await.unwrap().is_undefined());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_sees_globals() {
    let (bridge, _engine) = bridge();
    bridge.set("x", 5).await.unwrap();
    assert_eq!(bridge.run("x + 1").await.unwrap(), Value::from(6));
    assert_eq!(
        bridge.run("greeting = 'hi ' + x; greeting").await.unwrap(),
        Value::from("hi 5")
    );
    assert_eq!(bridge.get("greeting").await.unwrap(), Value::from("hi 5"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_function_invoked_once_with_ordered_args() {
    let (bridge, _engine) = bridge();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    bridge
        .set(
            "sub",
            HostFunction::from_sync("sub", move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                let a = args.first().and_then(Value::as_f64).unwrap_or_default();
                let b = args.get(1).and_then(Value::as_f64).unwrap_or_default();
                Ok(Value::from(a - b))
            }),
        )
        .await
        .unwrap();
    bridge
        .set(
            "shout",
            HostFunction::new("shout", |args: Vec<Value>| async move {
                tokio::task::yield_now().await;
                let text = args.first().and_then(Value::as_str).unwrap_or_default();
                Ok::<_, Value>(Value::from(text.to_uppercase()))
            }),
        )
        .await
        .unwrap();
    assert_eq!(bridge.registered_functions(), 2);

    assert_eq!(bridge.run("sub(10, 3)").await.unwrap(), Value::from(7));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        bridge.run("shout('a') + shout('b')").await.unwrap(),
        Value::from("AB")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_functions_inside_objects() {
    let (bridge, _engine) = bridge();
    let api = Object::new()
        .with("version", 3)
        .with(
            "lookup",
            HostFunction::from_sync("lookup", |_| {
                Ok(Value::from(Object::new().with("found", true).with("rank", 2)))
            }),
        );
    bridge.set("api", api).await.unwrap();

    assert_eq!(
        bridge.run("api.lookup().rank + api.version").await.unwrap(),
        Value::from(5)
    );

    let back = bridge.get("api").await.unwrap();
    let lookup = back
        .as_object()
        .and_then(|o| o.get("lookup"))
        .and_then(Value::as_function)
        .unwrap();
    assert_eq!(lookup.name(), "lookup");
    let found = lookup.call(vec![]).await.unwrap();
    assert_eq!(
        found.as_object().and_then(|o| o.get("found")),
        Some(&Value::from(true))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_rejection_is_rethrown() {
    let (bridge, _engine) = bridge();
    bridge
        .set(
            "fails",
            HostFunction::from_sync("fails", |_| Err(Value::from("uhh"))),
        )
        .await
        .unwrap();

    let err = bridge.run("fails()").await.unwrap_err();
    assert!(matches!(err, BridgeError::SandboxRuntime { .. }));
    assert_eq!(err.thrown(), Some(&Value::from("uhh")));
    assert_eq!(bridge.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thrown_errors() {
    let (bridge, _engine) = bridge();

    let err = bridge.run("throw 'boom'").await.unwrap_err();
    assert_eq!(err.thrown(), Some(&Value::from("boom")));

    let err = bridge.run("missing + 1").await.unwrap_err();
    let stack = err.thrown().and_then(Value::as_str).unwrap();
    assert!(stack.starts_with("ReferenceError: missing is not defined"));

    let err = bridge.get("nope").await.unwrap_err();
    assert!(matches!(err, BridgeError::SandboxRuntime { .. }));

    let err = bridge.run("1 +").await.unwrap_err();
    let syntax = err.thrown().and_then(Value::as_str).unwrap();
    assert!(syntax.starts_with("SyntaxError"));

    assert_eq!(bridge.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_settle_independently() {
    let (bridge, _engine) = bridge();
    bridge
        .set(
            "echo",
            HostFunction::new("echo", |args: Vec<Value>| async move {
                tokio::task::yield_now().await;
                Ok::<_, Value>(args.into_iter().next().unwrap_or_default())
            }),
        )
        .await
        .unwrap();

    let runs = (0..16).map(|i| {
        let bridge = bridge.clone();
        async move { bridge.run(&format!("echo('tag-{i}')")).await }
    });
    let results = futures::future::join_all(runs).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), Value::from(format!("tag-{i}")));
    }
    assert_eq!(bridge.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandbox_function_proxy() {
    let (bridge, _engine) = bridge();
    bridge.run("double = fn(n) => n * 2").await.unwrap();

    let double = bridge.get("double").await.unwrap();
    let double = double.as_function().unwrap();
    assert_eq!(double.call(vec![Value::from(21)]).await.unwrap(), Value::from(42));

    // A script function returned from run is callable too.
    let adder = bridge.run("fn(a, b) => a + b").await.unwrap();
    let sum = adder
        .as_function()
        .unwrap()
        .call(vec![Value::from("x"), Value::from(1)])
        .await
        .unwrap();
    assert_eq!(sum, Value::from("x1"));

    // And it can be handed back to script.
    bridge.set("again", adder.clone()).await.unwrap();
    assert_eq!(bridge.run("again(2, 3)").await.unwrap(), Value::from(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clear_discards_globals_and_functions() {
    let (bridge, engine) = bridge();
    bridge.set("x", 1).await.unwrap();
    bridge
        .set("f", HostFunction::from_sync("f", |_| Ok(Value::Null)))
        .await
        .unwrap();
    bridge.run("g = fn() => 1").await.unwrap();
    let g = bridge.get("g").await.unwrap();

    bridge.clear().await.unwrap();

    assert_eq!(bridge.generation(), 1);
    assert_eq!(bridge.registered_functions(), 0);
    assert_eq!(engine.live_contexts(), 1);
    assert!(matches!(
        bridge.get("x").await,
        Err(BridgeError::SandboxRuntime { .. })
    ));
    assert!(matches!(
        g.as_function().unwrap().call(vec![]).await,
        Err(BridgeError::ContextSuperseded)
    ));

    // A stale proxy cannot be smuggled back in either.
    bridge.set("stale", g).await.unwrap();
    assert!(bridge.get("stale").await.unwrap().is_undefined());

    // The fresh context is fully usable.
    bridge.set("x", 2).await.unwrap();
    assert_eq!(bridge.run("x * 3").await.unwrap(), Value::from(6));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runaway_script_runs_out_of_gas() {
    init_test_tracing();
    let bridge = Bridge::new(ToyEngine::new(), tiny_gas_config()).unwrap();

    let err = bridge.run("loop 1").await.unwrap_err();
    let BridgeError::OutOfGas { snapshot } = err else {
        panic!("expected out of gas, got {err:?}");
    };
    assert!(snapshot.gas_used >= snapshot.gas_limit);
    assert_eq!(bridge.pending_calls(), 0);

    // Exhaustion is sticky until the budget is reset.
    assert!(matches!(
        bridge.run("1").await,
        Err(BridgeError::OutOfGas { .. })
    ));
    let gas = bridge.get_gas().await.unwrap();
    assert!(gas.used >= gas.limit);

    bridge.set_gas(test_gas_descriptor(2_000)).await.unwrap();
    assert_eq!(bridge.run("1 + 1").await.unwrap(), Value::from(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gas_settings_survive_clear() {
    let (bridge, _engine) = bridge();
    bridge.run("[1, 2, 3]").await.unwrap();
    let before = bridge.get_gas().await.unwrap();
    assert!(before.used > 0);

    let set = bridge.set_gas(test_gas_descriptor(50_000)).await.unwrap();
    assert_eq!(set.limit, 50_000);
    assert_eq!(set.used, 0);
    assert_eq!(bridge.gas_config().gas_limit, 50_000);

    bridge.clear().await.unwrap();
    let after = bridge.get_gas().await.unwrap();
    assert_eq!(after.limit, 50_000);
    assert_eq!(after.used, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deep_recursion_is_an_engine_fault() {
    let (bridge, _engine) = bridge();
    let err = bridge
        .run("f = fn(n) => f(n + 1); f(0)")
        .await
        .unwrap_err();
    let BridgeError::EngineFault { snapshot } = err else {
        panic!("expected an engine fault, got {err:?}");
    };
    assert!(!snapshot.is_exhausted());

    // Unlike gas exhaustion, the context stays usable.
    assert_eq!(bridge.run("2").await.unwrap(), Value::from(2));
}

fn nested_array_source(levels: usize) -> String {
    format!("{}1{}", "[".repeat(levels), "]".repeat(levels))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deeply_nested_values_settle() {
    let (bridge, _engine) = bridge();

    // Past the JSON parser's own nesting limit.
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        bridge.run(&nested_array_source(140)),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, BridgeError::Protocol(_)), "{err:?}");

    // Parseable, but past the wire cap.
    let err = bridge.run(&nested_array_source(110)).await.unwrap_err();
    assert!(
        matches!(err, BridgeError::Protocol(ProtocolError::TooDeep { .. })),
        "{err:?}"
    );
    assert_eq!(bridge.pending_calls(), 0);

    // Within the cap the value comes back intact.
    let mut value = bridge.run(&nested_array_source(90)).await.unwrap();
    for _ in 0..90 {
        value = value.as_array().unwrap()[0].clone();
    }
    assert_eq!(value, Value::from(1));

    // Sending something too deep fails before it reaches the engine.
    let deep = (0..140).fold(json!(1), |inner, _| json!([inner]));
    assert!(matches!(
        bridge.set("deep", deep).await,
        Err(BridgeError::Protocol(ProtocolError::TooDeep { .. }))
    ));
    assert_eq!(bridge.pending_calls(), 0);
    assert_eq!(bridge.run("1 + 1").await.unwrap(), Value::from(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandbox_functions_stay_with_their_bridge() {
    init_test_tracing();
    let engine = ToyEngine::new();
    let a = Bridge::new(engine.clone(), test_gas_config()).unwrap();
    let b = Bridge::new(engine.clone(), test_gas_config()).unwrap();

    let from_a = a.run("fn() => 'from A'").await.unwrap();
    b.run("own = fn() => 'from B'").await.unwrap();
    assert_eq!(a.generation(), b.generation());

    // Both heaps hand out the same pointer; only the owning bridge may
    // pass it to its context.
    b.set("g", from_a.clone()).await.unwrap();
    assert!(b.get("g").await.unwrap().is_undefined());
    assert!(b.run("g()").await.is_err());
    assert_eq!(b.run("own()").await.unwrap(), Value::from("from B"));

    a.set("g", from_a.clone()).await.unwrap();
    assert_eq!(a.run("g()").await.unwrap(), Value::from("from A"));
    assert_eq!(
        from_a.as_function().unwrap().call(vec![]).await.unwrap(),
        Value::from("from A")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_tears_down_context() {
    let (bridge, engine) = bridge();
    let f = bridge.run("fn() => 1").await.unwrap();
    assert_eq!(engine.live_contexts(), 1);

    drop(bridge);
    // The router may still hold the bridge for a moment while it settles
    // the last call on the engine thread.
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.live_contexts() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        f.as_function().unwrap().call(vec![]).await,
        Err(BridgeError::BridgeClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_from_config() {
    init_test_tracing();
    let config = BridgeConfig::from_toml_str("[gas]\nlimit = 3000\nmemory_byte_cost = 2\n").unwrap();
    let bridge = Bridge::from_config(ToyEngine::new(), &config).unwrap();
    assert_eq!(bridge.gas_config().gas_limit, 3000);
    assert_eq!(bridge.gas_config().mem_cost_per_byte, 2);
    assert_eq!(bridge.get_gas().await.unwrap().limit, 3000);

    let invalid = BridgeConfig::from_toml_str("[gas]\nlimit = 0\n").unwrap();
    assert!(matches!(
        Bridge::from_config(ToyEngine::new(), &invalid),
        Err(BridgeError::Config(_))
    ));
}

#[test]
fn test_bridge_requires_runtime() {
    assert!(matches!(
        Bridge::new(ToyEngine::new(), test_gas_config()),
        Err(BridgeError::NoRuntime)
    ));
}
