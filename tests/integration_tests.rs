// tests/integration_tests.rs
//! Integration tests for the value bridge

use js_value_bridge::config::UnsupportedPolicy;
use js_value_bridge::engine::EngineError;
use js_value_bridge::host::HostValueType;
use js_value_bridge::{
    to_engine, to_host, AllocError, BridgeConfig, BridgeError, CyclePolicy, EngineRuntime,
    EngineValue, HeapSide, HostEnvironment, HostStatus, PropertyKey, ValueBridge,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

fn round_trip(env: &HostEnvironment, rt: &EngineRuntime, value: &EngineValue) -> EngineValue {
    let host = to_host(env, rt, value).expect("to_host failed");
    to_engine(env, rt, host).expect("to_engine failed")
}

/// Deep equality that ignores identity; `None` in arrays stands for a hole.
fn assert_deep_eq(rt: &EngineRuntime, left: &EngineValue, right: &EngineValue) {
    match (left, right) {
        (EngineValue::Object(_), EngineValue::Object(_)) => {
            assert_eq!(rt.kind_of(left).unwrap(), rt.kind_of(right).unwrap());
            if rt.is_array(left).unwrap() {
                let length = rt.array_length(left).unwrap();
                assert_eq!(length, rt.array_length(right).unwrap());
                for index in 0..length {
                    match (rt.get_index(left, index).unwrap(), rt.get_index(right, index).unwrap()) {
                        (Some(a), Some(b)) => assert_deep_eq(rt, &a, &b),
                        (None, None) => {}
                        other => panic!("hole mismatch at {}: {:?}", index, other),
                    }
                }
            } else {
                let keys = rt.own_enumerable_keys(left).unwrap();
                assert_eq!(keys, rt.own_enumerable_keys(right).unwrap());
                for key in keys {
                    assert_deep_eq(
                        rt,
                        &rt.get_property(left, &key).unwrap(),
                        &rt.get_property(right, &key).unwrap(),
                    );
                }
            }
        }
        _ => assert!(left.same_value(right), "{} != {}", left, right),
    }
}

#[test]
fn test_scalar_round_trip_is_exact() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let scalars = [
        EngineValue::Undefined,
        EngineValue::Null,
        EngineValue::Bool(false),
        EngineValue::Bool(true),
        EngineValue::Number(0.1 + 0.2),
        EngineValue::Number(-0.0),
        EngineValue::Number(f64::NAN),
        EngineValue::Number(f64::NEG_INFINITY),
        EngineValue::Number(f64::MIN_POSITIVE / 2.0),
        EngineValue::Number(f64::MAX),
        EngineValue::from(""),
        EngineValue::from("mixed ascii, ñ, 日本語 and 🦀"),
    ];

    for value in &scalars {
        let back = round_trip(&env, &rt, value);
        assert!(value.same_value(&back), "{} came back as {}", value, back);
    }
}

#[test]
fn test_structural_fidelity() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();

    let inner = rt.create_array(4).unwrap();
    rt.set_index(&inner, 0, EngineValue::from(1)).unwrap();
    rt.set_index(&inner, 3, EngineValue::from("last")).unwrap();

    let nested = rt.create_object().unwrap();
    rt.set_property(&nested, "flag", EngineValue::Bool(true)).unwrap();

    let root = rt.create_object().unwrap();
    rt.set_property(&root, "zeta", EngineValue::Null).unwrap();
    rt.set_property(&root, "list", inner).unwrap();
    rt.set_property(&root, "10", EngineValue::from(10)).unwrap();
    rt.set_property(&root, "2", EngineValue::from(2)).unwrap();
    rt.set_property(&root, "nested", nested).unwrap();
    rt.set_property(&root, "gone", EngineValue::Undefined).unwrap();

    let back = round_trip(&env, &rt, &root);
    assert_deep_eq(&rt, &root, &back);

    assert_eq!(
        rt.own_enumerable_keys(&back).unwrap(),
        vec![
            PropertyKey::Index(2),
            PropertyKey::Index(10),
            PropertyKey::Name("zeta".to_string()),
            PropertyKey::Name("list".to_string()),
            PropertyKey::Name("nested".to_string()),
            PropertyKey::Name("gone".to_string()),
        ]
    );
    let list = rt.get_property(&back, "list").unwrap();
    assert_eq!(rt.get_index(&list, 1).unwrap(), None);
}

#[test]
fn test_conversion_does_not_mutate_source() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let obj = rt.create_object().unwrap();
    rt.set_property(&obj, "a", EngineValue::from(1)).unwrap();

    let host = to_host(&env, &rt, &obj).unwrap();
    let two = env.create_double(2.0).unwrap();
    env.set_property(host, "a", two).unwrap();

    assert_eq!(rt.get_property(&obj, "a").unwrap(), EngineValue::from(1));
}

#[test]
fn test_cycle_preservation() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let obj = rt.create_object().unwrap();
    rt.set_property(&obj, "a", obj.clone()).unwrap();

    let host = to_host(&env, &rt, &obj).unwrap();
    assert_eq!(env.get_property(host, "a").unwrap(), host);

    let arr = env.create_array().unwrap();
    env.set_element(arr, 0, arr).unwrap();
    let engine = to_engine(&env, &rt, arr).unwrap();
    assert_eq!(rt.get_index(&engine, 0).unwrap(), Some(engine.clone()));
}

#[test]
fn test_cycle_rejected_when_configured() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let bridge = ValueBridge::new(BridgeConfig::default().with_cycle_policy(CyclePolicy::Reject));

    let a = rt.create_object().unwrap();
    let b = rt.create_object().unwrap();
    rt.set_property(&a, "b", b.clone()).unwrap();
    rt.set_property(&b, "a", a.clone()).unwrap();

    assert_eq!(bridge.to_host(&env, &rt, &a), Err(BridgeError::CyclicValue));
    assert_eq!(env.live_cells(), 0);
}

#[test]
fn test_function_liveness() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let seen = Arc::new(Mutex::new(None));

    let record = Arc::clone(&seen);
    let source = rt
        .create_function("record", move |rt, _, args| {
            let k = rt.get_property(&args[2], "k")?;
            *record.lock().unwrap() = Some((args[0].clone(), args[1].clone(), k));
            Ok(EngineValue::from("done"))
        })
        .unwrap();

    let shim = to_host(&env, &rt, &source).unwrap();
    assert_eq!(env.type_of(shim).unwrap(), HostValueType::Function);

    let one = env.create_double(1.0).unwrap();
    let x = env.create_string_utf8("x").unwrap();
    let arg = env.create_object().unwrap();
    let two = env.create_double(2.0).unwrap();
    env.set_property(arg, "k", two).unwrap();

    let result = env
        .call_function(env.get_undefined(), shim, &[one, x, arg])
        .unwrap();

    assert_eq!(env.get_value_string_utf8(result).unwrap(), "done");
    assert_eq!(
        seen.lock().unwrap().clone(),
        Some((
            EngineValue::Number(1.0),
            EngineValue::from("x"),
            EngineValue::Number(2.0)
        ))
    );
}

#[test]
fn test_receiver_is_forwarded() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let method = env
        .create_function("getName", |env, info| env.get_property(info.this(), "name"))
        .unwrap();

    let shim = to_engine(&env, &rt, method).unwrap();
    let receiver = rt.create_object().unwrap();
    rt.set_property(&receiver, "name", EngineValue::from("widget")).unwrap();

    assert_eq!(rt.call(&shim, &receiver, &[]).unwrap(), EngineValue::from("widget"));
}

#[test]
fn test_error_propagation_engine_to_host() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let boom = rt
        .create_function("boom", |rt, _, _| Err(rt.throw_error("boom")))
        .unwrap();

    let shim = to_host(&env, &rt, &boom).unwrap();
    assert_eq!(
        env.call_function(env.get_undefined(), shim, &[]),
        Err(HostStatus::PendingException)
    );

    let error = env.get_and_clear_last_exception().unwrap();
    assert!(env.is_error(error).unwrap());
    let message = env.get_property(error, "message").unwrap();
    assert_eq!(env.get_value_string_utf8(message).unwrap(), "boom");
}

#[test]
fn test_error_propagation_host_to_engine() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let boom = env
        .create_function("boom", |env, _| {
            env.throw_error("boom")?;
            Err(HostStatus::PendingException)
        })
        .unwrap();

    let shim = to_engine(&env, &rt, boom).unwrap();
    match rt.call(&shim, &EngineValue::Undefined, &[]) {
        Err(EngineError::Thrown(error)) => {
            assert_eq!(rt.error_message(&error).unwrap(), Some("boom".to_string()));
        }
        other => panic!("expected a throw, got {:?}", other),
    }
}

#[test]
fn test_thrown_non_error_value_is_preserved() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let thrower = rt
        .create_function("thrower", |_, _, _| {
            Err(EngineError::Thrown(EngineValue::from(42)))
        })
        .unwrap();

    let shim = to_host(&env, &rt, &thrower).unwrap();
    assert!(env.call_function(env.get_undefined(), shim, &[]).is_err());
    let thrown = env.get_and_clear_last_exception().unwrap();
    assert_eq!(env.get_value_double(thrown).unwrap(), 42.0);
}

#[test]
fn test_unsupported_values() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let symbol = rt.create_symbol(Some("tag")).unwrap();
    let holder = rt.create_object().unwrap();
    rt.set_property(&holder, "s", symbol.clone()).unwrap();

    assert_eq!(
        to_host(&env, &rt, &holder),
        Err(BridgeError::UnsupportedValue("symbol".to_string()))
    );
    assert_eq!(env.live_cells(), 0);

    let lenient = ValueBridge::new(
        BridgeConfig::default().with_unsupported_policy(UnsupportedPolicy::Undefined),
    );
    let host = lenient.to_host(&env, &rt, &holder).unwrap();
    let s = env.get_property(host, "s").unwrap();
    assert_eq!(env.type_of(s).unwrap(), HostValueType::Undefined);
    assert!(env.has_own_property(host, "s").unwrap());
}

#[test]
fn test_allocation_failure_mid_traversal() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();

    let items = (0..10).map(|i| EngineValue::from(i)).collect::<Vec<_>>();
    let list = rt.create_array_from(items).unwrap();
    let root = rt.create_object().unwrap();
    rt.set_property(&root, "list", list).unwrap();

    env.fail_nth_allocation(6);
    assert_eq!(
        to_host(&env, &rt, &root),
        Err(BridgeError::Allocation {
            side: HeapSide::Host,
            source: AllocError::Injected
        })
    );
    assert_eq!(env.live_cells(), 0);

    let host = env.create_object().unwrap();
    let value = env.create_string_utf8("v").unwrap();
    env.set_property(host, "v", value).unwrap();
    let before = rt.live_cells();
    rt.fail_nth_allocation(1);
    assert!(matches!(
        to_engine(&env, &rt, host),
        Err(BridgeError::Allocation {
            side: HeapSide::Engine,
            ..
        })
    ));
    assert_eq!(rt.live_cells(), before);
}

#[test]
fn test_cross_runtime_mismatch() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let other = EngineRuntime::new();
    let foreign = other.create_object().unwrap();

    assert!(matches!(
        to_host(&env, &rt, &foreign),
        Err(BridgeError::CrossRuntimeMismatch(_))
    ));
}

#[test]
fn test_conversion_on_foreign_thread_rejected() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let obj = rt.create_object().unwrap();

    let (env2, rt2) = (env.clone(), rt.clone());
    let result = thread::spawn(move || to_host(&env2, &rt2, &obj))
        .join()
        .unwrap();
    assert_eq!(result, Err(BridgeError::ForeignThread(HeapSide::Host)));
}

#[test]
fn test_no_cache_between_calls() {
    let env = HostEnvironment::new();
    let rt = EngineRuntime::new();
    let obj = rt.create_object().unwrap();

    let first = to_host(&env, &rt, &obj).unwrap();
    let second = to_host(&env, &rt, &obj).unwrap();
    assert_ne!(first, second);
}

/// Spawns a thread that owns an engine runtime and pumps its queue until stopped.
fn spawn_engine_thread() -> (EngineRuntime, Arc<AtomicBool>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let stop = Arc::new(AtomicBool::new(false));
    let done = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let rt = EngineRuntime::new();
        tx.send(rt.clone()).unwrap();
        rt.run_until(|| done.load(Ordering::SeqCst)).unwrap();
    });
    (rx.recv().unwrap(), stop, handle)
}

#[test]
fn test_shim_marshals_to_engine_owner_thread() {
    let env = HostEnvironment::new();
    let (rt, stop, handle) = spawn_engine_thread();
    let engine_thread = rt.owner_thread();

    let ran_on = Arc::new(Mutex::new(None));
    let record = Arc::clone(&ran_on);
    let add = rt
        .create_function("add", move |_, _, args| {
            *record.lock().unwrap() = Some(thread::current().id());
            let a = args[0].as_number().unwrap_or(0.0);
            let b = args[1].as_number().unwrap_or(0.0);
            Ok(EngineValue::Number(a + b))
        })
        .unwrap();

    let shim = to_host(&env, &rt, &add).unwrap();
    let a = env.create_double(2.0).unwrap();
    let b = env.create_double(40.0).unwrap();
    let sum = env.call_function(env.get_undefined(), shim, &[a, b]).unwrap();

    assert_eq!(env.get_value_double(sum).unwrap(), 42.0);
    assert_eq!(*ran_on.lock().unwrap(), Some(engine_thread));
    assert_ne!(engine_thread, thread::current().id());

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}

#[test]
fn test_nested_calls_across_threads_do_not_deadlock() {
    let env = HostEnvironment::new();
    let (rt, stop, handle) = spawn_engine_thread();

    // Host function that the engine calls back into while serving a host call.
    let inc = env
        .create_function("inc", |env, info| {
            let n = env.get_value_double(info.arg(0).unwrap_or(env.get_undefined()))?;
            env.create_double(n + 1.0)
        })
        .unwrap();

    let twice = rt
        .create_function("twice", |rt, _, args| {
            let f = &args[0];
            let once = rt.call(f, &EngineValue::Undefined, &[args[1].clone()])?;
            rt.call(f, &EngineValue::Undefined, &[once])
        })
        .unwrap();

    let shim = to_host(&env, &rt, &twice).unwrap();
    let start = env.create_double(1.0).unwrap();
    let result = env
        .call_function(env.get_undefined(), shim, &[inc, start])
        .unwrap();
    assert_eq!(env.get_value_double(result).unwrap(), 3.0);

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}

#[test]
fn test_host_function_called_from_engine_on_other_thread() {
    let rt = EngineRuntime::new();
    let (tx, rx) = mpsc::channel();
    let stop = Arc::new(AtomicBool::new(false));
    let done = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let env = HostEnvironment::new();
        tx.send(env.clone()).unwrap();
        env.run_until(|| done.load(Ordering::SeqCst)).unwrap();
    });
    let env = rx.recv().unwrap();

    let greet = env
        .create_function("greet", |env, info| {
            let name = env.get_value_string_utf8(info.arg(0).unwrap_or(env.get_undefined()))?;
            env.create_string_utf8(&format!("hello {}", name))
        })
        .unwrap();

    let shim = to_engine(&env, &rt, greet).unwrap();
    let result = rt
        .call(&shim, &EngineValue::Undefined, &[EngineValue::from("bridge")])
        .unwrap();
    assert_eq!(result, EngineValue::from("hello bridge"));

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}

#[test]
fn test_scheduling_error_when_runtime_dropped() {
    let env = HostEnvironment::new();
    let bridge = ValueBridge::default();
    let rt = EngineRuntime::new();
    let f = rt
        .create_function("f", |_, _, _| Ok(EngineValue::Undefined))
        .unwrap();
    let shim = bridge.to_host(&env, &rt, &f).unwrap();
    drop(rt);

    assert_eq!(
        env.call_function(env.get_undefined(), shim, &[]),
        Err(HostStatus::PendingException)
    );
    let error = env.get_and_clear_last_exception().unwrap();
    let message = env.get_property(error, "message").unwrap();
    assert_eq!(
        env.get_value_string_utf8(message).unwrap(),
        "scheduling error: target runtime has been dropped"
    );
}
