// demos/basic_usage.rs
//! Basic usage example of the value bridge

use js_value_bridge::dynamic::{engine_to_json, json_to_host};
use js_value_bridge::{
    BridgeConfig, BridgeError, CyclePolicy, EngineRuntime, EngineValue, HostEnvironment,
    HostStatus, ValueBridge,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

fn main() -> Result<(), BridgeError> {
    println!("=== JS Value Bridge - Basic Usage ===\n");

    let runtime = EngineRuntime::new();
    let env = HostEnvironment::new();
    let bridge = ValueBridge::default();

    // Example 1: structured props
    println!("Example 1: Object Round Trip");

    let props = runtime.create_object()?;
    runtime.set_property(&props, "title", EngineValue::from("Hello"))?;
    runtime.set_property(&props, "width", EngineValue::from(320))?;
    let tags = runtime.create_array_from([EngineValue::from("a"), EngineValue::from("b")])?;
    runtime.set_property(&props, "tags", tags)?;

    let host = bridge.to_host(&env, &runtime, &props)?;
    let width = env.get_property(host, "width")?;
    println!("Host width: {}", env.get_value_double(width)?);

    let back = bridge.to_engine(&env, &runtime, host)?;
    println!("Back in the engine: {}", engine_to_json(&runtime, &back)?);
    println!();

    // Example 2: cycles
    println!("Example 2: Cyclic Graph");

    let node = runtime.create_object()?;
    runtime.set_property(&node, "next", node.clone())?;
    let host_node = bridge.to_host(&env, &runtime, &node)?;
    println!(
        "node.next is node in the host heap: {}",
        env.get_property(host_node, "next")? == host_node
    );

    let strict = ValueBridge::new(BridgeConfig::default().with_cycle_policy(CyclePolicy::Reject));
    match strict.to_host(&env, &runtime, &node) {
        Err(err) => println!("Strict bridge refuses it: {}", err),
        Ok(_) => println!("Strict bridge unexpectedly accepted a cycle"),
    }
    println!();

    // Example 3: functions stay live
    println!("Example 3: Function Shims");

    let greet = runtime.create_function("greet", |_, _, args| {
        let name = args.first().and_then(EngineValue::as_str).unwrap_or("world");
        Ok(EngineValue::from(format!("hello, {}", name)))
    })?;
    let host_greet = bridge.to_host(&env, &runtime, &greet)?;
    let name = env.create_string_utf8("bridge")?;
    let greeting = env.call_function(env.get_undefined(), host_greet, &[name])?;
    println!("greet(\"bridge\") = {}", env.get_value_string_utf8(greeting)?);

    let fail = runtime.create_function("fail", |rt, _, _| Err(rt.throw_error("boom")))?;
    let host_fail = bridge.to_host(&env, &runtime, &fail)?;
    if let Err(HostStatus::PendingException) =
        env.call_function(env.get_undefined(), host_fail, &[])
    {
        if let Some(error) = env.get_and_clear_last_exception() {
            let message = env.get_property(error, "message")?;
            println!("fail() threw: {}", env.get_value_string_utf8(message)?);
        }
    }
    println!();

    // Example 4: calls marshalled to the owner thread
    println!("Example 4: Cross-Thread Call");

    let (tx, rx) = mpsc::channel();
    let stop = Arc::new(AtomicBool::new(false));
    let done = Arc::clone(&stop);
    let worker = thread::spawn(move || -> Result<(), BridgeError> {
        let engine = EngineRuntime::new();
        // The receiver only disappears if main has already failed.
        let _ = tx.send(engine.clone());
        engine.run_until(|| done.load(Ordering::SeqCst))?;
        Ok(())
    });

    if let Ok(remote) = rx.recv() {
        let square = remote.create_function("square", |_, _, args| {
            let n = args.first().and_then(EngineValue::as_number).unwrap_or(0.0);
            Ok(EngineValue::Number(n * n))
        })?;
        let host_square = bridge.to_host(&env, &remote, &square)?;
        let seven = env.create_double(7.0)?;
        let result = env.call_function(env.get_undefined(), host_square, &[seven])?;
        println!("square(7) on the engine thread = {}", env.get_value_double(result)?);
    }
    stop.store(true, Ordering::SeqCst);
    if let Ok(outcome) = worker.join() {
        outcome?;
    }
    println!();

    // Example 5: props from JSON
    println!("Example 5: JSON Props");

    let json = serde_json::json!({ "flex": 1, "style": { "color": "red" } });
    let host_props = json_to_host(&env, &json)?;
    let engine_props = bridge.to_engine(&env, &runtime, host_props)?;
    println!("JSON -> host -> engine: {}", engine_to_json(&runtime, &engine_props)?);

    Ok(())
}
