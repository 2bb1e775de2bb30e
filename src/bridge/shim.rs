// src/bridge/shim.rs
//! Forwarding functions installed in the other heap
//!
//! A shim holds a weak handle to the runtime that owns the wrapped function
//! and a root (engine) or strong reference (host) that keeps the function
//! alive until the shim cell itself is collected. On the wrapped function's
//! owner thread the call runs directly. From any other thread it is posted to
//! the owner's task queue and the caller blocks until the owner has run it.
//!
//! Arguments are converted into the wrapped function's heap on its owner
//! thread; the result (or the thrown value) is converted back on the caller's
//! thread. A throw surfaces to the caller as a throw in its own representation.

use super::convert::{EngineToHost, HostToEngine};
use crate::config::BridgeConfig;
use crate::engine::{EngineError, EngineRoot, EngineRuntime, EngineValue, WeakEngineRuntime};
use crate::host::{
    HostEnvironment, HostRetained, HostStatus, HostValue, HostValueType, WeakHostEnvironment,
};
use crate::task::ScheduleError;
use crate::BridgeError;
use std::iter;
use tracing::debug;

/// Value thrown by a wrapped function, converted into the caller's representation
#[derive(Debug, Clone, PartialEq)]
pub enum ThrownValue {
    Engine(EngineValue),
    Host(HostValue),
}

/// How a wrapped call ended; the payload is kept alive in the callee's heap.
enum Outcome<T> {
    Returned(T),
    Threw(T),
}

/// Wrap an engine function in a host function.
pub(crate) fn engine_function_to_host(
    env: &HostEnvironment,
    runtime: &EngineRuntime,
    function: &EngineValue,
    config: BridgeConfig,
) -> Result<HostValue, BridgeError> {
    let name = runtime.function_name(function)?;
    let source = runtime.downgrade();
    let target = runtime.root_guard(function.clone());

    let shim = env.create_function(&name, move |env, info| {
        call_engine(&source, target.value(), env, info.this(), info.args(), config)
            .map_err(|error| throw_into_host(env, error))
    })?;
    Ok(shim)
}

/// Wrap a host function in an engine function.
pub(crate) fn host_function_to_engine(
    env: &HostEnvironment,
    runtime: &EngineRuntime,
    function: HostValue,
    config: BridgeConfig,
) -> Result<EngineValue, BridgeError> {
    let name = env.function_name(function)?;
    let source = env.downgrade();
    let target = env.retain(function)?;

    let shim = runtime.create_function(&name, move |runtime, this, args| {
        call_host(&source, target.value(), runtime, this, args, config)
            .map_err(|error| throw_into_engine(runtime, error))
    })?;
    Ok(shim)
}

/// Call an engine function with host arguments and get a host result.
pub(crate) fn call_engine(
    source: &WeakEngineRuntime,
    function: &EngineValue,
    env: &HostEnvironment,
    this: HostValue,
    args: &[HostValue],
    config: BridgeConfig,
) -> Result<HostValue, BridgeError> {
    let runtime = source.upgrade().ok_or(ScheduleError::RuntimeGone)?;

    let outcome = if runtime.is_owner_thread() {
        debug!(runtime = %runtime.id(), "engine call on owner thread");
        invoke_engine(&runtime, function, env, this, args, config)?
    } else {
        debug!(runtime = %runtime.id(), "engine call marshalled to owner thread");
        let _retained = iter::once(&this)
            .chain(args)
            .map(|value| env.retain(*value))
            .collect::<Result<Vec<_>, _>>()?;

        let target = source.clone();
        let caller = env.downgrade();
        let function = function.clone();
        let args = args.to_vec();
        let pending = runtime.queue().submit(
            move || -> Result<Outcome<EngineRoot>, BridgeError> {
                let runtime = target.upgrade().ok_or(ScheduleError::RuntimeGone)?;
                let env = caller.upgrade().ok_or(ScheduleError::RuntimeGone)?;
                invoke_engine(&runtime, &function, &env, this, &args, config)
            },
        )?;

        let local = env.is_owner_thread().then(|| env.queue());
        pending.wait(local)??
    };

    match outcome {
        Outcome::Returned(result) => EngineToHost::new(env, &runtime, config).run(result.value()),
        Outcome::Threw(thrown) => {
            let message = engine_message(&runtime, thrown.value());
            let thrown = EngineToHost::new(env, &runtime, config).run(thrown.value())?;
            Err(BridgeError::PropagatedCall {
                message,
                thrown: ThrownValue::Host(thrown),
            })
        }
    }
}

/// Call a host function with engine arguments and get an engine result.
pub(crate) fn call_host(
    source: &WeakHostEnvironment,
    function: HostValue,
    runtime: &EngineRuntime,
    this: &EngineValue,
    args: &[EngineValue],
    config: BridgeConfig,
) -> Result<EngineValue, BridgeError> {
    let env = source.upgrade().ok_or(ScheduleError::RuntimeGone)?;

    let outcome = if env.is_owner_thread() {
        debug!(env = %env.id(), "host call on owner thread");
        invoke_host(&env, function, runtime, this, args, config)?
    } else {
        debug!(env = %env.id(), "host call marshalled to owner thread");
        let _rooted: Vec<EngineRoot> = iter::once(this)
            .chain(args)
            .filter(|value| value.heap_ref().is_some())
            .map(|value| runtime.root_guard(value.clone()))
            .collect();

        let target = source.clone();
        let caller = runtime.downgrade();
        let this = this.clone();
        let args = args.to_vec();
        let pending = env.queue().submit(
            move || -> Result<Outcome<HostRetained>, BridgeError> {
                let env = target.upgrade().ok_or(ScheduleError::RuntimeGone)?;
                let runtime = caller.upgrade().ok_or(ScheduleError::RuntimeGone)?;
                invoke_host(&env, function, &runtime, &this, &args, config)
            },
        )?;

        let local = runtime.is_owner_thread().then(|| runtime.queue());
        pending.wait(local)??
    };

    match outcome {
        Outcome::Returned(result) => HostToEngine::new(&env, runtime, config).run(result.value()),
        Outcome::Threw(thrown) => {
            let message = host_message(&env, thrown.value());
            let thrown = HostToEngine::new(&env, runtime, config).run(thrown.value())?;
            Err(BridgeError::PropagatedCall {
                message,
                thrown: ThrownValue::Engine(thrown),
            })
        }
    }
}

/// Runs on the engine owner thread.
fn invoke_engine(
    runtime: &EngineRuntime,
    function: &EngineValue,
    env: &HostEnvironment,
    this: HostValue,
    args: &[HostValue],
    config: BridgeConfig,
) -> Result<Outcome<EngineRoot>, BridgeError> {
    let inputs: Vec<HostValue> = iter::once(this).chain(args.iter().copied()).collect();
    let mut converted = HostToEngine::new(env, runtime, config).run_many(&inputs)?;
    let _rooted: Vec<EngineRoot> = converted
        .iter()
        .filter(|value| value.heap_ref().is_some())
        .map(|value| runtime.root_guard(value.clone()))
        .collect();
    let this = converted.remove(0);

    match runtime.call(function, &this, &converted) {
        Ok(result) => Ok(Outcome::Returned(runtime.root_guard(result))),
        Err(EngineError::Thrown(thrown)) => Ok(Outcome::Threw(runtime.root_guard(thrown))),
        Err(err) => Err(err.into()),
    }
}

/// Runs on the host owner thread.
fn invoke_host(
    env: &HostEnvironment,
    function: HostValue,
    runtime: &EngineRuntime,
    this: &EngineValue,
    args: &[EngineValue],
    config: BridgeConfig,
) -> Result<Outcome<HostRetained>, BridgeError> {
    let inputs: Vec<EngineValue> = iter::once(this).chain(args).cloned().collect();
    let mut converted = EngineToHost::new(env, runtime, config).run_many(&inputs)?;
    let _retained = converted
        .iter()
        .map(|value| env.retain(*value))
        .collect::<Result<Vec<_>, _>>()?;
    let this = converted.remove(0);

    match env.call_function(this, function, &converted) {
        Ok(result) => Ok(Outcome::Returned(env.retain(result)?)),
        Err(status) => match env.get_and_clear_last_exception() {
            Some(thrown) => Ok(Outcome::Threw(env.retain(thrown)?)),
            None => Err(status.into()),
        },
    }
}

/// Raise `error` as the pending host exception and return the status to report.
pub(crate) fn throw_into_host(env: &HostEnvironment, error: BridgeError) -> HostStatus {
    let thrown = match error {
        BridgeError::PropagatedCall {
            thrown: ThrownValue::Host(value),
            ..
        } => env.throw_value(value),
        other => env.throw_error(&other.to_string()),
    };
    match thrown {
        Ok(()) => HostStatus::PendingException,
        Err(status) => status,
    }
}

/// Turn `error` into the engine error an engine callable returns to throw.
pub(crate) fn throw_into_engine(runtime: &EngineRuntime, error: BridgeError) -> EngineError {
    match error {
        BridgeError::PropagatedCall {
            thrown: ThrownValue::Engine(value),
            ..
        } => EngineError::Thrown(value),
        other => runtime.throw_error(&other.to_string()),
    }
}

/// Human-readable text for a thrown engine value
pub(crate) fn engine_message(runtime: &EngineRuntime, thrown: &EngineValue) -> String {
    match runtime.error_message(thrown) {
        Ok(Some(message)) => message,
        _ => match thrown {
            EngineValue::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

/// Human-readable text for a thrown host value
pub(crate) fn host_message(env: &HostEnvironment, thrown: HostValue) -> String {
    let text = if env.is_error(thrown).unwrap_or(false) {
        env.get_property(thrown, "message")
            .and_then(|message| env.get_value_string_utf8(message))
    } else {
        env.get_value_string_utf8(thrown)
    };
    match text {
        Ok(text) => text,
        Err(_) => match env.type_of(thrown) {
            Ok(HostValueType::Number) => env
                .get_value_double(thrown)
                .map(|n| n.to_string())
                .unwrap_or_default(),
            Ok(kind) => format!("{:?}", kind).to_lowercase(),
            Err(status) => status.to_string(),
        },
    }
}
