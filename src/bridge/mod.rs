// src/bridge/mod.rs
//! The value bridge: conversions between engine and host values

mod convert;
pub mod shim;

use crate::config::BridgeConfig;
use crate::engine::{EngineRuntime, EngineValue};
use crate::host::{HostEnvironment, HostValue};
use crate::BridgeError;
use convert::{EngineToHost, HostToEngine};
use shim::ThrownValue;
use tracing::instrument;

/// Converts values between an engine runtime and a host environment.
///
/// The bridge itself is stateless apart from its configuration. Each call
/// builds its own identity table and discards it on return, so nothing is
/// cached across calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueBridge {
    config: BridgeConfig,
}

impl ValueBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Convert an engine value into a new host value.
    ///
    /// Must run on the host environment's owner thread. `value` must belong to
    /// `runtime`. On failure every host cell allocated by the call is freed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use js_value_bridge::{EngineRuntime, EngineValue, HostEnvironment, ValueBridge};
    ///
    /// let runtime = EngineRuntime::new();
    /// let env = HostEnvironment::new();
    /// let bridge = ValueBridge::default();
    ///
    /// let list = runtime
    ///     .create_array_from([EngineValue::from(1), EngineValue::from("two")])
    ///     .unwrap();
    /// let host = bridge.to_host(&env, &runtime, &list).unwrap();
    ///
    /// assert!(env.is_array(host).unwrap());
    /// assert_eq!(env.get_array_length(host).unwrap(), 2);
    /// ```
    #[instrument(level = "debug", skip_all, fields(env = %env.id(), runtime = %runtime.id()))]
    pub fn to_host(
        &self,
        env: &HostEnvironment,
        runtime: &EngineRuntime,
        value: &EngineValue,
    ) -> Result<HostValue, BridgeError> {
        EngineToHost::new(env, runtime, self.config).run(value)
    }

    /// Convert a host value into a new engine value.
    ///
    /// Must run on the engine runtime's owner thread. `value` must belong to
    /// `env`. On failure every engine cell allocated by the call is freed.
    #[instrument(level = "debug", skip_all, fields(env = %env.id(), runtime = %runtime.id()))]
    pub fn to_engine(
        &self,
        env: &HostEnvironment,
        runtime: &EngineRuntime,
        value: HostValue,
    ) -> Result<EngineValue, BridgeError> {
        HostToEngine::new(env, runtime, self.config).run(value)
    }

    /// Convert several engine values in one call; shared objects stay shared.
    pub fn to_host_many(
        &self,
        env: &HostEnvironment,
        runtime: &EngineRuntime,
        values: &[EngineValue],
    ) -> Result<Vec<HostValue>, BridgeError> {
        EngineToHost::new(env, runtime, self.config).run_many(values)
    }

    /// Convert several host values in one call; shared objects stay shared.
    pub fn to_engine_many(
        &self,
        env: &HostEnvironment,
        runtime: &EngineRuntime,
        values: &[HostValue],
    ) -> Result<Vec<EngineValue>, BridgeError> {
        HostToEngine::new(env, runtime, self.config).run_many(values)
    }

    /// Call an engine function from the host side.
    ///
    /// Arguments and result cross the boundary the same way a shim call does;
    /// a throw comes back as `BridgeError::PropagatedCall` carrying a host value.
    pub fn call_engine_function(
        &self,
        env: &HostEnvironment,
        runtime: &EngineRuntime,
        function: &EngineValue,
        this: HostValue,
        args: &[HostValue],
    ) -> Result<HostValue, BridgeError> {
        shim::call_engine(&runtime.downgrade(), function, env, this, args, self.config)
    }

    /// Call a host function from the engine side.
    pub fn call_host_function(
        &self,
        env: &HostEnvironment,
        runtime: &EngineRuntime,
        function: HostValue,
        this: &EngineValue,
        args: &[EngineValue],
    ) -> Result<EngineValue, BridgeError> {
        shim::call_host(&env.downgrade(), function, runtime, this, args, self.config)
    }

    /// Host value to throw for `error`: the thrown value itself for a
    /// propagated call, otherwise a new `Error` carrying the error text.
    pub fn error_to_host(
        &self,
        env: &HostEnvironment,
        runtime: &EngineRuntime,
        error: &BridgeError,
    ) -> Result<HostValue, BridgeError> {
        match error {
            BridgeError::PropagatedCall {
                thrown: ThrownValue::Host(value),
                ..
            } => Ok(*value),
            BridgeError::PropagatedCall {
                thrown: ThrownValue::Engine(value),
                ..
            } => self.to_host(env, runtime, value),
            other => {
                let message = env.create_string_utf8(&other.to_string())?;
                Ok(env.create_error(message)?)
            }
        }
    }

    /// Engine value to throw for `error`; see `error_to_host`.
    pub fn error_to_engine(
        &self,
        env: &HostEnvironment,
        runtime: &EngineRuntime,
        error: &BridgeError,
    ) -> Result<EngineValue, BridgeError> {
        match error {
            BridgeError::PropagatedCall {
                thrown: ThrownValue::Engine(value),
                ..
            } => Ok(value.clone()),
            BridgeError::PropagatedCall {
                thrown: ThrownValue::Host(value),
                ..
            } => self.to_engine(env, runtime, *value),
            other => Ok(runtime.create_error(&other.to_string())?),
        }
    }
}

/// Convert with the default configuration; see `ValueBridge::to_host`.
pub fn to_host(
    env: &HostEnvironment,
    runtime: &EngineRuntime,
    value: &EngineValue,
) -> Result<HostValue, BridgeError> {
    ValueBridge::default().to_host(env, runtime, value)
}

/// Convert with the default configuration; see `ValueBridge::to_engine`.
pub fn to_engine(
    env: &HostEnvironment,
    runtime: &EngineRuntime,
    value: HostValue,
) -> Result<EngineValue, BridgeError> {
    ValueBridge::default().to_engine(env, runtime, value)
}
