// src/bridge/convert.rs
//! Recursive structural conversion between the two heaps
//!
//! A converter lives for exactly one top-level call. Every compound source
//! value is memoized against the destination handle created for it, so shared
//! references and cycles keep their topology. Every destination cell the
//! converter allocates is recorded, and a failed call frees all of them before
//! the error is returned.

use super::shim;
use crate::config::{BridgeConfig, CyclePolicy, UnsupportedPolicy};
use crate::engine::{EngineError, EngineKind, EngineRef, EngineRuntime, EngineValue};
use crate::heap::PropertyKey;
use crate::host::{HostEnvironment, HostStatus, HostValue, HostValueType};
use crate::{BridgeError, HeapSide};
use ahash::{AHashMap, AHashSet};
use std::fmt::Debug;
use std::hash::Hash;
use tracing::{debug, trace};

/// Identity table and recursion bookkeeping shared by both directions
struct Scope<K, V> {
    config: BridgeConfig,
    memo: AHashMap<K, V>,
    in_progress: AHashSet<K>,
    depth: usize,
}

impl<K, V> Scope<K, V>
where
    K: Copy + Eq + Hash + Debug,
    V: Clone,
{
    fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            memo: AHashMap::new(),
            in_progress: AHashSet::new(),
            depth: 0,
        }
    }

    /// Destination already built for `source` in this call, if any.
    fn lookup(&self, source: K) -> Result<Option<V>, BridgeError> {
        let Some(target) = self.memo.get(&source) else {
            return Ok(None);
        };
        if self.in_progress.contains(&source) {
            if self.config.cycle_policy == CyclePolicy::Reject {
                return Err(BridgeError::CyclicValue);
            }
            trace!(?source, "cycle closed through memo");
        } else {
            trace!(?source, "shared reference reused");
        }
        Ok(Some(target.clone()))
    }

    /// Record a finished leaf (functions) that has no children to visit.
    fn memoize(&mut self, source: K, target: V) {
        self.memo.insert(source, target);
    }

    fn enter(&mut self, source: K, target: V) -> Result<(), BridgeError> {
        if self.depth >= self.config.max_depth {
            return Err(BridgeError::TooDeep(self.config.max_depth));
        }
        self.memo.insert(source, target);
        self.in_progress.insert(source);
        self.depth += 1;
        Ok(())
    }

    fn leave(&mut self, source: K) {
        self.in_progress.remove(&source);
        self.depth -= 1;
    }

    fn unsupported<T>(&self, category: &str, placeholder: T) -> Result<T, BridgeError> {
        match self.config.unsupported_policy {
            UnsupportedPolicy::Reject => Err(BridgeError::UnsupportedValue(category.to_string())),
            UnsupportedPolicy::Undefined => {
                debug!(category, "unsupported value replaced by undefined");
                Ok(placeholder)
            }
        }
    }
}

/// Engine value -> host value
pub(crate) struct EngineToHost<'a> {
    env: &'a HostEnvironment,
    runtime: &'a EngineRuntime,
    scope: Scope<EngineRef, HostValue>,
    allocated: Vec<HostValue>,
}

impl<'a> EngineToHost<'a> {
    pub(crate) fn new(
        env: &'a HostEnvironment,
        runtime: &'a EngineRuntime,
        config: BridgeConfig,
    ) -> Self {
        Self {
            env,
            runtime,
            scope: Scope::new(config),
            allocated: Vec::new(),
        }
    }

    pub(crate) fn run(self, value: &EngineValue) -> Result<HostValue, BridgeError> {
        let mut converted = self.run_many(std::slice::from_ref(value))?;
        converted.pop().ok_or(BridgeError::DanglingHandle)
    }

    /// Convert several values in one call, sharing the identity table.
    pub(crate) fn run_many(mut self, values: &[EngineValue]) -> Result<Vec<HostValue>, BridgeError> {
        self.check_preconditions(values)?;
        let result = values
            .iter()
            .map(|value| self.convert(value))
            .collect::<Result<Vec<_>, _>>();
        if result.is_err() {
            self.roll_back();
        }
        result
    }

    fn check_preconditions(&self, values: &[EngineValue]) -> Result<(), BridgeError> {
        if !self.env.is_owner_thread() {
            return Err(BridgeError::ForeignThread(HeapSide::Host));
        }
        if let Some(foreign) = values.iter().filter_map(EngineValue::heap_ref).find(|r| {
            r.runtime_id() != self.runtime.id()
        }) {
            return Err(BridgeError::CrossRuntimeMismatch(format!(
                "value belongs to {}, not {}",
                foreign.runtime_id(),
                self.runtime.id()
            )));
        }
        Ok(())
    }

    fn roll_back(&mut self) {
        let env = self.env;
        let freed = self
            .allocated
            .drain(..)
            .filter(|value| env.release(*value))
            .count();
        debug!(env = %env.id(), freed, "rolled back partial conversion");
    }

    fn track(&mut self, created: Result<HostValue, HostStatus>) -> Result<HostValue, BridgeError> {
        let value = created?;
        self.allocated.push(value);
        Ok(value)
    }

    fn convert(&mut self, value: &EngineValue) -> Result<HostValue, BridgeError> {
        let env = self.env;
        match value {
            EngineValue::Undefined => Ok(env.get_undefined()),
            EngineValue::Null => Ok(env.get_null()),
            EngineValue::Bool(b) => Ok(env.get_boolean(*b)),
            EngineValue::Number(n) => self.track(env.create_double(*n)),
            EngineValue::String(s) => self.track(env.create_string_utf8(s)),
            EngineValue::Symbol(_) => self.scope.unsupported("symbol", env.get_undefined()),
            EngineValue::Object(source) => self.convert_compound(value, *source),
        }
    }

    fn convert_compound(
        &mut self,
        value: &EngineValue,
        source: EngineRef,
    ) -> Result<HostValue, BridgeError> {
        if let Some(target) = self.scope.lookup(source)? {
            return Ok(target);
        }
        let (env, runtime) = (self.env, self.runtime);

        match runtime.kind_of(value)? {
            EngineKind::Function => {
                let target = self.track_shim(value)?;
                self.scope.memoize(source, target);
                Ok(target)
            }
            EngineKind::Array => {
                let length = runtime.array_length(value)?;
                let target = self.track(env.create_array_with_length(length))?;
                self.scope.enter(source, target)?;
                // Holes stay holes; only present indices are visited.
                let indices = runtime.own_enumerable_keys(value)?;
                for index in indices.iter().filter_map(PropertyKey::as_index) {
                    let index = index as usize;
                    if let Some(element) = runtime.get_index(value, index)? {
                        let element = self.convert(&element)?;
                        env.set_element(target, index, element)?;
                    }
                }
                self.scope.leave(source);
                Ok(target)
            }
            _ => {
                let target = if runtime.is_error(value)? {
                    let message = runtime.error_message(value)?.unwrap_or_default();
                    let message = self.track(env.create_string_utf8(&message))?;
                    self.track(env.create_error(message))?
                } else {
                    self.track(env.create_object())?
                };
                self.scope.enter(source, target)?;
                for key in runtime.own_enumerable_keys(value)? {
                    let property = runtime.get_property(value, &key)?;
                    let property = self.convert(&property)?;
                    env.set_property(target, key, property)?;
                }
                self.scope.leave(source);
                Ok(target)
            }
        }
    }

    fn track_shim(&mut self, function: &EngineValue) -> Result<HostValue, BridgeError> {
        let shim =
            shim::engine_function_to_host(self.env, self.runtime, function, self.scope.config)?;
        self.allocated.push(shim);
        Ok(shim)
    }
}

/// Host value -> engine value
pub(crate) struct HostToEngine<'a> {
    env: &'a HostEnvironment,
    runtime: &'a EngineRuntime,
    scope: Scope<HostValue, EngineValue>,
    allocated: Vec<EngineRef>,
}

impl<'a> HostToEngine<'a> {
    pub(crate) fn new(
        env: &'a HostEnvironment,
        runtime: &'a EngineRuntime,
        config: BridgeConfig,
    ) -> Self {
        Self {
            env,
            runtime,
            scope: Scope::new(config),
            allocated: Vec::new(),
        }
    }

    pub(crate) fn run(self, value: HostValue) -> Result<EngineValue, BridgeError> {
        let mut converted = self.run_many(&[value])?;
        converted.pop().ok_or(BridgeError::DanglingHandle)
    }

    /// Convert several values in one call, sharing the identity table.
    pub(crate) fn run_many(mut self, values: &[HostValue]) -> Result<Vec<EngineValue>, BridgeError> {
        self.check_preconditions(values)?;
        let result = values
            .iter()
            .map(|value| self.convert(*value))
            .collect::<Result<Vec<_>, _>>();
        if result.is_err() {
            self.roll_back();
        }
        result
    }

    fn check_preconditions(&self, values: &[HostValue]) -> Result<(), BridgeError> {
        if !self.runtime.is_owner_thread() {
            return Err(BridgeError::ForeignThread(HeapSide::Engine));
        }
        if let Some(foreign) = values.iter().find(|value| !self.env.owns(**value)) {
            return Err(BridgeError::CrossRuntimeMismatch(format!(
                "value belongs to {}, not {}",
                foreign.env_id(),
                self.env.id()
            )));
        }
        Ok(())
    }

    fn roll_back(&mut self) {
        let runtime = self.runtime;
        let freed = self
            .allocated
            .drain(..)
            .filter(|r| runtime.release(*r))
            .count();
        debug!(runtime = %runtime.id(), freed, "rolled back partial conversion");
    }

    fn track(
        &mut self,
        created: Result<EngineValue, EngineError>,
    ) -> Result<EngineValue, BridgeError> {
        let value = created?;
        if let Some(r) = value.heap_ref() {
            self.allocated.push(r);
        }
        Ok(value)
    }

    fn convert(&mut self, value: HostValue) -> Result<EngineValue, BridgeError> {
        let env = self.env;
        match env.type_of(value)? {
            HostValueType::Undefined => Ok(EngineValue::Undefined),
            HostValueType::Null => Ok(EngineValue::Null),
            HostValueType::Boolean => Ok(EngineValue::Bool(env.get_value_bool(value)?)),
            HostValueType::Number => Ok(EngineValue::Number(env.get_value_double(value)?)),
            HostValueType::String => Ok(EngineValue::String(env.get_value_string_utf8(value)?)),
            HostValueType::Symbol => self.scope.unsupported("symbol", EngineValue::Undefined),
            HostValueType::External => self.scope.unsupported("external", EngineValue::Undefined),
            HostValueType::BigInt => self.scope.unsupported("bigint", EngineValue::Undefined),
            HostValueType::Object | HostValueType::Function => self.convert_compound(value),
        }
    }

    fn convert_compound(&mut self, value: HostValue) -> Result<EngineValue, BridgeError> {
        if let Some(target) = self.scope.lookup(value)? {
            return Ok(target);
        }
        let (env, runtime) = (self.env, self.runtime);

        if env.type_of(value)? == HostValueType::Function {
            let target = self.track_shim(value)?;
            self.scope.memoize(value, target.clone());
            return Ok(target);
        }

        if env.is_array(value)? {
            let length = env.get_array_length(value)?;
            let target = self.track(runtime.create_array(length))?;
            self.scope.enter(value, target.clone())?;
            let indices = env.get_property_names(value)?;
            for index in indices.iter().filter_map(PropertyKey::as_index) {
                let index = index as usize;
                let element = env.get_element(value, index)?;
                let element = self.convert(element)?;
                runtime.set_index(&target, index, element)?;
            }
            self.scope.leave(value);
            return Ok(target);
        }

        let target = if env.is_error(value)? {
            let message = env.get_property(value, "message")?;
            let message = match env.type_of(message)? {
                HostValueType::String => env.get_value_string_utf8(message)?,
                _ => String::new(),
            };
            self.track(runtime.create_error(&message))?
        } else {
            self.track(runtime.create_object())?
        };
        self.scope.enter(value, target.clone())?;
        for key in env.get_property_names(value)? {
            let property = env.get_property(value, &key)?;
            let property = self.convert(property)?;
            runtime.set_property(&target, key, property)?;
        }
        self.scope.leave(value);
        Ok(target)
    }

    fn track_shim(&mut self, function: HostValue) -> Result<EngineValue, BridgeError> {
        let shim =
            shim::host_function_to_engine(self.env, self.runtime, function, self.scope.config)?;
        self.track(Ok(shim))
    }
}
