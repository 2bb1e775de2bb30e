// src/dynamic/mod.rs
//! Props path: engine and host values to and from `serde_json::Value`
//!
//! Component code that only needs plain data decodes props through JSON
//! instead of holding heap handles. The mapping is lossy in the same places
//! JSON is: `undefined` and array holes become `null`, non-finite numbers
//! become `null`, and cycles cannot be represented. Functions, symbols,
//! externals and bigints are rejected.

use crate::config::DEFAULT_MAX_DEPTH;
use crate::engine::{EngineKind, EngineRef, EngineRuntime, EngineValue};
use crate::heap::PropertyKey;
use crate::host::{HostEnvironment, HostValue, HostValueType};
use crate::{BridgeError, HeapSide};
use ahash::AHashSet;
use serde_json::{Map, Number, Value};
use tracing::debug;

/// Largest magnitude below which every integer is exactly representable as f64
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Longest array written out as JSON by default; holes expand to `null`.
pub const DEFAULT_MAX_ARRAY_LENGTH: usize = 1 << 24;

/// Nesting-limited JSON codec for both heaps
#[derive(Debug, Clone, Copy)]
pub struct JsonCodec {
    max_depth: usize,
    max_array_length: usize,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_array_length: DEFAULT_MAX_ARRAY_LENGTH,
        }
    }
}

impl JsonCodec {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            ..Self::default()
        }
    }

    /// Sparse arrays are dense in JSON, so the output grows with `length`.
    pub fn with_max_array_length(mut self, max_array_length: usize) -> Self {
        self.max_array_length = max_array_length;
        self
    }

    pub fn engine_to_json(
        &self,
        runtime: &EngineRuntime,
        value: &EngineValue,
    ) -> Result<Value, BridgeError> {
        let mut reader = EngineReader {
            runtime,
            max_depth: self.max_depth,
            max_array_length: self.max_array_length,
            in_progress: AHashSet::new(),
        };
        reader.read(value)
    }

    pub fn host_to_json(&self, env: &HostEnvironment, value: HostValue) -> Result<Value, BridgeError> {
        let mut reader = HostReader {
            env,
            max_depth: self.max_depth,
            max_array_length: self.max_array_length,
            in_progress: AHashSet::new(),
        };
        reader.read(value)
    }

    /// Build an engine value from JSON. Must run on the runtime's owner thread.
    pub fn json_to_engine(
        &self,
        runtime: &EngineRuntime,
        json: &Value,
    ) -> Result<EngineValue, BridgeError> {
        if !runtime.is_owner_thread() {
            return Err(BridgeError::ForeignThread(HeapSide::Engine));
        }
        let mut allocated = Vec::new();
        let result = self.write_engine(runtime, json, 0, &mut allocated);
        if result.is_err() {
            let freed = allocated.into_iter().filter(|r| runtime.release(*r)).count();
            debug!(runtime = %runtime.id(), freed, "rolled back partial json conversion");
        }
        result
    }

    /// Build a host value from JSON. Must run on the environment's owner thread.
    pub fn json_to_host(&self, env: &HostEnvironment, json: &Value) -> Result<HostValue, BridgeError> {
        if !env.is_owner_thread() {
            return Err(BridgeError::ForeignThread(HeapSide::Host));
        }
        let mut allocated = Vec::new();
        let result = self.write_host(env, json, 0, &mut allocated);
        if result.is_err() {
            let freed = allocated.into_iter().filter(|v| env.release(*v)).count();
            debug!(env = %env.id(), freed, "rolled back partial json conversion");
        }
        result
    }

    fn check_depth(&self, depth: usize) -> Result<(), BridgeError> {
        if depth >= self.max_depth {
            return Err(BridgeError::TooDeep(self.max_depth));
        }
        Ok(())
    }

    fn write_engine(
        &self,
        runtime: &EngineRuntime,
        json: &Value,
        depth: usize,
        allocated: &mut Vec<EngineRef>,
    ) -> Result<EngineValue, BridgeError> {
        let value = match json {
            Value::Null => EngineValue::Null,
            Value::Bool(b) => EngineValue::Bool(*b),
            Value::Number(n) => EngineValue::Number(json_number(n)?),
            Value::String(s) => EngineValue::String(s.clone()),
            Value::Array(items) => {
                self.check_depth(depth)?;
                let elements = items
                    .iter()
                    .map(|item| self.write_engine(runtime, item, depth + 1, allocated))
                    .collect::<Result<Vec<_>, _>>()?;
                let array = runtime.create_array_from(elements)?;
                allocated.extend(array.heap_ref());
                array
            }
            Value::Object(entries) => {
                self.check_depth(depth)?;
                let object = runtime.create_object()?;
                allocated.extend(object.heap_ref());
                for (key, item) in entries {
                    let item = self.write_engine(runtime, item, depth + 1, allocated)?;
                    runtime.set_property(&object, key.as_str(), item)?;
                }
                object
            }
        };
        Ok(value)
    }

    fn write_host(
        &self,
        env: &HostEnvironment,
        json: &Value,
        depth: usize,
        allocated: &mut Vec<HostValue>,
    ) -> Result<HostValue, BridgeError> {
        let value = match json {
            Value::Null => env.get_null(),
            Value::Bool(b) => env.get_boolean(*b),
            Value::Number(n) => track(env.create_double(json_number(n)?)?, allocated),
            Value::String(s) => track(env.create_string_utf8(s)?, allocated),
            Value::Array(items) => {
                self.check_depth(depth)?;
                let array = track(env.create_array_with_length(items.len())?, allocated);
                for (index, item) in items.iter().enumerate() {
                    let item = self.write_host(env, item, depth + 1, allocated)?;
                    env.set_element(array, index, item)?;
                }
                array
            }
            Value::Object(entries) => {
                self.check_depth(depth)?;
                let object = track(env.create_object()?, allocated);
                for (key, item) in entries {
                    let item = self.write_host(env, item, depth + 1, allocated)?;
                    env.set_property(object, key.as_str(), item)?;
                }
                object
            }
        };
        Ok(value)
    }
}

fn json_number(n: &Number) -> Result<f64, BridgeError> {
    n.as_f64()
        .ok_or_else(|| BridgeError::UnsupportedValue(format!("json number {}", n)))
}

/// JSON form of a number: integral values in the safe range print as integers.
fn number_to_json(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    let negative_zero = n == 0.0 && n.is_sign_negative();
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER && !negative_zero {
        return Value::from(n as i64);
    }
    Number::from_f64(n).map_or(Value::Null, Value::Number)
}

fn check_array_length(length: usize, limit: usize) -> Result<(), BridgeError> {
    if length > limit {
        return Err(BridgeError::UnsupportedValue(format!(
            "array of length {} (json limit {})",
            length, limit
        )));
    }
    Ok(())
}

fn track(created: HostValue, allocated: &mut Vec<HostValue>) -> HostValue {
    allocated.push(created);
    created
}

struct EngineReader<'a> {
    runtime: &'a EngineRuntime,
    max_depth: usize,
    max_array_length: usize,
    in_progress: AHashSet<EngineRef>,
}

impl EngineReader<'_> {
    fn read(&mut self, value: &EngineValue) -> Result<Value, BridgeError> {
        match value {
            EngineValue::Undefined | EngineValue::Null => Ok(Value::Null),
            EngineValue::Bool(b) => Ok(Value::Bool(*b)),
            EngineValue::Number(n) => Ok(number_to_json(*n)),
            EngineValue::String(s) => Ok(Value::String(s.clone())),
            EngineValue::Symbol(_) => Err(BridgeError::UnsupportedValue("symbol".into())),
            EngineValue::Object(r) => self.read_compound(value, *r),
        }
    }

    fn read_compound(&mut self, value: &EngineValue, r: EngineRef) -> Result<Value, BridgeError> {
        let runtime = self.runtime;
        if r.runtime_id() != runtime.id() {
            return Err(BridgeError::CrossRuntimeMismatch(format!(
                "value belongs to {}, not {}",
                r.runtime_id(),
                runtime.id()
            )));
        }
        if self.in_progress.contains(&r) {
            return Err(BridgeError::CyclicValue);
        }
        if self.in_progress.len() >= self.max_depth {
            return Err(BridgeError::TooDeep(self.max_depth));
        }

        let kind = runtime.kind_of(value)?;
        if kind == EngineKind::Function {
            return Err(BridgeError::UnsupportedValue("function".into()));
        }

        self.in_progress.insert(r);
        let json = if kind == EngineKind::Array {
            let length = runtime.array_length(value)?;
            check_array_length(length, self.max_array_length)?;
            let mut items = Vec::new();
            let indices = runtime.own_enumerable_keys(value)?;
            for index in indices.iter().filter_map(PropertyKey::as_index) {
                let index = index as usize;
                if let Some(element) = runtime.get_index(value, index)? {
                    items.resize(index, Value::Null);
                    items.push(self.read(&element)?);
                }
            }
            items.resize(length, Value::Null);
            Value::Array(items)
        } else {
            let mut entries = Map::new();
            for key in runtime.own_enumerable_keys(value)? {
                let property = runtime.get_property(value, &key)?;
                entries.insert(key.to_string(), self.read(&property)?);
            }
            Value::Object(entries)
        };
        self.in_progress.remove(&r);
        Ok(json)
    }
}

struct HostReader<'a> {
    env: &'a HostEnvironment,
    max_depth: usize,
    max_array_length: usize,
    in_progress: AHashSet<HostValue>,
}

impl HostReader<'_> {
    fn read(&mut self, value: HostValue) -> Result<Value, BridgeError> {
        let env = self.env;
        match env.type_of(value)? {
            HostValueType::Undefined | HostValueType::Null => Ok(Value::Null),
            HostValueType::Boolean => Ok(Value::Bool(env.get_value_bool(value)?)),
            HostValueType::Number => Ok(number_to_json(env.get_value_double(value)?)),
            HostValueType::String => Ok(Value::String(env.get_value_string_utf8(value)?)),
            HostValueType::Symbol => Err(BridgeError::UnsupportedValue("symbol".into())),
            HostValueType::External => Err(BridgeError::UnsupportedValue("external".into())),
            HostValueType::BigInt => Err(BridgeError::UnsupportedValue("bigint".into())),
            HostValueType::Function => Err(BridgeError::UnsupportedValue("function".into())),
            HostValueType::Object => self.read_compound(value),
        }
    }

    fn read_compound(&mut self, value: HostValue) -> Result<Value, BridgeError> {
        let env = self.env;
        if self.in_progress.contains(&value) {
            return Err(BridgeError::CyclicValue);
        }
        if self.in_progress.len() >= self.max_depth {
            return Err(BridgeError::TooDeep(self.max_depth));
        }

        self.in_progress.insert(value);
        let json = if env.is_array(value)? {
            let length = env.get_array_length(value)?;
            check_array_length(length, self.max_array_length)?;
            let mut items = Vec::new();
            let indices = env.get_property_names(value)?;
            for index in indices.iter().filter_map(PropertyKey::as_index) {
                let index = index as usize;
                items.resize(index, Value::Null);
                items.push(self.read(env.get_element(value, index)?)?);
            }
            items.resize(length, Value::Null);
            Value::Array(items)
        } else {
            let mut entries = Map::new();
            for key in env.get_property_names(value)? {
                let property = env.get_property(value, &key)?;
                entries.insert(key.to_string(), self.read(property)?);
            }
            Value::Object(entries)
        };
        self.in_progress.remove(&value);
        Ok(json)
    }
}

/// Engine value to JSON with the default nesting limit.
pub fn engine_to_json(runtime: &EngineRuntime, value: &EngineValue) -> Result<Value, BridgeError> {
    JsonCodec::default().engine_to_json(runtime, value)
}

/// JSON to engine value with the default nesting limit.
pub fn json_to_engine(runtime: &EngineRuntime, json: &Value) -> Result<EngineValue, BridgeError> {
    JsonCodec::default().json_to_engine(runtime, json)
}

/// Host value to JSON with the default nesting limit.
pub fn host_to_json(env: &HostEnvironment, value: HostValue) -> Result<Value, BridgeError> {
    JsonCodec::default().host_to_json(env, value)
}

/// JSON to host value with the default nesting limit.
pub fn json_to_host(env: &HostEnvironment, json: &Value) -> Result<HostValue, BridgeError> {
    JsonCodec::default().json_to_host(env, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_to_json_keeps_key_order() {
        let rt = EngineRuntime::new();
        let props = json_to_engine(&rt, &json!({"z": 1, "a": [true, null, "s"], "m": 2.5}))
            .unwrap();

        let keys: Vec<_> = rt
            .own_enumerable_keys(&props)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(keys, vec!["z", "a", "m"]);

        let back = engine_to_json(&rt, &props).unwrap();
        assert_eq!(back.to_string(), r#"{"z":1,"a":[true,null,"s"],"m":2.5}"#);
    }

    #[test]
    fn test_sparse_arrays_expand_up_to_the_limit() {
        let rt = EngineRuntime::new();
        let arr = rt.create_array(0).unwrap();
        rt.set_index(&arr, 3, EngineValue::from(4)).unwrap();
        assert_eq!(engine_to_json(&rt, &arr).unwrap(), json!([null, null, null, 4]));

        let codec = JsonCodec::default().with_max_array_length(3);
        assert!(matches!(
            codec.engine_to_json(&rt, &arr),
            Err(BridgeError::UnsupportedValue(_))
        ));

        let env = HostEnvironment::new();
        let huge = env.create_array().unwrap();
        let one = env.create_double(1.0).unwrap();
        env.set_element(huge, u32::MAX as usize - 1, one).unwrap();
        assert!(matches!(
            host_to_json(&env, huge),
            Err(BridgeError::UnsupportedValue(_))
        ));
    }

    #[test]
    fn test_lossy_values_become_null() {
        let rt = EngineRuntime::new();
        let arr = rt.create_array(3).unwrap();
        rt.set_index(&arr, 0, EngineValue::Undefined).unwrap();
        rt.set_index(&arr, 2, EngineValue::Number(f64::NAN)).unwrap();

        assert_eq!(engine_to_json(&rt, &arr).unwrap(), json!([null, null, null]));
        assert_eq!(
            engine_to_json(&rt, &EngineValue::Number(-0.0)).unwrap(),
            json!(-0.0)
        );
    }

    #[test]
    fn test_cycles_and_functions_rejected() {
        let rt = EngineRuntime::new();
        let obj = rt.create_object().unwrap();
        rt.set_property(&obj, "me", obj.clone()).unwrap();
        assert_eq!(engine_to_json(&rt, &obj), Err(BridgeError::CyclicValue));

        let f = rt
            .create_function("f", |_, _, _| Ok(EngineValue::Undefined))
            .unwrap();
        assert_eq!(
            engine_to_json(&rt, &f),
            Err(BridgeError::UnsupportedValue("function".to_string()))
        );
    }

    #[test]
    fn test_shared_acyclic_reference_is_duplicated() {
        let env = HostEnvironment::new();
        let shared = env.create_object().unwrap();
        let arr = env.create_array().unwrap();
        env.set_element(arr, 0, shared).unwrap();
        env.set_element(arr, 1, shared).unwrap();

        assert_eq!(host_to_json(&env, arr).unwrap(), json!([{}, {}]));
    }

    #[test]
    fn test_json_to_host_numeric_keys() {
        let env = HostEnvironment::new();
        let obj = json_to_host(&env, &json!({"b": "x", "0": 1})).unwrap();

        assert_eq!(
            env.get_property_names(obj).unwrap(),
            vec![PropertyKey::Index(0), PropertyKey::Name("b".to_string())]
        );
        assert_eq!(host_to_json(&env, obj).unwrap().to_string(), r#"{"0":1,"b":"x"}"#);
    }

    #[test]
    fn test_json_to_host_rolls_back() {
        let env = HostEnvironment::new();
        env.fail_nth_allocation(3);

        let result = json_to_host(&env, &json!({"a": 1, "b": 2}));
        assert!(matches!(result, Err(BridgeError::Allocation { .. })));
        assert_eq!(env.live_cells(), 0);
    }

    #[test]
    fn test_depth_limit() {
        let rt = EngineRuntime::new();
        let codec = JsonCodec::new(2);

        assert!(codec.json_to_engine(&rt, &json!([[1]])).is_ok());
        assert_eq!(
            codec.json_to_engine(&rt, &json!([[[1]]])),
            Err(BridgeError::TooDeep(2))
        );
    }
}
