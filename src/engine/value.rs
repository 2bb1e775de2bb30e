// src/engine/value.rs
//! Engine-model values
//!
//! Scalars are held inline; symbols and objects are references into the heap
//! of the runtime that created them. Arrays and functions are object
//! sub-kinds, told apart with `EngineRuntime::kind_of`.

use crate::heap::{HeapId, SlotId};
use std::fmt;

/// Reference to a cell in one engine runtime's heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineRef {
    pub(crate) heap: HeapId,
    pub(crate) slot: SlotId,
}

impl EngineRef {
    /// Runtime that owns the referenced cell
    pub fn runtime_id(self) -> HeapId {
        self.heap
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Symbol(EngineRef),
    Object(EngineRef),
}

/// Full type tag of an engine value, arrays and functions included
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    Object,
    Array,
    Function,
}

impl EngineValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, EngineValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, EngineValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            EngineValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            EngineValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EngineValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<EngineRef> {
        match self {
            EngineValue::Object(r) => Some(*r),
            _ => None,
        }
    }

    /// Heap reference held by this value, if any
    pub fn heap_ref(&self) -> Option<EngineRef> {
        match self {
            EngineValue::Symbol(r) | EngineValue::Object(r) => Some(*r),
            _ => None,
        }
    }

    /// Identity comparison: same scalar (numbers by bit pattern) or same heap cell
    pub fn same_value(&self, other: &EngineValue) -> bool {
        match (self, other) {
            (EngineValue::Number(a), EngineValue::Number(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

impl fmt::Display for EngineValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineValue::Undefined => write!(f, "undefined"),
            EngineValue::Null => write!(f, "null"),
            EngineValue::Bool(b) => write!(f, "{}", b),
            EngineValue::Number(n) => write!(f, "{}", n),
            EngineValue::String(s) => write!(f, "\"{}\"", s),
            EngineValue::Symbol(r) => write!(f, "Symbol(@{})", r.slot.index()),
            EngineValue::Object(r) => write!(f, "[object @{}]", r.slot.index()),
        }
    }
}

impl From<bool> for EngineValue {
    fn from(b: bool) -> Self {
        EngineValue::Bool(b)
    }
}

impl From<i32> for EngineValue {
    fn from(n: i32) -> Self {
        EngineValue::Number(n as f64)
    }
}

impl From<f64> for EngineValue {
    fn from(n: f64) -> Self {
        EngineValue::Number(n)
    }
}

impl From<String> for EngineValue {
    fn from(s: String) -> Self {
        EngineValue::String(s)
    }
}

impl From<&str> for EngineValue {
    fn from(s: &str) -> Self {
        EngineValue::String(s.to_string())
    }
}

impl<T: Into<EngineValue>> From<Option<T>> for EngineValue {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => EngineValue::Null,
        }
    }
}
