// src/lib.rs
//! # JS Value Bridge
//!
//! Converts JavaScript values between two heap representations: the
//! embedding-agnostic engine model (`EngineRuntime` / `EngineValue`) and the
//! native-module host model (`HostEnvironment` / `HostValue`).
//!
//! Scalars are copied by value, objects and arrays are copied structurally,
//! and functions are wrapped in live forwarding shims. Cycles and shared
//! references keep their topology within one conversion call.
//!
//! ## Example
//!
//! ```rust
//! use js_value_bridge::{to_engine, to_host, EngineRuntime, EngineValue, HostEnvironment};
//!
//! let runtime = EngineRuntime::new();
//! let env = HostEnvironment::new();
//!
//! let point = runtime.create_object().unwrap();
//! runtime.set_property(&point, "x", EngineValue::from(1.5)).unwrap();
//! runtime.set_property(&point, "label", EngineValue::from("origin")).unwrap();
//!
//! let host = to_host(&env, &runtime, &point).unwrap();
//! let x = env.get_property(host, "x").unwrap();
//! assert_eq!(env.get_value_double(x).unwrap(), 1.5);
//!
//! let back = to_engine(&env, &runtime, host).unwrap();
//! assert_eq!(runtime.get_property(&back, "label").unwrap(), EngineValue::from("origin"));
//! ```

pub mod bridge;
pub mod config;
pub mod dynamic;
pub mod engine;
pub mod heap;
pub mod host;
pub mod task;

use std::fmt;
use thiserror::Error;

pub use bridge::shim::ThrownValue;
pub use bridge::{to_engine, to_host, ValueBridge};
pub use config::{BridgeConfig, CyclePolicy, HeapLimits, UnsupportedPolicy};
pub use engine::{EngineError, EngineRuntime, EngineValue};
pub use heap::{AllocError, PropertyKey};
pub use host::{HostEnvironment, HostStatus, HostValue};
pub use task::ScheduleError;

/// Which of the two heaps an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapSide {
    Engine,
    Host,
}

impl fmt::Display for HeapSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapSide::Engine => write!(f, "engine"),
            HeapSide::Host => write!(f, "host"),
        }
    }
}

/// Errors raised by a conversion or a shim call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("{side} heap rejected an allocation: {source}")]
    Allocation {
        side: HeapSide,
        #[source]
        source: AllocError,
    },

    #[error("unsupported value category: {0}")]
    UnsupportedValue(String),

    #[error("value graph contains a cycle")]
    CyclicValue,

    #[error("cross-runtime mismatch: {0}")]
    CrossRuntimeMismatch(String),

    /// A wrapped function threw; `thrown` is already in the caller's representation
    #[error("{message}")]
    PropagatedCall { message: String, thrown: ThrownValue },

    #[error("conversion into the {0} heap must run on its owner thread")]
    ForeignThread(HeapSide),

    #[error("handle refers to a released or collected value")]
    DanglingHandle,

    #[error("value nesting exceeds the limit of {0}")]
    TooDeep(usize),

    #[error("scheduling error: {0}")]
    Scheduling(#[from] ScheduleError),

    #[error("engine error: {0}")]
    Engine(EngineError),

    #[error("host error: {0}")]
    Host(HostStatus),
}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Allocation(source) => BridgeError::Allocation {
                side: HeapSide::Engine,
                source,
            },
            EngineError::DanglingHandle => BridgeError::DanglingHandle,
            EngineError::ForeignValue => {
                BridgeError::CrossRuntimeMismatch("value belongs to another engine runtime".into())
            }
            other => BridgeError::Engine(other),
        }
    }
}

impl From<HostStatus> for BridgeError {
    fn from(status: HostStatus) -> Self {
        match status {
            HostStatus::NoMemory(source) => BridgeError::Allocation {
                side: HeapSide::Host,
                source,
            },
            HostStatus::InvalidHandle => BridgeError::DanglingHandle,
            HostStatus::WrongEnvironment => BridgeError::CrossRuntimeMismatch(
                "value belongs to another host environment".into(),
            ),
            other => BridgeError::Host(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_errors_keep_their_side() {
        let engine: BridgeError = EngineError::Allocation(AllocError::Injected).into();
        let host: BridgeError = HostStatus::NoMemory(AllocError::Injected).into();

        assert_eq!(
            engine,
            BridgeError::Allocation {
                side: HeapSide::Engine,
                source: AllocError::Injected
            }
        );
        assert_eq!(
            host,
            BridgeError::Allocation {
                side: HeapSide::Host,
                source: AllocError::Injected
            }
        );
        assert_eq!(
            host.to_string(),
            "host heap rejected an allocation: allocation rejected by injected failure"
        );
    }

    #[test]
    fn test_ownership_errors_map_to_mismatch() {
        assert!(matches!(
            BridgeError::from(EngineError::ForeignValue),
            BridgeError::CrossRuntimeMismatch(_)
        ));
        assert!(matches!(
            BridgeError::from(HostStatus::WrongEnvironment),
            BridgeError::CrossRuntimeMismatch(_)
        ));
        assert_eq!(
            BridgeError::from(HostStatus::InvalidHandle),
            BridgeError::DanglingHandle
        );
        assert_eq!(
            BridgeError::from(EngineError::NotAFunction),
            BridgeError::Engine(EngineError::NotAFunction)
        );
    }

    #[test]
    fn test_propagated_call_displays_message() {
        let error = BridgeError::PropagatedCall {
            message: "boom".to_string(),
            thrown: ThrownValue::Engine(EngineValue::Undefined),
        };
        assert_eq!(error.to_string(), "boom");
    }
}
