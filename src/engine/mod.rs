// src/engine/mod.rs
//! Engine-model heap: the embedding-agnostic JS value representation

pub mod runtime;
pub mod value;

pub use runtime::{EngineCallable, EngineError, EngineRoot, EngineRuntime, RootId, WeakEngineRuntime};
pub use value::{EngineKind, EngineRef, EngineValue};
