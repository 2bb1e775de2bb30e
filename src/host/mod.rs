// src/host/mod.rs
//! Host-model heap: the native-module JS value representation

pub mod env;
pub mod value;

pub use env::{
    CallbackInfo, HostCallback, HostEnvironment, HostRetained, HostStatus, WeakHostEnvironment,
};
pub use value::{HostReference, HostValue, HostValueType};
