// src/host/value.rs
//! Host-model value handles

use crate::heap::{HeapId, SlotId};

/// Handle to a value in one host environment.
///
/// Every host value, scalars included, lives in the environment's heap; the
/// handle itself is plain data and says nothing about the value's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostValue {
    pub(crate) env: HeapId,
    pub(crate) slot: SlotId,
}

impl HostValue {
    /// Environment that owns the value
    pub fn env_id(self) -> HeapId {
        self.env
    }
}

/// Result of `HostEnvironment::type_of`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    Object,
    Function,
    External,
    BigInt,
}

/// Reference-counted handle that can keep a value alive across collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostReference {
    pub(crate) env: HeapId,
    pub(crate) id: u64,
}
