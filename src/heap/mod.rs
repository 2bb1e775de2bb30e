// src/heap/mod.rs
//! Storage primitives shared by the engine and host heap models

pub mod arena;
pub mod elements;
pub mod property;

pub use arena::{AllocError, Arena, SlotId};
pub use elements::{Elements, MAX_ARRAY_LENGTH};
pub use property::{Property, PropertyKey, PropertyMap};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Process-unique identity of one heap (an engine runtime or a host environment)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u64);

impl HeapId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HeapId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap#{}", self.0)
    }
}

/// Lock a heap mutex, recovering the guard if a user callback panicked while holding it.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
