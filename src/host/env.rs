// src/host/env.rs
//! Host environment: owner of the host-model heap
//!
//! Calls report failure through `HostStatus`. A JS exception is not part of
//! the status: a throwing callback records it with `throw_value` and returns
//! `HostStatus::PendingException`, and whoever made the call collects it with
//! `get_and_clear_last_exception`.
//!
//! Values survive `collect_garbage` only while a reference with a positive
//! count points at them (directly or through other objects).

use super::value::{HostReference, HostValue, HostValueType};
use crate::config::HeapLimits;
use crate::heap::{lock, AllocError, Arena, Elements, HeapId, PropertyKey, PropertyMap, SlotId};
use crate::task::{ScheduleError, TaskQueue};
use ahash::{AHashMap, AHashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::ThreadId;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostStatus {
    #[error("invalid argument")]
    InvalidArg,

    #[error("an object was expected")]
    ObjectExpected,

    #[error("a string was expected")]
    StringExpected,

    #[error("a number was expected")]
    NumberExpected,

    #[error("a boolean was expected")]
    BooleanExpected,

    #[error("an array was expected")]
    ArrayExpected,

    #[error("a function was expected")]
    FunctionExpected,

    #[error("an exception is pending")]
    PendingException,

    #[error("handle refers to a released or collected value")]
    InvalidHandle,

    #[error("value belongs to another environment")]
    WrongEnvironment,

    #[error("out of memory: {0}")]
    NoMemory(#[from] AllocError),
}

/// Receiver and arguments of a host function call
#[derive(Debug, Clone)]
pub struct CallbackInfo {
    this: HostValue,
    args: Vec<HostValue>,
}

impl CallbackInfo {
    pub fn this(&self) -> HostValue {
        self.this
    }

    pub fn args(&self) -> &[HostValue] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<HostValue> {
        self.args.get(index).copied()
    }
}

/// Native implementation behind a host function
pub type HostCallback =
    Arc<dyn Fn(&HostEnvironment, &CallbackInfo) -> Result<HostValue, HostStatus> + Send + Sync>;

pub(crate) enum HostCell {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(Vec<u16>),
    Symbol(Option<String>),
    BigInt(i64),
    External(u64),
    Object {
        properties: PropertyMap<HostValue>,
        error: bool,
    },
    Array(Elements<HostValue>),
    Function {
        name: String,
        callback: HostCallback,
    },
}

struct ReferenceEntry {
    value: HostValue,
    count: u32,
}

struct HostHeap {
    cells: Arena<HostCell>,
    references: AHashMap<u64, ReferenceEntry>,
    next_reference: u64,
    pending_exception: Option<HostValue>,
}

struct Singletons {
    undefined: SlotId,
    null: SlotId,
    true_value: SlotId,
    false_value: SlotId,
}

struct HostInner {
    id: HeapId,
    heap: Mutex<HostHeap>,
    queue: TaskQueue,
    singletons: Singletons,
}

/// Handle to a host environment. Clones share the same heap.
#[derive(Clone)]
pub struct HostEnvironment {
    inner: Arc<HostInner>,
}

#[derive(Clone)]
pub struct WeakHostEnvironment {
    inner: Weak<HostInner>,
}

impl WeakHostEnvironment {
    pub fn upgrade(&self) -> Option<HostEnvironment> {
        self.inner.upgrade().map(|inner| HostEnvironment { inner })
    }
}

impl fmt::Debug for HostEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEnvironment")
            .field("id", &self.inner.id)
            .field("owner", &self.owner_thread())
            .finish()
    }
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl HostEnvironment {
    /// Create an environment owned by the calling thread.
    pub fn new() -> Self {
        Self::with_limits(HeapLimits::default())
    }

    pub fn with_limits(limits: HeapLimits) -> Self {
        let mut cells = Arena::new(limits);
        let singletons = Singletons {
            undefined: cells.alloc_pinned(HostCell::Undefined),
            null: cells.alloc_pinned(HostCell::Null),
            true_value: cells.alloc_pinned(HostCell::Boolean(true)),
            false_value: cells.alloc_pinned(HostCell::Boolean(false)),
        };

        Self {
            inner: Arc::new(HostInner {
                id: HeapId::next(),
                heap: Mutex::new(HostHeap {
                    cells,
                    references: AHashMap::new(),
                    next_reference: 0,
                    pending_exception: None,
                }),
                queue: TaskQueue::new(),
                singletons,
            }),
        }
    }

    pub fn id(&self) -> HeapId {
        self.inner.id
    }

    pub fn downgrade(&self) -> WeakHostEnvironment {
        WeakHostEnvironment {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.inner.queue.owner()
    }

    #[inline]
    pub fn is_owner_thread(&self) -> bool {
        self.inner.queue.is_owner_thread()
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    /// Run calls marshalled onto this environment's thread.
    pub fn run_pending(&self) -> Result<usize, ScheduleError> {
        self.inner.queue.run_pending()
    }

    /// Keep running marshalled calls until `done` returns true.
    pub fn run_until(&self, done: impl FnMut() -> bool) -> Result<usize, ScheduleError> {
        self.inner.queue.run_until(done)
    }

    pub fn owns(&self, value: HostValue) -> bool {
        value.env == self.inner.id
    }

    #[inline]
    fn heap(&self) -> MutexGuard<'_, HostHeap> {
        lock(&self.inner.heap)
    }

    #[inline]
    fn handle(&self, slot: SlotId) -> HostValue {
        HostValue {
            env: self.inner.id,
            slot,
        }
    }

    fn check(&self, value: HostValue) -> Result<(), HostStatus> {
        if self.owns(value) {
            Ok(())
        } else {
            Err(HostStatus::WrongEnvironment)
        }
    }

    fn with_cell<R>(
        &self,
        value: HostValue,
        f: impl FnOnce(&HostCell) -> Result<R, HostStatus>,
    ) -> Result<R, HostStatus> {
        self.check(value)?;
        let heap = self.heap();
        let cell = heap.cells.get(value.slot).ok_or(HostStatus::InvalidHandle)?;
        f(cell)
    }

    fn with_cell_mut<R>(
        &self,
        value: HostValue,
        f: impl FnOnce(&mut HostCell) -> Result<R, HostStatus>,
    ) -> Result<R, HostStatus> {
        self.check(value)?;
        let mut heap = self.heap();
        let cell = heap
            .cells
            .get_mut(value.slot)
            .ok_or(HostStatus::InvalidHandle)?;
        f(cell)
    }

    fn alloc(&self, cell: HostCell) -> Result<HostValue, HostStatus> {
        let mut heap = self.heap();
        heap.cells.reserve()?;
        let slot = heap.cells.insert(cell);
        Ok(self.handle(slot))
    }

    // Singletons and scalars

    pub fn get_undefined(&self) -> HostValue {
        self.handle(self.inner.singletons.undefined)
    }

    pub fn get_null(&self) -> HostValue {
        self.handle(self.inner.singletons.null)
    }

    pub fn get_boolean(&self, value: bool) -> HostValue {
        if value {
            self.handle(self.inner.singletons.true_value)
        } else {
            self.handle(self.inner.singletons.false_value)
        }
    }

    pub fn create_double(&self, value: f64) -> Result<HostValue, HostStatus> {
        self.alloc(HostCell::Number(value))
    }

    /// Create a string from UTF-8; stored as UTF-16 internally.
    pub fn create_string_utf8(&self, value: &str) -> Result<HostValue, HostStatus> {
        self.alloc(HostCell::String(value.encode_utf16().collect()))
    }

    pub fn create_string_utf16(&self, value: &[u16]) -> Result<HostValue, HostStatus> {
        self.alloc(HostCell::String(value.to_vec()))
    }

    pub fn create_symbol(&self, description: Option<&str>) -> Result<HostValue, HostStatus> {
        self.alloc(HostCell::Symbol(description.map(str::to_string)))
    }

    pub fn create_bigint_i64(&self, value: i64) -> Result<HostValue, HostStatus> {
        self.alloc(HostCell::BigInt(value))
    }

    /// Wrap an opaque native pointer-sized payload.
    pub fn create_external(&self, data: u64) -> Result<HostValue, HostStatus> {
        self.alloc(HostCell::External(data))
    }

    // Compound values

    pub fn create_object(&self) -> Result<HostValue, HostStatus> {
        self.alloc(HostCell::Object {
            properties: PropertyMap::new(),
            error: false,
        })
    }

    pub fn create_array(&self) -> Result<HostValue, HostStatus> {
        self.create_array_with_length(0)
    }

    /// Create an array of `length` holes.
    pub fn create_array_with_length(&self, length: usize) -> Result<HostValue, HostStatus> {
        self.alloc(HostCell::Array(Elements::with_length(length)?))
    }

    /// Create an `Error` whose message is the string `message`.
    pub fn create_error(&self, message: HostValue) -> Result<HostValue, HostStatus> {
        if self.type_of(message)? != HostValueType::String {
            return Err(HostStatus::StringExpected);
        }
        let mut properties = PropertyMap::new();
        properties.define("message".into(), message, false);
        self.alloc(HostCell::Object {
            properties,
            error: true,
        })
    }

    pub fn create_function<F>(&self, name: &str, callback: F) -> Result<HostValue, HostStatus>
    where
        F: Fn(&HostEnvironment, &CallbackInfo) -> Result<HostValue, HostStatus>
            + Send
            + Sync
            + 'static,
    {
        self.alloc(HostCell::Function {
            name: name.to_string(),
            callback: Arc::new(callback),
        })
    }

    // Inspection

    pub fn type_of(&self, value: HostValue) -> Result<HostValueType, HostStatus> {
        self.with_cell(value, |cell| {
            Ok(match cell {
                HostCell::Undefined => HostValueType::Undefined,
                HostCell::Null => HostValueType::Null,
                HostCell::Boolean(_) => HostValueType::Boolean,
                HostCell::Number(_) => HostValueType::Number,
                HostCell::String(_) => HostValueType::String,
                HostCell::Symbol(_) => HostValueType::Symbol,
                HostCell::BigInt(_) => HostValueType::BigInt,
                HostCell::External(_) => HostValueType::External,
                HostCell::Object { .. } | HostCell::Array(_) => HostValueType::Object,
                HostCell::Function { .. } => HostValueType::Function,
            })
        })
    }

    pub fn is_array(&self, value: HostValue) -> Result<bool, HostStatus> {
        self.with_cell(value, |cell| Ok(matches!(cell, HostCell::Array(_))))
    }

    pub fn is_error(&self, value: HostValue) -> Result<bool, HostStatus> {
        self.with_cell(value, |cell| {
            Ok(matches!(cell, HostCell::Object { error: true, .. }))
        })
    }

    pub fn is_live(&self, value: HostValue) -> bool {
        self.owns(value) && self.heap().cells.get(value.slot).is_some()
    }

    pub fn get_value_bool(&self, value: HostValue) -> Result<bool, HostStatus> {
        self.with_cell(value, |cell| match cell {
            HostCell::Boolean(b) => Ok(*b),
            _ => Err(HostStatus::BooleanExpected),
        })
    }

    pub fn get_value_double(&self, value: HostValue) -> Result<f64, HostStatus> {
        self.with_cell(value, |cell| match cell {
            HostCell::Number(n) => Ok(*n),
            _ => Err(HostStatus::NumberExpected),
        })
    }

    /// UTF-8 copy of a string; unpaired surrogates become U+FFFD.
    pub fn get_value_string_utf8(&self, value: HostValue) -> Result<String, HostStatus> {
        self.with_cell(value, |cell| match cell {
            HostCell::String(units) => Ok(String::from_utf16_lossy(units)),
            _ => Err(HostStatus::StringExpected),
        })
    }

    pub fn get_value_string_utf16(&self, value: HostValue) -> Result<Vec<u16>, HostStatus> {
        self.with_cell(value, |cell| match cell {
            HostCell::String(units) => Ok(units.clone()),
            _ => Err(HostStatus::StringExpected),
        })
    }

    pub fn get_value_bigint_i64(&self, value: HostValue) -> Result<i64, HostStatus> {
        self.with_cell(value, |cell| match cell {
            HostCell::BigInt(n) => Ok(*n),
            _ => Err(HostStatus::InvalidArg),
        })
    }

    pub fn get_value_external(&self, value: HostValue) -> Result<u64, HostStatus> {
        self.with_cell(value, |cell| match cell {
            HostCell::External(data) => Ok(*data),
            _ => Err(HostStatus::InvalidArg),
        })
    }

    pub fn symbol_description(&self, value: HostValue) -> Result<Option<String>, HostStatus> {
        self.with_cell(value, |cell| match cell {
            HostCell::Symbol(description) => Ok(description.clone()),
            _ => Err(HostStatus::InvalidArg),
        })
    }

    pub fn function_name(&self, value: HostValue) -> Result<String, HostStatus> {
        self.with_cell(value, |cell| match cell {
            HostCell::Function { name, .. } => Ok(name.clone()),
            _ => Err(HostStatus::FunctionExpected),
        })
    }

    // Arrays

    pub fn get_array_length(&self, array: HostValue) -> Result<usize, HostStatus> {
        self.with_cell(array, |cell| match cell {
            HostCell::Array(elements) => Ok(elements.len()),
            _ => Err(HostStatus::ArrayExpected),
        })
    }

    /// Whether `index` holds an element (false for holes).
    pub fn has_element(&self, array: HostValue, index: usize) -> Result<bool, HostStatus> {
        self.with_cell(array, |cell| match cell {
            HostCell::Array(elements) => Ok(elements.contains(index)),
            _ => Err(HostStatus::ArrayExpected),
        })
    }

    /// Element at `index`; holes and indices past the end read as `undefined`.
    pub fn get_element(&self, array: HostValue, index: usize) -> Result<HostValue, HostStatus> {
        let element = self.with_cell(array, |cell| match cell {
            HostCell::Array(elements) => Ok(elements.get(index).copied()),
            _ => Err(HostStatus::ArrayExpected),
        })?;
        Ok(element.unwrap_or_else(|| self.get_undefined()))
    }

    pub fn set_element(
        &self,
        array: HostValue,
        index: usize,
        value: HostValue,
    ) -> Result<(), HostStatus> {
        self.check(value)?;
        self.with_cell_mut(array, |cell| match cell {
            HostCell::Array(elements) => Ok(elements.set(index, value)?),
            _ => Err(HostStatus::ArrayExpected),
        })
    }

    pub fn delete_element(&self, array: HostValue, index: usize) -> Result<(), HostStatus> {
        self.with_cell_mut(array, |cell| match cell {
            HostCell::Array(elements) => {
                elements.remove(index);
                Ok(())
            }
            _ => Err(HostStatus::ArrayExpected),
        })
    }

    // Properties

    pub fn set_property(
        &self,
        object: HostValue,
        key: impl Into<PropertyKey>,
        value: HostValue,
    ) -> Result<(), HostStatus> {
        self.check(value)?;
        let key = key.into();
        if let (Some(index), true) = (key.as_index(), self.is_array(object)?) {
            return self.set_element(object, index as usize, value);
        }
        self.with_cell_mut(object, |cell| match cell {
            HostCell::Object { properties, .. } => {
                properties.set(key, value);
                Ok(())
            }
            _ => Err(HostStatus::ObjectExpected),
        })
    }

    pub fn define_property(
        &self,
        object: HostValue,
        key: impl Into<PropertyKey>,
        value: HostValue,
        enumerable: bool,
    ) -> Result<(), HostStatus> {
        self.check(value)?;
        let key = key.into();
        self.with_cell_mut(object, |cell| match cell {
            HostCell::Object { properties, .. } => {
                properties.define(key, value, enumerable);
                Ok(())
            }
            _ => Err(HostStatus::ObjectExpected),
        })
    }

    /// Own property lookup; missing keys read as `undefined`.
    pub fn get_property(
        &self,
        object: HostValue,
        key: impl Into<PropertyKey>,
    ) -> Result<HostValue, HostStatus> {
        let key = key.into();
        let found = self.with_cell(object, |cell| match cell {
            HostCell::Object { properties, .. } => Ok(properties.get(&key).copied()),
            HostCell::Array(elements) => Ok(key
                .as_index()
                .and_then(|index| elements.get(index as usize).copied())),
            HostCell::Function { .. } => Ok(None),
            _ => Err(HostStatus::ObjectExpected),
        })?;
        Ok(found.unwrap_or_else(|| self.get_undefined()))
    }

    pub fn has_own_property(
        &self,
        object: HostValue,
        key: impl Into<PropertyKey>,
    ) -> Result<bool, HostStatus> {
        let key = key.into();
        self.with_cell(object, |cell| match cell {
            HostCell::Object { properties, .. } => Ok(properties.contains(&key)),
            HostCell::Array(elements) => Ok(key
                .as_index()
                .map_or(false, |index| elements.contains(index as usize))),
            HostCell::Function { .. } => Ok(false),
            _ => Err(HostStatus::ObjectExpected),
        })
    }

    /// Own enumerable keys: indices ascending, then names in insertion order.
    pub fn get_property_names(&self, object: HostValue) -> Result<Vec<PropertyKey>, HostStatus> {
        self.with_cell(object, |cell| match cell {
            HostCell::Object { properties, .. } => Ok(properties.enumerable_keys()),
            HostCell::Array(elements) => Ok(elements
                .indices()
                .map(|index| PropertyKey::Index(index as u32))
                .collect()),
            HostCell::Function { .. } => Ok(Vec::new()),
            _ => Err(HostStatus::ObjectExpected),
        })
    }

    // Calls and exceptions

    /// Call a function. If it throws, the result is `Err(PendingException)` and the
    /// thrown value waits in `get_and_clear_last_exception`.
    pub fn call_function(
        &self,
        this: HostValue,
        function: HostValue,
        args: &[HostValue],
    ) -> Result<HostValue, HostStatus> {
        if self.is_exception_pending() {
            return Err(HostStatus::PendingException);
        }
        self.check(this)?;
        for arg in args {
            self.check(*arg)?;
        }

        let callback = self.with_cell(function, |cell| match cell {
            HostCell::Function { callback, .. } => Ok(Arc::clone(callback)),
            _ => Err(HostStatus::FunctionExpected),
        })?;

        let info = CallbackInfo {
            this,
            args: args.to_vec(),
        };
        let result = callback(self, &info)?;
        if self.is_exception_pending() {
            return Err(HostStatus::PendingException);
        }
        self.check(result)?;
        Ok(result)
    }

    /// Record `value` as the pending exception.
    pub fn throw_value(&self, value: HostValue) -> Result<(), HostStatus> {
        self.check(value)?;
        let mut heap = self.heap();
        if heap.pending_exception.is_some() {
            return Err(HostStatus::PendingException);
        }
        heap.pending_exception = Some(value);
        Ok(())
    }

    /// Throw `new Error(message)`.
    pub fn throw_error(&self, message: &str) -> Result<(), HostStatus> {
        let message = self.create_string_utf8(message)?;
        let error = self.create_error(message)?;
        self.throw_value(error)
    }

    pub fn is_exception_pending(&self) -> bool {
        self.heap().pending_exception.is_some()
    }

    pub fn get_and_clear_last_exception(&self) -> Option<HostValue> {
        self.heap().pending_exception.take()
    }

    // References

    pub fn create_reference(
        &self,
        value: HostValue,
        initial_count: u32,
    ) -> Result<HostReference, HostStatus> {
        self.check(value)?;
        let mut heap = self.heap();
        if !heap.cells.contains(value.slot) {
            return Err(HostStatus::InvalidHandle);
        }
        let id = heap.next_reference;
        heap.next_reference += 1;
        heap.references.insert(
            id,
            ReferenceEntry {
                value,
                count: initial_count,
            },
        );
        Ok(HostReference {
            env: self.inner.id,
            id,
        })
    }

    fn with_reference<R>(
        &self,
        reference: HostReference,
        f: impl FnOnce(&mut ReferenceEntry) -> Result<R, HostStatus>,
    ) -> Result<R, HostStatus> {
        if reference.env != self.inner.id {
            return Err(HostStatus::WrongEnvironment);
        }
        let mut heap = self.heap();
        let entry = heap
            .references
            .get_mut(&reference.id)
            .ok_or(HostStatus::InvalidArg)?;
        f(entry)
    }

    pub fn reference_ref(&self, reference: HostReference) -> Result<u32, HostStatus> {
        self.with_reference(reference, |entry| {
            entry.count = entry.count.saturating_add(1);
            Ok(entry.count)
        })
    }

    pub fn reference_unref(&self, reference: HostReference) -> Result<u32, HostStatus> {
        self.with_reference(reference, |entry| {
            if entry.count == 0 {
                return Err(HostStatus::InvalidArg);
            }
            entry.count -= 1;
            Ok(entry.count)
        })
    }

    pub fn delete_reference(&self, reference: HostReference) -> Result<(), HostStatus> {
        if reference.env != self.inner.id {
            return Err(HostStatus::WrongEnvironment);
        }
        match self.heap().references.remove(&reference.id) {
            Some(_) => Ok(()),
            None => Err(HostStatus::InvalidArg),
        }
    }

    /// Referenced value, or `None` once a weak (count 0) target has been collected.
    pub fn get_reference_value(
        &self,
        reference: HostReference,
    ) -> Result<Option<HostValue>, HostStatus> {
        let value = self.with_reference(reference, |entry| Ok(entry.value))?;
        Ok(self.is_live(value).then_some(value))
    }

    /// Hold a strong reference to `value` until the guard is dropped.
    pub fn retain(&self, value: HostValue) -> Result<HostRetained, HostStatus> {
        let reference = self.create_reference(value, 1)?;
        Ok(HostRetained {
            env: self.downgrade(),
            reference,
            value,
        })
    }

    // Memory

    /// Free everything not reachable from a strong reference or the pending exception.
    pub fn collect_garbage(&self) -> usize {
        let freed = {
            let mut heap = self.heap();
            let mut reachable = AHashSet::new();
            let mut worklist: Vec<SlotId> = heap
                .references
                .values()
                .filter(|entry| entry.count > 0)
                .map(|entry| entry.value.slot)
                .chain(heap.pending_exception.map(|value| value.slot))
                .collect();

            while let Some(slot) = worklist.pop() {
                if !reachable.insert(slot) {
                    continue;
                }
                match heap.cells.get(slot) {
                    Some(HostCell::Object { properties, .. }) => {
                        worklist.extend(properties.values().map(|value| value.slot));
                    }
                    Some(HostCell::Array(elements)) => {
                        worklist.extend(elements.values().map(|value| value.slot));
                    }
                    _ => {}
                }
            }

            heap.cells.sweep(&reachable)
        };

        let count = freed.len();
        drop(freed);
        debug!(env = %self.inner.id, freed = count, "host heap collected");
        count
    }

    /// Live cells, the preallocated singletons excluded
    pub fn live_cells(&self) -> usize {
        self.heap().cells.live()
    }

    /// Make the `n`-th following allocation fail once (`1` fails the next one).
    pub fn fail_nth_allocation(&self, n: u64) {
        self.heap().cells.fail_nth_allocation(n);
    }

    /// Free one cell right away; used to roll back a failed conversion.
    pub(crate) fn release(&self, value: HostValue) -> bool {
        if !self.owns(value) {
            return false;
        }
        let cell = self.heap().cells.free(value.slot);
        cell.is_some()
    }
}

/// Strong reference that is deleted when the guard drops
pub struct HostRetained {
    env: WeakHostEnvironment,
    reference: HostReference,
    value: HostValue,
}

impl HostRetained {
    pub fn value(&self) -> HostValue {
        self.value
    }
}

impl Drop for HostRetained {
    fn drop(&mut self) {
        if let Some(env) = self.env.upgrade() {
            // Already deleted is fine.
            let _ = env.delete_reference(self.reference);
        }
    }
}
