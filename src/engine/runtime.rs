// src/engine/runtime.rs
//! Engine runtime: owner of the engine-model heap
//!
//! The heap is a mark/sweep collected arena. Nothing is collected until
//! `collect_garbage` runs, and only values reachable from a persistent root
//! survive it. Function cells are opaque to the marker, so anything a
//! callable captures must be rooted by the callable itself.

use super::value::{EngineKind, EngineRef, EngineValue};
use crate::config::HeapLimits;
use crate::heap::{lock, AllocError, Arena, Elements, HeapId, PropertyKey, PropertyMap};
use crate::task::{ScheduleError, TaskQueue};
use ahash::{AHashMap, AHashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::ThreadId;
use thiserror::Error;
use tracing::debug;

/// Errors raised by engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A JS exception; the payload is the thrown value
    #[error("uncaught exception: {0}")]
    Thrown(EngineValue),

    #[error("value is not an object")]
    NotAnObject,

    #[error("value is not an array")]
    NotAnArray,

    #[error("value is not a function")]
    NotAFunction,

    #[error("handle refers to a released or collected cell")]
    DanglingHandle,

    #[error("value belongs to another runtime")]
    ForeignValue,

    #[error(transparent)]
    Allocation(#[from] AllocError),
}

/// Native implementation behind an engine function: `(runtime, this, args)`
pub type EngineCallable = Arc<
    dyn Fn(&EngineRuntime, &EngineValue, &[EngineValue]) -> Result<EngineValue, EngineError>
        + Send
        + Sync,
>;

pub(crate) enum EngineCell {
    Object {
        properties: PropertyMap<EngineValue>,
        error: bool,
    },
    Array(Elements<EngineValue>),
    Function {
        name: String,
        callable: EngineCallable,
    },
    Symbol {
        description: Option<String>,
    },
}

/// Persistent root handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(u64);

struct EngineHeap {
    cells: Arena<EngineCell>,
    roots: AHashMap<RootId, EngineValue>,
    next_root: u64,
}

struct EngineInner {
    id: HeapId,
    heap: Mutex<EngineHeap>,
    queue: TaskQueue,
}

/// Handle to an engine runtime. Clones share the same heap.
#[derive(Clone)]
pub struct EngineRuntime {
    inner: Arc<EngineInner>,
}

/// Non-owning runtime handle held by shims living in the other heap
#[derive(Clone)]
pub struct WeakEngineRuntime {
    inner: Weak<EngineInner>,
}

impl WeakEngineRuntime {
    pub fn upgrade(&self) -> Option<EngineRuntime> {
        self.inner.upgrade().map(|inner| EngineRuntime { inner })
    }
}

impl fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRuntime")
            .field("id", &self.inner.id)
            .field("owner", &self.owner_thread())
            .finish()
    }
}

impl Default for EngineRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRuntime {
    /// Create a runtime owned by the calling thread.
    pub fn new() -> Self {
        Self::with_limits(HeapLimits::default())
    }

    pub fn with_limits(limits: HeapLimits) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                id: HeapId::next(),
                heap: Mutex::new(EngineHeap {
                    cells: Arena::new(limits),
                    roots: AHashMap::new(),
                    next_root: 0,
                }),
                queue: TaskQueue::new(),
            }),
        }
    }

    pub fn id(&self) -> HeapId {
        self.inner.id
    }

    pub fn downgrade(&self) -> WeakEngineRuntime {
        WeakEngineRuntime {
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

    /// Run calls marshalled onto this runtime's thread.
    pub fn run_pending(&self) -> Result<usize, ScheduleError> {
        self.inner.queue.run_pending()
    }

    /// Keep running marshalled calls until `done` returns true.
    pub fn run_until(&self, done: impl FnMut() -> bool) -> Result<usize, ScheduleError> {
        self.inner.queue.run_until(done)
    }

    /// Whether `value` was created by this runtime (scalars belong to every runtime).
    pub fn owns(&self, value: &EngineValue) -> bool {
        value.heap_ref().map_or(true, |r| r.heap == self.inner.id)
    }

    #[inline]
    fn heap(&self) -> MutexGuard<'_, EngineHeap> {
        lock(&self.inner.heap)
    }

    fn check_owned(&self, value: &EngineValue) -> Result<(), EngineError> {
        if self.owns(value) {
            Ok(())
        } else {
            Err(EngineError::ForeignValue)
        }
    }

    fn resolve(&self, value: &EngineValue) -> Result<EngineRef, EngineError> {
        let r = value.heap_ref().ok_or(EngineError::NotAnObject)?;
        if r.heap != self.inner.id {
            return Err(EngineError::ForeignValue);
        }
        Ok(r)
    }

    fn with_cell<R>(
        &self,
        value: &EngineValue,
        f: impl FnOnce(&EngineCell) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let r = self.resolve(value)?;
        let heap = self.heap();
        let cell = heap.cells.get(r.slot).ok_or(EngineError::DanglingHandle)?;
        f(cell)
    }

    fn with_cell_mut<R>(
        &self,
        value: &EngineValue,
        f: impl FnOnce(&mut EngineCell) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let r = self.resolve(value)?;
        let mut heap = self.heap();
        let cell = heap
            .cells
            .get_mut(r.slot)
            .ok_or(EngineError::DanglingHandle)?;
        f(cell)
    }

    fn alloc(&self, cell: EngineCell) -> Result<EngineRef, EngineError> {
        let mut heap = self.heap();
        // On rejection the guard drops before `cell`, so captured handles are
        // released outside the lock.
        heap.cells.reserve()?;
        let slot = heap.cells.insert(cell);
        Ok(EngineRef {
            heap: self.inner.id,
            slot,
        })
    }

    // Construction

    pub fn create_object(&self) -> Result<EngineValue, EngineError> {
        self.alloc(EngineCell::Object {
            properties: PropertyMap::new(),
            error: false,
        })
        .map(EngineValue::Object)
    }

    /// Create an array of `length` holes.
    pub fn create_array(&self, length: usize) -> Result<EngineValue, EngineError> {
        self.alloc(EngineCell::Array(Elements::with_length(length)?))
            .map(EngineValue::Object)
    }

    pub fn create_array_from<I>(&self, elements: I) -> Result<EngineValue, EngineError>
    where
        I: IntoIterator<Item = EngineValue>,
    {
        let elements = elements
            .into_iter()
            .map(|element| self.check_owned(&element).map(|()| element))
            .collect::<Result<Vec<_>, _>>()?;
        self.alloc(EngineCell::Array(Elements::from_values(elements)?))
            .map(EngineValue::Object)
    }

    /// Create an `Error` instance; `name` and `message` are non-enumerable like in JS.
    pub fn create_error(&self, message: &str) -> Result<EngineValue, EngineError> {
        let mut properties = PropertyMap::new();
        properties.define("name".into(), EngineValue::from("Error"), false);
        properties.define("message".into(), EngineValue::from(message), false);
        self.alloc(EngineCell::Object {
            properties,
            error: true,
        })
        .map(EngineValue::Object)
    }

    /// Build the error a callable returns to throw `new Error(message)`.
    pub fn throw_error(&self, message: &str) -> EngineError {
        match self.create_error(message) {
            Ok(error) => EngineError::Thrown(error),
            Err(err) => err,
        }
    }

    pub fn create_symbol(&self, description: Option<&str>) -> Result<EngineValue, EngineError> {
        self.alloc(EngineCell::Symbol {
            description: description.map(str::to_string),
        })
        .map(EngineValue::Symbol)
    }

    pub fn create_function<F>(&self, name: &str, callable: F) -> Result<EngineValue, EngineError>
    where
        F: Fn(&EngineRuntime, &EngineValue, &[EngineValue]) -> Result<EngineValue, EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.alloc(EngineCell::Function {
            name: name.to_string(),
            callable: Arc::new(callable),
        })
        .map(EngineValue::Object)
    }

    // Inspection

    pub fn kind_of(&self, value: &EngineValue) -> Result<EngineKind, EngineError> {
        let kind = match value {
            EngineValue::Undefined => EngineKind::Undefined,
            EngineValue::Null => EngineKind::Null,
            EngineValue::Bool(_) => EngineKind::Boolean,
            EngineValue::Number(_) => EngineKind::Number,
            EngineValue::String(_) => EngineKind::String,
            EngineValue::Symbol(_) | EngineValue::Object(_) => self.with_cell(value, |cell| {
                Ok(match cell {
                    EngineCell::Object { .. } => EngineKind::Object,
                    EngineCell::Array(_) => EngineKind::Array,
                    EngineCell::Function { .. } => EngineKind::Function,
                    EngineCell::Symbol { .. } => EngineKind::Symbol,
                })
            })?,
        };
        Ok(kind)
    }

    pub fn is_array(&self, value: &EngineValue) -> Result<bool, EngineError> {
        Ok(self.kind_of(value)? == EngineKind::Array)
    }

    pub fn is_function(&self, value: &EngineValue) -> Result<bool, EngineError> {
        Ok(self.kind_of(value)? == EngineKind::Function)
    }

    pub fn is_error(&self, value: &EngineValue) -> Result<bool, EngineError> {
        match value {
            EngineValue::Object(_) => self.with_cell(value, |cell| {
                Ok(matches!(cell, EngineCell::Object { error: true, .. }))
            }),
            _ => Ok(false),
        }
    }

    /// Whether the value's cell is still allocated (scalars always are).
    pub fn is_live(&self, value: &EngineValue) -> bool {
        match value.heap_ref() {
            Some(r) => r.heap == self.inner.id && self.heap().cells.contains(r.slot),
            None => true,
        }
    }

    // Arrays

    pub fn array_length(&self, array: &EngineValue) -> Result<usize, EngineError> {
        self.with_cell(array, |cell| match cell {
            EngineCell::Array(elements) => Ok(elements.len()),
            _ => Err(EngineError::NotAnArray),
        })
    }

    /// Element at `index`; `None` for a hole or an index past the end.
    pub fn get_index(
        &self,
        array: &EngineValue,
        index: usize,
    ) -> Result<Option<EngineValue>, EngineError> {
        self.with_cell(array, |cell| match cell {
            EngineCell::Array(elements) => Ok(elements.get(index).cloned()),
            _ => Err(EngineError::NotAnArray),
        })
    }

    /// Store an element, growing the array with holes when `index` is past the end.
    ///
    /// Indices at or above 2^32 - 1 fail with `AllocError::InvalidArrayLength`.
    pub fn set_index(
        &self,
        array: &EngineValue,
        index: usize,
        value: EngineValue,
    ) -> Result<(), EngineError> {
        self.check_owned(&value)?;
        self.with_cell_mut(array, |cell| match cell {
            EngineCell::Array(elements) => Ok(elements.set(index, value)?),
            _ => Err(EngineError::NotAnArray),
        })
    }

    /// Turn an element into a hole (`delete array[index]`).
    pub fn delete_index(&self, array: &EngineValue, index: usize) -> Result<(), EngineError> {
        self.with_cell_mut(array, |cell| match cell {
            EngineCell::Array(elements) => {
                elements.remove(index);
                Ok(())
            }
            _ => Err(EngineError::NotAnArray),
        })
    }

    // Properties

    pub fn set_property(
        &self,
        object: &EngineValue,
        key: impl Into<PropertyKey>,
        value: EngineValue,
    ) -> Result<(), EngineError> {
        self.check_owned(&value)?;
        let key = key.into();
        self.with_cell_mut(object, |cell| match cell {
            EngineCell::Object { properties, .. } => {
                properties.set(key, value);
                Ok(())
            }
            _ => Err(EngineError::NotAnObject),
        })
    }

    pub fn define_property(
        &self,
        object: &EngineValue,
        key: impl Into<PropertyKey>,
        value: EngineValue,
        enumerable: bool,
    ) -> Result<(), EngineError> {
        self.check_owned(&value)?;
        let key = key.into();
        self.with_cell_mut(object, |cell| match cell {
            EngineCell::Object { properties, .. } => {
                properties.define(key, value, enumerable);
                Ok(())
            }
            _ => Err(EngineError::NotAnObject),
        })
    }

    /// Own property lookup; missing keys read as `undefined`.
    pub fn get_property(
        &self,
        object: &EngineValue,
        key: impl Into<PropertyKey>,
    ) -> Result<EngineValue, EngineError> {
        let key = key.into();
        self.with_cell(object, |cell| match cell {
            EngineCell::Object { properties, .. } => Ok(properties
                .get(&key)
                .cloned()
                .unwrap_or(EngineValue::Undefined)),
            EngineCell::Array(elements) => Ok(match &key {
                PropertyKey::Index(index) => elements
                    .get(*index as usize)
                    .cloned()
                    .unwrap_or(EngineValue::Undefined),
                PropertyKey::Name(name) if name == "length" => {
                    EngineValue::Number(elements.len() as f64)
                }
                PropertyKey::Name(_) => EngineValue::Undefined,
            }),
            EngineCell::Function { name, .. } => Ok(match &key {
                PropertyKey::Name(key) if key == "name" => EngineValue::String(name.clone()),
                _ => EngineValue::Undefined,
            }),
            EngineCell::Symbol { .. } => Err(EngineError::NotAnObject),
        })
    }

    pub fn has_own_property(
        &self,
        object: &EngineValue,
        key: impl Into<PropertyKey>,
    ) -> Result<bool, EngineError> {
        let key = key.into();
        self.with_cell(object, |cell| match cell {
            EngineCell::Object { properties, .. } => Ok(properties.contains(&key)),
            EngineCell::Array(elements) => Ok(match &key {
                PropertyKey::Index(index) => elements.contains(*index as usize),
                PropertyKey::Name(name) => name == "length",
            }),
            EngineCell::Function { .. } => Ok(matches!(&key, PropertyKey::Name(n) if n == "name")),
            EngineCell::Symbol { .. } => Err(EngineError::NotAnObject),
        })
    }

    /// Own enumerable keys in the order a `for...in` over own properties observes them.
    pub fn own_enumerable_keys(&self, object: &EngineValue) -> Result<Vec<PropertyKey>, EngineError> {
        self.with_cell(object, |cell| match cell {
            EngineCell::Object { properties, .. } => Ok(properties.enumerable_keys()),
            EngineCell::Array(elements) => Ok(elements
                .indices()
                .map(|index| PropertyKey::Index(index as u32))
                .collect()),
            EngineCell::Function { .. } => Ok(Vec::new()),
            EngineCell::Symbol { .. } => Err(EngineError::NotAnObject),
        })
    }

    /// The `message` of an `Error` instance, `None` for anything else.
    pub fn error_message(&self, value: &EngineValue) -> Result<Option<String>, EngineError> {
        if !self.is_error(value)? {
            return Ok(None);
        }
        match self.get_property(value, "message")? {
            EngineValue::String(message) => Ok(Some(message)),
            _ => Ok(None),
        }
    }

    pub fn symbol_description(&self, symbol: &EngineValue) -> Result<Option<String>, EngineError> {
        self.with_cell(symbol, |cell| match cell {
            EngineCell::Symbol { description } => Ok(description.clone()),
            _ => Err(EngineError::NotAnObject),
        })
    }

    pub fn function_name(&self, function: &EngineValue) -> Result<String, EngineError> {
        self.with_cell(function, |cell| match cell {
            EngineCell::Function { name, .. } => Ok(name.clone()),
            _ => Err(EngineError::NotAFunction),
        })
    }

    // Calls

    /// Invoke a function. A JS throw comes back as `EngineError::Thrown`.
    pub fn call(
        &self,
        function: &EngineValue,
        this: &EngineValue,
        args: &[EngineValue],
    ) -> Result<EngineValue, EngineError> {
        if function.as_object().is_none() {
            return Err(EngineError::NotAFunction);
        }
        self.check_owned(this)?;
        for arg in args {
            self.check_owned(arg)?;
        }

        let callable = self.with_cell(function, |cell| match cell {
            EngineCell::Function { callable, .. } => Ok(Arc::clone(callable)),
            _ => Err(EngineError::NotAFunction),
        })?;

        // The heap lock is not held here; callables may re-enter the runtime.
        callable(self, this, args)
    }

    // Memory

    pub fn root(&self, value: EngineValue) -> RootId {
        let mut heap = self.heap();
        let id = RootId(heap.next_root);
        heap.next_root += 1;
        heap.roots.insert(id, value);
        id
    }

    pub fn unroot(&self, id: RootId) -> bool {
        self.heap().roots.remove(&id).is_some()
    }

    /// Root `value` until the returned guard is dropped.
    pub fn root_guard(&self, value: EngineValue) -> EngineRoot {
        let id = self.root(value.clone());
        EngineRoot {
            runtime: self.downgrade(),
            id,
            value,
        }
    }

    /// Mark from the persistent roots and free everything unreachable.
    pub fn collect_garbage(&self) -> usize {
        let freed = {
            let mut heap = self.heap();
            let mut reachable = AHashSet::new();
            let mut worklist: Vec<EngineRef> = heap
                .roots
                .values()
                .filter_map(EngineValue::heap_ref)
                .collect();

            while let Some(r) = worklist.pop() {
                if r.heap != self.inner.id || !reachable.insert(r.slot) {
                    continue;
                }
                match heap.cells.get(r.slot) {
                    Some(EngineCell::Object { properties, .. }) => {
                        worklist.extend(properties.values().filter_map(EngineValue::heap_ref));
                    }
                    Some(EngineCell::Array(elements)) => {
                        worklist.extend(elements.values().filter_map(EngineValue::heap_ref));
                    }
                    _ => {}
                }
            }

            heap.cells.sweep(&reachable)
        };

        let count = freed.len();
        // Freed cells may hold shims whose drop touches the other heap.
        drop(freed);
        debug!(runtime = %self.inner.id, freed = count, "engine heap collected");
        count
    }

    pub fn live_cells(&self) -> usize {
        self.heap().cells.live()
    }

    /// Make the `n`-th following allocation fail once (`1` fails the next one).
    pub fn fail_nth_allocation(&self, n: u64) {
        self.heap().cells.fail_nth_allocation(n);
    }

    /// Free one cell right away; used to roll back a failed conversion.
    pub(crate) fn release(&self, r: EngineRef) -> bool {
        if r.heap != self.inner.id {
            return false;
        }
        let cell = self.heap().cells.free(r.slot);
        cell.is_some()
    }
}

/// Keeps a value rooted for as long as the guard lives
pub struct EngineRoot {
    runtime: WeakEngineRuntime,
    id: RootId,
    value: EngineValue,
}

impl EngineRoot {
    pub fn value(&self) -> &EngineValue {
        &self.value
    }
}

impl Drop for EngineRoot {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.unroot(self.id);
        }
    }
}
