//! Pluggable context types
//!
//! A context type is a named category of ambient per-thread state (identity,
//! locale, transaction association). The framework depends only on the
//! three-operation contract in [`ContextProvider`]: snapshot the calling
//! thread, install a snapshot (or clear) on an executing thread, and put the
//! displaced state back afterwards.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};

/// Opaque snapshot of one context type's ambient value on one thread.
pub type ContextCapture = Box<dyn Any + Send + Sync>;

/// Opaque state displaced from an executing thread by `establish`, owed back
/// to that thread via `restore`.
pub type PriorContext = Box<dyn Any + Send>;

/// One category of ambient per-thread state.
///
/// All three operations are synchronous and must be cheap. A provider whose
/// capture or restore blocks on I/O is an implementation defect, not a
/// condition this framework handles.
pub trait ContextProvider: Send + Sync + 'static {
    /// Stable name of this context type, unique within a service.
    fn context_type(&self) -> &str;

    /// Snapshot the calling thread's ambient value for this type.
    ///
    /// Returns `None` when the calling thread has no ambient value; the
    /// capture as a whole still succeeds and this type degrades to a
    /// clear-marker.
    fn capture(&self) -> Option<ContextCapture>;

    /// Install `capture` on the current thread (`None` clears the type),
    /// returning whatever state it displaced.
    fn establish(&self, capture: Option<&ContextCapture>) -> PriorContext;

    /// Reinstate state previously displaced by `establish` on this thread.
    fn restore(&self, prior: PriorContext);
}

/// Context provider backed by a per-thread value table.
///
/// Each instance owns one named slot of ambient state per thread. Embedders
/// keep a handle to call [`set`](Self::set) / [`get`](Self::get) on their own
/// threads and register a clone of the `Arc` with the context service so
/// captures flow through task submission.
pub struct ThreadStateProvider<T> {
    name: String,
    slots: Mutex<HashMap<ThreadId, T>>,
}

impl<T: Clone + Send + Sync + 'static> ThreadStateProvider<T> {
    /// Create a provider for the given context type name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Set the current thread's ambient value.
    pub fn set(&self, value: T) {
        self.slots().insert(thread::current().id(), value);
    }

    /// Get the current thread's ambient value, if any.
    pub fn get(&self) -> Option<T> {
        self.slots().get(&thread::current().id()).cloned()
    }

    /// Remove and return the current thread's ambient value.
    pub fn remove(&self) -> Option<T> {
        self.slots().remove(&thread::current().id())
    }

    /// Number of threads currently holding a value for this type.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Whether no thread currently holds a value for this type.
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    // A panicking delegate unwinds through establish/restore; the table must
    // stay usable afterwards, so poison is stripped rather than propagated.
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + Sync + 'static> ContextProvider for ThreadStateProvider<T> {
    fn context_type(&self) -> &str {
        &self.name
    }

    fn capture(&self) -> Option<ContextCapture> {
        self.get().map(|value| Box::new(value) as ContextCapture)
    }

    fn establish(&self, capture: Option<&ContextCapture>) -> PriorContext {
        let id = thread::current().id();
        let incoming = capture.and_then(|c| c.downcast_ref::<T>()).cloned();
        let prior = match incoming {
            Some(value) => self.slots().insert(id, value),
            None => self.slots().remove(&id),
        };
        Box::new(prior) as PriorContext
    }

    fn restore(&self, prior: PriorContext) {
        let id = thread::current().id();
        if let Ok(prior) = prior.downcast::<Option<T>>() {
            match *prior {
                Some(value) => {
                    self.slots().insert(id, value);
                }
                None => {
                    self.slots().remove(&id);
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for ThreadStateProvider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadStateProvider")
            .field("name", &self.name)
            .finish()
    }
}
