//! Signal Implementation
//!
//! A Signal is the fundamental observable primitive. It holds a directly
//! set value and records which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read while a computation is being tracked, the
//!    read is recorded as a dependency edge for that computation.
//!
//! 2. When a signal's value is written, the runtime queues the change;
//!    the enclosing batch propagates it to every dependent in dependency
//!    order.
//!
//! # Thread Safety
//!
//! The value sits behind a `RwLock`; registry bookkeeping lives in the
//! runtime's concurrent maps.

use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use super::runtime::Runtime;
use crate::graph::node::SourceId;

/// An observable value holding a `T`.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (dirties dependents)
/// count.set(5);
/// ```
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    runtime: Runtime,
    inner: Arc<SignalInner<T>>,
}

struct SignalInner<T> {
    source: SourceId,
    value: RwLock<T>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal in the given graph with an initial value.
    pub fn new(runtime: &Runtime, value: T) -> Self {
        let source = runtime.register_source(None);
        Self {
            runtime: runtime.clone(),
            inner: Arc::new(SignalInner {
                source,
                value: RwLock::new(value),
            }),
        }
    }

    /// Get the current value.
    ///
    /// If called while a computation is being tracked, registers that
    /// computation as a dependent.
    pub fn get(&self) -> T {
        self.runtime.track_read(self.inner.source);
        self.inner
            .value
            .read()
            .expect("value lock poisoned")
            .clone()
    }

    /// Get the current value without establishing a dependency.
    pub fn get_untracked(&self) -> T {
        self.inner
            .value
            .read()
            .expect("value lock poisoned")
            .clone()
    }

    /// Set a new value and dirty all dependents.
    pub fn set(&self, value: T) {
        {
            let mut guard = self.inner.value.write().expect("value lock poisoned");
            *guard = value;
        }
        self.runtime.mark_changed(self.inner.source);
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = {
            let guard = self.inner.value.read().expect("value lock poisoned");
            f(&guard)
        };
        self.set(next);
    }

    pub(crate) fn source(&self) -> SourceId {
        self.inner.source
    }
}

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.source.raw())
            .field("value", &self.get_untracked())
            .finish()
    }
}
