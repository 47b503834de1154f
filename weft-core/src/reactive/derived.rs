//! Derived Value Implementation
//!
//! A Derived is a cached synchronous value that re-evaluates only when
//! its dependencies change.
//!
//! # How Derived Values Work
//!
//! 1. On first access, the computation runs and the result is cached.
//!
//! 2. When a dependency changes, the propagation pass recomputes the
//!    value *eagerly* if anything downstream is listening, so tasks and
//!    effects later in the pass observe consistent upstream state. With
//!    no listeners, the value is just marked dirty and recomputes lazily
//!    on the next read.
//!
//! 3. A recomputation that produces an equal value (`PartialEq`) does
//!    not dirty downstream nodes.
//!
//! # Thread Safety
//!
//! The cached value and dirty state are behind locks; the computation
//! runs without any engine lock held.

use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use super::runtime::{ReactiveNode, Runtime};
use super::subscriber::SubscriberId;
use crate::graph::node::{DirtyState, NodeKind, SourceId};

/// A cached derived value that recomputes when dependencies change.
///
/// The `PartialEq` bound is what allows pruning: a recomputation whose
/// result equals the cached value stops propagation downstream.
pub struct Derived<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    runtime: Runtime,
    inner: Arc<DerivedInner<T>>,
}

struct DerivedInner<T> {
    subscriber: SubscriberId,
    source: SourceId,
    compute: Box<dyn Fn() -> T + Send + Sync>,
    value: RwLock<Option<T>>,
    state: RwLock<DirtyState>,
}

impl<T> Derived<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Create a derived value from a computation.
    ///
    /// The computation does not run until the first read.
    pub fn new<F>(runtime: &Runtime, compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let subscriber = SubscriberId::new();
        let source = runtime.register_source(Some(subscriber));
        let inner = Arc::new(DerivedInner {
            subscriber,
            source,
            compute: Box::new(compute),
            value: RwLock::new(None),
            state: RwLock::new(DirtyState::Dirty),
        });
        runtime.register_subscriber(
            subscriber,
            Arc::downgrade(&inner) as std::sync::Weak<dyn ReactiveNode>,
            NodeKind::Derived,
            Some(source),
            false,
        );
        Self {
            runtime: runtime.clone(),
            inner,
        }
    }

    /// Get the current value, recomputing if needed.
    pub fn get(&self) -> T {
        self.runtime.track_read(self.inner.source);

        let dirty = {
            let state = *self.inner.state.read().expect("state lock poisoned");
            state == DirtyState::Dirty
                || self
                    .inner
                    .value
                    .read()
                    .expect("value lock poisoned")
                    .is_none()
        };
        if dirty {
            self.inner.recompute(&self.runtime);
        }

        self.inner
            .value
            .read()
            .expect("value lock poisoned")
            .clone()
            .expect("clean derived value should be present")
    }

    /// Whether the computation has produced a cached value yet.
    pub fn has_value(&self) -> bool {
        self.inner
            .value
            .read()
            .expect("value lock poisoned")
            .is_some()
    }
}

impl<T> DerivedInner<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Run the computation under tracking and cache the result.
    /// Returns whether the value actually changed.
    fn recompute(&self, rt: &Runtime) -> bool {
        let new_value = rt.tracked_run(self.subscriber, || (self.compute)());

        let changed = {
            let current = self.value.read().expect("value lock poisoned");
            current.as_ref() != Some(&new_value)
        };

        *self.value.write().expect("value lock poisoned") = Some(new_value);
        *self.state.write().expect("state lock poisoned") = DirtyState::Clean;
        changed
    }
}

impl<T> ReactiveNode for DerivedInner<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    fn invalidate(&self, rt: &Runtime) -> Option<SourceId> {
        *self.state.write().expect("state lock poisoned") = DirtyState::Dirty;

        // Nobody downstream: stay dirty, recompute lazily on next read.
        if !rt.has_subscribers(self.source) {
            return None;
        }

        if self.recompute(rt) {
            rt.bump_version(self.source);
            Some(self.source)
        } else {
            None
        }
    }
}

impl<T> Clone for Derived<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Derived<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.inner.source.raw())
            .field("has_value", &self.has_value())
            .finish()
    }
}
