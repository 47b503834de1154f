//! Lazy Resource Lifecycle
//!
//! A `LazyResource` pairs the acquisition and release of an external
//! resource (a filesystem watcher, a socket, a subprocess) with the
//! liveness of the graph node it is attached to. The runtime invokes
//! `on_live` exactly once when the node's live-subscriber count rises
//! from zero, and `on_idle` exactly once when it falls back to zero.
//! Liveness is counted transitively through every derivation stage, so a
//! collection observed only at the far end of a chain still activates
//! its watcher.
//!
//! Activation failure is latched: the error is logged once, kept for the
//! orchestrator to inspect, and the resource is never retried. The
//! source degrades to non-incremental instead of crashing the graph.

use parking_lot::Mutex;

use crate::error::ResourceError;

enum ResourceState {
    Idle,
    Active,
    Failed(ResourceError),
}

/// An acquisition/release pair bound to a node's transitive liveness.
pub struct LazyResource {
    activate: Box<dyn Fn() -> Result<(), ResourceError> + Send + Sync>,
    deactivate: Box<dyn Fn() + Send + Sync>,
    state: Mutex<ResourceState>,
}

impl LazyResource {
    /// Create a resource from an activate/deactivate pair.
    ///
    /// Neither closure is invoked until the owning node gains or loses
    /// its first live subscriber.
    pub fn new<A, D>(activate: A, deactivate: D) -> Self
    where
        A: Fn() -> Result<(), ResourceError> + Send + Sync + 'static,
        D: Fn() + Send + Sync + 'static,
    {
        Self {
            activate: Box::new(activate),
            deactivate: Box::new(deactivate),
            state: Mutex::new(ResourceState::Idle),
        }
    }

    /// Whether the resource is currently held.
    pub fn is_active(&self) -> bool {
        matches!(*self.state.lock(), ResourceState::Active)
    }

    /// The latched activation failure, if any.
    pub fn error(&self) -> Option<ResourceError> {
        match &*self.state.lock() {
            ResourceState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Called by the runtime on a 0 -> 1 live-subscriber transition.
    pub(crate) fn on_live(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, ResourceState::Idle) {
            return;
        }
        match (self.activate)() {
            Ok(()) => *state = ResourceState::Active,
            Err(err) => {
                tracing::error!(error = %err, "resource activation failed; source degrades to non-incremental");
                *state = ResourceState::Failed(err);
            }
        }
    }

    /// Called by the runtime on a 1 -> 0 live-subscriber transition.
    pub(crate) fn on_idle(&self) {
        let mut state = self.state.lock();
        if matches!(*state, ResourceState::Active) {
            (self.deactivate)();
            *state = ResourceState::Idle;
        }
    }
}

impl std::fmt::Debug for LazyResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyResource")
            .field("active", &self.is_active())
            .field("error", &self.error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    fn counting_resource() -> (LazyResource, Arc<AtomicI32>, Arc<AtomicI32>) {
        let up = Arc::new(AtomicI32::new(0));
        let down = Arc::new(AtomicI32::new(0));
        let up2 = up.clone();
        let down2 = down.clone();
        let resource = LazyResource::new(
            move || {
                up2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move || {
                down2.fetch_add(1, Ordering::SeqCst);
            },
        );
        (resource, up, down)
    }

    #[test]
    fn activates_and_deactivates_once_per_transition() {
        let (resource, up, down) = counting_resource();

        resource.on_live();
        assert!(resource.is_active());
        assert_eq!(up.load(Ordering::SeqCst), 1);

        // Already active: a second notification is a no-op.
        resource.on_live();
        assert_eq!(up.load(Ordering::SeqCst), 1);

        resource.on_idle();
        assert!(!resource.is_active());
        assert_eq!(down.load(Ordering::SeqCst), 1);

        // A later cycle re-acquires.
        resource.on_live();
        assert_eq!(up.load(Ordering::SeqCst), 2);
        resource.on_idle();
        assert_eq!(down.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_is_latched_and_never_retried() {
        let attempts = Arc::new(AtomicI32::new(0));
        let attempts2 = attempts.clone();
        let resource = LazyResource::new(
            move || {
                attempts2.fetch_add(1, Ordering::SeqCst);
                Err(ResourceError::Activation("watch limit reached".into()))
            },
            || {},
        );

        resource.on_live();
        assert!(!resource.is_active());
        assert!(resource.error().is_some());

        resource.on_live();
        resource.on_idle();
        resource.on_live();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
