//! Effect Implementation
//!
//! An Effect is a terminal side-effecting computation that re-runs
//! whenever anything it read on its last run changes.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs immediately to establish its
//!    initial dependencies.
//!
//! 2. When a dependency changes, the effect is queued by the
//!    propagation pass and re-run once per batch, after every other
//!    node has settled.
//!
//! 3. Each run replaces the dependency set with what was actually read,
//!    so edges from branches not taken this time are dropped.
//!
//! Effects are the graph's liveness roots: everything an effect reads,
//! directly or through any number of derivation stages, counts as
//! observed, which is what drives lazy resource activation.
//!
//! # Failure
//!
//! A panic in the body is caught at the node boundary, logged, and
//! skipped; the rest of the graph keeps running.
//!
//! # Disposal
//!
//! `dispose` halts re-runs, releases the effect's edges (and with them
//! its contribution to liveness) and invokes the cleanup closure, if one
//! was given.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::runtime::{ReactiveNode, Runtime};
use super::subscriber::SubscriberId;
use crate::graph::node::{NodeKind, SourceId};

/// A side-effecting computation that re-runs when dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 0);
///
/// let count2 = count.clone();
/// let effect = Effect::new(&rt, move || {
///     println!("count is {}", count2.get());
/// });
///
/// count.set(5); // prints "count is 5"
/// ```
pub struct Effect {
    runtime: Runtime,
    inner: Arc<EffectInner>,
}

struct EffectInner {
    subscriber: SubscriberId,
    run: Box<dyn Fn() + Send + Sync>,
    cleanup: Option<Box<dyn Fn() + Send + Sync>>,
    disposed: AtomicBool,
    run_count: AtomicUsize,
}

impl Effect {
    /// Create an effect and run it immediately.
    pub fn new<F>(runtime: &Runtime, run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(runtime, Box::new(run), None)
    }

    /// Create an effect with a cleanup closure, invoked on disposal.
    pub fn with_cleanup<F, C>(runtime: &Runtime, run: F, cleanup: C) -> Self
    where
        F: Fn() + Send + Sync + 'static,
        C: Fn() + Send + Sync + 'static,
    {
        Self::build(runtime, Box::new(run), Some(Box::new(cleanup)))
    }

    fn build(
        runtime: &Runtime,
        run: Box<dyn Fn() + Send + Sync>,
        cleanup: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Self {
        let subscriber = SubscriberId::new();
        let inner = Arc::new(EffectInner {
            subscriber,
            run,
            cleanup,
            disposed: AtomicBool::new(false),
            run_count: AtomicUsize::new(0),
        });
        runtime.register_subscriber(
            subscriber,
            Arc::downgrade(&inner) as std::sync::Weak<dyn ReactiveNode>,
            NodeKind::Effect,
            None,
            true,
        );

        // Establish initial dependencies.
        inner.execute(runtime);

        Self {
            runtime: runtime.clone(),
            inner,
        }
    }

    /// Halt re-runs, release the effect's edges and run cleanup.
    ///
    /// Idempotent; only the first call does anything.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.runtime.drop_subscriber(self.inner.subscriber);
        if let Some(cleanup) = &self.inner.cleanup {
            cleanup();
        }
    }

    /// Whether the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// How many times the effect has run. Orchestrators running in
    /// continuous mode watch this to emit change notifications.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }
}

impl EffectInner {
    fn execute(&self, rt: &Runtime) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let outcome = rt.tracked_run(self.subscriber, || {
            catch_unwind(AssertUnwindSafe(|| (self.run)()))
        });
        if outcome.is_err() {
            tracing::error!("effect body panicked; skipping this run");
        }

        self.run_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl ReactiveNode for EffectInner {
    fn invalidate(&self, _rt: &Runtime) -> Option<SourceId> {
        // Effects have no output; the pass queues them via `run_effect`.
        None
    }

    fn run_effect(&self, rt: &Runtime) {
        self.execute(rt);
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
