//! Reactive Runtime
//!
//! The runtime is the central coordinator of one build graph. It owns the
//! source and subscriber registries, the dependency edges between them,
//! the batch queue that coalesces writes into propagation passes, the
//! transitive liveness counts that drive lazy resources, and the pending
//! counter behind quiescence detection.
//!
//! # How It Works
//!
//! 1. Every readable thing (signal, store field, collection structure,
//!    collection item, task output) registers a source entry.
//!
//! 2. Every computation (derived value, task, derivation, effect)
//!    registers a subscriber entry holding a weak handle to the node.
//!
//! 3. When a computation runs, reads are collected on the evaluation
//!    stack and then *replace* the subscriber's previous dependency set.
//!    The edge diff also carries liveness: a live subscriber gaining or
//!    losing an edge bumps the source's live count, and 0/1 transitions
//!    cascade through owner nodes to the roots of the graph.
//!
//! 4. When a source changes, the runtime queues it; at the end of the
//!    enclosing batch one propagation pass runs all affected nodes in
//!    dependency order (see `graph::propagate`).
//!
//! # Thread Safety
//!
//! Registries are concurrent maps; the evaluation stack is thread-local.
//! The design assumes a single logical thread of control (a
//! current-thread tokio runtime): propagation is synchronous, and only
//! task futures suspend.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;

use super::context::{ReadSet, TrackFrame};
use super::subscriber::SubscriberId;
use crate::graph::node::{NodeKind, SourceId};
use crate::quiesce::PendingTasks;
use crate::resource::LazyResource;

/// A node that can be re-run by the propagation pass.
pub(crate) trait ReactiveNode: Send + Sync {
    /// Called in dependency order when one of the node's tracked sources
    /// changed. Returns the node's output source when the visible output
    /// changed, so propagation continues downstream.
    fn invalidate(&self, rt: &Runtime) -> Option<SourceId>;

    /// Run an effect body. Only meaningful for `NodeKind::Effect`; the
    /// pass routes effects here after every other node has settled.
    fn run_effect(&self, _rt: &Runtime) {}
}

/// Registry entry for one readable source.
pub(crate) struct SourceEntry {
    /// Subscribers currently holding an edge to this source.
    pub(crate) subscribers: HashSet<SubscriberId>,
    /// The subscriber whose output this source is, if any. Liveness
    /// flows through the owner to the owner's own dependencies.
    pub(crate) owner: Option<SubscriberId>,
    /// Transitive live-subscriber count.
    pub(crate) live: usize,
    /// Resource bound to this source's liveness.
    pub(crate) resource: Option<Arc<LazyResource>>,
    /// Bumped on every visible change.
    pub(crate) version: u64,
}

/// Registry entry for one subscriber.
pub(crate) struct SubscriberEntry {
    pub(crate) node: Weak<dyn ReactiveNode>,
    pub(crate) kind: NodeKind,
    /// The source this subscriber writes, if any (None for effects).
    pub(crate) out: Option<SourceId>,
    /// Dependency set from the most recent run. Replaced wholesale.
    pub(crate) deps: HashSet<SourceId>,
    /// Live units received from owned sources.
    pub(crate) live_units: usize,
    /// Effects are intrinsically live until disposed.
    pub(crate) live_root: bool,
}

impl SubscriberEntry {
    pub(crate) fn is_live(&self) -> bool {
        self.live_root || self.live_units > 0
    }
}

/// Write queue for the current batch.
pub(crate) struct BatchState {
    pub(crate) active: bool,
    pub(crate) queued: Vec<SourceId>,
    /// Sources whose teardown is deferred until the batch has drained,
    /// so their final change still reaches subscribers.
    pub(crate) retired: Vec<SourceId>,
}

pub(crate) struct RuntimeInner {
    pub(crate) sources: DashMap<SourceId, SourceEntry>,
    pub(crate) subscribers: DashMap<SubscriberId, SubscriberEntry>,
    pub(crate) batch: Mutex<BatchState>,
    pub(crate) pending: PendingTasks,
}

/// Handle to one build graph. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                sources: DashMap::new(),
                subscribers: DashMap::new(),
                batch: Mutex::new(BatchState {
                    active: false,
                    queued: Vec::new(),
                    retired: Vec::new(),
                }),
                pending: PendingTasks::new(),
            }),
        }
    }

    /// Run `f` with write propagation deferred: every source changed
    /// inside is collected and flows through a single propagation pass
    /// when the outermost batch ends, so effects re-run at most once for
    /// the whole batch.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let nested = {
            let mut b = self.inner.batch.lock();
            if b.active {
                true
            } else {
                b.active = true;
                false
            }
        };
        if nested {
            return f();
        }
        let guard = BatchGuard { runtime: self };
        let out = f();
        drop(guard);
        out
    }

    /// Resolve once every task in the graph has settled and stayed
    /// settled through a full propagation pass.
    ///
    /// Usable both one-shot (build, await, dispose the effects) and
    /// continuously (await once for initial-build confirmation, then keep
    /// observing effect re-runs).
    pub async fn await_quiescence(&self) {
        self.inner.pending.wait_idle().await;
    }

    // ------------------------------------------------------------------
    // Source registry
    // ------------------------------------------------------------------

    pub(crate) fn register_source(&self, owner: Option<SubscriberId>) -> SourceId {
        let id = SourceId::next();
        self.inner.sources.insert(
            id,
            SourceEntry {
                subscribers: HashSet::new(),
                owner,
                live: 0,
                resource: None,
                version: 0,
            },
        );
        id
    }

    pub(crate) fn set_source_owner(&self, id: SourceId, owner: SubscriberId) {
        let already_live = {
            let mut entry = match self.inner.sources.get_mut(&id) {
                Some(entry) => entry,
                None => return,
            };
            entry.owner = Some(owner);
            entry.live > 0
        };
        if already_live {
            self.bump_subscriber_live(owner, true);
        }
    }

    /// Tear a source down, or defer the teardown to the end of the
    /// active batch so its final change still reaches subscribers.
    pub(crate) fn retire_source(&self, id: SourceId) {
        {
            let mut b = self.inner.batch.lock();
            if b.active {
                b.retired.push(id);
                return;
            }
        }
        self.drop_source_now(id);
    }

    fn drop_source_now(&self, id: SourceId) {
        let entry = match self.inner.sources.remove(&id) {
            Some((_, entry)) => entry,
            None => return,
        };
        for sub in &entry.subscribers {
            if let Some(mut s) = self.inner.subscribers.get_mut(sub) {
                s.deps.remove(&id);
            }
        }
        if entry.live > 0 {
            if let Some(resource) = &entry.resource {
                resource.on_idle();
            }
            if let Some(owner) = entry.owner {
                self.bump_subscriber_live(owner, false);
            }
        }
    }

    pub(crate) fn attach_resource(&self, id: SourceId, resource: Arc<LazyResource>) {
        let live = {
            let mut entry = match self.inner.sources.get_mut(&id) {
                Some(entry) => entry,
                None => return,
            };
            entry.resource = Some(resource.clone());
            entry.live > 0
        };
        if live {
            resource.on_live();
        }
    }

    pub(crate) fn resource_of(&self, id: SourceId) -> Option<Arc<LazyResource>> {
        self.inner.sources.get(&id).and_then(|e| e.resource.clone())
    }

    pub(crate) fn has_subscribers(&self, id: SourceId) -> bool {
        self.inner
            .sources
            .get(&id)
            .map(|e| !e.subscribers.is_empty())
            .unwrap_or(false)
    }

    pub(crate) fn bump_version(&self, id: SourceId) {
        if let Some(mut entry) = self.inner.sources.get_mut(&id) {
            entry.version += 1;
        }
    }

    // ------------------------------------------------------------------
    // Subscriber registry
    // ------------------------------------------------------------------

    pub(crate) fn register_subscriber(
        &self,
        id: SubscriberId,
        node: Weak<dyn ReactiveNode>,
        kind: NodeKind,
        out: Option<SourceId>,
        live_root: bool,
    ) {
        self.inner.subscribers.insert(
            id,
            SubscriberEntry {
                node,
                kind,
                out,
                deps: HashSet::new(),
                live_units: 0,
                live_root,
            },
        );
    }

    pub(crate) fn drop_subscriber(&self, id: SubscriberId) {
        let entry = match self.inner.subscribers.remove(&id) {
            Some((_, entry)) => entry,
            None => return,
        };
        let live = entry.is_live();
        for dep in &entry.deps {
            let present = match self.inner.sources.get_mut(dep) {
                Some(mut s) => {
                    s.subscribers.remove(&id);
                    true
                }
                None => false,
            };
            if present && live {
                self.bump_source_live(*dep, false);
            }
        }
    }

    /// Register a permanent edge outside the tracking machinery.
    /// Derivations use this for their structural subscription.
    pub(crate) fn add_static_edge(&self, source: SourceId, sub: SubscriberId) {
        let live = {
            let mut e = match self.inner.subscribers.get_mut(&sub) {
                Some(e) => e,
                None => return,
            };
            e.deps.insert(source);
            e.is_live()
        };
        let present = match self.inner.sources.get_mut(&source) {
            Some(mut s) => {
                s.subscribers.insert(sub);
                true
            }
            None => false,
        };
        if present && live {
            self.bump_source_live(source, true);
        }
    }

    // ------------------------------------------------------------------
    // Dependency tracking
    // ------------------------------------------------------------------

    /// Record a read of `source` into the active evaluation frame, if any.
    pub(crate) fn track_read(&self, source: SourceId) {
        TrackFrame::record_read(source);
    }

    /// Run `f` under a tracking frame for `sub` and replace the
    /// subscriber's dependency set with the reads it collected.
    pub(crate) fn tracked_run<T>(&self, sub: SubscriberId, f: impl FnOnce() -> T) -> T {
        let frame = TrackFrame::enter(sub);
        let out = f();
        let reads = frame.finish();
        self.finish_tracking(sub, reads);
        out
    }

    fn finish_tracking(&self, sub: SubscriberId, reads: ReadSet) {
        let new_deps: HashSet<SourceId> = reads.into_iter().collect();
        let (added, removed, live) = {
            let mut e = match self.inner.subscribers.get_mut(&sub) {
                Some(e) => e,
                None => return,
            };
            let added: Vec<SourceId> = new_deps.difference(&e.deps).copied().collect();
            let removed: Vec<SourceId> = e.deps.difference(&new_deps).copied().collect();
            let live = e.is_live();
            e.deps = new_deps;
            (added, removed, live)
        };
        for source in added {
            let present = match self.inner.sources.get_mut(&source) {
                Some(mut s) => {
                    s.subscribers.insert(sub);
                    true
                }
                None => false,
            };
            if present && live {
                self.bump_source_live(source, true);
            }
        }
        for source in removed {
            let present = match self.inner.sources.get_mut(&source) {
                Some(mut s) => {
                    s.subscribers.remove(&sub);
                    true
                }
                None => false,
            };
            if present && live {
                self.bump_source_live(source, false);
            }
        }
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Effects call this on creation and disposal; owned-source
    /// transitions call it through `bump_source_live`.
    pub(crate) fn bump_subscriber_live(&self, id: SubscriberId, up: bool) {
        let (rising, deps) = {
            let mut e = match self.inner.subscribers.get_mut(&id) {
                Some(e) => e,
                None => return,
            };
            let before = e.is_live();
            if up {
                e.live_units += 1;
            } else {
                e.live_units = e.live_units.saturating_sub(1);
            }
            let after = e.is_live();
            if before == after {
                return;
            }
            (after, e.deps.iter().copied().collect::<Vec<_>>())
        };
        for dep in deps {
            self.bump_source_live(dep, rising);
        }
    }

    fn bump_source_live(&self, id: SourceId, up: bool) {
        let (rising, owner, resource) = {
            let mut e = match self.inner.sources.get_mut(&id) {
                Some(e) => e,
                None => return,
            };
            let before = e.live > 0;
            if up {
                e.live += 1;
            } else {
                e.live = e.live.saturating_sub(1);
            }
            let after = e.live > 0;
            if before == after {
                return;
            }
            (after, e.owner, e.resource.clone())
        };
        if rising {
            if let Some(resource) = resource {
                resource.on_live();
            }
            if let Some(owner) = owner {
                self.bump_subscriber_live(owner, true);
            }
        } else {
            if let Some(resource) = resource {
                resource.on_idle();
            }
            if let Some(owner) = owner {
                self.bump_subscriber_live(owner, false);
            }
        }
    }

    // ------------------------------------------------------------------
    // Change scheduling
    // ------------------------------------------------------------------

    /// Record a visible change of `source` and propagate: immediately
    /// when no batch is active, otherwise at the end of the batch.
    pub(crate) fn mark_changed(&self, source: SourceId) {
        self.bump_version(source);
        self.schedule(vec![source]);
    }

    pub(crate) fn schedule(&self, roots: Vec<SourceId>) {
        {
            let mut b = self.inner.batch.lock();
            b.queued.extend(roots);
            if b.active {
                return;
            }
            b.active = true;
        }
        self.drain();
    }

    fn drain(&self) {
        loop {
            let roots = {
                let mut b = self.inner.batch.lock();
                if b.queued.is_empty() {
                    b.active = false;
                    let retired = std::mem::take(&mut b.retired);
                    drop(b);
                    for id in retired {
                        self.drop_source_now(id);
                    }
                    return;
                }
                std::mem::take(&mut b.queued)
            };
            self.run_pass(roots);
        }
    }

    // ------------------------------------------------------------------
    // Pending-task accounting
    // ------------------------------------------------------------------

    pub(crate) fn pending_increment(&self) {
        self.inner.pending.increment();
    }

    pub(crate) fn pending_decrement(&self) {
        self.inner.pending.decrement();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("sources", &self.inner.sources.len())
            .field("subscribers", &self.inner.subscribers.len())
            .field("pending_tasks", &self.inner.pending.count())
            .finish()
    }
}

struct BatchGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut b = self.runtime.inner.batch.lock();
            b.active = false;
            b.queued.clear();
            b.retired.clear();
        } else {
            self.runtime.drain();
        }
    }
}
