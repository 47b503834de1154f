//! Collection Derivation
//!
//! `derive` maps a keyed collection into a parallel collection of tasks,
//! one per key. The mapping is incremental by construction:
//!
//! - upstream add    -> one task created for that key
//! - upstream remove -> that key's task cancelled and dropped
//! - upstream update -> that key's task invalidated; siblings untouched
//!
//! The result is a [`Stage`], itself backed by a `KeyedCollection`, so
//! stages chain: `files.derive(render).derive(bundle)`. Keys pass
//! through unchanged along the whole chain. A chained task reads its
//! upstream task with short-circuit semantics, so `Pending` and `Err`
//! flow to the frontier without invoking any transform.
//!
//! Each stage registers a relay node subscribed to its input's
//! structure. The relay does no recomputation (structural changes are
//! mirrored synchronously by the watcher) but it carries liveness: a
//! live effect iterating the frontier makes the relay live, which makes
//! the input structure live, and so on back to the root collection and
//! its attached resource.

use std::future::Future;
use std::sync::{Arc, Weak};

use crate::error::TaskError;
use crate::graph::node::{NodeKind, SourceId};
use crate::reactive::runtime::{ReactiveNode, Runtime};
use crate::reactive::subscriber::SubscriberId;
use crate::task::{Halt, Task, TaskFuture};

use super::keyed::{CollectionEvent, CollectionKey, KeyedCollection};

/// Liveness carrier for one derivation stage.
struct Relay {
    subscriber: SubscriberId,
}

impl ReactiveNode for Relay {
    fn invalidate(&self, _rt: &Runtime) -> Option<SourceId> {
        // Structure is mirrored by the watcher at mutation time; value
        // changes flow key-by-key through the tasks themselves.
        None
    }
}

/// A keyed collection of tasks mirroring an upstream collection.
pub struct Stage<K, B>
where
    K: CollectionKey,
    B: Clone + Send + Sync + 'static,
{
    tasks: KeyedCollection<K, Task<B>>,
    _relay: Arc<Relay>,
}

impl<K, B> Stage<K, B>
where
    K: CollectionKey,
    B: Clone + Send + Sync + 'static,
{
    fn build<SV>(
        source: &KeyedCollection<K, SV>,
        make_task: Arc<dyn Fn(&Runtime, &K) -> Task<B> + Send + Sync>,
    ) -> Self
    where
        SV: Clone + Send + Sync + 'static,
    {
        let rt = source.runtime().clone();
        let tasks: KeyedCollection<K, Task<B>> = KeyedCollection::new(&rt);
        let relay = Arc::new(Relay {
            subscriber: SubscriberId::new(),
        });
        rt.register_subscriber(
            relay.subscriber,
            Arc::downgrade(&relay) as Weak<dyn ReactiveNode>,
            NodeKind::Relay,
            Some(tasks.structure_source()),
            false,
        );
        rt.set_source_owner(tasks.structure_source(), relay.subscriber);
        rt.add_static_edge(source.structure_source(), relay.subscriber);

        // One task per pre-existing key.
        rt.batch(|| {
            for key in source.keys_untracked() {
                let task = (*make_task)(&rt, &key);
                let _ = tasks.insert(key, task);
            }
        });

        // Mirror structural changes from here on.
        let watcher_tasks = tasks.clone();
        let watcher_rt = rt.clone();
        let watcher_make = make_task.clone();
        source.watch(
            relay.subscriber,
            Arc::new(move |event| match event {
                CollectionEvent::Added(key) => {
                    let task = (*watcher_make)(&watcher_rt, key);
                    if watcher_tasks.insert(key.clone(), task).is_err() {
                        tracing::warn!(?key, "derived stage already tracks key");
                    }
                }
                CollectionEvent::Removed(key) => {
                    if let Some(task) = watcher_tasks.remove(key) {
                        task.retire();
                    }
                }
            }),
        );

        Self {
            tasks,
            _relay: relay,
        }
    }

    /// Chain another stage whose transform consumes this stage's
    /// settled values. Pending and failed upstream keys short-circuit.
    pub fn derive<C, F, Fut>(&self, transform: F) -> Stage<K, C>
    where
        C: Clone + Send + Sync + 'static,
        F: Fn(K, B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C, TaskError>> + Send + 'static,
    {
        let transform = Arc::new(transform);
        let upstream = self.tasks.clone();
        Stage::build(
            &self.tasks,
            Arc::new(move |rt: &Runtime, key: &K| {
                let upstream = upstream.clone();
                let transform = transform.clone();
                let key = key.clone();
                Task::new(rt, move |_ctx| {
                    let task = match upstream.get(&key) {
                        Some(task) => task,
                        None => return Err(Halt::Pending),
                    };
                    let value = task.read()?;
                    Ok(Box::pin((*transform)(key.clone(), value)) as TaskFuture<C>)
                })
            }),
        )
    }

    /// The backing collection of tasks.
    pub fn tasks(&self) -> &KeyedCollection<K, Task<B>> {
        &self.tasks
    }

    /// Look up one key's task.
    pub fn get(&self, key: &K) -> Option<Task<B>> {
        self.tasks.get(key)
    }

    /// Iterate `(key, task)` pairs in collection order.
    pub fn iter(&self) -> std::vec::IntoIter<(K, Task<B>)> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<K, V> KeyedCollection<K, V>
where
    K: CollectionKey,
    V: Clone + Send + Sync + 'static,
{
    /// Map this collection into a parallel collection of tasks, one per
    /// key, recomputing only keys whose input changed.
    pub fn derive<B, F, Fut>(&self, transform: F) -> Stage<K, B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(K, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<B, TaskError>> + Send + 'static,
    {
        let transform = Arc::new(transform);
        let source = self.clone();
        Stage::build(
            self,
            Arc::new(move |rt: &Runtime, key: &K| {
                let source = source.clone();
                let transform = transform.clone();
                let key = key.clone();
                Task::new(rt, move |_ctx| {
                    // The key can race out between invalidation and this
                    // run; the removal cascade retires the task shortly.
                    let value = match source.get(&key) {
                        Some(value) => value,
                        None => return Err(Halt::Pending),
                    };
                    Ok(Box::pin((*transform)(key.clone(), value)) as TaskFuture<B>)
                })
            }),
        )
    }
}

impl<K, B> Clone for Stage<K, B>
where
    K: CollectionKey,
    B: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
            _relay: Arc::clone(&self._relay),
        }
    }
}

impl<K, B> std::fmt::Debug for Stage<K, B>
where
    K: CollectionKey,
    B: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage").field("tasks", &self.tasks).finish()
    }
}
