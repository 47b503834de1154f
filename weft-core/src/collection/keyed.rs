//! Keyed Collection Implementation
//!
//! An ordered set of observable items, each addressed by a caller-derived
//! key that stays stable across updates. Structure (membership and
//! order) and each item's value are separately observable: iterating
//! depends on both, `get` depends on one item only, so updating one key
//! never disturbs readers of its siblings.
//!
//! Items keep insertion order unless the collection was built
//! `with_comparator`, in which case inserts keep the sequence sorted.
//!
//! `update` compares the new value structurally before dirtying anything,
//! which is what protects downstream stages from metadata-only false
//! rebuilds.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::error::{CollectionError, ResourceError};
use crate::graph::node::SourceId;
use crate::reactive::runtime::Runtime;
use crate::reactive::subscriber::SubscriberId;
use crate::resource::LazyResource;

/// Bounds every collection key must satisfy.
pub trait CollectionKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> CollectionKey for T {}

/// A structural change to a collection, delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CollectionEvent<K> {
    Added(K),
    Removed(K),
}

type Watcher<K> = Arc<dyn Fn(&CollectionEvent<K>) + Send + Sync>;
type Comparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

/// An ordered, keyed set of observable items.
pub struct KeyedCollection<K, V> {
    runtime: Runtime,
    inner: Arc<CollectionInner<K, V>>,
}

struct CollectionInner<K, V> {
    structure: SourceId,
    items: RwLock<IndexMap<K, ItemSlot<V>>>,
    watchers: RwLock<Vec<(SubscriberId, Watcher<K>)>>,
    comparator: Option<Comparator<K>>,
}

struct ItemSlot<V> {
    source: SourceId,
    value: V,
}

impl<K, V> KeyedCollection<K, V>
where
    K: CollectionKey,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty collection in insertion order.
    pub fn new(runtime: &Runtime) -> Self {
        Self::build(runtime, None)
    }

    /// Create an empty collection whose iteration order is maintained by
    /// a key comparator.
    pub fn with_comparator<C>(runtime: &Runtime, comparator: C) -> Self
    where
        C: Fn(&K, &K) -> Ordering + Send + Sync + 'static,
    {
        Self::build(runtime, Some(Arc::new(comparator)))
    }

    fn build(runtime: &Runtime, comparator: Option<Comparator<K>>) -> Self {
        let structure = runtime.register_source(None);
        Self {
            runtime: runtime.clone(),
            inner: Arc::new(CollectionInner {
                structure,
                items: RwLock::new(IndexMap::new()),
                watchers: RwLock::new(Vec::new()),
                comparator,
            }),
        }
    }

    /// Add an item under a fresh key.
    ///
    /// Appends last unless a comparator orders the sequence. Rejects
    /// keys already present.
    pub fn insert(&self, key: K, value: V) -> Result<(), CollectionError> {
        {
            let mut items = self.inner.items.write().expect("items lock poisoned");
            if items.contains_key(&key) {
                return Err(CollectionError::DuplicateKey(format!("{key:?}")));
            }
            let slot = ItemSlot {
                source: self.runtime.register_source(None),
                value,
            };
            match self.inner.comparator.as_deref() {
                Some(cmp) => {
                    let index = items
                        .binary_search_by(|existing, _| cmp(existing, &key))
                        .unwrap_or_else(|i| i);
                    items.shift_insert(index, key.clone(), slot);
                }
                None => {
                    items.insert(key.clone(), slot);
                }
            }
        }
        self.runtime.batch(|| {
            self.emit(&CollectionEvent::Added(key));
            self.runtime.mark_changed(self.inner.structure);
        });
        Ok(())
    }

    /// Replace an item's value, suppressed when the new value compares
    /// equal to the current one. Returns whether a change was recorded.
    pub fn update(&self, key: &K, value: V) -> Result<bool, CollectionError>
    where
        V: PartialEq,
    {
        let source = {
            let mut items = self.inner.items.write().expect("items lock poisoned");
            let slot = items
                .get_mut(key)
                .ok_or_else(|| CollectionError::MissingKey(format!("{key:?}")))?;
            if slot.value == value {
                return Ok(false);
            }
            slot.value = value;
            slot.source
        };
        self.runtime.mark_changed(source);
        Ok(true)
    }

    /// Remove an item, cascading through every watcher (derived stages
    /// cancel and drop the tasks keyed by it).
    pub fn remove(&self, key: &K) -> Option<V> {
        let (value, item_source) = {
            let mut items = self.inner.items.write().expect("items lock poisoned");
            let slot = items.shift_remove(key)?;
            (slot.value, slot.source)
        };
        self.runtime.batch(|| {
            self.emit(&CollectionEvent::Removed(key.clone()));
            self.runtime.mark_changed(item_source);
            self.runtime.mark_changed(self.inner.structure);
            self.runtime.retire_source(item_source);
        });
        Some(value)
    }

    /// Look up one item, depending on that item alone (or on the
    /// structure, when the key is absent, so a later insert re-runs the
    /// reader).
    pub fn get(&self, key: &K) -> Option<V> {
        let items = self.inner.items.read().expect("items lock poisoned");
        match items.get(key) {
            Some(slot) => {
                self.runtime.track_read(slot.source);
                Some(slot.value.clone())
            }
            None => {
                self.runtime.track_read(self.inner.structure);
                None
            }
        }
    }

    /// Look up one item without establishing a dependency.
    pub fn get_untracked(&self, key: &K) -> Option<V> {
        let items = self.inner.items.read().expect("items lock poisoned");
        items.get(key).map(|slot| slot.value.clone())
    }

    /// Iterate `(key, value)` pairs in collection order, depending on
    /// the structure and on every item.
    pub fn iter(&self) -> std::vec::IntoIter<(K, V)> {
        self.runtime.track_read(self.inner.structure);
        let items = self.inner.items.read().expect("items lock poisoned");
        let pairs: Vec<(K, V)> = items
            .iter()
            .map(|(key, slot)| {
                self.runtime.track_read(slot.source);
                (key.clone(), slot.value.clone())
            })
            .collect();
        pairs.into_iter()
    }

    /// Whether the key is present, depending on the structure.
    pub fn contains_key(&self, key: &K) -> bool {
        self.runtime.track_read(self.inner.structure);
        self.inner
            .items
            .read()
            .expect("items lock poisoned")
            .contains_key(key)
    }

    /// Item count, depending on the structure.
    pub fn len(&self) -> usize {
        self.runtime.track_read(self.inner.structure);
        self.inner.items.read().expect("items lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind a resource to this collection's liveness: it activates when
    /// the collection gains its first (transitive) live observer and
    /// deactivates when it loses the last one.
    pub fn attach_resource(&self, resource: LazyResource) {
        self.runtime
            .attach_resource(self.inner.structure, Arc::new(resource));
    }

    /// The latched activation failure of the attached resource, if any.
    pub fn resource_error(&self) -> Option<ResourceError> {
        self.runtime
            .resource_of(self.inner.structure)
            .and_then(|resource| resource.error())
    }

    pub(crate) fn keys_untracked(&self) -> Vec<K> {
        let items = self.inner.items.read().expect("items lock poisoned");
        items.keys().cloned().collect()
    }

    pub(crate) fn structure_source(&self) -> SourceId {
        self.inner.structure
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn watch(&self, subscriber: SubscriberId, watcher: Watcher<K>) {
        self.inner
            .watchers
            .write()
            .expect("watchers lock poisoned")
            .push((subscriber, watcher));
    }

    fn emit(&self, event: &CollectionEvent<K>) {
        let watchers: Vec<Watcher<K>> = {
            let watchers = self.inner.watchers.read().expect("watchers lock poisoned");
            watchers.iter().map(|(_, w)| w.clone()).collect()
        };
        for watcher in watchers {
            (*watcher)(event);
        }
    }
}

impl<K, V> Clone for KeyedCollection<K, V> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Debug for KeyedCollection<K, V>
where
    K: CollectionKey,
    V: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let items = self.inner.items.read().expect("items lock poisoned");
        let mut map = f.debug_map();
        for (key, slot) in items.iter() {
            map.entry(key, &slot.value);
        }
        map.finish()
    }
}
