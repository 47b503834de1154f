//! Property Store Implementation
//!
//! A `PropertyStore` is a record whose fields are individually
//! observable: reading one field depends on that field alone, and a
//! write (single-field or whole-record) dirties only the fields whose
//! value structurally changed. A consumer of `base_url` never re-runs
//! because `title` changed.

use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use super::runtime::Runtime;
use crate::graph::node::SourceId;

/// A record with individually observable fields.
pub struct PropertyStore<V>
where
    V: Clone + Send + Sync + PartialEq + 'static,
{
    runtime: Runtime,
    inner: Arc<StoreInner<V>>,
}

struct StoreInner<V> {
    fields: RwLock<IndexMap<&'static str, FieldSlot<V>>>,
}

struct FieldSlot<V> {
    source: SourceId,
    value: V,
}

impl<V> PropertyStore<V>
where
    V: Clone + Send + Sync + PartialEq + 'static,
{
    /// Create a store from an initial set of fields.
    pub fn new(runtime: &Runtime, fields: impl IntoIterator<Item = (&'static str, V)>) -> Self {
        let fields = fields
            .into_iter()
            .map(|(key, value)| {
                (
                    key,
                    FieldSlot {
                        source: runtime.register_source(None),
                        value,
                    },
                )
            })
            .collect();
        Self {
            runtime: runtime.clone(),
            inner: Arc::new(StoreInner {
                fields: RwLock::new(fields),
            }),
        }
    }

    /// Read one field, depending on that field alone.
    pub fn get(&self, key: &str) -> Option<V> {
        let fields = self.inner.fields.read().expect("fields lock poisoned");
        let slot = fields.get(key)?;
        self.runtime.track_read(slot.source);
        Some(slot.value.clone())
    }

    /// Read one field without establishing a dependency.
    pub fn get_untracked(&self, key: &str) -> Option<V> {
        let fields = self.inner.fields.read().expect("fields lock poisoned");
        fields.get(key).map(|slot| slot.value.clone())
    }

    /// Write one field, dirtying it only if the value actually changed.
    /// Unknown keys are added as new fields.
    pub fn set(&self, key: &'static str, value: V) {
        let changed_source = {
            let mut fields = self.inner.fields.write().expect("fields lock poisoned");
            match fields.get_mut(key) {
                Some(slot) if slot.value == value => None,
                Some(slot) => {
                    slot.value = value;
                    Some(slot.source)
                }
                None => {
                    let source = self.runtime.register_source(None);
                    fields.insert(key, FieldSlot { source, value });
                    Some(source)
                }
            }
        };
        if let Some(source) = changed_source {
            self.runtime.mark_changed(source);
        }
    }

    /// Replace the whole record, diffing per key: only fields whose
    /// value structurally changed are dirtied. Fields missing from the
    /// replacement are removed; their readers re-run and observe `None`.
    pub fn replace(&self, next: impl IntoIterator<Item = (&'static str, V)>) {
        let next: IndexMap<&'static str, V> = next.into_iter().collect();
        self.runtime.batch(|| {
            let mut changed: Vec<SourceId> = Vec::new();
            let mut removed: Vec<SourceId> = Vec::new();
            {
                let mut fields = self.inner.fields.write().expect("fields lock poisoned");
                fields.retain(|key, slot| {
                    if next.contains_key(key) {
                        true
                    } else {
                        removed.push(slot.source);
                        false
                    }
                });
                for (key, value) in next {
                    match fields.get_mut(key) {
                        Some(slot) if slot.value == value => {}
                        Some(slot) => {
                            slot.value = value;
                            changed.push(slot.source);
                        }
                        None => {
                            let source = self.runtime.register_source(None);
                            fields.insert(key, FieldSlot { source, value });
                            changed.push(source);
                        }
                    }
                }
            }
            for source in changed {
                self.runtime.mark_changed(source);
            }
            for source in removed {
                self.runtime.mark_changed(source);
                self.runtime.retire_source(source);
            }
        });
    }

    /// Current field names, in insertion order.
    pub fn keys(&self) -> Vec<&'static str> {
        let fields = self.inner.fields.read().expect("fields lock poisoned");
        fields.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .fields
            .read()
            .expect("fields lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Clone for PropertyStore<V>
where
    V: Clone + Send + Sync + PartialEq + 'static,
{
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Debug for PropertyStore<V>
where
    V: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields = self.inner.fields.read().expect("fields lock poisoned");
        let mut map = f.debug_map();
        for (key, slot) in fields.iter() {
            map.entry(key, &slot.value);
        }
        map.finish()
    }
}
