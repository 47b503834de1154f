//! Graph Node Identities
//!
//! This module defines the identity and metadata types that live in the
//! dependency graph. A *source* is anything that can be read under
//! tracking: a signal, a store field, a collection's structure, a
//! collection item, or a task's output slot. A *subscriber* is any
//! computation that reads sources: a derived value, a task, a collection
//! derivation, or an effect.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a readable source in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    /// Generate a new unique source ID.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The kind of subscriber node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A synchronous cached derived value. Recomputes lazily on read,
    /// eagerly within a propagation pass.
    Derived,

    /// An async derived task with a tri-state result.
    Task,

    /// A terminal side-effecting node. Effects are leaves: they have
    /// dependencies but no output source.
    Effect,

    /// A collection derivation. Structural changes are mirrored by its
    /// watcher; the node itself exists to carry liveness through the
    /// chain.
    Relay,
}

/// Dirty state of a synchronous derived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The cached value is up-to-date.
    Clean,

    /// An input changed; the value must recompute before the next read.
    Dirty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ids_are_unique() {
        let id1 = SourceId::next();
        let id2 = SourceId::next();
        let id3 = SourceId::next();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }
}
