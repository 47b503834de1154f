//! Propagation Pass
//!
//! One pass takes the set of sources changed in a batch and re-runs every
//! affected node in dependency order, so no node ever observes a
//! half-updated upstream value.
//!
//! # Algorithm
//!
//! 1. Walk the subscriber graph breadth-first from the changed sources to
//!    collect every node that *might* be affected, following each
//!    subscriber's output source onward.
//! 2. Order the collected nodes with Kahn's algorithm, counting only
//!    edges internal to the collected set.
//! 3. Process in order. A node is invalidated only when one of its
//!    tracked dependencies actually changed; synchronous derived values
//!    recompute immediately and report whether their output changed,
//!    pruning downstream work when it did not. Tasks restart. Effects
//!    are queued.
//! 4. Run the queued effects once, after every other node has settled
//!    into its post-batch state.
//!
//! Cyclic dependencies are not supported; nodes on a cycle are skipped
//! by the topological order and logged.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::graph::node::{NodeKind, SourceId};
use crate::reactive::runtime::Runtime;
use crate::reactive::subscriber::SubscriberId;

impl Runtime {
    pub(crate) fn run_pass(&self, roots: Vec<SourceId>) {
        let inner = &self.inner;

        // Realized changes; grows as nodes report changed outputs.
        let mut changed: HashSet<SourceId> = HashSet::new();
        // Everything reachable, changed or not, for topology purposes.
        let mut reach: HashSet<SourceId> = HashSet::new();
        let mut src_queue: VecDeque<SourceId> = VecDeque::new();
        for root in roots {
            if reach.insert(root) {
                changed.insert(root);
                src_queue.push_back(root);
            }
        }

        // 1. Collect candidates.
        let mut candidates: Vec<SubscriberId> = Vec::new();
        let mut candidate_set: HashSet<SubscriberId> = HashSet::new();
        while let Some(source) = src_queue.pop_front() {
            let subs: Vec<SubscriberId> = match inner.sources.get(&source) {
                Some(e) => e.subscribers.iter().copied().collect(),
                None => continue,
            };
            for sub in subs {
                if candidate_set.insert(sub) {
                    candidates.push(sub);
                    if let Some(e) = inner.subscribers.get(&sub) {
                        if let Some(out) = e.out {
                            if reach.insert(out) {
                                src_queue.push_back(out);
                            }
                        }
                    }
                }
            }
        }
        if candidates.is_empty() {
            return;
        }

        // 2. Topological order over the candidate set (Kahn).
        let mut owner_of: HashMap<SourceId, SubscriberId> = HashMap::new();
        for sub in &candidates {
            if let Some(e) = inner.subscribers.get(sub) {
                if let Some(out) = e.out {
                    owner_of.insert(out, *sub);
                }
            }
        }

        let mut in_degree: HashMap<SubscriberId, usize> = HashMap::new();
        let mut successors: HashMap<SubscriberId, Vec<SubscriberId>> = HashMap::new();
        for sub in &candidates {
            let deps: Vec<SourceId> = inner
                .subscribers
                .get(sub)
                .map(|e| e.deps.iter().copied().collect())
                .unwrap_or_default();
            let mut degree = 0;
            for dep in deps {
                if let Some(owner) = owner_of.get(&dep) {
                    if owner != sub && candidate_set.contains(owner) {
                        degree += 1;
                        successors.entry(*owner).or_default().push(*sub);
                    }
                }
            }
            in_degree.insert(*sub, degree);
        }

        let mut queue: VecDeque<SubscriberId> = candidates
            .iter()
            .copied()
            .filter(|sub| in_degree.get(sub).copied() == Some(0))
            .collect();
        let mut ordered: Vec<SubscriberId> = Vec::with_capacity(candidates.len());
        while let Some(sub) = queue.pop_front() {
            ordered.push(sub);
            if let Some(next) = successors.get(&sub) {
                for n in next {
                    if let Some(degree) = in_degree.get_mut(n) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(*n);
                        }
                    }
                }
            }
        }
        if ordered.len() < candidates.len() {
            tracing::warn!(
                skipped = candidates.len() - ordered.len(),
                "dependency cycle detected; cyclic nodes skipped this pass"
            );
        }

        // 3. Invalidate in order.
        let mut effects: Vec<SubscriberId> = Vec::new();
        for sub in ordered {
            let (kind, hit, node) = match inner.subscribers.get(&sub) {
                Some(e) => (
                    e.kind,
                    e.deps.iter().any(|d| changed.contains(d)),
                    e.node.clone(),
                ),
                None => continue,
            };
            if !hit {
                continue;
            }
            match kind {
                NodeKind::Effect => effects.push(sub),
                _ => {
                    if let Some(node) = node.upgrade() {
                        if let Some(out) = node.invalidate(self) {
                            changed.insert(out);
                        }
                    }
                }
            }
        }

        // 4. Run effects last, each at most once per pass.
        for sub in effects {
            let node = inner
                .subscribers
                .get(&sub)
                .and_then(|e| e.node.upgrade());
            if let Some(node) = node {
                node.run_effect(self);
            }
        }
    }
}
