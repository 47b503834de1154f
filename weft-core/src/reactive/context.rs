//! Evaluation Context
//!
//! The evaluation context tracks which computation is currently running.
//! This enables dynamic dependency tracking: when a source is read, the
//! current computation is recorded as its dependent.
//!
//! # Implementation
//!
//! A thread-local stack holds one frame per in-flight computation. When a
//! node recomputes, it pushes a frame; every source read while the frame
//! is on top is recorded into it. When the computation completes, the
//! frame is popped and the collected reads replace the node's previous
//! dependency set wholesale, so edges from control-flow paths not taken
//! on this run are dropped.
//!
//! Nested frames are supported (a derived value recomputing inside an
//! effect's run records its own reads, not the effect's).

use smallvec::SmallVec;
use std::cell::RefCell;

use super::subscriber::SubscriberId;
use crate::graph::node::SourceId;

/// Reads collected during one computation.
pub(crate) type ReadSet = SmallVec<[SourceId; 8]>;

thread_local! {
    static FRAME_STACK: RefCell<Vec<FrameEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the evaluation-context stack.
struct FrameEntry {
    subscriber_id: SubscriberId,
    reads: ReadSet,
}

/// Guard for one tracked computation.
///
/// Pops its frame when finished or dropped, so the stack stays balanced
/// even if the computation panics.
pub(crate) struct TrackFrame {
    subscriber_id: SubscriberId,
    finished: bool,
}

impl TrackFrame {
    /// Enter a new tracking frame for the given subscriber.
    pub(crate) fn enter(subscriber_id: SubscriberId) -> Self {
        FRAME_STACK.with(|stack| {
            stack.borrow_mut().push(FrameEntry {
                subscriber_id,
                reads: ReadSet::new(),
            });
        });

        Self {
            subscriber_id,
            finished: false,
        }
    }

    /// Check if there is an active tracking frame on this thread.
    pub(crate) fn is_active() -> bool {
        FRAME_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// Get the subscriber of the innermost active frame, if any.
    pub(crate) fn current_subscriber() -> Option<SubscriberId> {
        FRAME_STACK.with(|stack| stack.borrow().last().map(|entry| entry.subscriber_id))
    }

    /// Record a read of the given source into the innermost frame.
    ///
    /// No-op when no frame is active.
    pub(crate) fn record_read(source: SourceId) {
        FRAME_STACK.with(|stack| {
            if let Some(entry) = stack.borrow_mut().last_mut() {
                entry.reads.push(source);
            }
        });
    }

    /// Finish the frame, returning every source read while it was active.
    pub(crate) fn finish(mut self) -> ReadSet {
        self.finished = true;
        FRAME_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            match popped {
                Some(entry) => {
                    debug_assert_eq!(
                        entry.subscriber_id, self.subscriber_id,
                        "tracking frame mismatch"
                    );
                    entry.reads
                }
                None => ReadSet::new(),
            }
        })
    }
}

impl Drop for TrackFrame {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Unwinding through a computation: discard the frame.
        FRAME_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
