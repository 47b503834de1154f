//! Error taxonomy for the build graph.
//!
//! Errors are values: a failed per-item transform settles its task as
//! `Err(TaskError)` and flows through the graph like any other result.
//! The propagation machinery itself never raises; panics are caught at
//! node boundaries and converted here.

use thiserror::Error;

/// A per-item transform failure.
///
/// Isolated to the key whose task produced it; sibling keys and the rest
/// of the graph keep running. Cloneable so it can be carried in task
/// state and fanned out to every reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The user transform returned an error.
    #[error("transform failed: {0}")]
    Transform(String),

    /// The task body or its future panicked. The unwind is caught at the
    /// node boundary and surfaced as a normal error value.
    #[error("task body panicked")]
    Panicked,
}

impl TaskError {
    /// Build a transform error from any displayable cause.
    pub fn transform(cause: impl std::fmt::Display) -> Self {
        Self::Transform(cause.to_string())
    }
}

/// An external resource failed to come up.
///
/// Surfaced once to the orchestrator; the owning source then degrades to
/// non-incremental (no further automatic updates) without crashing the
/// graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("resource activation failed: {0}")]
    Activation(String),
}

/// Structural misuse of a keyed collection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectionError {
    /// `insert` requires a fresh key.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// `update` requires an existing key.
    #[error("missing key: {0}")]
    MissingKey(String),
}
