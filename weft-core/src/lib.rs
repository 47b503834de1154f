//! Weft Core
//!
//! This crate is the reactive engine behind the Weft build orchestrator:
//! it recomputes derived artifacts (rendered pages, bundles, generated
//! reference docs) from a set of source files, rebuilding only what
//! actually changed.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: signals, property stores, derived values, effects, and
//!   the runtime that tracks dependencies and propagates changes
//! - `graph`: node identities and the batched, dependency-ordered
//!   propagation pass
//! - `collection`: keyed collections and per-key derivation stages
//! - `task`: async derived tasks with tri-state results, plus result
//!   dispatch and burst coalescing
//! - `resource`: external resource lifecycles bound to graph liveness
//! - `source`: the file-change boundary (`FileRecord`)
//! - `error`: the error taxonomy
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_core::{Effect, KeyedCollection, Runtime, TaskState};
//!
//! # async fn demo() {
//! let rt = Runtime::new();
//!
//! // Source files come from an external watcher.
//! let files: KeyedCollection<String, String> = KeyedCollection::new(&rt);
//! files.insert("index".into(), "# hello".into()).unwrap();
//!
//! // Render each file; only changed keys ever recompute.
//! let pages = files.derive(|_key, text: String| async move {
//!     Ok(text.to_uppercase())
//! });
//!
//! // Terminal consumer: write every settled page out.
//! let pages2 = pages.clone();
//! let _writer = Effect::new(&rt, move || {
//!     for (key, task) in pages2.iter() {
//!         if let TaskState::Ok(page) = task.state() {
//!             persist(&key, &page);
//!         }
//!     }
//! });
//!
//! // One-shot mode: wait for the initial build to settle.
//! rt.await_quiescence().await;
//! # }
//! ```

pub mod collection;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod resource;
pub mod source;
pub mod task;

mod quiesce;

pub use collection::{CollectionKey, KeyedCollection, Stage};
pub use error::{CollectionError, ResourceError, TaskError};
pub use reactive::{Derived, Effect, PropertyStore, Runtime, Signal};
pub use resource::LazyResource;
pub use source::{apply_change, apply_removal, FileRecord};
pub use task::{
    coalesce::coalesce, join, CancelFlag, Halt, Outcome, Task, TaskContext, TaskFuture, TaskState,
};
