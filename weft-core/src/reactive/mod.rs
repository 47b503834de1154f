//! Reactive Primitives
//!
//! The core observable types: signals, property stores, derived values
//! and effects, plus the runtime that coordinates them.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal holds mutable state. Reading it inside a tracked
//! computation registers that computation as a dependent; writing it
//! dirties every dependent.
//!
//! ## Property stores
//!
//! A PropertyStore is a record whose fields are individually
//! observable. Writes diff per field, so a reader of one field never
//! re-runs because a sibling field changed.
//!
//! ## Derived values
//!
//! A Derived is a cached synchronous computation. It recomputes when a
//! dependency changes, and a recomputation that produces an equal value
//! stops propagation downstream.
//!
//! ## Effects
//!
//! An Effect synchronizes graph state with the outside world: writing
//! artifacts, notifying listeners, logging. Effects re-run once per
//! write batch and are the graph's liveness roots.
//!
//! # Implementation Notes
//!
//! Dependency tracking is explicit: a thread-local evaluation stack
//! records reads, and each run replaces the computation's dependency
//! set. There is no hidden wiring; the runtime owns every edge.

pub(crate) mod context;
pub mod derived;
pub mod effect;
pub mod runtime;
pub mod signal;
pub mod store;
pub mod subscriber;

pub use derived::Derived;
pub use effect::Effect;
pub use runtime::Runtime;
pub use signal::Signal;
pub use store::PropertyStore;
pub use subscriber::SubscriberId;
