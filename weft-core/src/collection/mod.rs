//! Keyed Collections and Derivations
//!
//! Ordered, keyed sets of observable items, and the per-key derivation
//! stages that turn them into pipelines of tasks.

pub mod derive;
pub mod keyed;

pub use derive::Stage;
pub use keyed::{CollectionKey, KeyedCollection};
