//! Merge train coordination engine.
//!
//! A merge train serializes the merging of concurrent merge requests into
//! one target branch: each queued entry (a car) is validated against the
//! cumulative result of everything ahead of it, and cars merge strictly in
//! queue order. This crate is the coordination core only; building
//! pipelines, creating refs, and performing the merge commit belong to the
//! embedding application, reached through the interpreter traits in
//! [`effects`].
//!
//! [`engine::Engine`] wires everything together; the pieces are usable
//! separately for embeddings that manage their own task lifecycle.

pub mod context;
pub mod coordinator;
pub mod effects;
pub mod engine;
pub mod events;
pub mod finalizer;
pub mod refresh;
pub mod state;
pub mod store;
pub mod train;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use context::EngineContext;
pub use coordinator::{EngineError, TrainCoordinator};
pub use engine::Engine;
pub use events::{EngineEvent, EventBus};
pub use finalizer::{MergeFinalizer, MergeSource};
pub use refresh::{RefreshError, RefreshScheduler};
pub use train::Train;
