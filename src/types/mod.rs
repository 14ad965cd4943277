//! Core domain types for the merge train engine.
//!
//! This module contains all the fundamental types used throughout the crate,
//! designed to encode invariants via the type system.

pub mod car;
pub mod ids;
pub mod merge_request;

// Re-export commonly used types at the module level
pub use car::{Car, CarState, TrainKey};
pub use ids::{BranchName, CarId, MergeRequestId, PipelineId, ProjectId, Sha, UserId};
pub use merge_request::{HeadPipeline, MergeRequest, ProjectSettings};
