//! Effects-as-data for the external build and ref-management systems.
//!
//! This module defines effect types that describe operations without
//! executing them. This enables:
//! - Core logic that is testable against recording fakes
//! - Logging/tracing of intended operations
//! - A narrow, explicit boundary to the excluded subsystems
//!
//! Interpreters that execute these effects are defined in `interpreter` and
//! implemented by the embedding application.

use serde::{Deserialize, Serialize};

use crate::types::{CarId, MergeRequestId, PipelineId, ProjectId, Sha};

pub mod interpreter;

pub use interpreter::{PipelineInterpreter, RefInterpreter};

/// The observable status of an external pipeline.
///
/// The engine never inspects pipeline internals beyond these fields. A
/// pipeline that timed out upstream simply reports `complete: false` here;
/// timeouts are "not yet successful", never a special case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub complete: bool,
    pub successful: bool,

    /// The SHA the pipeline ran against.
    pub sha: Sha,
}

impl PipelineStatus {
    /// Returns true for a completed-but-unsuccessful pipeline.
    pub fn failed(&self) -> bool {
        self.complete && !self.successful
    }
}

/// An operation against the external build system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect_type", rename_all = "snake_case")]
pub enum PipelineEffect {
    /// Request a new verification pipeline for a merge request, built
    /// against the given base SHA (the car's validation base).
    Request {
        merge_request: MergeRequestId,
        base: Sha,
    },

    /// Fetch the current status of a pipeline.
    GetStatus { pipeline: PipelineId },
}

/// Response to a [`PipelineEffect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response_type", rename_all = "snake_case")]
pub enum PipelineResponse {
    Requested { pipeline: PipelineId },
    Status(PipelineStatus),
}

/// An operation against the source-control ref management layer.
///
/// Train refs are the chained-validation mechanism: the ref layer merges a
/// car's changes on top of the given base and the resulting SHA becomes the
/// validation base for the next car.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect_type", rename_all = "snake_case")]
pub enum RefEffect {
    /// Create (or move) the train ref for a car: base plus the merge
    /// request's changes.
    CreateTrainRef {
        project: ProjectId,
        merge_request: MergeRequestId,
        car: CarId,
        base: Sha,
    },

    /// Delete a car's train ref during cleanup.
    DeleteTrainRef { project: ProjectId, car: CarId },

    /// Resolve a fully qualified ref to a SHA.
    GetRefSha { project: ProjectId, ref_name: String },
}

/// Response to a [`RefEffect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response_type", rename_all = "snake_case")]
pub enum RefResponse {
    /// The SHA of the newly created train ref.
    TrainRefCreated { sha: Sha },

    Deleted,

    Sha { sha: Sha },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_pipeline_is_not_failed() {
        let status = PipelineStatus {
            complete: false,
            successful: false,
            sha: Sha::new("a".repeat(40)),
        };
        assert!(!status.failed());
    }

    #[test]
    fn complete_unsuccessful_pipeline_is_failed() {
        let status = PipelineStatus {
            complete: true,
            successful: false,
            sha: Sha::new("a".repeat(40)),
        };
        assert!(status.failed());
    }

    #[test]
    fn complete_successful_pipeline_is_not_failed() {
        let status = PipelineStatus {
            complete: true,
            successful: true,
            sha: Sha::new("a".repeat(40)),
        };
        assert!(!status.failed());
    }

    #[test]
    fn effect_serde_roundtrip() {
        let effect = RefEffect::CreateTrainRef {
            project: ProjectId(1),
            merge_request: MergeRequestId(2),
            car: CarId(3),
            base: Sha::new("b".repeat(40)),
        };
        let json = serde_json::to_string(&effect).unwrap();
        let parsed: RefEffect = serde_json::from_str(&json).unwrap();
        assert_eq!(effect, parsed);
    }
}
