//! Trusted input records fed to the engine by the embedding application.
//!
//! The engine does not compute diffs, evaluate approvals, or watch branches
//! itself; it is told about merge requests and project settings through these
//! records and trusts them.

use serde::{Deserialize, Serialize};

use super::ids::{BranchName, MergeRequestId, PipelineId, ProjectId, Sha};
use super::car::TrainKey;

/// The latest build artifact for a merge request's own diff head.
///
/// This is distinct from a car's train pipeline: it validates the merge
/// request in isolation and only feeds the train-eligibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadPipeline {
    pub id: PipelineId,

    /// The SHA this pipeline ran against. Eligibility requires it to match
    /// the merge request's current diff head.
    pub sha: Sha,

    pub complete: bool,
}

/// A merge request as the engine knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: MergeRequestId,
    pub project: ProjectId,
    pub source_branch: BranchName,
    pub target_branch: BranchName,

    /// Head SHA of the merge request's current diff.
    pub diff_head_sha: Sha,

    /// The authoritative merged flag. Separate from any car state: a merge
    /// request can be merged without ever riding a train.
    pub merged: bool,

    /// Latest build artifact for the diff head, if any.
    pub head_pipeline: Option<HeadPipeline>,
}

impl MergeRequest {
    pub fn new(
        id: MergeRequestId,
        project: ProjectId,
        source_branch: impl Into<BranchName>,
        target_branch: impl Into<BranchName>,
        diff_head_sha: impl Into<Sha>,
    ) -> Self {
        MergeRequest {
            id,
            project,
            source_branch: source_branch.into(),
            target_branch: target_branch.into(),
            diff_head_sha: diff_head_sha.into(),
            merged: false,
            head_pipeline: None,
        }
    }

    /// Builder-style helper for tests and setup code.
    pub fn with_head_pipeline(mut self, pipeline: HeadPipeline) -> Self {
        self.head_pipeline = Some(pipeline);
        self
    }

    /// Returns the train partition this merge request targets.
    pub fn train_key(&self) -> TrainKey {
        TrainKey {
            project: self.project,
            target_branch: self.target_branch.clone(),
        }
    }
}

/// Per-project configuration consulted by the eligibility check.
///
/// Unknown projects default to trains disabled, so a misrouted enqueue is
/// rejected rather than silently creating a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// Whether merge-train mode is enabled for the project.
    pub merge_trains_enabled: bool,

    /// Whether the project mandates a successful pipeline before merge.
    /// When false, an in-progress head pipeline is enough to enqueue.
    pub require_successful_pipeline: bool,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        ProjectSettings {
            merge_trains_enabled: false,
            require_successful_pipeline: true,
        }
    }
}
