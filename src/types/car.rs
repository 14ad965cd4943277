//! The per-merge-request queue entry and its state enum.
//!
//! A `Car` is one merge request's seat on a merge train. Queue position is
//! never stored on the car; it is derived from id ordering by the `Train`
//! view (count of active cars with a smaller id).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ids::{BranchName, CarId, MergeRequestId, PipelineId, ProjectId, Sha, UserId};

/// The partition key of one merge train.
///
/// Every operation takes this key explicitly; there is no global "current
/// train" and no train view is cached across asynchronous boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainKey {
    pub project: ProjectId,
    pub target_branch: BranchName,
}

impl TrainKey {
    pub fn new(project: ProjectId, target_branch: impl Into<BranchName>) -> Self {
        TrainKey {
            project,
            target_branch: target_branch.into(),
        }
    }
}

impl std::fmt::Display for TrainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.project, self.target_branch)
    }
}

/// The lifecycle state of a car.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarState {
    /// Just enqueued; no pipeline has been requested yet.
    Idle,

    /// Has a pipeline validated against the current train head.
    Fresh,

    /// The pipeline no longer reflects the car's predecessor; a new one must
    /// be requested before the car can merge.
    Stale,

    /// The merge commit is in flight.
    Merging,

    /// Terminal: merged through the train.
    Merged,

    /// Terminal: inserted directly for a merge request that merged outside
    /// the train (e.g. an immediate merge bypassing the queue). Exists only
    /// for queue-history continuity and is never processed.
    SkipMerged,
}

impl CarState {
    /// Returns true if the car still occupies a queue position.
    pub fn is_active(&self) -> bool {
        matches!(self, CarState::Idle | CarState::Stale | CarState::Fresh)
    }

    /// Returns true for states counted as completed train history.
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            CarState::Merging | CarState::Merged | CarState::SkipMerged
        )
    }

    /// Returns true for states that never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CarState::Merged | CarState::SkipMerged)
    }

    /// Returns the name of this state for logging/display.
    pub fn name(&self) -> &'static str {
        match self {
            CarState::Idle => "idle",
            CarState::Fresh => "fresh",
            CarState::Stale => "stale",
            CarState::Merging => "merging",
            CarState::Merged => "merged",
            CarState::SkipMerged => "skip_merged",
        }
    }
}

/// One queued merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    /// Monotonic id; lower id = earlier in queue. Immutable.
    pub id: CarId,

    /// Target project of the train this car rides.
    pub project: ProjectId,

    /// Target branch of the train this car rides.
    pub target_branch: BranchName,

    /// The merge request this car represents (1:1 while the car exists).
    pub merge_request: MergeRequestId,

    /// Who requested queuing.
    pub user: UserId,

    /// Last-known verification pipeline, if one has been requested.
    pub pipeline: Option<PipelineId>,

    /// SHA of this car's train ref: the cumulative merge result of all cars
    /// up to and including this one. Recorded when a pipeline is requested
    /// and used as the validation base for the next car.
    pub train_ref: Option<Sha>,

    /// Current lifecycle state.
    pub state: CarState,

    pub created_at: DateTime<Utc>,

    /// Set when the merge completes.
    pub merged_at: Option<DateTime<Utc>>,

    /// Time from enqueue to merge, set together with `merged_at`.
    pub duration: Option<Duration>,
}

impl Car {
    /// Returns the train partition this car belongs to.
    pub fn train_key(&self) -> TrainKey {
        TrainKey {
            project: self.project,
            target_branch: self.target_branch.clone(),
        }
    }

    /// Returns true if the car still occupies a queue position.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Returns true if the scheduler must request a fresh pipeline before
    /// this car can advance: either no pipeline was ever assigned, or the
    /// existing one was validated against a predecessor that is gone.
    pub fn requires_new_pipeline(&self) -> bool {
        self.pipeline.is_none() || self.state == CarState::Stale
    }
}
