//! State transitions for the car state machine.
//!
//! Pure functions for computing the next state from the current state and an
//! event. The transition table is an explicit match over `(state, event)`
//! pairs; side effects (pipeline id storage, timestamps, refresh triggers)
//! are applied by the store and the orchestration layer after a transition
//! is accepted.

use thiserror::Error;

use crate::types::{CarState, PipelineId};

/// An event that may transition a car.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarEvent {
    /// A new pipeline was requested for the car; it now reflects the current
    /// train head.
    RefreshPipeline(PipelineId),

    /// The car's predecessor changed (merged, dropped, or aborted); its
    /// pipeline was validated against a ref that no longer exists.
    OutdatePipeline,

    /// The car is first in queue with a successful pipeline; the merge
    /// commit is being created.
    StartMerge,

    /// The merge commit landed.
    FinishMerge,
}

impl CarEvent {
    /// Returns the name of this event for logging/display.
    pub fn name(&self) -> &'static str {
        match self {
            CarEvent::RefreshPipeline(_) => "refresh_pipeline",
            CarEvent::OutdatePipeline => "outdate_pipeline",
            CarEvent::StartMerge => "start_merge",
            CarEvent::FinishMerge => "finish_merge",
        }
    }
}

/// Error returned when an event is not valid in the current state.
///
/// An invalid transition on a live car indicates that the per-car
/// serialization contract was violated: two events raced on the same car.
/// The store treats it as a programming error and fails loudly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid car transition: {event} from {from}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: &'static str,
}

/// Computes the next state for a car.
///
/// Accepted transitions:
/// - idle/stale/fresh + refresh_pipeline -> fresh
/// - fresh + outdate_pipeline -> stale
/// - fresh + start_merge -> merging
/// - merging + finish_merge -> merged
///
/// Terminal states (merged, skip_merged) accept no event.
pub fn next_state(current: CarState, event: CarEvent) -> Result<CarState, TransitionError> {
    match (current, event) {
        (CarState::Idle | CarState::Stale | CarState::Fresh, CarEvent::RefreshPipeline(_)) => {
            Ok(CarState::Fresh)
        }
        (CarState::Fresh, CarEvent::OutdatePipeline) => Ok(CarState::Stale),
        (CarState::Fresh, CarEvent::StartMerge) => Ok(CarState::Merging),
        (CarState::Merging, CarEvent::FinishMerge) => Ok(CarState::Merged),
        (from, event) => Err(TransitionError {
            from: from.name(),
            event: event.name(),
        }),
    }
}
