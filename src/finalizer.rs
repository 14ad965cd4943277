//! Post-merge settlement: records the authoritative merged flag and settles
//! the queue consequences of a landed merge.
//!
//! The merge-mark step is the only step that must succeed. Everything after
//! it (car completion, ref cleanup, cascade aborts, successor refresh) is
//! error-isolated: an individual failure is logged and left to the owning
//! subsystem's retry, never rolled back into the merge itself.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::context::EngineContext;
use crate::coordinator::EngineError;
use crate::effects::{RefEffect, RefInterpreter};
use crate::events::EngineEvent;
use crate::state::CarEvent;
use crate::types::{Car, CarState, MergeRequest, MergeRequestId, TrainKey};

/// Upper bound on cascade aborts settled per merge. Trains longer than this
/// are repaired by the re-scans the aborts themselves trigger.
const CASCADE_ABORT_LIMIT: usize = 100;

/// How a merge request was merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// Merged through its train's first car.
    Train,

    /// Merged outside the train (fast-path immediate merge).
    Immediate,
}

/// Settles a landed merge into engine state.
#[derive(Debug, Clone)]
pub struct MergeFinalizer<R> {
    context: Arc<EngineContext>,
    refs: R,
}

impl<R> MergeFinalizer<R>
where
    R: RefInterpreter,
    R::Error: std::fmt::Display,
{
    pub fn new(context: Arc<EngineContext>, refs: R) -> Self {
        MergeFinalizer { context, refs }
    }

    /// Records a merge and settles its queue consequences.
    ///
    /// Idempotent: a merge request already marked merged returns
    /// immediately, which makes duplicate invocation from retried events
    /// safe. Only the merge-mark step can fail; every cleanup step after it
    /// is best-effort.
    #[instrument(skip(self))]
    pub async fn finalize_merge(
        &self,
        merge_request: MergeRequestId,
        source: MergeSource,
    ) -> Result<(), EngineError> {
        let (mr, merged_car) = {
            let _guard = self.context.locks.lock(merge_request).await;

            let mr = self
                .context
                .merge_requests
                .get(merge_request)
                .ok_or(EngineError::UnknownMergeRequest(merge_request))?;
            if mr.merged {
                debug!(merge_request = %merge_request, "merge already recorded");
                return Ok(());
            }
            let mr = self
                .context
                .merge_requests
                .mark_merged(merge_request)
                .ok_or(EngineError::UnknownMergeRequest(merge_request))?;

            let merged_car = match source {
                MergeSource::Train => self.complete_merging_car(merge_request),
                MergeSource::Immediate => None,
            };
            (mr, merged_car)
        };

        if let MergeSource::Immediate = source {
            // A queued merge request that merged outside the train can never
            // merge through it; its car is settled like an abort.
            self.context
                .remove_car(merge_request, "merged outside the train")
                .await;
        }

        self.cascade_abort(&mr).await;

        if let Some(car) = merged_car {
            self.cleanup_train_ref(&car).await;

            let successor = self.context.train(&car.train_key()).successor_of(car.id).cloned();
            if let Some(successor) = successor {
                self.context.outdate_car(successor).await;
            }

            self.context.signal_refresh(&car.train_key());
            self.context.events.emit(EngineEvent::CarMerged { car });
        }

        Ok(())
    }

    /// Completes the merging car, if the merge request still has one.
    /// Called under the merge request's lock.
    fn complete_merging_car(&self, merge_request: MergeRequestId) -> Option<Car> {
        let car = self.context.cars.get_by_merge_request(merge_request)?;
        if car.state != CarState::Merging {
            warn!(
                car = %car.id,
                state = car.state.name(),
                "merge landed for a car that was not merging"
            );
            return None;
        }
        self.context.cars.apply(car.id, CarEvent::FinishMerge)
    }

    /// Aborts train entries targeting the merged request's source branch.
    ///
    /// Those entries were waiting to catch up to this merge and become
    /// unreachable once it lands. The query is bounded and each abort is
    /// isolated so one failure cannot block the rest.
    async fn cascade_abort(&self, mr: &MergeRequest) {
        let key = TrainKey {
            project: mr.project,
            target_branch: mr.source_branch.clone(),
        };
        let waiting = self.context.cars.active_cars_targeting(&key, CASCADE_ABORT_LIMIT);
        if waiting.is_empty() {
            return;
        }

        let reason = format!(
            "target branch {} was merged into {}",
            mr.source_branch, mr.target_branch
        );
        for car in waiting {
            if let Some(removed) = self.context.remove_car(car.merge_request, &reason).await {
                self.cleanup_train_ref(&removed).await;
            }
        }
    }

    /// Best-effort deletion of a car's train ref.
    async fn cleanup_train_ref(&self, car: &Car) {
        if car.train_ref.is_none() {
            return;
        }
        let effect = RefEffect::DeleteTrainRef {
            project: car.project,
            car: car.id,
        };
        if let Err(err) = self.refs.interpret(effect).await {
            warn!(car = %car.id, error = %err, "failed to delete train ref");
        }
    }
}
