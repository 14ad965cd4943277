//! Orchestration of enqueue, cancel, abort, and per-event reprocessing.
//!
//! The `TrainCoordinator` is the primary state-transition driver: every
//! user- or dispatcher-initiated mutation of a car goes through it, under
//! the per-merge-request lock. It performs no synchronous queue work beyond
//! the requested transition — recomputing what should happen next is always
//! delegated to the refresh scheduler, so many rapid events coalesce into
//! one re-scan.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::context::EngineContext;
use crate::effects::{RefEffect, RefInterpreter};
use crate::state::CarEvent;
use crate::types::{
    Car, CarState, MergeRequest, MergeRequestId, ProjectSettings, TrainKey, UserId,
};


/// Reason string recorded when a user removes their own car.
const CANCELLED_BY_USER: &str = "cancelled by user";

/// Errors surfaced synchronously to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The merge request is not eligible for the train. Never retried
    /// automatically.
    #[error("merge train not available: {reason}")]
    NotAvailable { reason: String },

    /// The dispatcher referenced a merge request the engine was never told
    /// about.
    #[error("unknown merge request {0}")]
    UnknownMergeRequest(MergeRequestId),
}

impl EngineError {
    fn not_available(reason: impl Into<String>) -> Self {
        EngineError::NotAvailable {
            reason: reason.into(),
        }
    }
}

/// The orchestration entry point for one engine instance.
///
/// Holds the shared context and the ref interpreter used for best-effort
/// train-ref cleanup on eviction.
#[derive(Debug, Clone)]
pub struct TrainCoordinator<R> {
    context: Arc<EngineContext>,
    refs: R,
}

impl<R> TrainCoordinator<R>
where
    R: RefInterpreter,
    R::Error: std::fmt::Display,
{
    pub fn new(context: Arc<EngineContext>, refs: R) -> Self {
        TrainCoordinator { context, refs }
    }

    /// Adds a merge request to its target branch's train.
    ///
    /// Idempotent: if the merge request already has an active car, that car
    /// is returned and nothing is created. Fails with
    /// [`EngineError::NotAvailable`] when the project has trains disabled or
    /// the merge request has no usable build artifact.
    #[instrument(skip(self))]
    pub async fn enqueue(
        &self,
        merge_request: MergeRequestId,
        user: UserId,
    ) -> Result<Car, EngineError> {
        let _guard = self.context.locks.lock(merge_request).await;

        let mr = self
            .context
            .merge_requests
            .get(merge_request)
            .ok_or(EngineError::UnknownMergeRequest(merge_request))?;

        if let Some(existing) = self.context.cars.get_by_merge_request(merge_request) {
            if existing.is_active() {
                debug!(car = %existing.id, "merge request already queued");
                return Ok(existing);
            }
            return Err(EngineError::not_available(
                "merge request already completed a train",
            ));
        }

        let settings = self.context.projects.settings(mr.project);
        if let Err(reason) = eligibility(&mr, settings) {
            return Err(EngineError::not_available(reason));
        }

        let car = self.context.cars.insert_idle(&mr, user);
        self.context
            .events
            .emit(crate::events::EngineEvent::CarEnqueued { car: car.clone() });
        self.context.signal_refresh(&car.train_key());
        Ok(car)
    }

    /// Re-evaluates an enqueued merge request by signalling a re-scan of its
    /// train. No synchronous work happens here.
    pub fn process(&self, merge_request: MergeRequestId) -> Result<(), EngineError> {
        let mr = self
            .context
            .merge_requests
            .get(merge_request)
            .ok_or(EngineError::UnknownMergeRequest(merge_request))?;
        self.context.signal_refresh(&mr.train_key());
        Ok(())
    }

    /// Removes a merge request's car at the user's request.
    ///
    /// Effective immediately: the car is gone when this returns. The
    /// consequences (successor re-validation, re-scan) settle
    /// asynchronously; callers must not assume the queue is settled.
    /// Returns `None` if there was nothing to remove or the car had already
    /// reached merging/merged.
    #[instrument(skip(self))]
    pub async fn cancel(&self, merge_request: MergeRequestId) -> Option<Car> {
        let removed = self.context.remove_car(merge_request, CANCELLED_BY_USER).await?;
        self.cleanup_train_ref(&removed).await;
        Some(removed)
    }

    /// Removes a merge request's car involuntarily, recording why.
    ///
    /// Same eviction contract as [`TrainCoordinator::cancel`]; used for
    /// pipeline failures, branch changes, and cascade cleanup after a
    /// related merge.
    #[instrument(skip(self))]
    pub async fn abort(&self, merge_request: MergeRequestId, reason: &str) -> Option<Car> {
        let removed = self.context.remove_car(merge_request, reason).await?;
        self.cleanup_train_ref(&removed).await;
        Some(removed)
    }

    /// Eligibility predicate used by the auto-merge strategy dispatcher to
    /// pick a strategy. Mirrors the checks `enqueue` enforces.
    pub fn available_for(&self, merge_request: MergeRequestId) -> Result<bool, EngineError> {
        let mr = self
            .context
            .merge_requests
            .get(merge_request)
            .ok_or(EngineError::UnknownMergeRequest(merge_request))?;
        let settings = self.context.projects.settings(mr.project);
        Ok(eligibility(&mr, settings).is_ok())
    }

    /// Inserts a terminal placeholder car for a merge request that merged
    /// outside the train, keeping queue history continuous.
    ///
    /// The merge request must already carry the authoritative merged flag;
    /// this is the caller-side precondition for skip-merged placeholders.
    #[instrument(skip(self))]
    pub async fn insert_skip_merged(
        &self,
        merge_request: MergeRequestId,
        user: UserId,
    ) -> Result<Car, EngineError> {
        let _guard = self.context.locks.lock(merge_request).await;

        let mr = self
            .context
            .merge_requests
            .get(merge_request)
            .ok_or(EngineError::UnknownMergeRequest(merge_request))?;
        if !mr.merged {
            return Err(EngineError::not_available(
                "skip-merged placeholder requires an already-merged merge request",
            ));
        }
        if self
            .context
            .cars
            .get_by_merge_request(merge_request)
            .is_some()
        {
            return Err(EngineError::not_available(
                "merge request already has a train entry",
            ));
        }

        Ok(self.context.cars.insert_skip_merged(&mr, user))
    }

    /// Transitions the first car from fresh to merging.
    ///
    /// Called by the refresh scheduler once the car's pipeline succeeded.
    /// Re-checks state under the lock; returns `None` when the car changed
    /// or vanished since the scheduler's snapshot, in which case the caller
    /// simply re-scans.
    pub(crate) async fn begin_merge(&self, merge_request: MergeRequestId) -> Option<Car> {
        let _guard = self.context.locks.lock(merge_request).await;
        let car = self.context.cars.get_by_merge_request(merge_request)?;
        if car.state != CarState::Fresh {
            debug!(car = %car.id, state = car.state.name(), "not starting merge");
            return None;
        }
        self.context.cars.apply(car.id, CarEvent::StartMerge)
    }

    /// 0-based queue position of a merge request's car, for UI display.
    /// `None` when the merge request has no active car.
    pub fn car_index(&self, merge_request: MergeRequestId) -> Option<usize> {
        let car = self.context.cars.get_by_merge_request(merge_request)?;
        let train = self.context.train(&car.train_key());
        train.index_of(car.id)
    }

    /// Active and completed cars of one train, ordered by id, for
    /// audit/history views.
    pub fn train_history(&self, key: &TrainKey) -> Vec<Car> {
        self.context.train(key).all_cars().to_vec()
    }

    /// Best-effort deletion of an evicted car's train ref. Failures are
    /// logged and retried by the ref layer's own janitor, never surfaced.
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

/// The eligibility rule: train mode enabled, not already merged, a build
/// artifact for the current diff head, and that artifact either complete or
/// allowed to still be running.
fn eligibility(mr: &MergeRequest, settings: ProjectSettings) -> Result<(), &'static str> {
    if !settings.merge_trains_enabled {
        return Err("merge trains are not enabled for the target project");
    }
    // A merged request must never get a car: the finalizer's idempotency
    // guard would skip settling it, leaving the car stuck in merging.
    if mr.merged {
        return Err("merge request is already merged");
    }
    match &mr.head_pipeline {
        None => Err("no pipeline exists for the current diff head"),
        Some(head) if head.sha != mr.diff_head_sha => {
            Err("head pipeline does not match the current diff head")
        }
        Some(head) if !head.complete && settings.require_successful_pipeline => {
            Err("head pipeline is still running and the project requires a successful pipeline")
        }
        Some(_) => Ok(()),
    }
}
