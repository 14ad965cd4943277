//! The background re-scan task that advances trains.
//!
//! Every relevant state change signals a `TrainKey` over the refresh
//! channel; the scheduler drains the channel, deduplicates keys, and runs a
//! level-triggered re-scan per train. A re-scan recomputes everything from
//! current state, so duplicate or out-of-order signals are harmless and two
//! scans with no intervening change are a no-op.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::context::EngineContext;
use crate::coordinator::TrainCoordinator;
use crate::effects::{
    PipelineEffect, PipelineInterpreter, PipelineResponse, PipelineStatus, RefEffect,
    RefInterpreter, RefResponse,
};
use crate::events::EngineEvent;
use crate::finalizer::{MergeFinalizer, MergeSource};
use crate::state::CarEvent;
use crate::train::Train;
use crate::types::{Car, PipelineId, Sha, TrainKey};


/// Delay before a failed re-scan is signalled again.
const RESCAN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// A re-scan failure. Always retried by re-signalling the train after a
/// delay; per-car state is left as it was.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("pipeline interpreter failed: {0}")]
    Pipeline(String),

    #[error("ref interpreter failed: {0}")]
    Refs(String),

    #[error("interpreter returned a response of the wrong shape")]
    UnexpectedResponse,
}

/// Consumes refresh signals and re-scans the named trains.
#[derive(Debug)]
pub struct RefreshScheduler<P, R> {
    context: Arc<EngineContext>,
    pipelines: P,
    refs: R,
    coordinator: TrainCoordinator<R>,
    finalizer: MergeFinalizer<R>,
    refresh_rx: mpsc::UnboundedReceiver<TrainKey>,
}

impl<P, R> RefreshScheduler<P, R>
where
    P: PipelineInterpreter,
    P::Error: std::fmt::Display,
    R: RefInterpreter + Clone,
    R::Error: std::fmt::Display,
{
    pub fn new(
        context: Arc<EngineContext>,
        pipelines: P,
        refs: R,
        coordinator: TrainCoordinator<R>,
        finalizer: MergeFinalizer<R>,
        refresh_rx: mpsc::UnboundedReceiver<TrainKey>,
    ) -> Self {
        RefreshScheduler {
            context,
            pipelines,
            refs,
            coordinator,
            finalizer,
            refresh_rx,
        }
    }

    /// Runs until the channel closes or the token is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                key = self.refresh_rx.recv() => {
                    let Some(key) = key else { break };
                    // Drain whatever queued up behind this signal so a burst
                    // of events becomes one scan per train.
                    let mut keys = HashSet::new();
                    keys.insert(key);
                    while let Ok(key) = self.refresh_rx.try_recv() {
                        keys.insert(key);
                    }
                    for key in keys {
                        if let Err(err) = self.rescan(&key).await {
                            warn!(train = %key, error = %err, "re-scan failed");
                            self.retry_later(key);
                        }
                    }
                }
            }
        }
        debug!("refresh scheduler stopped");
    }

    /// Re-scans one train from current state until it can make no further
    /// progress.
    ///
    /// The first active car drives the merge decision: request its pipeline
    /// if it needs one, merge it if its pipeline succeeded, abort it if its
    /// pipeline failed and move on to the new first car. While the first car
    /// waits on its pipeline, successors needing a pipeline get one against
    /// their predecessor's train ref, so the whole train validates
    /// concurrently. Each iteration re-snapshots the train; earlier steps'
    /// effects are visible to later ones.
    #[instrument(skip(self))]
    async fn rescan(&self, key: &TrainKey) -> Result<(), RefreshError> {
        loop {
            let train = self.context.train(key);
            let Some(first) = train.first_car().cloned() else {
                break;
            };

            if first.requires_new_pipeline() {
                self.request_pipeline(&train, &first).await?;
                continue;
            }

            let Some(pipeline) = first.pipeline else {
                break;
            };
            let status = self.pipeline_status(pipeline).await?;
            if status.complete {
                if status.failed() {
                    self.coordinator
                        .abort(first.merge_request, "pipeline did not succeed")
                        .await;
                } else if self.coordinator.begin_merge(first.merge_request).await.is_some() {
                    self.finalizer
                        .finalize_merge(first.merge_request, MergeSource::Train)
                        .await
                        .ok();
                }
                continue;
            }

            // First car is waiting; keep the rest of the train validating.
            let Some(waiting) = train
                .active_cars()
                .find(|car| car.requires_new_pipeline())
                .cloned()
            else {
                break;
            };
            self.request_pipeline(&train, &waiting).await?;
        }

        self.context.events.emit(EngineEvent::TrainRefreshed {
            project: key.project,
            target_branch: key.target_branch.clone(),
        });
        Ok(())
    }

    /// Requests a pipeline for a car against its validation base, without
    /// holding the car's lock across the external calls. State is re-checked
    /// under the lock before the result is recorded.
    async fn request_pipeline(&self, train: &Train, car: &Car) -> Result<(), RefreshError> {
        let base = self.validation_base(train, car).await?;

        let train_ref = self
            .create_train_ref(car, &base)
            .await?;

        let response = self
            .pipelines
            .interpret(PipelineEffect::Request {
                merge_request: car.merge_request,
                base: base.clone(),
            })
            .await
            .map_err(|err| RefreshError::Pipeline(err.to_string()))?;
        let PipelineResponse::Requested { pipeline } = response else {
            return Err(RefreshError::UnexpectedResponse);
        };

        let recorded = {
            let _guard = self.context.locks.lock(car.merge_request).await;
            match self.context.cars.get(car.id) {
                Some(current) if current.is_active() => {
                    self.context.cars.set_train_ref(car.id, train_ref);
                    self.context
                        .cars
                        .apply(car.id, CarEvent::RefreshPipeline(pipeline));
                    true
                }
                _ => false,
            }
        };

        if !recorded {
            // The car left the train mid-request; its eviction ran against a
            // snapshot without this ref, so the cleanup falls to us.
            debug!(car = %car.id, "car left the train while its pipeline was requested");
            let effect = RefEffect::DeleteTrainRef {
                project: car.project,
                car: car.id,
            };
            if let Err(err) = self.refs.interpret(effect).await {
                warn!(car = %car.id, error = %err, "failed to delete train ref");
            }
        }
        Ok(())
    }

    /// The SHA a car's pipeline must be validated against: the previous
    /// active car's train ref if present, otherwise the target branch tip.
    /// Every car's pipeline reflects the cumulative effect of the cars
    /// ahead of it.
    async fn validation_base(&self, train: &Train, car: &Car) -> Result<Sha, RefreshError> {
        if let Some(previous) = train.previous_active(car.id) {
            if let Some(sha) = &previous.train_ref {
                return Ok(sha.clone());
            }
        }

        let response = self
            .refs
            .interpret(RefEffect::GetRefSha {
                project: car.project,
                ref_name: car.target_branch.head_ref(),
            })
            .await
            .map_err(|err| RefreshError::Refs(err.to_string()))?;
        match response {
            RefResponse::Sha { sha } => Ok(sha),
            _ => Err(RefreshError::UnexpectedResponse),
        }
    }

    async fn create_train_ref(&self, car: &Car, base: &Sha) -> Result<Sha, RefreshError> {
        let response = self
            .refs
            .interpret(RefEffect::CreateTrainRef {
                project: car.project,
                merge_request: car.merge_request,
                car: car.id,
                base: base.clone(),
            })
            .await
            .map_err(|err| RefreshError::Refs(err.to_string()))?;
        match response {
            RefResponse::TrainRefCreated { sha } => Ok(sha),
            _ => Err(RefreshError::UnexpectedResponse),
        }
    }

    async fn pipeline_status(&self, pipeline: PipelineId) -> Result<PipelineStatus, RefreshError> {
        let response = self
            .pipelines
            .interpret(PipelineEffect::GetStatus { pipeline })
            .await
            .map_err(|err| RefreshError::Pipeline(err.to_string()))?;
        match response {
            PipelineResponse::Status(status) => Ok(status),
            _ => Err(RefreshError::UnexpectedResponse),
        }
    }

    fn retry_later(&self, key: TrainKey) {
        let context = self.context.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESCAN_RETRY_DELAY).await;
            context.signal_refresh(&key);
        });
    }
}
