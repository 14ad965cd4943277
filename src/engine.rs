//! Engine assembly: wires the stores, coordinator, finalizer, and refresh
//! scheduler together and owns the scheduler task's lifecycle.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::EngineContext;
use crate::coordinator::{EngineError, TrainCoordinator};
use crate::effects::{PipelineInterpreter, RefInterpreter};
use crate::events::EngineEvent;
use crate::finalizer::{MergeFinalizer, MergeSource};
use crate::refresh::RefreshScheduler;
use crate::types::{
    Car, HeadPipeline, MergeRequest, MergeRequestId, ProjectId, ProjectSettings, TrainKey, UserId,
};

/// One running merge-train engine.
///
/// Construction spawns the refresh scheduler; [`Engine::shutdown`] stops it.
/// All public operations delegate to the coordinator and finalizer over the
/// shared context.
#[derive(Debug)]
pub struct Engine<R> {
    context: Arc<EngineContext>,
    coordinator: TrainCoordinator<R>,
    finalizer: MergeFinalizer<R>,
    shutdown: CancellationToken,
    scheduler: JoinHandle<()>,
}

impl<R> Engine<R>
where
    R: RefInterpreter + Clone + Send + Sync + 'static,
    R::Error: std::fmt::Display,
{
    /// Builds the engine against the given interpreters and starts the
    /// refresh scheduler task.
    pub fn start<P>(pipelines: P, refs: R) -> Self
    where
        P: PipelineInterpreter + Send + Sync + 'static,
        P::Error: std::fmt::Display,
    {
        let (context, refresh_rx) = EngineContext::new();
        let context = Arc::new(context);
        let coordinator = TrainCoordinator::new(context.clone(), refs.clone());
        let finalizer = MergeFinalizer::new(context.clone(), refs.clone());
        let scheduler = RefreshScheduler::new(
            context.clone(),
            pipelines,
            refs,
            coordinator.clone(),
            finalizer.clone(),
            refresh_rx,
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));
        info!("merge train engine started");

        Engine {
            context,
            coordinator,
            finalizer,
            shutdown,
            scheduler: handle,
        }
    }

    /// Stops the refresh scheduler and waits for it to finish. In-flight
    /// state transitions complete; unprocessed refresh signals are dropped.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.scheduler.await;
        info!("merge train engine stopped");
    }

    // Input records from the embedding application.

    pub fn upsert_project(&self, project: ProjectId, settings: ProjectSettings) {
        self.context.projects.upsert(project, settings);
    }

    pub fn upsert_merge_request(&self, merge_request: MergeRequest) {
        self.context.merge_requests.upsert(merge_request);
    }

    /// Records a new head pipeline for a merge request's own diff head and
    /// re-signals its train.
    pub fn set_head_pipeline(&self, merge_request: MergeRequestId, pipeline: HeadPipeline) {
        if let Some(mr) = self
            .context
            .merge_requests
            .set_head_pipeline(merge_request, pipeline)
        {
            self.context.signal_refresh(&mr.train_key());
        }
    }

    // Coordination operations.

    pub async fn enqueue(
        &self,
        merge_request: MergeRequestId,
        user: UserId,
    ) -> Result<Car, EngineError> {
        self.coordinator.enqueue(merge_request, user).await
    }

    pub fn process(&self, merge_request: MergeRequestId) -> Result<(), EngineError> {
        self.coordinator.process(merge_request)
    }

    pub async fn cancel(&self, merge_request: MergeRequestId) -> Option<Car> {
        self.coordinator.cancel(merge_request).await
    }

    pub async fn abort(&self, merge_request: MergeRequestId, reason: &str) -> Option<Car> {
        self.coordinator.abort(merge_request, reason).await
    }

    pub fn available_for(&self, merge_request: MergeRequestId) -> Result<bool, EngineError> {
        self.coordinator.available_for(merge_request)
    }

    pub async fn insert_skip_merged(
        &self,
        merge_request: MergeRequestId,
        user: UserId,
    ) -> Result<Car, EngineError> {
        self.coordinator.insert_skip_merged(merge_request, user).await
    }

    pub async fn finalize_merge(
        &self,
        merge_request: MergeRequestId,
        source: MergeSource,
    ) -> Result<(), EngineError> {
        self.finalizer.finalize_merge(merge_request, source).await
    }

    // Query surface.

    /// 0-based queue position of a merge request's car, if it has an active
    /// one.
    pub fn car_index(&self, merge_request: MergeRequestId) -> Option<usize> {
        self.coordinator.car_index(merge_request)
    }

    /// Active and completed cars of one train, for audit/history views.
    pub fn train_history(&self, key: &TrainKey) -> Vec<Car> {
        self.coordinator.train_history(key)
    }

    /// Subscribes to engine events. Best-effort delivery; events emitted
    /// before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.context.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakePipelines, FakeRefs, make_merge_request, test_sha};
    use crate::types::{CarState, PipelineId};

    fn eligible(id: u64) -> MergeRequest {
        let source = format!("feature/{id}");
        make_merge_request(id, 1, &source, "main").with_head_pipeline(HeadPipeline {
            id: PipelineId(500 + id),
            sha: test_sha(id),
            complete: true,
        })
    }

    fn train_enabled() -> ProjectSettings {
        ProjectSettings {
            merge_trains_enabled: true,
            require_successful_pipeline: true,
        }
    }

    #[tokio::test]
    async fn merge_request_rides_the_train_end_to_end() {
        crate::test_utils::init_tracing();
        let pipelines = FakePipelines::new();
        let refs = FakeRefs::new();
        refs.set_branch_tip(ProjectId(1), "main", test_sha(0xbead));
        let engine = Engine::start(pipelines.clone(), refs);
        engine.upsert_project(ProjectId(1), train_enabled());
        engine.upsert_merge_request(eligible(10));

        let mut events = engine.subscribe();
        let car = engine.enqueue(MergeRequestId(10), UserId(3)).await.unwrap();
        assert_eq!(engine.car_index(MergeRequestId(10)), Some(0));

        // The scheduler picks up the enqueue signal and requests a pipeline.
        loop {
            if let EngineEvent::TrainRefreshed { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(pipelines.requests().len(), 1);

        pipelines.succeed(PipelineId(1000));
        engine.process(MergeRequestId(10)).unwrap();

        loop {
            if let EngineEvent::CarMerged { car: merged } = events.recv().await.unwrap() {
                assert_eq!(merged.id, car.id);
                assert_eq!(merged.state, CarState::Merged);
                break;
            }
        }
        assert_eq!(engine.car_index(MergeRequestId(10)), None);
        assert_eq!(engine.train_history(&car.train_key()).len(), 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_is_immediate_from_the_caller_view() {
        let engine = Engine::start(FakePipelines::new(), FakeRefs::new());
        engine.upsert_project(ProjectId(1), train_enabled());
        engine.upsert_merge_request(eligible(10));

        engine.enqueue(MergeRequestId(10), UserId(3)).await.unwrap();
        assert!(engine.cancel(MergeRequestId(10)).await.is_some());
        assert_eq!(engine.car_index(MergeRequestId(10)), None);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn new_head_pipeline_signals_the_train() {
        let engine = Engine::start(FakePipelines::new(), FakeRefs::new());
        engine.upsert_project(ProjectId(1), train_enabled());
        engine.upsert_merge_request(make_merge_request(10, 1, "feature/10", "main"));

        assert!(!engine.available_for(MergeRequestId(10)).unwrap());
        engine.set_head_pipeline(
            MergeRequestId(10),
            HeadPipeline {
                id: PipelineId(510),
                sha: test_sha(10),
                complete: true,
            },
        );
        assert!(engine.available_for(MergeRequestId(10)).unwrap());

        engine.shutdown().await;
    }
}
