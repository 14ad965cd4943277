//! Shared fixtures and recording fakes for the test suites.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;

use crate::context::EngineContext;
use crate::effects::{
    PipelineEffect, PipelineInterpreter, PipelineResponse, PipelineStatus, RefEffect,
    RefInterpreter, RefResponse,
};
use crate::state::CarEvent;
use crate::types::{
    BranchName, Car, CarId, CarState, MergeRequest, MergeRequestId, PipelineId, ProjectId,
    ProjectSettings, Sha, TrainKey, UserId,
};

/// Installs a tracing subscriber reading `RUST_LOG`, writing through the
/// test harness. Safe to call from every test; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A deterministic 40-character SHA built from a numeric seed.
pub fn test_sha(seed: u64) -> Sha {
    Sha::new(format!("{seed:040x}"))
}

/// Builds a car with the given id, train, and state. Fields not covered by
/// the arguments get neutral defaults.
pub fn make_car(
    id: u64,
    project: u64,
    target_branch: &str,
    merge_request: u64,
    state: CarState,
    pipeline: Option<PipelineId>,
) -> Car {
    Car {
        id: CarId(id),
        project: ProjectId(project),
        target_branch: BranchName::new(target_branch),
        merge_request: MergeRequestId(merge_request),
        user: UserId(1),
        pipeline,
        train_ref: None,
        state,
        created_at: Utc::now(),
        merged_at: None,
        duration: None,
    }
}

/// Builds an unmerged merge request with a diff head derived from its id and
/// no head pipeline.
pub fn make_merge_request(id: u64, project: u64, source: &str, target: &str) -> MergeRequest {
    MergeRequest::new(
        MergeRequestId(id),
        ProjectId(project),
        source,
        target,
        test_sha(id),
    )
}

/// Fresh context plus the refresh-signal receiver, with project 1 registered
/// as train-enabled.
pub fn setup_context() -> (Arc<EngineContext>, mpsc::UnboundedReceiver<TrainKey>) {
    let (context, refresh_rx) = EngineContext::new();
    context.projects.upsert(
        ProjectId(1),
        ProjectSettings {
            merge_trains_enabled: true,
            require_successful_pipeline: true,
        },
    );
    (Arc::new(context), refresh_rx)
}

/// Registers a merge request on project 1 targeting `main` and inserts a
/// fresh car for it, bypassing the coordinator. The car carries the given
/// pipeline.
pub fn enqueue_fresh_car(context: &EngineContext, merge_request: u64, pipeline: PipelineId) -> Car {
    let source = format!("feature/{merge_request}");
    let mr = make_merge_request(merge_request, 1, &source, "main");
    context.merge_requests.upsert(mr.clone());
    let car = context.cars.insert_idle(&mr, UserId(1));
    context
        .cars
        .apply(car.id, CarEvent::RefreshPipeline(pipeline))
        .expect("car was just inserted")
}

/// Recording fake for the build system.
///
/// Pipeline requests allocate ids from 1000 upward and start in a running
/// state; tests script completion through [`FakePipelines::succeed`] and
/// [`FakePipelines::fail`].
#[derive(Debug, Clone, Default)]
pub struct FakePipelines {
    inner: Arc<Mutex<FakePipelinesInner>>,
}

#[derive(Debug, Default)]
struct FakePipelinesInner {
    next_id: u64,
    statuses: HashMap<PipelineId, PipelineStatus>,
    requests: Vec<(MergeRequestId, Sha)>,
}

impl FakePipelines {
    pub fn new() -> Self {
        FakePipelines::default()
    }

    /// Marks a pipeline complete and successful against the SHA it was
    /// requested for.
    pub fn succeed(&self, pipeline: PipelineId) {
        let mut inner = self.inner.lock().expect("fake pipelines poisoned");
        let status = inner
            .statuses
            .get_mut(&pipeline)
            .expect("pipeline was never requested");
        status.complete = true;
        status.successful = true;
    }

    /// Marks a pipeline complete and failed.
    pub fn fail(&self, pipeline: PipelineId) {
        let mut inner = self.inner.lock().expect("fake pipelines poisoned");
        let status = inner
            .statuses
            .get_mut(&pipeline)
            .expect("pipeline was never requested");
        status.complete = true;
        status.successful = false;
    }

    /// Every `(merge request, base)` pair requested so far, in order.
    pub fn requests(&self) -> Vec<(MergeRequestId, Sha)> {
        self.inner
            .lock()
            .expect("fake pipelines poisoned")
            .requests
            .clone()
    }
}

impl PipelineInterpreter for FakePipelines {
    type Error = Infallible;

    async fn interpret(&self, effect: PipelineEffect) -> Result<PipelineResponse, Infallible> {
        let mut inner = self.inner.lock().expect("fake pipelines poisoned");
        match effect {
            PipelineEffect::Request {
                merge_request,
                base,
            } => {
                let pipeline = PipelineId(1000 + inner.next_id);
                inner.next_id += 1;
                inner.requests.push((merge_request, base.clone()));
                inner.statuses.insert(
                    pipeline,
                    PipelineStatus {
                        complete: false,
                        successful: false,
                        sha: base,
                    },
                );
                Ok(PipelineResponse::Requested { pipeline })
            }
            PipelineEffect::GetStatus { pipeline } => {
                let status = inner
                    .statuses
                    .get(&pipeline)
                    .cloned()
                    .unwrap_or(PipelineStatus {
                        complete: false,
                        successful: false,
                        sha: test_sha(0),
                    });
                Ok(PipelineResponse::Status(status))
            }
        }
    }
}

/// Recording fake for the ref-management layer.
///
/// Branch tips are scripted; train-ref creation returns a deterministic SHA
/// derived from the car id and the base, so tests can assert the chain.
#[derive(Debug, Clone, Default)]
pub struct FakeRefs {
    inner: Arc<Mutex<FakeRefsInner>>,
}

#[derive(Debug, Default)]
struct FakeRefsInner {
    branch_tips: HashMap<(ProjectId, String), Sha>,
    creates: Vec<(CarId, Sha)>,
    deletes: Vec<CarId>,
}

impl FakeRefs {
    pub fn new() -> Self {
        FakeRefs::default()
    }

    /// Scripts the SHA `GetRefSha` resolves for a branch's head ref.
    pub fn set_branch_tip(&self, project: ProjectId, branch: &str, sha: Sha) {
        let mut inner = self.inner.lock().expect("fake refs poisoned");
        inner
            .branch_tips
            .insert((project, BranchName::new(branch).head_ref()), sha);
    }

    /// The SHA a `CreateTrainRef` for this car and base will return.
    pub fn train_ref_sha(car: CarId, base: &Sha) -> Sha {
        let base_tag = u64::from_str_radix(base.short(), 16).unwrap_or(0);
        Sha::new(format!("{:040x}", 0xcc00_0000_u64 + car.0 * 4096 + base_tag % 4096))
    }

    /// Every `(car, base)` train-ref creation so far, in order.
    pub fn creates(&self) -> Vec<(CarId, Sha)> {
        self.inner.lock().expect("fake refs poisoned").creates.clone()
    }

    /// Every train-ref deletion so far, in order.
    pub fn deletes(&self) -> Vec<CarId> {
        self.inner.lock().expect("fake refs poisoned").deletes.clone()
    }
}

impl RefInterpreter for FakeRefs {
    type Error = Infallible;

    async fn interpret(&self, effect: RefEffect) -> Result<RefResponse, Infallible> {
        let mut inner = self.inner.lock().expect("fake refs poisoned");
        match effect {
            RefEffect::CreateTrainRef { car, base, .. } => {
                let sha = FakeRefs::train_ref_sha(car, &base);
                inner.creates.push((car, base));
                Ok(RefResponse::TrainRefCreated { sha })
            }
            RefEffect::DeleteTrainRef { car, .. } => {
                inner.deletes.push(car);
                Ok(RefResponse::Deleted)
            }
            RefEffect::GetRefSha { project, ref_name } => {
                let sha = inner
                    .branch_tips
                    .get(&(project, ref_name))
                    .cloned()
                    .unwrap_or_else(|| test_sha(0));
                Ok(RefResponse::Sha { sha })
            }
        }
    }
}
