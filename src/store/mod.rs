//! In-memory coordination state: cars, merge requests, project settings, and
//! per-merge-request locks.
//!
//! Durable storage is the embedding system's concern; these stores are the
//! engine's working state. All reads hand out clones — every returned `Car`
//! is a point-in-time snapshot that may be superseded by the time the caller
//! acts on it. The per-car locks in [`MergeRequestLocks`] are what serialize
//! mutations, not the store's internal mutex (which only guards map access).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::state::{CarEvent, next_state};
use crate::types::{
    Car, CarId, CarState, MergeRequest, MergeRequestId, PipelineId, ProjectId, ProjectSettings,
    Sha, TrainKey, UserId,
};

/// Id-ordered collection of all cars across all trains.
#[derive(Debug, Default)]
pub struct CarStore {
    inner: Mutex<CarStoreInner>,
}

#[derive(Debug, Default)]
struct CarStoreInner {
    next_id: u64,
    by_id: BTreeMap<CarId, Car>,
    by_merge_request: HashMap<MergeRequestId, CarId>,
}

impl CarStore {
    pub fn new() -> Self {
        CarStore::default()
    }

    /// Creates an idle car for a merge request and assigns the next id.
    ///
    /// The caller is responsible for the one-car-per-merge-request invariant
    /// (checked under the merge request's lock before calling).
    pub fn insert_idle(&self, merge_request: &MergeRequest, user: UserId) -> Car {
        self.insert(merge_request, user, CarState::Idle)
    }

    /// Creates a terminal placeholder car for a merge request that merged
    /// outside the train.
    pub fn insert_skip_merged(&self, merge_request: &MergeRequest, user: UserId) -> Car {
        self.insert(merge_request, user, CarState::SkipMerged)
    }

    fn insert(&self, merge_request: &MergeRequest, user: UserId, state: CarState) -> Car {
        let mut inner = self.inner.lock().expect("car store poisoned");
        let id = CarId(inner.next_id);
        inner.next_id += 1;

        let car = Car {
            id,
            project: merge_request.project,
            target_branch: merge_request.target_branch.clone(),
            merge_request: merge_request.id,
            user,
            pipeline: None,
            train_ref: None,
            state,
            created_at: Utc::now(),
            merged_at: None,
            duration: None,
        };

        inner.by_merge_request.insert(merge_request.id, id);
        inner.by_id.insert(id, car.clone());
        debug!(car = %id, merge_request = %merge_request.id, state = state.name(), "car created");
        car
    }

    /// Returns a snapshot of a car by id.
    pub fn get(&self, id: CarId) -> Option<Car> {
        let inner = self.inner.lock().expect("car store poisoned");
        inner.by_id.get(&id).cloned()
    }

    /// Returns a snapshot of the car currently attached to a merge request.
    pub fn get_by_merge_request(&self, merge_request: MergeRequestId) -> Option<Car> {
        let inner = self.inner.lock().expect("car store poisoned");
        let id = inner.by_merge_request.get(&merge_request)?;
        inner.by_id.get(id).cloned()
    }

    /// Hard-removes a car. Removal is an explicit delete, distinct from the
    /// terminal states; merged cars stay in the store as history.
    pub fn remove(&self, id: CarId) -> Option<Car> {
        let mut inner = self.inner.lock().expect("car store poisoned");
        let car = inner.by_id.remove(&id)?;
        // Only unmap the merge request if it still points at this car.
        if inner.by_merge_request.get(&car.merge_request) == Some(&id) {
            inner.by_merge_request.remove(&car.merge_request);
        }
        debug!(car = %id, merge_request = %car.merge_request, "car removed");
        Some(car)
    }

    /// Applies a state-machine event to a car and returns the updated
    /// snapshot, or `None` if the car was concurrently removed.
    ///
    /// # Panics
    ///
    /// Panics if the event is invalid in the car's current state. That can
    /// only happen when two events raced on one car, i.e. the per-car
    /// serialization contract was violated — a programming error that must
    /// fail loudly rather than corrupt queue state.
    pub fn apply(&self, id: CarId, event: CarEvent) -> Option<Car> {
        let mut inner = self.inner.lock().expect("car store poisoned");
        let car = inner.by_id.get_mut(&id)?;

        let next = match next_state(car.state, event) {
            Ok(next) => next,
            Err(err) => panic!("car {id} serialization violated: {err}"),
        };

        debug!(
            car = %id,
            from = car.state.name(),
            to = next.name(),
            event = event.name(),
            "car transition"
        );

        car.state = next;
        match event {
            CarEvent::RefreshPipeline(pipeline) => {
                car.pipeline = Some(pipeline);
            }
            CarEvent::FinishMerge => {
                let merged_at = Utc::now();
                car.merged_at = Some(merged_at);
                car.duration = Some(
                    (merged_at - car.created_at)
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                );
            }
            CarEvent::OutdatePipeline | CarEvent::StartMerge => {}
        }

        Some(car.clone())
    }

    /// Records the SHA of a car's train ref.
    pub fn set_train_ref(&self, id: CarId, sha: Sha) {
        let mut inner = self.inner.lock().expect("car store poisoned");
        if let Some(car) = inner.by_id.get_mut(&id) {
            car.train_ref = Some(sha);
        }
    }

    /// Returns all cars of one train, ordered by id ascending.
    pub fn train_cars(&self, key: &TrainKey) -> Vec<Car> {
        let inner = self.inner.lock().expect("car store poisoned");
        inner
            .by_id
            .values()
            .filter(|car| car.project == key.project && car.target_branch == key.target_branch)
            .cloned()
            .collect()
    }

    /// Returns up to `limit` active cars riding the train for the given
    /// target branch. Used for the bounded cascade-abort query when a merge
    /// lands on that branch.
    pub fn active_cars_targeting(&self, key: &TrainKey, limit: usize) -> Vec<Car> {
        let inner = self.inner.lock().expect("car store poisoned");
        inner
            .by_id
            .values()
            .filter(|car| {
                car.project == key.project
                    && car.target_branch == key.target_branch
                    && car.is_active()
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Store of merge request records the engine has been told about.
#[derive(Debug, Default)]
pub struct MergeRequestStore {
    inner: Mutex<HashMap<MergeRequestId, MergeRequest>>,
}

impl MergeRequestStore {
    pub fn new() -> Self {
        MergeRequestStore::default()
    }

    /// Inserts or replaces a merge request record.
    pub fn upsert(&self, merge_request: MergeRequest) {
        let mut inner = self.inner.lock().expect("merge request store poisoned");
        inner.insert(merge_request.id, merge_request);
    }

    pub fn get(&self, id: MergeRequestId) -> Option<MergeRequest> {
        let inner = self.inner.lock().expect("merge request store poisoned");
        inner.get(&id).cloned()
    }

    /// Sets the authoritative merged flag. Returns the updated record, or
    /// `None` for an unknown merge request.
    pub fn mark_merged(&self, id: MergeRequestId) -> Option<MergeRequest> {
        let mut inner = self.inner.lock().expect("merge request store poisoned");
        let mr = inner.get_mut(&id)?;
        mr.merged = true;
        Some(mr.clone())
    }

    /// Records the latest head pipeline for a merge request's diff head.
    pub fn set_head_pipeline(
        &self,
        id: MergeRequestId,
        pipeline: crate::types::HeadPipeline,
    ) -> Option<MergeRequest> {
        let mut inner = self.inner.lock().expect("merge request store poisoned");
        let mr = inner.get_mut(&id)?;
        mr.head_pipeline = Some(pipeline);
        Some(mr.clone())
    }
}

/// Registry of per-project settings.
#[derive(Debug, Default)]
pub struct ProjectRegistry {
    inner: Mutex<HashMap<ProjectId, ProjectSettings>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        ProjectRegistry::default()
    }

    pub fn upsert(&self, project: ProjectId, settings: ProjectSettings) {
        let mut inner = self.inner.lock().expect("project registry poisoned");
        inner.insert(project, settings);
    }

    /// Returns the settings for a project, defaulting to trains disabled
    /// for unknown projects.
    pub fn settings(&self, project: ProjectId) -> ProjectSettings {
        let inner = self.inner.lock().expect("project registry poisoned");
        inner.get(&project).copied().unwrap_or_default()
    }
}

/// Per-merge-request async mutexes.
///
/// Every mutating operation on a car runs under its merge request's lock;
/// that is the serialization guarantee the state machine relies on. Locks
/// are created on first use and kept for the life of the engine (merge
/// request cardinality is bounded by the embedding application).
#[derive(Debug, Default)]
pub struct MergeRequestLocks {
    inner: Mutex<HashMap<MergeRequestId, Arc<AsyncMutex<()>>>>,
}

impl MergeRequestLocks {
    pub fn new() -> Self {
        MergeRequestLocks::default()
    }

    /// Acquires the lock for one merge request.
    pub async fn lock(&self, merge_request: MergeRequestId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut inner = self.inner.lock().expect("lock map poisoned");
            inner
                .entry(merge_request)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}
