//! Shared engine core: the stores, the event bus, the refresh signal
//! channel, and the one removal routine every eviction path goes through.

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::events::{EngineEvent, EventBus};
use crate::state::CarEvent;
use crate::store::{CarStore, MergeRequestLocks, MergeRequestStore, ProjectRegistry};
use crate::train::Train;
use crate::types::{Car, CarState, MergeRequestId, TrainKey};

/// Shared state behind every engine component.
///
/// The coordinator, finalizer, and refresh scheduler all hold an
/// `Arc<EngineContext>`; the stores inside serialize their own access, and
/// `locks` provides the per-car mutation contract.
#[derive(Debug)]
pub struct EngineContext {
    pub cars: CarStore,
    pub merge_requests: MergeRequestStore,
    pub projects: ProjectRegistry,
    pub locks: MergeRequestLocks,
    pub events: EventBus,
    refresh_tx: mpsc::UnboundedSender<TrainKey>,
}

impl EngineContext {
    /// Creates the context and the receiving end of the refresh channel,
    /// which the scheduler task consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TrainKey>) {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let context = EngineContext {
            cars: CarStore::new(),
            merge_requests: MergeRequestStore::new(),
            projects: ProjectRegistry::new(),
            locks: MergeRequestLocks::new(),
            events: EventBus::new(),
            refresh_tx,
        };
        (context, refresh_rx)
    }

    /// Takes a point-in-time snapshot of one train.
    pub fn train(&self, key: &TrainKey) -> Train {
        Train::new(key.clone(), self.cars.train_cars(key))
    }

    /// Signals the refresh scheduler to re-scan one train. Decoupled from
    /// the triggering event so rapid signals coalesce into one scan. A
    /// closed channel (scheduler shut down) is ignored.
    pub fn signal_refresh(&self, key: &TrainKey) {
        trace!(train = %key, "signalling refresh");
        let _ = self.refresh_tx.send(key.clone());
    }

    /// Removes a merge request's car before it merges, applying the shared
    /// eviction contract: capture the successor, delete the car, outdate the
    /// successor, signal a re-scan, emit `car_aborted`.
    ///
    /// Returns the removed car, or `None` if there was no car to remove or
    /// it had already reached merging/merged. The two-car sequence is
    /// intentionally non-atomic: the successor is outdated after the delete,
    /// under its own lock, and the idempotent re-scan repairs any transient
    /// inconsistency.
    pub async fn remove_car(&self, merge_request: MergeRequestId, reason: &str) -> Option<Car> {
        let (removed, successor) = {
            let _guard = self.locks.lock(merge_request).await;

            let car = self.cars.get_by_merge_request(merge_request)?;
            if !car.is_active() {
                debug!(
                    car = %car.id,
                    state = car.state.name(),
                    "not removing car past the point of no return"
                );
                return None;
            }

            // Capture the successor before the delete; afterwards the car is
            // gone and the successor can no longer be located relative to it.
            let train = self.train(&car.train_key());
            let successor = train.successor_of(car.id).cloned();
            let removed = self.cars.remove(car.id)?;
            (removed, successor)
        };

        debug!(car = %removed.id, merge_request = %merge_request, reason, "car evicted");

        if let Some(successor) = successor {
            self.outdate_car(successor).await;
        }

        self.events.emit(EngineEvent::CarAborted {
            car: removed.clone(),
            reason: reason.to_string(),
        });
        self.signal_refresh(&removed.train_key());

        Some(removed)
    }

    /// Marks a car's pipeline as outdated because its predecessor changed.
    ///
    /// Only a fresh car transitions (idle and stale cars already need a
    /// pipeline); the state is re-checked under the car's own lock because
    /// the snapshot that located it is already stale.
    pub async fn outdate_car(&self, car: Car) {
        let _guard = self.locks.lock(car.merge_request).await;
        match self.cars.get(car.id) {
            Some(current) if current.state == CarState::Fresh => {
                self.cars.apply(car.id, CarEvent::OutdatePipeline);
            }
            Some(current) => {
                trace!(
                    car = %car.id,
                    state = current.state.name(),
                    "successor needs no outdating"
                );
            }
            None => {
                trace!(car = %car.id, "successor vanished before outdating");
            }
        }
    }
}
