//! The derived train view: ordering queries over one `(project, branch)`
//! partition of the car collection.
//!
//! A `Train` is a point-in-time snapshot, never an aggregate with its own
//! state. Position is always computed as a rank over active cars with a
//! smaller id — there is no stored position field to renumber. Any snapshot
//! may be superseded by the time a consumer acts on it; the refresh
//! scheduler's idempotent re-scan is the correction mechanism.

use crate::types::{Car, CarId, MergeRequestId, TrainKey};

/// Snapshot of one merge train, cars ordered by id ascending.
#[derive(Debug, Clone)]
pub struct Train {
    key: TrainKey,
    cars: Vec<Car>,
}

impl Train {
    /// Builds a train view from an id-ordered car list.
    pub fn new(key: TrainKey, cars: Vec<Car>) -> Self {
        debug_assert!(cars.windows(2).all(|w| w[0].id < w[1].id));
        Train { key, cars }
    }

    pub fn key(&self) -> &TrainKey {
        &self.key
    }

    /// All cars for this train, ordered by id ascending.
    pub fn all_cars(&self) -> &[Car] {
        &self.cars
    }

    /// Cars still occupying a queue position (idle, stale, or fresh).
    pub fn active_cars(&self) -> impl Iterator<Item = &Car> {
        self.cars.iter().filter(|car| car.is_active())
    }

    /// Completed train history (merging, merged, or skip-merged).
    pub fn complete_cars(&self) -> impl Iterator<Item = &Car> {
        self.cars.iter().filter(|car| car.state.is_complete())
    }

    /// The lowest-id active car: the only car that may be mergeable.
    pub fn first_car(&self) -> Option<&Car> {
        self.active_cars().next()
    }

    /// 0-based queue position of a car: the count of active cars with a
    /// strictly smaller id. `None` if the car is not active in this train.
    pub fn index_of(&self, id: CarId) -> Option<usize> {
        self.active_cars().position(|car| car.id == id)
    }

    /// Like [`Train::index_of`], looked up by merge request.
    pub fn index_of_merge_request(&self, merge_request: MergeRequestId) -> Option<usize> {
        self.active_cars()
            .position(|car| car.merge_request == merge_request)
    }

    /// The active car immediately ahead of the given id, if any. Its train
    /// ref (when present) is the validation base for the given car.
    pub fn previous_active(&self, id: CarId) -> Option<&Car> {
        self.active_cars().take_while(|car| car.id < id).last()
    }

    /// The next active car after the given id, if any. This is the car that
    /// must be outdated when its predecessor merges or is removed.
    pub fn successor_of(&self, id: CarId) -> Option<&Car> {
        self.active_cars().find(|car| car.id > id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_car;
    use crate::types::{CarState, PipelineId, ProjectId};
    use proptest::prelude::*;

    fn key() -> TrainKey {
        TrainKey::new(ProjectId(1), "main")
    }

    fn train(states: &[CarState]) -> Train {
        let cars = states
            .iter()
            .enumerate()
            .map(|(i, &state)| {
                make_car(
                    i as u64,
                    1,
                    "main",
                    100 + i as u64,
                    state,
                    Some(PipelineId(i as u64)),
                )
            })
            .collect();
        Train::new(key(), cars)
    }

    #[test]
    fn first_car_skips_complete_cars() {
        let t = train(&[CarState::Merged, CarState::Merging, CarState::Fresh]);
        assert_eq!(t.first_car().unwrap().id, CarId(2));
    }

    #[test]
    fn empty_train_has_no_first_car() {
        let t = Train::new(key(), vec![]);
        assert!(t.first_car().is_none());
    }

    #[test]
    fn index_skips_inactive_predecessors() {
        let t = train(&[CarState::Merged, CarState::Fresh, CarState::Idle]);
        assert_eq!(t.index_of(CarId(0)), None);
        assert_eq!(t.index_of(CarId(1)), Some(0));
        assert_eq!(t.index_of(CarId(2)), Some(1));
    }

    #[test]
    fn previous_active_skips_complete_cars() {
        let t = train(&[CarState::Fresh, CarState::Merged, CarState::Idle]);
        assert_eq!(t.previous_active(CarId(2)).unwrap().id, CarId(0));
        assert!(t.previous_active(CarId(0)).is_none());
    }

    #[test]
    fn successor_skips_complete_cars() {
        let t = train(&[CarState::Merging, CarState::Merged, CarState::Idle]);
        assert_eq!(t.successor_of(CarId(0)).unwrap().id, CarId(2));
        assert!(t.successor_of(CarId(2)).is_none());
    }

    proptest! {
        /// Ordering invariant: for active cars, id order and derived index
        /// order agree.
        #[test]
        fn index_order_matches_id_order(
            states in prop::collection::vec(
                prop_oneof![
                    Just(CarState::Idle),
                    Just(CarState::Fresh),
                    Just(CarState::Stale),
                    Just(CarState::Merging),
                    Just(CarState::Merged),
                    Just(CarState::SkipMerged),
                ],
                0..12,
            )
        ) {
            let t = train(&states);
            let active: Vec<_> = t.active_cars().collect();
            for pair in active.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                prop_assert!(a.id < b.id);
                prop_assert!(t.index_of(a.id).unwrap() < t.index_of(b.id).unwrap());
            }
        }

        /// At most one car is first; it has index 0 and no active
        /// predecessor.
        #[test]
        fn first_car_has_rank_zero(
            states in prop::collection::vec(
                prop_oneof![
                    Just(CarState::Idle),
                    Just(CarState::Fresh),
                    Just(CarState::Merged),
                ],
                0..12,
            )
        ) {
            let t = train(&states);
            if let Some(first) = t.first_car() {
                prop_assert_eq!(t.index_of(first.id), Some(0));
                prop_assert!(t.previous_active(first.id).is_none());
            }
        }
    }
}
