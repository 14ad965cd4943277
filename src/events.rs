//! Fire-and-forget engine events for notification and audit listeners.
//!
//! Delivery is best-effort over a `tokio::sync::broadcast` channel: emission
//! never blocks, and a missing or lagging subscriber never fails a state
//! transition.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{BranchName, Car, ProjectId};

/// Default capacity for the broadcast channel. Slow subscribers past this
/// many undelivered events start lagging and lose the oldest ones.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A named event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A car was created and joined its train.
    CarEnqueued { car: Car },

    /// A car's merge request was merged through the train.
    CarMerged { car: Car },

    /// A car was removed before merging, voluntarily or not.
    CarAborted { car: Car, reason: String },

    /// A re-scan of one train completed.
    TrainRefreshed {
        project: ProjectId,
        target_branch: BranchName,
    },
}

impl EngineEvent {
    /// Returns the name of this event for logging/display.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::CarEnqueued { .. } => "car_enqueued",
            EngineEvent::CarMerged { .. } => "car_merged",
            EngineEvent::CarAborted { .. } => "car_aborted",
            EngineEvent::TrainRefreshed { .. } => "train_refreshed",
        }
    }
}

/// Broadcast bus for engine events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        EventBus { tx }
    }

    /// Subscribes a new listener. Events emitted before this call are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emits an event to all current subscribers.
    ///
    /// A send error only means there are no subscribers; it is ignored.
    pub fn emit(&self, event: EngineEvent) {
        trace!(event = event.name(), "emitting engine event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_car;
    use crate::types::CarState;

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::TrainRefreshed {
            project: ProjectId(1),
            target_branch: BranchName::new("main"),
        });
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let car = make_car(1, 1, "main", 10, CarState::Idle, None);
        bus.emit(EngineEvent::CarEnqueued { car: car.clone() });

        let received = rx.recv().await.unwrap();
        assert_eq!(received, EngineEvent::CarEnqueued { car });
        assert_eq!(received.name(), "car_enqueued");
    }
}
