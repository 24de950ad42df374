//! Health events broadcast to any number of subscribers.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::HealthSnapshot;
use super::checks::HealthStatus;
use super::remediation::RemediationAction;

/// Events buffered per slow subscriber before it starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum HealthEvent {
    CheckCompleted(Arc<HealthSnapshot>),
    StatusChanged {
        previous: HealthStatus,
        current: HealthStatus,
        timestamp: i64,
    },
    Remediation(RemediationAction),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HealthEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: HealthEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
