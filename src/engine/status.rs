//! Read-only status stream for the control surface

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Updates are dropped for subscribers lagging this far behind
const STATUS_CAPACITY: usize = 1024;

/// One status event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusUpdate {
    Started {
        operator_balance: u64,
    },
    Stopping {
        in_flight: usize,
    },
    Stopped,
    FeedConnected {
        feed: String,
    },
    FeedInterrupted {
        feed: String,
        reason: String,
    },
    IntentsDropped {
        total: u64,
    },
    OpportunityFound {
        opportunity_id: Uuid,
        intent_id: String,
        front_run_lamports: u64,
        net_profit: i128,
    },
    AttemptRejected {
        opportunity_id: Uuid,
        reason: String,
    },
    BidPlaced {
        opportunity_id: Uuid,
        bid: u64,
    },
    AttemptResolved {
        opportunity_id: Uuid,
        outcome: String,
    },
    PositionChanged {
        position_id: Uuid,
        status: String,
    },
    ProfitRecorded {
        realized: i128,
        session_total: i128,
    },
    OperatorAlert {
        detail: String,
    },
}

/// Broadcast bus for status updates
#[derive(Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusUpdate>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CAPACITY);
        Self { tx }
    }

    /// Publish an update; having no subscribers is fine
    pub fn publish(&self, update: StatusUpdate) {
        trace!(?update, "Status update");
        let _ = self.tx.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.tx.subscribe()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_updates() {
        let bus = StatusBus::new();
        let mut rx = bus.subscribe();

        bus.publish(StatusUpdate::Stopped);

        assert!(matches!(rx.recv().await.unwrap(), StatusUpdate::Stopped));
    }

    #[test]
    fn test_publish_without_subscribers() {
        StatusBus::new().publish(StatusUpdate::FeedConnected {
            feed: "test".into(),
        });
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let json = serde_json::to_string(&StatusUpdate::IntentsDropped { total: 3 }).unwrap();
        assert_eq!(json, r#"{"kind":"intents_dropped","total":3}"#);
    }
}
