use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

/// Fixed event types (§4.10): node:{registered|heartbeat|offline|slashed},
/// database:{created|deleted|failover}, replication:{synced|lagging},
/// audit:{challenge|response|failed}.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    NodeRegistered,
    NodeHeartbeat,
    NodeOffline,
    NodeSlashed,
    DatabaseCreated,
    DatabaseDeleted,
    DatabaseFailover,
    ReplicationSynced { count: u64, position: u64 },
    ReplicationLagging { detail: String },
    AuditChallenge,
    AuditResponse,
    AuditFailed { node_id: String, detail: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: i64,
    pub node_id: Option<String>,
    pub database_id: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now().timestamp_millis(),
            node_id: None,
            database_id: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_database(mut self, database_id: impl Into<String>) -> Self {
        self.database_id = Some(database_id.into());
        self
    }
}

/// Synchronous-feeling publish/subscribe mechanism (§4.10). Backed by a
/// `tokio::sync::broadcast` channel, generalized from the per-client
/// `UpdateStateMessage` channel pattern used by the teacher's scheduler.
/// Handlers subscribe and must not block; publish itself never awaits a
/// subscriber.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(?event.kind, "event published");
        // A publish with no subscribers is not an error (§4.10: errors in
        // handlers are caught and logged, never propagated).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventKind::ReplicationSynced { count: 3, position: 3 }).with_database("db1"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.database_id.as_deref(), Some("db1"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::new(EventKind::NodeHeartbeat));
    }
}
