use std::collections::HashMap;
use std::sync::RwLock;

use crate::database::Role;

/// Soft state describing a discovered peer Node (§3 Peer Connection).
/// Created by peer discovery, destroyed on process exit; carries no
/// serialized state beyond `lastPing`.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub node_id: String,
    pub endpoint: String,
    pub ws_endpoint: String,
    pub last_ping_ms: i64,
    pub latency_ms: Option<u64>,
    pub connected: bool,
    pub role: Role,
}

/// Shared-by-reference peer table (§3 Ownership: "Peer Connections are
/// shared by reference across all Database Instances hosted by the
/// Node"). Keyed by `nodeId`.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<String, PeerConnection>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert(&self, peer: PeerConnection) {
        self.peers.write().unwrap().insert(peer.node_id.clone(), peer);
    }

    pub fn get(&self, node_id: &str) -> Option<PeerConnection> {
        self.peers.read().unwrap().get(node_id).cloned()
    }

    pub fn remove(&self, node_id: &str) -> Option<PeerConnection> {
        self.peers.write().unwrap().remove(node_id)
    }

    pub fn all(&self) -> Vec<PeerConnection> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    /// Called on process exit (§3: "destroyed on process exit").
    pub fn clear(&self) {
        self.peers.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer(id: &str) -> PeerConnection {
        PeerConnection {
            node_id: id.to_string(),
            endpoint: format!("http://{id}"),
            ws_endpoint: format!("ws://{id}"),
            last_ping_ms: 0,
            latency_ms: None,
            connected: true,
            role: Role::Replica,
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let table = PeerTable::new();
        table.upsert(sample_peer("n1"));
        assert!(table.get("n1").is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn clear_drops_all_connections() {
        let table = PeerTable::new();
        table.upsert(sample_peer("n1"));
        table.upsert(sample_peer("n2"));
        table.clear();
        assert!(table.is_empty());
    }
}
