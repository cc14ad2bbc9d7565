use serde::{Deserialize, Serialize};

use crate::region::Region;
use crate::tee::EncryptionMode;

/// `syncMode` (§3 Replication Config): `Async` applies on the Replica's own
/// schedule. `Sync` is recorded alongside `minConfirmations` but the write
/// path does not yet gate a Primary's response on replica acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    Async,
    Sync,
}

/// `readPreference` (§3 Replication Config, §4.4): where a read-only
/// statement is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreference {
    Primary,
    Nearest,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationConfig {
    pub replica_count: u32,
    pub min_confirmations: u32,
    pub sync_mode: SyncMode,
    pub read_preference: ReadPreference,
    pub failover_timeout_ms: u64,
    #[serde(default)]
    pub preferred_regions: Vec<Region>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_count: 0,
            min_confirmations: 0,
            sync_mode: SyncMode::Async,
            read_preference: ReadPreference::Primary,
            failover_timeout_ms: 5_000,
            preferred_regions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Replica,
}

/// §3 Database Instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseMeta {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub encryption_mode: EncryptionMode,
    pub replication: ReplicationConfig,
    pub primary_node_id: String,
    #[serde(default)]
    pub replica_node_ids: Vec<String>,
    pub role: Role,
    pub wal_position: u64,
    pub schema_version: u32,
    pub schema_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
}
