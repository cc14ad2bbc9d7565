pub mod peer;
pub mod registry_client;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::database::{db_path, is_loadable_database_file, DatabaseInstance};
use crate::error::Result;
use crate::events::{Event, EventBus, EventKind};
use crate::region::Region;
use crate::replication::ReplicationEngine;

pub use peer::{PeerConnection, PeerTable};
pub use registry_client::{HttpRegistryClient, NodeRecord, RegistryClient};

/// Heartbeat interval (§4.5 step 4).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Consecutive missed beats before a Node is considered `Offline` (§3:
/// "Active→Offline after three missed beats").
const MISSED_BEATS_BEFORE_OFFLINE: u32 = 3;
/// Upper bound on how long shutdown will wait on in-flight network I/O
/// (§4.5: "must not wait on network I/O longer than a bounded grace
/// period").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Active,
    Syncing,
    Offline,
    Suspended,
    Exiting,
}

/// §3 Node. Counters that mutate under concurrent access are atomics;
/// everything else is set once at startup.
pub struct NodeInfo {
    pub node_id: String,
    pub operator_address: String,
    pub endpoint: String,
    pub ws_endpoint: String,
    pub region: Region,
    pub tee_enabled: bool,
    pub version: String,
    pub staked_amount: AtomicU64,
    pub slashed_amount: AtomicU64,
    pub status: RwLock<NodeStatus>,
    pub last_heartbeat: AtomicI64,
    pub missed_beats: AtomicU32,
    pub total_queries: AtomicU64,
    pub performance_score: AtomicU32,
}

/// `nodeId` is a 32-byte digest of operator address + endpoint +
/// registration time (§3), hex-encoded for transport.
pub fn compute_node_id(operator_address: &str, endpoint: &str, registered_at: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operator_address.as_bytes());
    hasher.update(endpoint.as_bytes());
    hasher.update(registered_at.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Process-level loop (§4.5): registration, heartbeat, peer discovery,
/// request dispatch, lifecycle. Generalized from the teacher's
/// single-process `sqld` server loop into an explicit struct owning
/// background task handles instead of relying on process-wide statics
/// (§9 DESIGN NOTES: "global mutable timers... become explicit fields").
pub struct NodeRuntime {
    pub info: Arc<NodeInfo>,
    pub databases: RwLock<HashMap<String, Arc<DatabaseInstance>>>,
    pub peers: Arc<PeerTable>,
    pub events: EventBus,
    pub data_dir: PathBuf,
    pub dev_mode: bool,
    accepted_tee_levels: Vec<String>,
    registry: Arc<dyn RegistryClient>,
    registered_on_chain: std::sync::atomic::AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl NodeRuntime {
    pub fn new(
        operator_address: String,
        endpoint: String,
        ws_endpoint: String,
        region: Region,
        tee_enabled: bool,
        stake: u64,
        data_dir: PathBuf,
        dev_mode: bool,
        accepted_tee_levels: Vec<String>,
        registry: Arc<dyn RegistryClient>,
        events: EventBus,
    ) -> Self {
        let node_id = compute_node_id(&operator_address, &endpoint, Utc::now().timestamp_millis());
        let info = Arc::new(NodeInfo {
            node_id,
            operator_address,
            endpoint,
            ws_endpoint,
            region,
            tee_enabled,
            version: env!("CARGO_PKG_VERSION").to_string(),
            staked_amount: AtomicU64::new(stake),
            slashed_amount: AtomicU64::new(0),
            status: RwLock::new(NodeStatus::Pending),
            last_heartbeat: AtomicI64::new(0),
            missed_beats: AtomicU32::new(0),
            total_queries: AtomicU64::new(0),
            performance_score: AtomicU32::new(1000),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            info,
            databases: RwLock::new(HashMap::new()),
            peers: Arc::new(PeerTable::new()),
            events,
            data_dir,
            dev_mode,
            accepted_tee_levels,
            registry,
            registered_on_chain: std::sync::atomic::AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Runs the full startup sequence (§4.5 steps 1-6).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        self.load_existing_databases()?;
        self.register_with_registry().await;
        self.spawn_heartbeat_loop();
        self.spawn_replication_loops();
        self.discover_peers().await;

        *self.info.status.write() = NodeStatus::Active;
        self.events
            .publish(Event::new(EventKind::NodeRegistered).with_node(self.info.node_id.clone()));
        Ok(())
    }

    fn load_existing_databases(&self) -> Result<()> {
        if !self.data_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(database_id) = is_loadable_database_file(file_name) else {
                continue;
            };
            match DatabaseInstance::load(
                &self.data_dir,
                database_id,
                self.info.operator_address.clone(),
                self.info.node_id.clone(),
                self.events.clone(),
                self.accepted_tee_levels.clone(),
            ) {
                Ok(instance) => {
                    self.databases
                        .write()
                        .insert(database_id.to_string(), Arc::new(instance));
                }
                Err(err) => {
                    tracing::warn!(database_id, error = %err, "failed to load database on boot");
                }
            }
        }
        Ok(())
    }

    async fn register_with_registry(&self) {
        match self.registry.get_node(&self.info.node_id).await {
            Ok(Some(_)) => {
                *self.info.status.write() = NodeStatus::Active;
                self.registered_on_chain.store(true, Ordering::SeqCst);
            }
            Ok(None) => {
                match self
                    .registry
                    .register_node(
                        &self.info.node_id,
                        &self.info.endpoint,
                        self.info.region,
                        self.info.tee_enabled,
                        self.info.staked_amount.load(Ordering::SeqCst),
                    )
                    .await
                {
                    Ok(()) => self.registered_on_chain.store(true, Ordering::SeqCst),
                    Err(err) => {
                        tracing::warn!(error = %err, "registry unreachable at startup, continuing offline");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "registry unreachable at startup, continuing offline");
            }
        }
    }

    /// Polls the Registry's view of this Node's `slashedAmount` and moves
    /// to `Suspended` the first time it exceeds what was last observed
    /// (§3: stake slashing suspends a Node). Does not auto-recover —
    /// operator intervention is expected to bring a slashed Node back.
    async fn check_slash_status(&self) {
        let Ok(Some(record)) = self.registry.get_node(&self.info.node_id).await else {
            return;
        };
        let previous = self.info.slashed_amount.swap(record.slashed_amount, Ordering::SeqCst);
        if record.slashed_amount > previous && record.slashed_amount > 0 {
            *self.info.status.write() = NodeStatus::Suspended;
            tracing::warn!(
                node_id = %self.info.node_id,
                slashed_amount = record.slashed_amount,
                "node suspended after stake slash"
            );
            self.events
                .publish(Event::new(EventKind::NodeSlashed).with_node(self.info.node_id.clone()));
        }
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.info.last_heartbeat.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
                        if this.registered_on_chain.load(Ordering::SeqCst) {
                            match this.registry.heartbeat(&this.info.node_id).await {
                                Ok(()) => {
                                    this.info.missed_beats.store(0, Ordering::SeqCst);
                                    this.events.publish(Event::new(EventKind::NodeHeartbeat).with_node(this.info.node_id.clone()));
                                }
                                Err(err) => {
                                    let missed = this.info.missed_beats.fetch_add(1, Ordering::SeqCst) + 1;
                                    tracing::warn!(error = %err, missed, "registry heartbeat failed");
                                    if missed >= MISSED_BEATS_BEFORE_OFFLINE {
                                        *this.info.status.write() = NodeStatus::Offline;
                                        this.events.publish(Event::new(EventKind::NodeOffline).with_node(this.info.node_id.clone()));
                                    }
                                }
                            }
                            this.check_slash_status().await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        self.tasks.try_lock().expect("no contention at startup").push(handle);
    }

    /// Starts one Replication Engine loop per Database whose
    /// `primaryNodeId` is not this Node (§4.5 step 5).
    fn spawn_replication_loops(self: &Arc<Self>) {
        let databases = self.databases.read();
        for (database_id, instance) in databases.iter() {
            if instance.meta.primary_node_id == self.info.node_id || instance.meta.primary_node_id.is_empty() {
                continue;
            }
            let engine = Arc::new(ReplicationEngine::new(
                instance.meta.primary_node_id.clone(),
                database_id.clone(),
                self.info.node_id.clone(),
                self.events.clone(),
                50,
                Arc::clone(&self.info),
            ));
            let shutdown = self.shutdown_rx.clone();
            let instance = Arc::clone(instance);
            let handle = tokio::spawn(async move {
                engine.run_loop(instance, crate::replication::DEFAULT_TICK, shutdown).await;
            });
            self.tasks.try_lock().expect("no contention at startup").push(handle);
        }
    }

    async fn discover_peers(&self) {
        // Soft state; missing registry is tolerated and logged (§4.5 step 6).
        tracing::debug!("peer discovery is registry-driven and best-effort; no peers pre-seeded");
    }

    pub fn database(&self, database_id: &str) -> Option<Arc<DatabaseInstance>> {
        self.databases.read().get(database_id).cloned()
    }

    pub fn insert_database(&self, database_id: String, instance: Arc<DatabaseInstance>) {
        self.databases.write().insert(database_id, instance);
    }

    pub fn remove_database(&self, database_id: &str) -> Option<Arc<DatabaseInstance>> {
        self.databases.write().remove(database_id)
    }

    pub fn database_path(&self, database_id: &str) -> PathBuf {
        db_path(&self.data_dir, database_id)
    }

    pub fn accepted_tee_levels(&self) -> &[String] {
        &self.accepted_tee_levels
    }

    pub fn status(&self) -> NodeStatus {
        *self.info.status.read()
    }

    /// Shutdown sequence (§4.5): mark `Exiting`, stop timers, close every
    /// Database handle, drop peer connections — bounded by
    /// [`SHUTDOWN_GRACE`].
    pub async fn shutdown(&self) {
        *self.info.status.write() = NodeStatus::Exiting;
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        let join_all = futures::future::join_all(handles);
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all).await.is_err() {
            tracing::warn!("node shutdown exceeded grace period; proceeding anyway");
        }

        self.databases.write().clear();
        self.peers.clear();
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoDto {
    pub node_id: String,
    pub operator_address: String,
    pub endpoint: String,
    pub ws_endpoint: String,
    pub region: Region,
    pub role: &'static str,
    pub status: NodeStatus,
    pub staked_amount: u64,
    pub slashed_amount: u64,
    pub tee_enabled: bool,
    pub version: String,
    pub last_heartbeat: i64,
    pub hosted_database_count: usize,
    pub total_queries: u64,
    pub performance_score: u32,
}

impl NodeRuntime {
    pub fn to_dto(&self) -> NodeInfoDto {
        NodeInfoDto {
            node_id: self.info.node_id.clone(),
            operator_address: self.info.operator_address.clone(),
            endpoint: self.info.endpoint.clone(),
            ws_endpoint: self.info.ws_endpoint.clone(),
            region: self.info.region,
            role: "primary",
            status: self.status(),
            staked_amount: self.info.staked_amount.load(Ordering::SeqCst),
            slashed_amount: self.info.slashed_amount.load(Ordering::SeqCst),
            tee_enabled: self.info.tee_enabled,
            version: self.info.version.clone(),
            last_heartbeat: self.info.last_heartbeat.load(Ordering::SeqCst),
            hosted_database_count: self.databases.read().len(),
            total_queries: self.info.total_queries.load(Ordering::SeqCst),
            performance_score: self.info.performance_score.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_deterministic_for_same_inputs() {
        let id1 = compute_node_id("0xA", "http://n1", 1000);
        let id2 = compute_node_id("0xA", "http://n1", 1000);
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);
    }

    #[test]
    fn node_id_differs_with_registration_time() {
        let id1 = compute_node_id("0xA", "http://n1", 1000);
        let id2 = compute_node_id("0xA", "http://n1", 2000);
        assert_ne!(id1, id2);
    }
}
