use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::database::{DatabaseInstance, ReadPreference, Role};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::node::{NodeInfo, NodeStatus};
use crate::region::Region;
use crate::storage::StorageAdapter;
use crate::wal::{WalEntry, WalJournal};

/// Default replication tick interval (§4.4: "ticks at a configurable
/// interval, default one second").
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Default page size requested per sync round (mirrors `WalJournal`'s own
/// cap).
const SYNC_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalSyncRequest {
    pub database_id: String,
    pub from_position: u64,
    pub limit: u32,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalSyncResponse {
    pub entries: Vec<WalEntry>,
    pub has_more: bool,
    pub current_position: u64,
}

/// Per-Database replica tick loop (§4.4). Pulls the next WAL batch from
/// the Primary over HTTP, applies it with strict chain verification, and
/// publishes the resulting `replication:*` event. Runs on its own
/// lightweight task per Database, generalized from the teacher's
/// per-connection task-spawning pattern.
pub struct ReplicationEngine {
    http: reqwest::Client,
    primary_base_url: String,
    database_id: String,
    node_id: String,
    events: EventBus,
    lag_threshold: u64,
    node_info: Arc<NodeInfo>,
}

impl ReplicationEngine {
    pub fn new(
        primary_base_url: impl Into<String>,
        database_id: impl Into<String>,
        node_id: impl Into<String>,
        events: EventBus,
        lag_threshold: u64,
        node_info: Arc<NodeInfo>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            primary_base_url: primary_base_url.into(),
            database_id: database_id.into(),
            node_id: node_id.into(),
            events,
            lag_threshold,
            node_info,
        }
    }

    /// Flips this Node's status between `Active` and `Syncing` as replica
    /// lag crosses [`Self::lag_threshold`] (§3/§4.4). Never overrides
    /// `Offline`/`Suspended`/`Exiting` — those reflect a more severe state
    /// set elsewhere.
    fn update_sync_status(&self, lag: u64) {
        let mut status = self.node_info.status.write();
        match *status {
            NodeStatus::Active if lag > self.lag_threshold => *status = NodeStatus::Syncing,
            NodeStatus::Syncing if lag <= self.lag_threshold => *status = NodeStatus::Active,
            _ => {}
        }
    }

    /// Runs one sync round: pull, verify, apply, publish. Returns whether
    /// the Primary reported more entries beyond this batch, signalling the
    /// caller to re-tick immediately instead of waiting a full interval
    /// (§4.4 backpressure rule). On transport error or chain mismatch,
    /// publishes `replication:lagging` carrying the failure detail before
    /// returning the error — storage is never touched past the point of
    /// failure (§4.4 step 5, §8 scenario #3).
    pub async fn run_once(&self, storage: &StorageAdapter) -> Result<bool> {
        match self.try_sync(storage).await {
            Ok(has_more) => Ok(has_more),
            Err(err) => {
                self.events.publish(
                    Event::new(EventKind::ReplicationLagging {
                        detail: format!("sync failed: {err}"),
                    })
                    .with_database(self.database_id.clone())
                    .with_node(self.node_id.clone()),
                );
                Err(err)
            }
        }
    }

    async fn try_sync(&self, storage: &StorageAdapter) -> Result<bool> {
        let from_position = WalJournal::head_position(storage)?;
        let req = WalSyncRequest {
            database_id: self.database_id.clone(),
            from_position,
            limit: SYNC_LIMIT,
            node_id: self.node_id.clone(),
        };

        let url = format!("{}/v2/wal/sync", self.primary_base_url.trim_end_matches('/'));
        let resp = self.http.post(&url).json(&req).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Timeout);
        }
        let body: WalSyncResponse = resp.json().await?;

        let applied = body.entries.len() as u64;
        if applied > 0 {
            WalJournal::apply_batch(storage, &body.entries)?;
        }

        let new_head = WalJournal::head_position(storage)?;
        let lag = body.current_position.saturating_sub(new_head);

        if applied > 0 {
            self.events.publish(
                Event::new(EventKind::ReplicationSynced {
                    count: applied,
                    position: new_head,
                })
                .with_database(self.database_id.clone())
                .with_node(self.node_id.clone()),
            );
        }
        if lag > self.lag_threshold {
            self.events.publish(
                Event::new(EventKind::ReplicationLagging {
                    detail: format!("{lag} entries behind primary"),
                })
                .with_database(self.database_id.clone())
                .with_node(self.node_id.clone()),
            );
        }
        self.update_sync_status(lag);

        Ok(body.has_more)
    }

    /// Drives `run_once` on an interval, re-ticking immediately while
    /// `hasMore` is true and otherwise sleeping the configured interval.
    /// Exits when `shutdown` resolves.
    pub async fn run_loop(
        self: Arc<Self>,
        database: Arc<DatabaseInstance>,
        tick: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.run_once(database.storage()).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(database_id = %self.database_id, error = %err, "replication tick failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Primary,
    Replica(String),
}

/// Resolves `readPreference` (§4.4) into a concrete node to route a
/// read-only statement to. `Primary` always wins outright; `Nearest`
/// prefers a replica whose region matches the caller's, falling back to
/// the Primary when none does; `Any` takes the first healthy replica,
/// also falling back to the Primary when the replica set is empty.
pub fn route_read(
    preference: ReadPreference,
    caller_region: Region,
    primary_node_id: &str,
    replicas: &[(String, Region)],
) -> RouteTarget {
    match preference {
        ReadPreference::Primary => RouteTarget::Primary,
        ReadPreference::Any => replicas
            .first()
            .map(|(id, _)| RouteTarget::Replica(id.clone()))
            .unwrap_or(RouteTarget::Primary),
        ReadPreference::Nearest => replicas
            .iter()
            .find(|(_, region)| *region == caller_region)
            .or_else(|| replicas.first())
            .map(|(id, _)| RouteTarget::Replica(id.clone()))
            .unwrap_or(RouteTarget::Primary),
    }
}

/// True when `role` permits a mutating statement to run locally (§4.4:
/// writes against a Replica must be rejected or forwarded, never
/// silently accepted).
pub fn accepts_writes(role: Role) -> bool {
    role == Role::Primary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_preference_always_routes_to_primary() {
        let replicas = vec![("r1".to_string(), Region::EuWest)];
        let target = route_read(ReadPreference::Primary, Region::EuWest, "p1", &replicas);
        assert_eq!(target, RouteTarget::Primary);
    }

    #[test]
    fn nearest_prefers_matching_region() {
        let replicas = vec![
            ("r1".to_string(), Region::UsEast),
            ("r2".to_string(), Region::EuWest),
        ];
        let target = route_read(ReadPreference::Nearest, Region::EuWest, "p1", &replicas);
        assert_eq!(target, RouteTarget::Replica("r2".to_string()));
    }

    #[test]
    fn nearest_falls_back_to_primary_with_no_replicas() {
        let target = route_read(ReadPreference::Nearest, Region::EuWest, "p1", &[]);
        assert_eq!(target, RouteTarget::Primary);
    }

    #[test]
    fn any_takes_first_replica() {
        let replicas = vec![("r1".to_string(), Region::UsEast)];
        let target = route_read(ReadPreference::Any, Region::Global, "p1", &replicas);
        assert_eq!(target, RouteTarget::Replica("r1".to_string()));
    }

    #[test]
    fn only_primary_role_accepts_writes() {
        assert!(accepts_writes(Role::Primary));
        assert!(!accepts_writes(Role::Replica));
    }
}
