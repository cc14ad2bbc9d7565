pub mod meta;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

pub use meta::{DatabaseMeta, ReadPreference, ReplicationConfig, Role, SyncMode};

use crate::acl::{AclSubsystem, Permission};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::storage::StorageAdapter;
use crate::tee::{gate_for, EncryptionMode};
use crate::value::{classify, Classification, Row, Value};
use crate::wal::WalJournal;

/// Names reserved for internal tables — never surfaced to clients (§6
/// "Persisted state layout").
pub const RESERVED_TABLE_PREFIX: &str = "__";

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub sql: String,
    pub params: Vec<Value>,
    pub required_wal_position: Option<u64>,
    pub caller: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub rows: Vec<Row>,
    pub rows_affected: i64,
    pub last_insert_id: i64,
    pub execution_ms: u64,
    pub wal_position: u64,
    pub processed_by_node_id: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    pub wal_position: u64,
    pub lag: u64,
    pub last_sync: Option<i64>,
    pub syncing: bool,
}

/// End-to-end handler for one Database (§4.3): enforces ACL, routes by
/// classification, executes, journals if mutating, and reports
/// replication status. Owns one Storage Adapter + one WAL Journal and
/// serializes all statements on them under a single per-Database lock
/// (§5), so WAL append happens in the same tick as the statement that
/// produced it without interleaving from another caller.
pub struct DatabaseInstance {
    pub meta: DatabaseMeta,
    storage: StorageAdapter,
    lock: AsyncMutex<()>,
    node_id: String,
    replica_sync_state: parking_lot::Mutex<HashMap<String, ReplicaStatus>>,
    query_count: AtomicU64,
    events: EventBus,
    accepted_tee_levels: Vec<String>,
}

impl DatabaseInstance {
    /// `createDatabase(req)` (§4.3). Idempotent on `databaseId` only in
    /// the sense that a repeat call against an existing physical file is
    /// rejected; it is not idempotent across distinct calls (§8 round-trip
    /// law).
    pub fn create(
        data_dir: &Path,
        meta: DatabaseMeta,
        initial_ddl: Option<&str>,
        node_id: impl Into<String>,
        events: EventBus,
        accepted_tee_levels: Vec<String>,
    ) -> Result<Self> {
        let path = db_path(data_dir, &meta.id);
        if path.exists() {
            return Err(Error::AlreadyExists(meta.id.clone()));
        }
        let storage = StorageAdapter::open_or_create(&path, true)?;
        WalJournal::ensure_table(&storage)?;
        AclSubsystem::ensure_table(&storage)?;
        if let Some(ddl) = initial_ddl {
            storage.exec(ddl)?;
        }

        let instance = Self {
            meta,
            storage,
            lock: AsyncMutex::new(()),
            node_id: node_id.into(),
            replica_sync_state: parking_lot::Mutex::new(HashMap::new()),
            query_count: AtomicU64::new(0),
            events,
            accepted_tee_levels,
        };
        instance
            .events
            .publish(Event::new(EventKind::DatabaseCreated).with_database(instance.meta.id.clone()));
        Ok(instance)
    }

    /// Loads an existing `<id>.db` file from disk on Node boot (§4.5 step
    /// 2). Its role defaults to Primary until the external Registry is
    /// consulted.
    pub fn load(
        data_dir: &Path,
        database_id: &str,
        owner: String,
        node_id: impl Into<String>,
        events: EventBus,
        accepted_tee_levels: Vec<String>,
    ) -> Result<Self> {
        let path = db_path(data_dir, database_id);
        let storage = StorageAdapter::open_or_create(&path, false)?;
        WalJournal::ensure_table(&storage)?;
        AclSubsystem::ensure_table(&storage)?;
        let schema_hash = hex::encode(storage.schema_digest()?);
        let wal_position = WalJournal::head_position(&storage)?;
        let meta = DatabaseMeta {
            id: database_id.to_string(),
            name: database_id.to_string(),
            owner,
            encryption_mode: EncryptionMode::None,
            replication: ReplicationConfig::default(),
            primary_node_id: String::new(),
            replica_node_ids: Vec::new(),
            role: Role::Primary,
            wal_position,
            schema_version: 1,
            schema_hash,
            created_at: Utc::now().timestamp_millis(),
            updated_at: Utc::now().timestamp_millis(),
        };
        Ok(Self {
            meta,
            storage,
            lock: AsyncMutex::new(()),
            node_id: node_id.into(),
            replica_sync_state: parking_lot::Mutex::new(HashMap::new()),
            query_count: AtomicU64::new(0),
            events,
            accepted_tee_levels,
        })
    }

    pub fn storage(&self) -> &StorageAdapter {
        &self.storage
    }

    pub fn wal_position(&self) -> Result<u64> {
        WalJournal::head_position(&self.storage)
    }

    fn authorize(&self, req: &ExecuteRequest, classification: Classification) -> Result<()> {
        let Some(caller) = req.caller.as_deref() else {
            // No authenticated caller: treated as the owner for local/dev
            // use, matching the teacher's permissive default path.
            return Ok(());
        };
        let now = Utc::now().timestamp_millis();
        let required = if is_acl_statement(&req.sql) {
            Permission::Admin
        } else if classification == Classification::ReadOnly {
            Permission::Read
        } else {
            Permission::Write
        };
        AclSubsystem::require(&self.storage, &self.meta.owner, caller, required, now)
    }

    /// `execute(req)` (§4.3).
    pub async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse> {
        let start = std::time::Instant::now();
        let _guard = self.lock.lock().await;

        let classification = classify(&req.sql);
        self.authorize(&req, classification)?;

        if self.meta.role == Role::Replica && classification == Classification::Mutating {
            return Err(Error::WriteOnReplica);
        }

        if let Some(required) = req.required_wal_position {
            let current = self.wal_position()?;
            if current < required {
                return Err(Error::ReplicationLag(crate::error::ReplicationLagDetails {
                    current,
                    required,
                }));
            }
        }

        let read_only = classification == Classification::ReadOnly;
        let gate = gate_for(self.meta.encryption_mode, &self.accepted_tee_levels);
        let result = gate
            .execute(&self.storage, &req.sql, &req.params, read_only, "default", "strict")
            .await?;

        let wal_position = if !read_only {
            let entry = WalJournal::append(&self.storage, &req.sql, &req.params)?;
            entry.position
        } else {
            self.wal_position()?
        };

        self.query_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("engine_queries_total").increment(1);

        Ok(ExecuteResponse {
            rows: result.rows,
            rows_affected: result.outcome.changes,
            last_insert_id: result.outcome.last_insert_row_id,
            execution_ms: start.elapsed().as_millis() as u64,
            wal_position,
            processed_by_node_id: self.node_id.clone(),
            read_only,
        })
    }

    /// `batchExecute(req)` (§4.3). When `transactional`, wraps the list in
    /// `BEGIN; … ; COMMIT;` with `ROLLBACK` on first failure; each
    /// mutating statement is journaled, but as one contiguous run of
    /// entries, in order.
    pub async fn batch_execute(
        &self,
        statements: Vec<(String, Vec<Value>)>,
        transactional: bool,
        caller: Option<String>,
    ) -> Result<Vec<ExecuteResponse>> {
        let _guard = self.lock.lock().await;

        if transactional {
            self.storage.exec("BEGIN;")?;
        }

        let mut responses = Vec::with_capacity(statements.len());
        for (sql, params) in statements {
            let req = ExecuteRequest {
                sql: sql.clone(),
                params: params.clone(),
                required_wal_position: None,
                caller: caller.clone(),
            };
            let classification = classify(&sql);
            if let Err(e) = self.authorize(&req, classification) {
                if transactional {
                    let _ = self.storage.exec("ROLLBACK;");
                }
                return Err(e);
            }
            if self.meta.role == Role::Replica && classification == Classification::Mutating {
                if transactional {
                    let _ = self.storage.exec("ROLLBACK;");
                }
                return Err(Error::WriteOnReplica);
            }

            let read_only = classification == Classification::ReadOnly;
            let exec_result = if read_only {
                self.storage
                    .query_parameterized(&sql, &params)
                    .map(|rows| (rows, crate::storage::ExecOutcome::default()))
            } else {
                self.storage
                    .run_parameterized(&sql, &params)
                    .map(|outcome| (Vec::new(), outcome))
            };

            let (rows, outcome) = match exec_result {
                Ok(v) => v,
                Err(e) => {
                    if transactional {
                        let _ = self.storage.exec("ROLLBACK;");
                    }
                    return Err(e);
                }
            };

            let wal_position = if !read_only {
                WalJournal::append(&self.storage, &sql, &params)?.position
            } else {
                self.wal_position()?
            };

            responses.push(ExecuteResponse {
                rows,
                rows_affected: outcome.changes,
                last_insert_id: outcome.last_insert_row_id,
                execution_ms: 0,
                wal_position,
                processed_by_node_id: self.node_id.clone(),
                read_only,
            });
        }

        if transactional {
            self.storage.exec("COMMIT;")?;
        }

        Ok(responses)
    }

    /// `deleteDatabase(id)` (§4.3): closes the handle, removes the
    /// primary file and its `-wal`/`-shm` sidecars.
    pub fn delete(data_dir: &Path, database_id: &str) -> Result<()> {
        let path = db_path(data_dir, database_id);
        for suffix in ["", "-wal", "-shm"] {
            let sidecar = PathBuf::from(format!("{}{}", path.display(), suffix));
            if sidecar.exists() {
                std::fs::remove_file(sidecar)?;
            }
        }
        Ok(())
    }

    pub fn record_replica_sync(&self, node_id: impl Into<String>, status: ReplicaStatus) {
        self.replica_sync_state.lock().insert(node_id.into(), status);
    }

    /// `getReplicationStatus(id)` (§4.3).
    pub fn replication_status(&self) -> HashMap<String, ReplicaStatus> {
        self.replica_sync_state.lock().clone()
    }
}

fn is_acl_statement(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    upper.contains("__ACL")
}

pub fn db_path(data_dir: &Path, database_id: &str) -> PathBuf {
    data_dir.join(format!("{database_id}.db"))
}

/// File names matching `__*` are reserved and skipped by the Node's boot
/// loader (§6).
pub fn is_loadable_database_file(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_suffix(".db")?;
    if stem.starts_with(RESERVED_TABLE_PREFIX) {
        None
    } else {
        Some(stem)
    }
}
