use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::storage::StorageAdapter;
use crate::value::Value;

/// All-zero hash used as `prevHash` for position 1 (§3 WAL Entry).
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A single hash-chained WAL entry (§3 WAL Entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub position: u64,
    pub transaction_id: String,
    pub timestamp: i64,
    pub sql: String,
    pub params: Vec<Value>,
    pub hash: String,
    pub prev_hash: String,
}

fn canonical_string(
    position: u64,
    transaction_id: &str,
    timestamp: i64,
    sql: &str,
    params_json: &str,
    prev_hash: &str,
) -> String {
    format!("{position}:{transaction_id}:{timestamp}:{sql}:{params_json}:{prev_hash}")
}

fn digest_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append-only, hash-chained log of every mutating statement, stored in a
/// reserved `__wal` table inside the same SQLite file (§4.2).
pub struct WalJournal;

const CREATE_WAL_TABLE: &str = "CREATE TABLE IF NOT EXISTS __wal (\
    position INTEGER PRIMARY KEY, \
    transaction_id TEXT NOT NULL, \
    timestamp INTEGER NOT NULL, \
    sql TEXT NOT NULL, \
    params TEXT, \
    hash TEXT NOT NULL, \
    prev_hash TEXT NOT NULL\
)";

impl WalJournal {
    pub fn ensure_table(storage: &StorageAdapter) -> Result<()> {
        storage.exec(CREATE_WAL_TABLE)
    }

    /// The hash of the highest-position entry, or [`GENESIS_HASH`] when the
    /// journal is empty. Also serves as the "starting head" on Primary
    /// restart (§4.2 edge case: "no reconstruction needed").
    pub fn head_hash(storage: &StorageAdapter) -> Result<String> {
        storage.with_conn(|conn| {
            let res: Option<String> = conn
                .query_row(
                    "SELECT hash FROM __wal ORDER BY position DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .ok();
            Ok(res.unwrap_or_else(|| GENESIS_HASH.to_string()))
        })
    }

    pub fn head_position(storage: &StorageAdapter) -> Result<u64> {
        storage.with_conn(|conn| {
            let res: Option<i64> = conn
                .query_row("SELECT MAX(position) FROM __wal", [], |row| row.get(0))
                .unwrap_or(None);
            Ok(res.unwrap_or(0) as u64)
        })
    }

    /// `append(db, sql, params)` (§4.2). Must be called in the same tick
    /// as, and after, the statement's successful execution, and under the
    /// Database Instance's per-Database lock (§5).
    pub fn append(storage: &StorageAdapter, sql: &str, params: &[Value]) -> Result<WalEntry> {
        let prev_hash = Self::head_hash(storage)?;
        let position = Self::head_position(storage)? + 1;
        let transaction_id = {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        };
        let timestamp = Utc::now().timestamp_millis();
        let params_json = serde_json::to_string(params)?;
        let canonical = canonical_string(position, &transaction_id, timestamp, sql, &params_json, &prev_hash);
        let hash = digest_hex(&canonical);

        storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO __wal (position, transaction_id, timestamp, sql, params, hash, prev_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    position as i64,
                    transaction_id,
                    timestamp,
                    sql,
                    params_json,
                    hash,
                    prev_hash,
                ],
            )?;
            Ok(())
        })?;

        Ok(WalEntry {
            position,
            transaction_id,
            timestamp,
            sql: sql.to_string(),
            params: params.to_vec(),
            hash,
            prev_hash,
        })
    }

    /// Inserts an already-assigned entry, preserving the Primary-assigned
    /// position. Used by `apply_batch` on replicas after re-executing the
    /// statement.
    fn insert_entry(storage: &StorageAdapter, entry: &WalEntry) -> Result<()> {
        let params_json = serde_json::to_string(&entry.params)?;
        storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO __wal (position, transaction_id, timestamp, sql, params, hash, prev_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    entry.position as i64,
                    entry.transaction_id,
                    entry.timestamp,
                    entry.sql,
                    params_json,
                    entry.hash,
                    entry.prev_hash,
                ],
            )?;
            Ok(())
        })
    }

    /// `fetchRange(db, fromPos, limit)` (§4.2). Entries with position
    /// strictly greater than `fromPos`, ascending, up to `limit` (default
    /// cap 1000).
    pub fn fetch_range(storage: &StorageAdapter, from_pos: u64, limit: u32) -> Result<FetchRangeResult> {
        let limit = limit.min(1000).max(1);
        let current_pos = Self::head_position(storage)?;
        let entries = storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT position, transaction_id, timestamp, sql, params, hash, prev_hash \
                 FROM __wal WHERE position > ?1 ORDER BY position ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![from_pos as i64, (limit as i64) + 1], |row| {
                let params_json: Option<String> = row.get(4)?;
                Ok(WalEntry {
                    position: row.get::<_, i64>(0)? as u64,
                    transaction_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    sql: row.get(3)?,
                    params: params_json
                        .map(|s| serde_json::from_str(&s).unwrap_or_default())
                        .unwrap_or_default(),
                    hash: row.get(5)?,
                    prev_hash: row.get(6)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let has_more = entries.len() as u32 > limit;
        let mut entries = entries;
        entries.truncate(limit as usize);
        Ok(FetchRangeResult {
            entries,
            has_more,
            current_pos,
        })
    }

    /// Recomputes `entry.hash` from its fields and `prev_hash`.
    fn expected_hash(entry: &WalEntry) -> Result<String> {
        let params_json = serde_json::to_string(&entry.params)?;
        let canonical = canonical_string(
            entry.position,
            &entry.transaction_id,
            entry.timestamp,
            &entry.sql,
            &params_json,
            &entry.prev_hash,
        );
        Ok(digest_hex(&canonical))
    }

    /// `applyBatch(db, entries)` (replica only, §4.2). Verifies
    /// `entries[0].prevHash` equals the replica's current head hash, then
    /// for each entry verifies `entry.hash` matches the recomputed digest
    /// and `entry.prevHash` matches the prior entry's hash. On any
    /// mismatch the whole batch is discarded — no partial apply. On
    /// success, re-executes each statement via `storage` and inserts the
    /// entry preserving the Primary-assigned position.
    pub fn apply_batch(storage: &StorageAdapter, entries: &[WalEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(Self::head_position(storage)?);
        }

        let local_head = Self::head_hash(storage)?;
        if entries[0].prev_hash != local_head {
            return Err(Error::WALChain(entries[0].position));
        }

        let mut prev_hash = local_head;
        for entry in entries {
            if entry.prev_hash != prev_hash {
                return Err(Error::WALChain(entry.position));
            }
            let expected = Self::expected_hash(entry)?;
            if expected != entry.hash {
                return Err(Error::WALChain(entry.position));
            }
            prev_hash = entry.hash.clone();
        }

        // No partial apply (§4.2, §5): only mutate storage once every
        // entry in the batch has verified.
        for entry in entries {
            storage.run_parameterized(&entry.sql, &entry.params)?;
            Self::insert_entry(storage, entry)?;
        }

        Ok(entries.last().unwrap().position)
    }

    /// Diagnostic self-verification (SPEC_FULL.md §B.3): recomputes every
    /// entry's hash over `[from_pos, to_pos]` and returns the first
    /// divergent position, if any, without mutating anything. Used by the
    /// Audit Protocol and by the chain-tamper test scenario (spec.md §8
    /// #3).
    pub fn verify_chain(storage: &StorageAdapter, from_pos: u64, to_pos: u64) -> Result<Option<u64>> {
        let result = Self::fetch_range(storage, from_pos.saturating_sub(1), (to_pos - from_pos + 1) as u32)?;
        let mut prev_hash = if from_pos == 1 {
            GENESIS_HASH.to_string()
        } else {
            storage.with_conn(|conn| {
                conn.query_row(
                    "SELECT hash FROM __wal WHERE position = ?1",
                    [(from_pos - 1) as i64],
                    |row| row.get(0),
                )
                .map_err(Error::Storage)
            })?
        };
        for entry in &result.entries {
            if entry.position > to_pos {
                break;
            }
            if entry.prev_hash != prev_hash {
                return Ok(Some(entry.position));
            }
            let expected = Self::expected_hash(entry)?;
            if expected != entry.hash {
                return Ok(Some(entry.position));
            }
            prev_hash = entry.hash.clone();
        }
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct FetchRangeResult {
    pub entries: Vec<WalEntry>,
    pub has_more: bool,
    pub current_pos: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageAdapter;

    fn tmp_storage() -> (tempfile::TempDir, StorageAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let storage = StorageAdapter::open_or_create(&path, true).unwrap();
        WalJournal::ensure_table(&storage).unwrap();
        storage.exec("CREATE TABLE t(x INTEGER)").unwrap();
        (dir, storage)
    }

    #[test]
    fn first_entry_chains_from_genesis() {
        let (_dir, storage) = tmp_storage();
        let entry = WalJournal::append(&storage, "INSERT INTO t VALUES (1)", &[]).unwrap();
        assert_eq!(entry.position, 1);
        assert_eq!(entry.prev_hash, GENESIS_HASH);
    }

    #[test]
    fn positions_are_gapless_and_chained() {
        let (_dir, storage) = tmp_storage();
        let e1 = WalJournal::append(&storage, "INSERT INTO t VALUES (1)", &[]).unwrap();
        let e2 = WalJournal::append(&storage, "INSERT INTO t VALUES (2)", &[]).unwrap();
        assert_eq!(e2.position, e1.position + 1);
        assert_eq!(e2.prev_hash, e1.hash);
    }

    #[test]
    fn fetch_range_boundary_is_empty_at_head() {
        let (_dir, storage) = tmp_storage();
        WalJournal::append(&storage, "INSERT INTO t VALUES (1)", &[]).unwrap();
        let res = WalJournal::fetch_range(&storage, 1, 10).unwrap();
        assert!(res.entries.is_empty());
        assert!(!res.has_more);
    }

    #[test]
    fn apply_batch_replays_on_replica() {
        let (_dir, primary) = tmp_storage();
        WalJournal::append(&primary, "INSERT INTO t VALUES (1)", &[]).unwrap();
        WalJournal::append(&primary, "INSERT INTO t VALUES (2)", &[]).unwrap();
        let batch = WalJournal::fetch_range(&primary, 0, 10).unwrap().entries;

        let (_dir2, replica) = tmp_storage();
        let new_head = WalJournal::apply_batch(&replica, &batch).unwrap();
        assert_eq!(new_head, 2);
        let rows = replica.query_parameterized("SELECT * FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn apply_batch_rejects_prev_hash_mismatch_and_discards_whole_batch() {
        let (_dir, primary) = tmp_storage();
        WalJournal::append(&primary, "INSERT INTO t VALUES (1)", &[]).unwrap();
        WalJournal::append(&primary, "INSERT INTO t VALUES (2)", &[]).unwrap();
        let mut batch = WalJournal::fetch_range(&primary, 0, 10).unwrap().entries;
        batch[0].prev_hash = "deadbeef".repeat(8);

        let (_dir2, replica) = tmp_storage();
        let err = WalJournal::apply_batch(&replica, &batch).unwrap_err();
        assert!(matches!(err, Error::WALChain(1)));
        assert_eq!(WalJournal::head_position(&replica).unwrap(), 0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// For any sequence of appended statements, `verify_chain` over
            /// the whole range must report no divergence (§4.2, §8 #3
            /// negative case).
            #[test]
            fn untampered_chain_always_verifies(values in prop::collection::vec(0i64..10_000, 1..30)) {
                let dir = tempfile::tempdir().unwrap();
                let path = dir.path().join("t.db");
                let storage = StorageAdapter::open_or_create(&path, true).unwrap();
                WalJournal::ensure_table(&storage).unwrap();
                storage.exec("CREATE TABLE t(x INTEGER)").unwrap();

                for v in &values {
                    WalJournal::append(&storage, &format!("INSERT INTO t VALUES ({v})"), &[]).unwrap();
                }

                let divergence = WalJournal::verify_chain(&storage, 1, values.len() as u64).unwrap();
                prop_assert_eq!(divergence, None);
            }
        }
    }

    #[test]
    fn verify_chain_detects_tampered_hash() {
        let (_dir, storage) = tmp_storage();
        for i in 1..=5 {
            WalJournal::append(&storage, &format!("INSERT INTO t VALUES ({i})"), &[]).unwrap();
        }
        storage
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE __wal SET hash = 'tampered' WHERE position = 3",
                    [],
                )
                .map_err(Error::Storage)?;
                Ok(())
            })
            .unwrap();

        let divergence = WalJournal::verify_chain(&storage, 1, 5).unwrap();
        assert_eq!(divergence, Some(3));
    }
}
