use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::storage::StorageAdapter;
use crate::wal::WalJournal;

/// SQLite's default page size; the Storage Adapter never overrides it
/// (§4.1 pragmas list does not set `page_size`).
const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditChallenge {
    pub challenge_id: String,
    pub database_id: String,
    pub page_index: u32,
    pub expected_hash: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct AuditResponse {
    pub challenge_id: String,
    pub page_bytes: Vec<u8>,
}

/// Primary-issued page-hash challenges answered by Replicas (§4.9). A
/// mismatch — wrong digest, or no response before `expiresAt` — raises
/// `audit:failed` for an external enforcement layer to act on; this
/// protocol never slashes by itself (SPEC_FULL.md §C.4).
pub struct AuditProtocol;

fn read_page(path: &Path, page_index: u32) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let offset = page_index as u64 * PAGE_SIZE;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    let read = file.read(&mut buf)?;
    buf.truncate(read);
    Ok(buf)
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl AuditProtocol {
    /// Reads the current content of `pageIndex` straight off disk and
    /// issues a challenge carrying its expected hash. `ttl_ms` bounds how
    /// long a Replica has to answer.
    pub fn issue_challenge(
        storage: &StorageAdapter,
        database_id: &str,
        page_index: u32,
        ttl_ms: i64,
        events: &EventBus,
    ) -> Result<AuditChallenge> {
        let page = read_page(storage.path(), page_index)?;
        let challenge = AuditChallenge {
            challenge_id: Uuid::new_v4().to_string(),
            database_id: database_id.to_string(),
            page_index,
            expected_hash: digest_hex(&page),
            expires_at: Utc::now().timestamp_millis() + ttl_ms,
        };
        events.publish(Event::new(EventKind::AuditChallenge).with_database(database_id));
        Ok(challenge)
    }

    /// Verifies a Replica's response against the issued challenge. `None`
    /// stands for a timeout (no response received before `expiresAt`).
    pub fn verify_response(
        challenge: &AuditChallenge,
        response: Option<&AuditResponse>,
        node_id: &str,
        events: &EventBus,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let ok = match response {
            Some(resp) if now <= challenge.expires_at => {
                resp.challenge_id == challenge.challenge_id
                    && digest_hex(&resp.page_bytes) == challenge.expected_hash
            }
            _ => false,
        };

        if ok {
            events.publish(Event::new(EventKind::AuditResponse).with_database(challenge.database_id.clone()));
        } else {
            let detail = if response.is_none() {
                "no response before expiry".to_string()
            } else if now > challenge.expires_at {
                "response arrived after expiry".to_string()
            } else {
                "page digest mismatch".to_string()
            };
            events.publish(
                Event::new(EventKind::AuditFailed {
                    node_id: node_id.to_string(),
                    detail,
                })
                .with_database(challenge.database_id.clone()),
            );
        }
        Ok(ok)
    }

    /// Answers a challenge by reading the named page off a local replica
    /// file.
    pub fn respond(storage: &StorageAdapter, challenge: &AuditChallenge) -> Result<AuditResponse> {
        let page_bytes = read_page(storage.path(), challenge.page_index)?;
        Ok(AuditResponse {
            challenge_id: challenge.challenge_id.clone(),
            page_bytes,
        })
    }

    /// Walks `WalJournal::verify_chain` over `[from_pos, to_pos]` and
    /// raises `audit:failed` on the first divergent position, if any.
    pub fn verify_wal_range(
        storage: &StorageAdapter,
        database_id: &str,
        node_id: &str,
        from_pos: u64,
        to_pos: u64,
        events: &EventBus,
    ) -> Result<Option<u64>> {
        if to_pos < from_pos {
            return Ok(None);
        }
        match WalJournal::verify_chain(storage, from_pos, to_pos)? {
            Some(position) => {
                events.publish(
                    Event::new(EventKind::AuditFailed {
                        node_id: node_id.to_string(),
                        detail: format!("WAL chain diverges at position {position}"),
                    })
                    .with_database(database_id),
                );
                Ok(Some(position))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageAdapter;

    fn tmp_storage() -> (tempfile::TempDir, StorageAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageAdapter::open_or_create(dir.path().join("t.db"), true).unwrap();
        storage.exec("CREATE TABLE t(x INTEGER)").unwrap();
        storage
            .run_parameterized("INSERT INTO t VALUES (1)", &[])
            .unwrap();
        (dir, storage)
    }

    #[test]
    fn matching_response_passes() {
        let (_dir, primary) = tmp_storage();
        let events = EventBus::new();
        let challenge = AuditProtocol::issue_challenge(&primary, "db1", 0, 5_000, &events).unwrap();
        let response = AuditProtocol::respond(&primary, &challenge).unwrap();
        assert!(AuditProtocol::verify_response(&challenge, Some(&response), "node2", &events).unwrap());
    }

    #[test]
    fn tampered_page_fails_and_raises_event() {
        let (_dir, primary) = tmp_storage();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let challenge = AuditProtocol::issue_challenge(&primary, "db1", 0, 5_000, &events).unwrap();

        let bogus = AuditResponse {
            challenge_id: challenge.challenge_id.clone(),
            page_bytes: vec![0u8; 4096],
        };
        assert!(!AuditProtocol::verify_response(&challenge, Some(&bogus), "node2", &events).unwrap());

        // drain the issued `audit:challenge` event first.
        let _ = rx.try_recv();
        let event = rx.try_recv().unwrap();
        assert!(matches!(event.kind, EventKind::AuditFailed { .. }));
    }

    #[test]
    fn missing_response_counts_as_failure() {
        let (_dir, primary) = tmp_storage();
        let events = EventBus::new();
        let challenge = AuditProtocol::issue_challenge(&primary, "db1", 0, 5_000, &events).unwrap();
        assert!(!AuditProtocol::verify_response(&challenge, None, "node2", &events).unwrap());
    }

    #[test]
    fn wal_range_divergence_is_detected() {
        let (_dir, storage) = tmp_storage();
        WalJournal::ensure_table(&storage).unwrap();
        for i in 1..=3 {
            WalJournal::append(&storage, &format!("INSERT INTO t VALUES ({i})"), &[]).unwrap();
        }
        storage
            .with_conn(|conn| {
                conn.execute("UPDATE __wal SET hash = 'bad' WHERE position = 2", [])
                    .map_err(Error::Storage)?;
                Ok(())
            })
            .unwrap();

        let events = EventBus::new();
        let divergence =
            AuditProtocol::verify_wal_range(&storage, "db1", "node2", 1, 3, &events).unwrap();
        assert_eq!(divergence, Some(2));
    }
}
