use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::acl::Permission;
use crate::database::ReplicationConfig;
use crate::error::{Error, Result};
use crate::tee::EncryptionMode;
use crate::value::Value;
use crate::vector::DistanceMetric;

/// Replay window for HMAC-signed requests (SPEC_FULL.md §C.5).
const REPLAY_WINDOW_MS: i64 = 5 * 60 * 1000;

type HmacSha256 = Hmac<Sha256>;

/// Verifies `signature` (hex-encoded HMAC-SHA256 of `"{timestamp}:{payload}"`
/// keyed by the database owner's address) and that `timestamp` falls within
/// [`REPLAY_WINDOW_MS`] of now.
pub fn verify_signature(owner: &str, timestamp: i64, payload: &str, signature_hex: &str) -> Result<()> {
    let now = Utc::now().timestamp_millis();
    if (now - timestamp).abs() > REPLAY_WINDOW_MS {
        return Err(Error::Unauthorized("timestamp outside replay window".to_string()));
    }
    let mut mac = HmacSha256::new_from_slice(owner.as_bytes())
        .map_err(|e| Error::Unauthorized(e.to_string()))?;
    mac.update(format!("{timestamp}:{payload}").as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    if expected != signature_hex.to_lowercase() {
        return Err(Error::Unauthorized("signature mismatch".to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatabaseRequestDto {
    pub database_id: Option<String>,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub encryption_mode: Option<EncryptionMode>,
    #[serde(default)]
    pub replication: Option<ReplicationConfig>,
    #[serde(default)]
    pub initial_ddl: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatabaseResponseDto {
    pub database_id: String,
    pub name: String,
    pub owner: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequestDto {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub required_wal_position: Option<u64>,
    #[serde(default)]
    pub caller_address: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatementDto {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchExecuteRequestDto {
    pub statements: Vec<BatchStatementDto>,
    #[serde(default)]
    pub transactional: bool,
    #[serde(default)]
    pub caller_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRequestDto {
    pub grantee: String,
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub caller_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRequestDto {
    pub grantee: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub caller_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorInsertRequestDto {
    pub table_name: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Vec<(String, Value)>,
    #[serde(default)]
    pub partition_value: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorSearchRequestDto {
    pub table_name: String,
    pub vector: Vec<f32>,
    pub k: u32,
    #[serde(default)]
    pub partition_value: Option<Value>,
    #[serde(default)]
    pub metadata_filter: Option<String>,
    #[serde(default)]
    pub distance_metric: Option<DistanceMetric>,
    #[serde(default)]
    pub include_metadata: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponseDto {
    pub status: &'static str,
    pub block_height: u64,
    pub databases: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalIntrospectionDto {
    pub database_id: String,
    pub head_position: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let owner = "0xA";
        let now = Utc::now().timestamp_millis();
        let mut mac = HmacSha256::new_from_slice(owner.as_bytes()).unwrap();
        mac.update(format!("{now}:payload").as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature(owner, now, "payload", &sig).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let owner = "0xA";
        let old = Utc::now().timestamp_millis() - REPLAY_WINDOW_MS - 1000;
        let mut mac = HmacSha256::new_from_slice(owner.as_bytes()).unwrap();
        mac.update(format!("{old}:payload").as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature(owner, old, "payload", &sig).is_err());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let owner = "0xA";
        let now = Utc::now().timestamp_millis();
        assert!(verify_signature(owner, now, "payload", "deadbeef").is_err());
    }
}
