use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::StorageAdapter;
use crate::value::{Row, Value};
use crate::wal::WalJournal;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Whitelisted metadata filter grammar: `column OP literal` (§4.7).
static FILTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(=|!=|<=|>=|<|>|LIKE|IS NULL|IS NOT NULL)\s*('(?:[^']|'')*'|-?\d+(?:\.\d+)?|NULL)?\s*$"#,
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    L2,
    Cosine,
    Dot,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIndexRequest {
    pub table_name: String,
    pub dimensions: u32,
    #[serde(default = "default_vector_type")]
    pub vector_type: String,
    #[serde(default)]
    pub distance_metric: Option<DistanceMetric>,
    #[serde(default)]
    pub metadata_columns: Vec<String>,
    #[serde(default)]
    pub partition_key: Option<String>,
}

fn default_vector_type() -> String {
    "float32".to_string()
}

fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("invalid identifier `{name}`")))
    }
}

pub struct VectorIndexFacility;

impl VectorIndexFacility {
    /// `createIndex` (§4.7). Validates table/column names, builds the
    /// virtual table DDL, and journals it like any other DDL statement.
    pub fn create_index(storage: &StorageAdapter, req: &CreateIndexRequest) -> Result<()> {
        validate_identifier(&req.table_name)?;
        for col in &req.metadata_columns {
            validate_identifier(col)?;
        }
        if let Some(pk) = &req.partition_key {
            validate_identifier(pk)?;
        }

        let mut columns = vec![format!("embedding {}[{}]", req.vector_type, req.dimensions)];
        for col in &req.metadata_columns {
            // Auxiliary metadata columns are prefixed per §4.7 so the
            // virtual table knows to store, not index, them.
            columns.push(format!("+{col}"));
        }
        if let Some(pk) = &req.partition_key {
            columns.push(pk.clone());
        }

        let sql = format!(
            "CREATE VIRTUAL TABLE {} USING vec0({})",
            req.table_name,
            columns.join(", ")
        );
        storage.exec(&sql)?;
        WalJournal::append(storage, &sql, &[])?;
        Ok(())
    }

    /// `insert` (§4.7). Serializes the vector as little-endian float32
    /// bytes, base64-encodes it for the WAL parameter array (SPEC_FULL.md
    /// §C.2 decision), and inserts alongside metadata columns.
    pub fn insert(
        storage: &StorageAdapter,
        table_name: &str,
        vector: &[f32],
        metadata: &[(String, Value)],
        partition_value: Option<&Value>,
    ) -> Result<i64> {
        validate_identifier(table_name)?;
        for (col, _) in metadata {
            validate_identifier(col)?;
        }

        let mut bytes = Vec::with_capacity(vector.len() * 4);
        for v in vector {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let mut columns = vec!["embedding".to_string()];
        let mut params: Vec<Value> = vec![Value::Blob(bytes)];
        for (col, val) in metadata {
            columns.push(col.clone());
            params.push(val.clone());
        }
        if let Some(pv) = partition_value {
            columns.push("partition_key".to_string());
            params.push(pv.clone());
        }

        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {table_name} ({}) VALUES ({placeholders})",
            columns.join(", ")
        );
        let outcome = storage.run_parameterized(&sql, &params)?;

        // The blob travels through the WAL as base64 text so replicas can
        // reconstruct the insert from JSON-encoded params.
        let wal_params: Vec<Value> = params
            .into_iter()
            .map(|p| match p {
                Value::Blob(b) => Value::Text(BASE64.encode(b)),
                other => other,
            })
            .collect();
        WalJournal::append(storage, &sql, &wal_params)?;

        Ok(outcome.last_insert_row_id)
    }

    /// Validates a metadata filter against the §4.7 whitelist grammar.
    pub fn validate_filter(filter: &str) -> Result<()> {
        if FILTER_RE.is_match(filter) {
            Ok(())
        } else {
            Err(Error::InvalidRequest(format!("invalid metadata filter `{filter}`")))
        }
    }

    /// `search` (§4.7). `k=0` returns an empty list; an invalid
    /// `metadataFilter` returns `InvalidRequest` rather than being
    /// interpolated unchecked into SQL. When `include_metadata` is set, the
    /// auxiliary (`+column`) fields are selected alongside `rowid`/`distance`
    /// and returned on each hit.
    pub fn search(
        storage: &StorageAdapter,
        table_name: &str,
        vector: &[f32],
        k: u32,
        partition_value: Option<&Value>,
        metadata_filter: Option<&str>,
        include_metadata: bool,
    ) -> Result<Vec<SearchHit>> {
        validate_identifier(table_name)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        if let Some(filter) = metadata_filter {
            Self::validate_filter(filter)?;
        }

        let mut bytes = Vec::with_capacity(vector.len() * 4);
        for v in vector {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let select = if include_metadata { "*" } else { "rowid, distance" };
        let mut sql = format!("SELECT {select} FROM {table_name} WHERE embedding MATCH ? AND k = ?");
        let mut params: Vec<Value> = vec![Value::Blob(bytes), Value::Integer(k as i64)];
        if let Some(pv) = partition_value {
            sql.push_str(" AND partition_key = ?");
            params.push(pv.clone());
        }
        if let Some(filter) = metadata_filter {
            sql.push_str(&format!(" AND {filter}"));
        }
        sql.push_str(" ORDER BY distance ASC");

        let rows: Vec<Row> = storage.query_parameterized(&sql, &params)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut rowid = 0i64;
                let mut distance = 0f64;
                let mut metadata = Vec::new();
                for (name, value) in row.columns {
                    match (name.as_str(), value) {
                        ("rowid", Value::Integer(i)) => rowid = i,
                        ("distance", Value::Real(d)) => distance = d,
                        ("distance", Value::Integer(d)) => distance = d as f64,
                        ("embedding", _) => {}
                        (other, v) if include_metadata => metadata.push((other.to_string(), v)),
                        _ => {}
                    }
                }
                SearchHit {
                    rowid,
                    distance,
                    metadata: if include_metadata { Some(metadata) } else { None },
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub rowid: i64,
    pub distance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<(String, Value)>>,
}

/// Euclidean distance between two equal-length vectors — what the vec0
/// extension's `MATCH` operator computes under `DistanceMetric::L2`.
/// Exposed so callers (and tests) can reason about expected ordering
/// without a live virtual-table extension loaded.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| ((*x - *y) as f64).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_table_names() {
        let req = CreateIndexRequest {
            table_name: "vecs; DROP TABLE x".to_string(),
            dimensions: 3,
            vector_type: "float32".to_string(),
            distance_metric: None,
            metadata_columns: vec![],
            partition_key: None,
        };
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageAdapter::open_or_create(dir.path().join("t.db"), true).unwrap();
        assert!(VectorIndexFacility::create_index(&storage, &req).is_err());
    }

    #[test]
    fn validates_whitelisted_filters() {
        assert!(VectorIndexFacility::validate_filter("status = 'ok'").is_ok());
        assert!(VectorIndexFacility::validate_filter("age > 10").is_ok());
        assert!(VectorIndexFacility::validate_filter("deleted_at IS NULL").is_ok());
        assert!(VectorIndexFacility::validate_filter("1=1; DROP TABLE t").is_err());
        assert!(VectorIndexFacility::validate_filter("status = (SELECT 1)").is_err());
    }

    #[test]
    fn search_with_k_zero_returns_empty_without_touching_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageAdapter::open_or_create(dir.path().join("t.db"), true).unwrap();
        let hits = VectorIndexFacility::search(&storage, "vecs", &[0.0, 0.0, 0.0], 0, None, None, false).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn l2_distance_orders_nearest_first() {
        // spec.md §8 scenario 5: vectors [1,0,0],[0,1,0],[0,0,1], query
        // [0.9,0.1,0], k=2 expects rowid 1 closer than rowid 2 under L2.
        let query = [0.9, 0.1, 0.0];
        let d1 = l2_distance(&query, &[1.0, 0.0, 0.0]);
        let d2 = l2_distance(&query, &[0.0, 1.0, 0.0]);
        let d3 = l2_distance(&query, &[0.0, 0.0, 1.0]);
        assert!(d1 < d2);
        assert!(d2 < d3);
    }

    #[test]
    fn search_rejects_invalid_filter_before_querying() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageAdapter::open_or_create(dir.path().join("t.db"), true).unwrap();
        let err = VectorIndexFacility::search(
            &storage,
            "vecs",
            &[0.0, 0.0, 0.0],
            2,
            None,
            Some("1=1; DROP TABLE t"),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
