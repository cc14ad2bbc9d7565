use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

/// Tagged value union bound positionally against SQLite statements and
/// journaled as a JSON array in the WAL (§3 WAL Entry, §9 redesign notes:
/// "dynamic typing of parameters... replaced by a tagged value union").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Blob(Vec<u8>),
}

impl From<rusqlite::types::Value> for Value {
    fn from(other: rusqlite::types::Value) -> Self {
        use rusqlite::types::Value as V;
        match other {
            V::Null => Value::Null,
            V::Integer(i) => Value::Integer(i),
            V::Real(x) => Value::Real(x),
            V::Text(s) => Value::Text(s),
            V::Blob(b) => Value::Blob(b),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Real(x) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*x)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            // Booleans are stored as integers (§4.1: "boolean (as integer)").
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*b as i64)),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        match j {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Real(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            // Arrays/objects have no SQLite affinity; encode as text.
            other => Value::Text(other.to_string()),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::json!(i),
            Value::Real(x) => serde_json::json!(x),
            Value::Text(s) => serde_json::Value::String(s),
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Blob(b) => serde_json::json!({ "base64": BASE64.encode(b) }),
        }
    }
}

/// A single row as an ordered mapping of column name to value (§4.1
/// `queryParameterized`).
#[derive(Debug, Clone, Serialize)]
pub struct Row {
    pub columns: Vec<(String, Value)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    ReadOnly,
    Mutating,
}

/// Classifies a SQL statement per §4.1: read-only iff its trimmed,
/// upper-cased prefix is `SELECT`, `EXPLAIN`, or a `PRAGMA` form containing
/// no `=`. Deterministic and a pure function of the prefix (§8 universal
/// invariant).
pub fn classify(sql: &str) -> Classification {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("EXPLAIN") {
        return Classification::ReadOnly;
    }
    if upper.starts_with("PRAGMA") && !sql.contains('=') {
        return Classification::ReadOnly;
    }
    Classification::Mutating
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_select_is_read_only() {
        assert_eq!(classify("  select 1"), Classification::ReadOnly);
        assert_eq!(classify("EXPLAIN QUERY PLAN SELECT 1"), Classification::ReadOnly);
    }

    #[test]
    fn classify_pragma_without_equals_is_read_only() {
        assert_eq!(classify("PRAGMA table_info(t)"), Classification::ReadOnly);
    }

    #[test]
    fn classify_pragma_with_equals_is_mutating() {
        assert_eq!(classify("PRAGMA journal_mode = WAL"), Classification::Mutating);
    }

    #[test]
    fn classify_dml_is_mutating() {
        assert_eq!(classify("INSERT INTO t VALUES (1)"), Classification::Mutating);
        assert_eq!(classify("UPDATE t SET x = 1"), Classification::Mutating);
        assert_eq!(classify("CREATE TABLE t(x)"), Classification::Mutating);
    }

    #[test]
    fn classify_is_deterministic() {
        for _ in 0..5 {
            assert_eq!(classify("select * from t"), Classification::ReadOnly);
        }
    }
}
