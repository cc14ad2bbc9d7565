use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::value::{classify, Classification, Row, Value};

/// Outcome of a mutating, parameterized statement (§4.1
/// `runParameterized`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOutcome {
    pub changes: i64,
    pub last_insert_row_id: i64,
}

/// Opens and drives one SQLite file in WAL journal mode. Concurrent calls
/// on the same handle are serialized by the caller (§5: the host must
/// ensure they do not run concurrently); this type does not lock itself,
/// `DatabaseInstance` owns that responsibility.
pub struct StorageAdapter {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl StorageAdapter {
    /// `openOrCreate(path, createIfMissing)` (§4.1). Sets
    /// `journal_mode=WAL`, `synchronous=NORMAL`, `foreign_keys=ON`, and a
    /// 5-second busy timeout.
    pub fn open_or_create(path: impl AsRef<Path>, create_if_missing: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !create_if_missing && !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let conn = Connection::open(&path).map_err(Error::Storage)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `exec(handle, sql)` (§4.1): runs a DDL/arbitrary script.
    pub fn exec(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql).map_err(Error::Storage)
    }

    /// `runParameterized` (§4.1): binds `params` positionally and returns
    /// `{changes, lastInsertRowId}`.
    pub fn run_parameterized(&self, sql: &str, params: &[Value]) -> Result<ExecOutcome> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        let changes = stmt.execute(refs.as_slice())? as i64;
        Ok(ExecOutcome {
            changes,
            last_insert_row_id: conn.last_insert_rowid(),
        })
    }

    /// `queryParameterized` (§4.1): returns rows as an ordered mapping of
    /// column name to value.
    pub fn query_parameterized(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        let mut rows = stmt.query(refs.as_slice())?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut columns = Vec::with_capacity(col_names.len());
            for (i, name) in col_names.iter().enumerate() {
                let value: rusqlite::types::Value = row.get(i)?;
                columns.push((name.clone(), Value::from(value)));
            }
            out.push(Row { columns });
        }
        Ok(out)
    }

    /// `classify(sql)` (§4.1).
    pub fn classify(&self, sql: &str) -> Classification {
        classify(sql)
    }

    /// `schemaDigest(handle)` (§4.1): SHA-256 over the newline-joined,
    /// name-ordered CREATE statements from the master catalog.
    pub fn schema_digest(&self) -> Result<[u8; 32]> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sql FROM sqlite_master WHERE sql IS NOT NULL AND name NOT LIKE '\\_\\_%' ESCAPE '\\' ORDER BY name",
        )?;
        let mut rows = stmt.query([])?;
        let mut joined = String::new();
        while let Some(row) = rows.next()? {
            let sql: String = row.get(0)?;
            joined.push_str(&sql);
            joined.push('\n');
        }
        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        Ok(hasher.finalize().into())
    }

    /// Direct connection access for modules that need to compose raw SQL
    /// under the same lock (WAL journal, ACL, vector facility).
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(&self.conn.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_db() -> (tempfile::TempDir, StorageAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let adapter = StorageAdapter::open_or_create(&path, true).unwrap();
        (dir, adapter)
    }

    #[test]
    fn open_missing_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        assert!(matches!(
            StorageAdapter::open_or_create(&path, false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn exec_and_query_round_trip() {
        let (_dir, adapter) = tmp_db();
        adapter.exec("CREATE TABLE t(x INTEGER)").unwrap();
        let outcome = adapter
            .run_parameterized("INSERT INTO t VALUES (?)", &[Value::Integer(42)])
            .unwrap();
        assert_eq!(outcome.changes, 1);
        let rows = adapter.query_parameterized("SELECT * FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns[0], ("x".to_string(), Value::Integer(42)));
    }

    #[test]
    fn schema_digest_is_stable_and_excludes_reserved_tables() {
        let (_dir, adapter) = tmp_db();
        adapter.exec("CREATE TABLE t(x INTEGER)").unwrap();
        adapter.exec("CREATE TABLE __wal(position INTEGER)").unwrap();
        let d1 = adapter.schema_digest().unwrap();
        let d2 = adapter.schema_digest().unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn classify_matches_free_function() {
        let (_dir, adapter) = tmp_db();
        assert_eq!(adapter.classify("SELECT 1"), Classification::ReadOnly);
        assert_eq!(adapter.classify("DELETE FROM t"), Classification::Mutating);
    }
}
