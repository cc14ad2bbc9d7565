use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::StorageAdapter;

/// §3 ACL Rule: grantee address, permission, grantedAt, optional
/// expiresAt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AclRule {
    pub grantee: String,
    pub permission: Permission,
    pub granted_at: i64,
    pub expires_at: Option<i64>,
}

const CREATE_ACL_TABLE: &str = "CREATE TABLE IF NOT EXISTS __acl (\
    grantee TEXT NOT NULL, \
    permission TEXT NOT NULL, \
    granted_at INTEGER NOT NULL, \
    expires_at INTEGER, \
    PRIMARY KEY (grantee, permission)\
)";

/// Per-Database table of (grantee, permission, grantedAt, expiresAt) with
/// owner implicit-admin rule (§3, §4.8).
pub struct AclSubsystem;

impl AclSubsystem {
    pub fn ensure_table(storage: &StorageAdapter) -> Result<()> {
        storage.exec(CREATE_ACL_TABLE)
    }

    /// `grant` (§4.8): upserts one row per (grantee, permission).
    pub fn grant(
        storage: &StorageAdapter,
        grantee: &str,
        permissions: &[Permission],
        granted_at: i64,
        expires_at: Option<i64>,
    ) -> Result<()> {
        storage.with_conn(|conn| {
            for perm in permissions {
                conn.execute(
                    "INSERT INTO __acl (grantee, permission, granted_at, expires_at) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(grantee, permission) DO UPDATE SET granted_at = excluded.granted_at, expires_at = excluded.expires_at",
                    rusqlite::params![grantee, perm.as_str(), granted_at, expires_at],
                )?;
            }
            Ok(())
        })
    }

    /// `revoke` (§4.8): deletes the specified permissions, or all of
    /// grantee's rules when `permissions` is empty.
    pub fn revoke(storage: &StorageAdapter, grantee: &str, permissions: &[Permission]) -> Result<()> {
        storage.with_conn(|conn| {
            if permissions.is_empty() {
                conn.execute("DELETE FROM __acl WHERE grantee = ?1", [grantee])?;
            } else {
                for perm in permissions {
                    conn.execute(
                        "DELETE FROM __acl WHERE grantee = ?1 AND permission = ?2",
                        rusqlite::params![grantee, perm.as_str()],
                    )?;
                }
            }
            Ok(())
        })
    }

    /// `list` (§4.8): returns grouped rules.
    pub fn list(storage: &StorageAdapter) -> Result<Vec<AclRule>> {
        storage.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT grantee, permission, granted_at, expires_at FROM __acl")?;
            let rows = stmt.query_map([], |row| {
                let permission: String = row.get(1)?;
                Ok(AclRule {
                    grantee: row.get(0)?,
                    permission: Permission::from_str(&permission).unwrap_or(Permission::Read),
                    granted_at: row.get(2)?,
                    expires_at: row.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// `check` (§4.8): true when `grantee` equals `owner` or a
    /// non-expired rule exists (§8 universal invariant:
    /// `hasPermission(owner, _) = true` always).
    pub fn check(
        storage: &StorageAdapter,
        owner: &str,
        grantee: &str,
        permission: Permission,
        now: i64,
    ) -> Result<bool> {
        if grantee == owner {
            return Ok(true);
        }
        storage.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM __acl WHERE grantee = ?1 AND permission = ?2 \
                 AND (expires_at IS NULL OR expires_at > ?3)",
                rusqlite::params![grantee, permission.as_str(), now],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Authorizes `grantee` for the ACL-table administration itself; used
    /// before any `grant`/`revoke` call (§4.3 step 2: "`Admin` required for
    /// statements against the ACL table").
    pub fn require(
        storage: &StorageAdapter,
        owner: &str,
        grantee: &str,
        permission: Permission,
        now: i64,
    ) -> Result<()> {
        if Self::check(storage, owner, grantee, permission, now)? {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "`{grantee}` lacks `{}` permission",
                permission.as_str()
            )))
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
        AclSubsystem::ensure_table(&storage).unwrap();
        (dir, storage)
    }

    #[test]
    fn owner_always_has_permission() {
        let (_dir, storage) = tmp_storage();
        assert!(AclSubsystem::check(&storage, "0xA", "0xA", Permission::Admin, 0).unwrap());
    }

    #[test]
    fn grant_then_revoke_is_monotonically_non_increasing() {
        let (_dir, storage) = tmp_storage();
        AclSubsystem::grant(&storage, "0xB", &[Permission::Read], 0, None).unwrap();
        assert!(AclSubsystem::check(&storage, "0xA", "0xB", Permission::Read, 0).unwrap());

        AclSubsystem::revoke(&storage, "0xB", &[Permission::Read]).unwrap();
        assert!(!AclSubsystem::check(&storage, "0xA", "0xB", Permission::Read, 0).unwrap());
    }

    #[test]
    fn expired_rule_does_not_grant_permission() {
        let (_dir, storage) = tmp_storage();
        AclSubsystem::grant(&storage, "0xB", &[Permission::Write], 0, Some(100)).unwrap();
        assert!(AclSubsystem::check(&storage, "0xA", "0xB", Permission::Write, 50).unwrap());
        assert!(!AclSubsystem::check(&storage, "0xA", "0xB", Permission::Write, 200).unwrap());
    }

    #[test]
    fn write_does_not_imply_admin() {
        let (_dir, storage) = tmp_storage();
        AclSubsystem::grant(&storage, "0xB", &[Permission::Write], 0, None).unwrap();
        assert!(!AclSubsystem::check(&storage, "0xA", "0xB", Permission::Admin, 0).unwrap());
    }
}
