//! SQLite storage backend for the relay.

pub mod models;

use crate::error::RelayError;
use models::{
    key_from_row, session_from_row, version_from_row, KEY_COLUMNS, SESSION_COLUMNS,
    VERSION_COLUMNS,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use vaultsync_core::sync::models::{NewVersion, ProfileSummary, VaultKey, VaultVersion};
use vaultsync_core::sync::session::SessionRecord;
use vaultsync_core::AuthError;

/// Thread-safe relay storage.
#[derive(Clone)]
pub struct RelayStorage {
    conn: Arc<Mutex<Connection>>,
}

impl RelayStorage {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, anyhow::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vaults (
                vault_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vault_keys (
                vault_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                public_key BLOB NOT NULL,
                hostname TEXT NOT NULL,
                instance_id TEXT,
                registered_at INTEGER NOT NULL,
                revoked_at INTEGER,
                PRIMARY KEY (vault_id, fingerprint),
                FOREIGN KEY (vault_id) REFERENCES vaults(vault_id)
            );

            CREATE TABLE IF NOT EXISTS vault_versions (
                version_id TEXT PRIMARY KEY,
                vault_id TEXT NOT NULL,
                profile TEXT NOT NULL,
                storage_ref TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                key_fingerprint TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (vault_id) REFERENCES vaults(vault_id)
            );

            CREATE TABLE IF NOT EXISTS sync_rules (
                vault_id TEXT NOT NULL,
                profile TEXT NOT NULL,
                path TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (vault_id, profile, path)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                vault_id TEXT NOT NULL,
                issued_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                revoked_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_versions_profile
                ON vault_versions(vault_id, profile, created_at);
            CREATE INDEX IF NOT EXISTS idx_rules_profile
                ON sync_rules(vault_id, profile);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires
                ON sessions(expires_at);",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock error: {}", e)))
    }

    /// All keys of a vault, revoked ones included. Empty for an unknown vault.
    pub fn vault_keys(&self, vault_id: &Uuid) -> Result<Vec<VaultKey>, RelayError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM vault_keys WHERE vault_id = ?1 ORDER BY registered_at, fingerprint",
            KEY_COLUMNS
        ))?;
        let keys = stmt
            .query_map([vault_id.to_string()], key_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Add a key to a vault, creating the vault on its first key.
    ///
    /// A vault that already has keys only accepts new ones when `session_verified`.
    /// Re-registering an active key updates its metadata; a revoked key is refused.
    pub fn register_key(
        &self,
        vault_id: &Uuid,
        key: &VaultKey,
        session_verified: bool,
    ) -> Result<VaultKey, RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let vault = vault_id.to_string();

        let key_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM vault_keys WHERE vault_id = ?1",
            [&vault],
            |row| row.get(0),
        )?;
        if key_count > 0 && !session_verified {
            return Err(AuthError::MissingCredentials.into());
        }

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {} FROM vault_keys WHERE vault_id = ?1 AND fingerprint = ?2",
                    KEY_COLUMNS
                ),
                params![vault, key.fingerprint],
                key_from_row,
            )
            .optional()?;
        if let Some(existing) = &existing {
            if existing.is_revoked() {
                return Err(RelayError::Conflict(
                    "key has been revoked and cannot be registered again".to_string(),
                ));
            }
        }

        tx.execute(
            "INSERT OR IGNORE INTO vaults (vault_id, created_at) VALUES (?1, ?2)",
            params![vault, key.registered_at],
        )?;
        tx.execute(
            "INSERT INTO vault_keys (vault_id, fingerprint, public_key, hostname, instance_id, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(vault_id, fingerprint) DO UPDATE SET
                hostname = excluded.hostname,
                instance_id = excluded.instance_id",
            params![
                vault,
                key.fingerprint,
                key.public_key,
                key.hostname,
                key.instance_id.map(|id| id.to_string()),
                key.registered_at,
            ],
        )?;
        let stored = tx.query_row(
            &format!(
                "SELECT {} FROM vault_keys WHERE vault_id = ?1 AND fingerprint = ?2",
                KEY_COLUMNS
            ),
            params![vault, key.fingerprint],
            key_from_row,
        )?;
        tx.commit()?;
        Ok(stored)
    }

    /// Soft-delete a key and revoke the sessions it issued. Idempotent.
    pub fn revoke_key(
        &self,
        vault_id: &Uuid,
        fingerprint: &str,
        now: i64,
    ) -> Result<VaultKey, RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let vault = vault_id.to_string();

        let updated = tx.execute(
            "UPDATE vault_keys SET revoked_at = COALESCE(revoked_at, ?3)
             WHERE vault_id = ?1 AND fingerprint = ?2",
            params![vault, fingerprint, now],
        )?;
        if updated == 0 {
            return Err(RelayError::NotFound(format!("Unknown key {}", fingerprint)));
        }
        tx.execute(
            "UPDATE sessions SET revoked_at = ?3
             WHERE vault_id = ?1 AND issued_by = ?2 AND revoked_at IS NULL",
            params![vault, fingerprint, now],
        )?;
        let key = tx.query_row(
            &format!(
                "SELECT {} FROM vault_keys WHERE vault_id = ?1 AND fingerprint = ?2",
                KEY_COLUMNS
            ),
            params![vault, fingerprint],
            key_from_row,
        )?;
        tx.commit()?;
        Ok(key)
    }

    /// Append a version record. When the content hash equals the profile's
    /// latest version, that record is returned instead.
    pub fn record_version(
        &self,
        vault_id: &Uuid,
        profile: &str,
        new: &NewVersion,
        key_fingerprint: &str,
        now: i64,
    ) -> Result<(VaultVersion, bool), RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let latest = latest_in(&tx, vault_id, profile)?;
        if let Some(latest) = latest {
            if latest.content_hash == new.content_hash {
                return Ok((latest, false));
            }
        }

        let version = VaultVersion {
            version_id: Uuid::new_v4(),
            vault_id: *vault_id,
            profile: profile.to_string(),
            storage_ref: new.storage_ref.clone(),
            size_bytes: new.size_bytes,
            content_hash: new.content_hash.clone(),
            key_fingerprint: key_fingerprint.to_string(),
            created_at: now,
        };
        tx.execute(
            "INSERT INTO vault_versions (version_id, vault_id, profile, storage_ref, size_bytes,
                                         content_hash, key_fingerprint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                version.version_id.to_string(),
                version.vault_id.to_string(),
                version.profile,
                version.storage_ref,
                version.size_bytes as i64,
                version.content_hash,
                version.key_fingerprint,
                version.created_at,
            ],
        )?;
        tx.commit()?;
        Ok((version, true))
    }

    pub fn latest_version(
        &self,
        vault_id: &Uuid,
        profile: &str,
    ) -> Result<Option<VaultVersion>, RelayError> {
        let conn = self.conn()?;
        latest_in(&conn, vault_id, profile)
    }

    /// Versions of a profile, newest first.
    pub fn list_versions(
        &self,
        vault_id: &Uuid,
        profile: &str,
    ) -> Result<Vec<VaultVersion>, RelayError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM vault_versions WHERE vault_id = ?1 AND profile = ?2
             ORDER BY created_at DESC, rowid DESC",
            VERSION_COLUMNS
        ))?;
        let versions = stmt
            .query_map(params![vault_id.to_string(), profile], version_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    /// Every profile with versions or sync rules.
    pub fn list_profiles(&self, vault_id: &Uuid) -> Result<Vec<ProfileSummary>, RelayError> {
        let conn = self.conn()?;
        let vault = vault_id.to_string();
        let mut profiles: BTreeMap<String, ProfileSummary> = BTreeMap::new();
        let empty = |profile: &str| ProfileSummary {
            profile: profile.to_string(),
            version_count: 0,
            latest_at: None,
            excluded_count: 0,
        };

        let mut stmt = conn.prepare(
            "SELECT profile, COUNT(*), MAX(created_at) FROM vault_versions
             WHERE vault_id = ?1 GROUP BY profile",
        )?;
        let rows = stmt.query_map([&vault], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?;
        for row in rows {
            let (profile, count, latest) = row?;
            let entry = profiles.entry(profile.clone()).or_insert_with(|| empty(&profile));
            entry.version_count = count.max(0) as u64;
            entry.latest_at = latest;
        }

        let mut stmt = conn.prepare(
            "SELECT profile, COUNT(*) FROM sync_rules WHERE vault_id = ?1 GROUP BY profile",
        )?;
        let rows = stmt.query_map([&vault], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (profile, count) = row?;
            let entry = profiles.entry(profile.clone()).or_insert_with(|| empty(&profile));
            entry.excluded_count = count.max(0) as u64;
        }

        Ok(profiles.into_values().collect())
    }

    /// Excluded paths of a profile, sorted. Empty if none were ever set.
    pub fn sync_rules(&self, vault_id: &Uuid, profile: &str) -> Result<Vec<String>, RelayError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT path FROM sync_rules WHERE vault_id = ?1 AND profile = ?2 ORDER BY path",
        )?;
        let paths = stmt
            .query_map(params![vault_id.to_string(), profile], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    /// Replace a profile's exclusion set in one transaction.
    pub fn replace_sync_rules(
        &self,
        vault_id: &Uuid,
        profile: &str,
        paths: &BTreeSet<String>,
        now: i64,
    ) -> Result<usize, RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let vault = vault_id.to_string();
        tx.execute(
            "DELETE FROM sync_rules WHERE vault_id = ?1 AND profile = ?2",
            params![vault, profile],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO sync_rules (vault_id, profile, path, created_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for path in paths {
                insert.execute(params![vault, profile, path, now])?;
            }
        }
        tx.commit()?;
        Ok(paths.len())
    }

    pub fn insert_session(&self, record: &SessionRecord) -> Result<(), RelayError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (token_hash, vault_id, issued_by, created_at, expires_at, revoked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.token_hash,
                record.vault_id.to_string(),
                record.issued_by,
                record.created_at,
                record.expires_at,
                record.revoked_at,
            ],
        )?;
        Ok(())
    }

    pub fn find_session(&self, token_hash: &str) -> Result<Option<SessionRecord>, RelayError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE token_hash = ?1", SESSION_COLUMNS),
                [token_hash],
                session_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Delete sessions that expired before `now`. Returns how many were removed.
    pub fn delete_expired_sessions(&self, now: i64) -> Result<usize, RelayError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM sessions WHERE expires_at < ?1", [now])?;
        Ok(removed)
    }
}

fn latest_in(
    conn: &Connection,
    vault_id: &Uuid,
    profile: &str,
) -> Result<Option<VaultVersion>, RelayError> {
    let version = conn
        .query_row(
            &format!(
                "SELECT {} FROM vault_versions WHERE vault_id = ?1 AND profile = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                VERSION_COLUMNS
            ),
            params![vault_id.to_string(), profile],
            version_from_row,
        )
        .optional()?;
    Ok(version)
}
