//! Row mapping for relay tables.

use rusqlite::Row;
use uuid::Uuid;
use vaultsync_core::sync::models::{VaultKey, VaultVersion};
use vaultsync_core::sync::session::SessionRecord;

pub const KEY_COLUMNS: &str =
    "fingerprint, public_key, hostname, instance_id, registered_at, revoked_at";

pub const VERSION_COLUMNS: &str =
    "version_id, vault_id, profile, storage_ref, size_bytes, content_hash, key_fingerprint, created_at";

pub const SESSION_COLUMNS: &str =
    "token_hash, vault_id, issued_by, created_at, expires_at, revoked_at";

fn parse_uuid(idx: usize, raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub fn key_from_row(row: &Row<'_>) -> rusqlite::Result<VaultKey> {
    let instance_id: Option<String> = row.get(3)?;
    Ok(VaultKey {
        fingerprint: row.get(0)?,
        public_key: row.get(1)?,
        hostname: row.get(2)?,
        instance_id: instance_id.map(|s| parse_uuid(3, s)).transpose()?,
        registered_at: row.get(4)?,
        revoked_at: row.get(5)?,
    })
}

pub fn version_from_row(row: &Row<'_>) -> rusqlite::Result<VaultVersion> {
    let size: i64 = row.get(4)?;
    Ok(VaultVersion {
        version_id: parse_uuid(0, row.get(0)?)?,
        vault_id: parse_uuid(1, row.get(1)?)?,
        profile: row.get(2)?,
        storage_ref: row.get(3)?,
        size_bytes: size.max(0) as u64,
        content_hash: row.get(5)?,
        key_fingerprint: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        token_hash: row.get(0)?,
        vault_id: parse_uuid(1, row.get(1)?)?,
        issued_by: row.get(2)?,
        created_at: row.get(3)?,
        expires_at: row.get(4)?,
        revoked_at: row.get(5)?,
    })
}
