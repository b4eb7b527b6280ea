//! Short-lived session tokens for dashboard clients.
//!
//! A token is issued to a request signed by a registered key and then stands
//! in for per-request signing on dashboard operations only. The relay stores
//! the SHA-256 of the token, never the token itself.

use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::sync::auth::{AuthError, Operation};

pub const TOKEN_PREFIX: &str = "vs_";
pub const DEFAULT_SESSION_TTL_SECS: i64 = 900;

/// A freshly minted token. `token` is returned to the client once and then dropped.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub token_hash: String,
    pub expires_at: i64,
}

/// Server-side session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub token_hash: String,
    pub vault_id: Uuid,
    /// Fingerprint of the key that requested the session.
    pub issued_by: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked_at: Option<i64>,
}

pub fn issue_token(now: i64, ttl_secs: i64) -> IssuedSession {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let token = format!("{}{}", TOKEN_PREFIX, hex::encode(raw));
    IssuedSession {
        token_hash: hash_token(&token),
        token,
        expires_at: now + ttl_secs,
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Extract the token from an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ")?.trim();
    token.starts_with(TOKEN_PREFIX).then_some(token)
}

/// Check a looked-up session against the requested vault and operation.
pub fn verify_session(
    record: Option<&SessionRecord>,
    vault_id: &Uuid,
    op: Operation,
    now: i64,
) -> Result<(), AuthError> {
    let record = record.ok_or(AuthError::InvalidToken)?;
    if record.vault_id != *vault_id {
        return Err(AuthError::InvalidToken);
    }
    if record.revoked_at.is_some() {
        return Err(AuthError::TokenRevoked);
    }
    if now >= record.expires_at {
        return Err(AuthError::TokenExpired);
    }
    if !op.dashboard_allowed() {
        return Err(AuthError::OperationNotPermitted);
    }
    Ok(())
}
