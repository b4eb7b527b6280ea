//! Request authentication for the relay server.
//!
//! A request is authorized either by an Ed25519 signature from a registered
//! vault key or, for dashboard operations, by a session token.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::storage::RelayStorage;
use axum::http::HeaderMap;
use chrono::Utc;
use uuid::Uuid;
use vaultsync_core::sync::auth::{
    verify_request, Operation, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use vaultsync_core::sync::models::VaultKey;
use vaultsync_core::sync::session::{bearer_token, hash_token, verify_session, SessionRecord};
use vaultsync_core::AuthError;

/// Who made an authorized request.
#[derive(Debug, Clone)]
pub enum Principal {
    Key(VaultKey),
    Session(SessionRecord),
}

impl Principal {
    /// Fingerprint of the key behind the request; for a session, the key that issued it.
    pub fn fingerprint(&self) -> &str {
        match self {
            Self::Key(key) => &key.fingerprint,
            Self::Session(session) => &session.issued_by,
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Authorize `op` on `vault_id` over `scope`.
pub fn authorize(
    storage: &RelayStorage,
    config: &RelayConfig,
    headers: &HeaderMap,
    vault_id: &Uuid,
    op: Operation,
    scope: &[&str],
) -> Result<Principal, RelayError> {
    let now = Utc::now().timestamp();

    if let Some(value) = header(headers, "Authorization") {
        let token = bearer_token(value).ok_or(AuthError::InvalidFormat)?;
        let record = storage.find_session(&hash_token(token))?;
        verify_session(record.as_ref(), vault_id, op, now)?;
        let record = record.ok_or(AuthError::InvalidToken)?;
        // Sessions die with the key that issued them.
        let issuer_revoked = storage
            .vault_keys(vault_id)?
            .iter()
            .any(|k| k.fingerprint == record.issued_by && k.is_revoked());
        if issuer_revoked {
            return Err(AuthError::TokenRevoked.into());
        }
        return Ok(Principal::Session(record));
    }

    let timestamp = header(headers, TIMESTAMP_HEADER);
    let signature = header(headers, SIGNATURE_HEADER);
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(t), Some(s)) => (t, s),
        _ => return Err(AuthError::MissingCredentials.into()),
    };
    let timestamp: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| AuthError::InvalidFormat)?;

    let keys = storage.vault_keys(vault_id)?;
    let key = verify_request(
        &keys,
        &vault_id.to_string(),
        op,
        scope,
        timestamp,
        signature,
        now,
        config.timestamp_tolerance_secs,
    )
    .map_err(|e| {
        tracing::debug!(vault = %vault_id, op = %op, error = %e, "Rejected request");
        e
    })?;
    Ok(Principal::Key(key.clone()))
}
