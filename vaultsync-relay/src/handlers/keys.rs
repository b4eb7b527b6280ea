//! Vault key registration, listing and revocation.

use super::{parse_vault_id, AppState};
use crate::auth::authorize;
use crate::error::RelayError;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use vaultsync_core::sync::auth::{verify_registration_proof, Operation};
use vaultsync_core::sync::models::{RegisterKeyRequest, VaultKey};

/// `POST /v1/vaults/{v}/keys`
///
/// The body carries a proof-of-possession signature by the key being
/// registered. The first key of a vault needs nothing else; every later key
/// needs a session token issued by an already registered key.
pub async fn register_key(
    State(state): State<AppState>,
    Path(vault): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<VaultKey>, RelayError> {
    let vault_id = parse_vault_id(&vault)?;
    let req: RegisterKeyRequest = serde_json::from_slice(&body)
        .map_err(|e| RelayError::BadRequest(format!("Invalid registration: {}", e)))?;
    if req.hostname.trim().is_empty() {
        return Err(RelayError::BadRequest("hostname is required".to_string()));
    }

    let now = Utc::now().timestamp();
    let fingerprint = verify_registration_proof(
        &vault_id.to_string(),
        &req.public_key,
        req.timestamp,
        &req.proof,
        now,
        state.config.timestamp_tolerance_secs,
    )?;

    let session_verified = if headers.contains_key("Authorization") {
        authorize(
            &state.storage,
            &state.config,
            &headers,
            &vault_id,
            Operation::RegisterKey,
            &[fingerprint.as_str()],
        )?;
        true
    } else {
        false
    };

    let key = VaultKey {
        fingerprint,
        public_key: req.public_key,
        hostname: req.hostname,
        instance_id: req.instance_id,
        registered_at: now,
        revoked_at: None,
    };
    let stored = state.storage.register_key(&vault_id, &key, session_verified)?;
    tracing::info!(vault = %vault_id, fingerprint = %stored.fingerprint, hostname = %stored.hostname, "Key registered");
    Ok(Json(stored))
}

/// `GET /v1/vaults/{v}/keys`
pub async fn list_keys(
    State(state): State<AppState>,
    Path(vault): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<VaultKey>>, RelayError> {
    let vault_id = parse_vault_id(&vault)?;
    authorize(
        &state.storage,
        &state.config,
        &headers,
        &vault_id,
        Operation::ListKeys,
        &[],
    )?;
    Ok(Json(state.storage.vault_keys(&vault_id)?))
}

/// `POST /v1/vaults/{v}/keys/{fingerprint}/revoke`
pub async fn revoke_key(
    State(state): State<AppState>,
    Path((vault, fingerprint)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<VaultKey>, RelayError> {
    let vault_id = parse_vault_id(&vault)?;
    let principal = authorize(
        &state.storage,
        &state.config,
        &headers,
        &vault_id,
        Operation::RevokeKey,
        &[fingerprint.as_str()],
    )?;
    let key = state
        .storage
        .revoke_key(&vault_id, &fingerprint, Utc::now().timestamp())?;
    tracing::info!(
        vault = %vault_id,
        fingerprint = %key.fingerprint,
        by = %principal.fingerprint(),
        "Key revoked"
    );
    Ok(Json(key))
}
