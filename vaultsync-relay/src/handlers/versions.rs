//! Version records and profile listing.

use super::{check_profile, parse_vault_id, AppState};
use crate::auth::{authorize, Principal};
use crate::error::RelayError;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use vaultsync_core::sync::auth::{body_digest, Operation};
use vaultsync_core::sync::models::{NewVersion, ProfileSummary, VaultVersion};

/// `POST /v1/vaults/{v}/profiles/{p}/versions`
///
/// Called by a pushing machine after the transfer succeeded. Signature only.
pub async fn record_version(
    State(state): State<AppState>,
    Path((vault, profile)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<VaultVersion>, RelayError> {
    let vault_id = parse_vault_id(&vault)?;
    check_profile(&profile)?;
    let digest = body_digest(&body);
    let principal = authorize(
        &state.storage,
        &state.config,
        &headers,
        &vault_id,
        Operation::Push,
        &[profile.as_str(), digest.as_str()],
    )?;
    let Principal::Key(key) = principal else {
        return Err(vaultsync_core::AuthError::OperationNotPermitted.into());
    };

    let new: NewVersion = serde_json::from_slice(&body)
        .map_err(|e| RelayError::BadRequest(format!("Invalid version: {}", e)))?;
    if new.storage_ref.is_empty() || !is_hex_digest(&new.content_hash) {
        return Err(RelayError::BadRequest(
            "storage_ref and a hex content_hash are required".to_string(),
        ));
    }

    let (version, created) = state.storage.record_version(
        &vault_id,
        &profile,
        &new,
        &key.fingerprint,
        Utc::now().timestamp(),
    )?;
    if created {
        tracing::info!(
            vault = %vault_id,
            profile = %profile,
            version = %version.version_id,
            size = version.size_bytes,
            fingerprint = %key.fingerprint,
            "Version recorded"
        );
    } else {
        tracing::debug!(vault = %vault_id, profile = %profile, version = %version.version_id, "Content unchanged, returning latest version");
    }
    Ok(Json(version))
}

/// `GET /v1/vaults/{v}/profiles/{p}/versions`, newest first.
pub async fn list_versions(
    State(state): State<AppState>,
    Path((vault, profile)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Vec<VaultVersion>>, RelayError> {
    let vault_id = parse_vault_id(&vault)?;
    check_profile(&profile)?;
    authorize(
        &state.storage,
        &state.config,
        &headers,
        &vault_id,
        Operation::ReadVersions,
        &[profile.as_str()],
    )?;
    Ok(Json(state.storage.list_versions(&vault_id, &profile)?))
}

/// `GET /v1/vaults/{v}/profiles/{p}/versions/latest`
pub async fn latest_version(
    State(state): State<AppState>,
    Path((vault, profile)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<VaultVersion>, RelayError> {
    let vault_id = parse_vault_id(&vault)?;
    check_profile(&profile)?;
    authorize(
        &state.storage,
        &state.config,
        &headers,
        &vault_id,
        Operation::Pull,
        &[profile.as_str()],
    )?;
    state
        .storage
        .latest_version(&vault_id, &profile)?
        .map(Json)
        .ok_or_else(|| RelayError::NotFound(format!("No versions for profile {}", profile)))
}

/// `GET /v1/vaults/{v}/profiles`
pub async fn list_profiles(
    State(state): State<AppState>,
    Path(vault): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProfileSummary>>, RelayError> {
    let vault_id = parse_vault_id(&vault)?;
    authorize(
        &state.storage,
        &state.config,
        &headers,
        &vault_id,
        Operation::ListProfiles,
        &[],
    )?;
    Ok(Json(state.storage.list_profiles(&vault_id)?))
}

fn is_hex_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{signed_headers, signing_key, vault_key};
    use crate::handlers::test_state;
    use ed25519_dalek::SigningKey;
    use uuid::Uuid;

    fn setup() -> (AppState, Uuid, SigningKey) {
        let state = test_state();
        let vault = Uuid::new_v4();
        let signing = signing_key(21);
        state
            .storage
            .register_key(&vault, &vault_key(&signing), false)
            .unwrap();
        (state, vault, signing)
    }

    async fn record(
        state: &AppState,
        vault: &Uuid,
        signing: &SigningKey,
        profile: &str,
        hash_byte: char,
    ) -> Result<Json<VaultVersion>, RelayError> {
        let hash: String = std::iter::repeat(hash_byte).take(64).collect();
        let body = serde_json::to_vec(&NewVersion {
            storage_ref: format!("{}/snapshots/{}", profile, hash),
            size_bytes: 42,
            content_hash: hash,
        })
        .unwrap();
        let digest = body_digest(&body);
        let headers = signed_headers(signing, vault, Operation::Push, &[profile, &digest]);
        record_version(
            State(state.clone()),
            Path((vault.to_string(), profile.to_string())),
            headers,
            Bytes::from(body),
        )
        .await
    }

    async fn latest(
        state: &AppState,
        vault: &Uuid,
        signing: &SigningKey,
        profile: &str,
    ) -> Result<Json<VaultVersion>, RelayError> {
        let headers = signed_headers(signing, vault, Operation::Pull, &[profile]);
        latest_version(
            State(state.clone()),
            Path((vault.to_string(), profile.to_string())),
            headers,
        )
        .await
    }

    #[tokio::test]
    async fn latest_is_404_until_first_push() {
        let (state, vault, signing) = setup();
        let err = latest(&state, &vault, &signing, "laptop").await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));

        let Json(recorded) = record(&state, &vault, &signing, "laptop", 'a').await.unwrap();
        let Json(found) = latest(&state, &vault, &signing, "laptop").await.unwrap();
        assert_eq!(found, recorded);
        assert_eq!(found.key_fingerprint, vault_key(&signing).fingerprint);
    }

    #[tokio::test]
    async fn same_content_twice_yields_one_record() {
        let (state, vault, signing) = setup();
        let Json(first) = record(&state, &vault, &signing, "laptop", 'a').await.unwrap();
        let Json(second) = record(&state, &vault, &signing, "laptop", 'a').await.unwrap();
        assert_eq!(first.version_id, second.version_id);
        record(&state, &vault, &signing, "laptop", 'b').await.unwrap();

        let headers = signed_headers(&signing, &vault, Operation::ReadVersions, &["laptop"]);
        let Json(versions) = list_versions(
            State(state.clone()),
            Path((vault.to_string(), "laptop".to_string())),
            headers,
        )
        .await
        .unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].content_hash.starts_with('b'));
    }

    #[tokio::test]
    async fn profiles_listing_and_invalid_names() {
        let (state, vault, signing) = setup();
        record(&state, &vault, &signing, "laptop", 'a').await.unwrap();
        record(&state, &vault, &signing, "desktop", 'c').await.unwrap();

        let headers = signed_headers(&signing, &vault, Operation::ListProfiles, &[]);
        let Json(profiles) = list_profiles(State(state.clone()), Path(vault.to_string()), headers)
            .await
            .unwrap();
        let names: Vec<_> = profiles.iter().map(|p| p.profile.as_str()).collect();
        assert_eq!(names, vec!["desktop", "laptop"]);

        let err = record(&state, &vault, &signing, "bad/name", 'a').await.unwrap_err();
        assert!(matches!(err, RelayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn malformed_hash_is_rejected() {
        let (state, vault, signing) = setup();
        let body = br#"{"storage_ref":"laptop/x","size_bytes":1,"content_hash":"nothex"}"#;
        let digest = body_digest(body);
        let headers = signed_headers(&signing, &vault, Operation::Push, &["laptop", &digest]);
        let err = record_version(
            State(state),
            Path((vault.to_string(), "laptop".to_string())),
            headers,
            Bytes::from_static(body),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::BadRequest(_)));
    }
}
