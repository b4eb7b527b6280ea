//! Per-profile sync rules (the set of paths excluded from sharing).

use super::{check_profile, parse_vault_id, AppState};
use crate::auth::authorize;
use crate::error::RelayError;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use vaultsync_core::sync::auth::{body_digest, Operation};
use vaultsync_core::sync::models::{PutSyncRulesResponse, SyncRulesBody};
use vaultsync_core::sync::rules::validate_exclusions;

/// `GET /v1/vaults/{v}/profiles/{p}/sync-rules`
pub async fn get_rules(
    State(state): State<AppState>,
    Path((vault, profile)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<SyncRulesBody>, RelayError> {
    let vault_id = parse_vault_id(&vault)?;
    check_profile(&profile)?;
    authorize(
        &state.storage,
        &state.config,
        &headers,
        &vault_id,
        Operation::GetSyncRules,
        &[profile.as_str()],
    )?;
    let excluded = state.storage.sync_rules(&vault_id, &profile)?;
    Ok(Json(SyncRulesBody { excluded }))
}

/// `PUT /v1/vaults/{v}/profiles/{p}/sync-rules`
///
/// Replaces the whole set. The payload is validated in full before anything
/// is written, so a rejected request leaves the stored rules untouched.
pub async fn put_rules(
    State(state): State<AppState>,
    Path((vault, profile)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PutSyncRulesResponse>, RelayError> {
    let vault_id = parse_vault_id(&vault)?;
    check_profile(&profile)?;
    let digest = body_digest(&body);
    authorize(
        &state.storage,
        &state.config,
        &headers,
        &vault_id,
        Operation::PutSyncRules,
        &[profile.as_str(), digest.as_str()],
    )?;

    let paths = parse_excluded(&body)?;
    let set = validate_exclusions(&paths, state.config.max_rules_per_profile)?;
    let count = state
        .storage
        .replace_sync_rules(&vault_id, &profile, &set, Utc::now().timestamp())?;
    tracing::info!(vault = %vault_id, profile = %profile, excluded = count, "Sync rules replaced");

    Ok(Json(PutSyncRulesResponse {
        status: "ok".to_string(),
        excluded_count: count,
    }))
}

fn parse_excluded(body: &[u8]) -> Result<Vec<String>, RelayError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::BadRequest(format!("Invalid JSON: {}", e)))?;
    let items = value
        .get("excluded")
        .and_then(|v| v.as_array())
        .ok_or_else(|| RelayError::BadRequest("excluded must be an array".to_string()))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| RelayError::BadRequest("excluded entries must be strings".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{signed_headers, signing_key, vault_key};
    use crate::handlers::test_state;
    use ed25519_dalek::SigningKey;
    use uuid::Uuid;
    use vaultsync_core::AuthError;

    fn setup() -> (AppState, Uuid, SigningKey) {
        let state = test_state();
        let vault = Uuid::new_v4();
        let signing = signing_key(11);
        state
            .storage
            .register_key(&vault, &vault_key(&signing), false)
            .unwrap();
        (state, vault, signing)
    }

    async fn put(
        state: &AppState,
        vault: &Uuid,
        signing: &SigningKey,
        profile: &str,
        body: &str,
    ) -> Result<Json<PutSyncRulesResponse>, RelayError> {
        let digest = body_digest(body.as_bytes());
        let headers = signed_headers(signing, vault, Operation::PutSyncRules, &[profile, &digest]);
        put_rules(
            State(state.clone()),
            Path((vault.to_string(), profile.to_string())),
            headers,
            Bytes::from(body.to_string()),
        )
        .await
    }

    async fn get(state: &AppState, vault: &Uuid, signing: &SigningKey, profile: &str) -> Vec<String> {
        let headers = signed_headers(signing, vault, Operation::GetSyncRules, &[profile]);
        let Json(body) = get_rules(
            State(state.clone()),
            Path((vault.to_string(), profile.to_string())),
            headers,
        )
        .await
        .unwrap();
        body.excluded
    }

    #[tokio::test]
    async fn put_then_get_returns_normalized_set() {
        let (state, vault, signing) = setup();
        let Json(resp) = put(
            &state,
            &vault,
            &signing,
            "laptop",
            r#"{"excluded":["secrets.yaml","notes/private/","secrets.yaml"]}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.excluded_count, 2);
        assert_eq!(
            get(&state, &vault, &signing, "laptop").await,
            vec!["notes/private", "secrets.yaml"]
        );
        assert!(get(&state, &vault, &signing, "desktop").await.is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_leaves_rules_untouched() {
        let (state, vault, signing) = setup();
        put(&state, &vault, &signing, "laptop", r#"{"excluded":["keep.txt"]}"#)
            .await
            .unwrap();

        for body in [
            r#"{"excluded":"keep.txt"}"#,
            r#"{"excluded":["ok.txt",""]}"#,
            r#"{"excluded":["../escape"]}"#,
            r#"{"excluded":[1]}"#,
        ] {
            let err = put(&state, &vault, &signing, "laptop", body).await.unwrap_err();
            assert!(matches!(err, RelayError::BadRequest(_)), "{}", body);
        }
        assert_eq!(get(&state, &vault, &signing, "laptop").await, vec!["keep.txt"]);
    }

    #[tokio::test]
    async fn too_many_paths_is_payload_too_large() {
        let (mut state, vault, signing) = setup();
        let mut config = (*state.config).clone();
        config.max_rules_per_profile = 2;
        state.config = std::sync::Arc::new(config);

        let err = put(&state, &vault, &signing, "laptop", r#"{"excluded":["a","b","c"]}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::PayloadTooLarge));
    }

    #[tokio::test]
    async fn body_is_bound_to_signature() {
        let (state, vault, signing) = setup();
        let digest = body_digest(br#"{"excluded":["a"]}"#);
        let headers = signed_headers(&signing, &vault, Operation::PutSyncRules, &["laptop", &digest]);
        let err = put_rules(
            State(state.clone()),
            Path((vault.to_string(), "laptop".to_string())),
            headers,
            Bytes::from_static(br#"{"excluded":["b"]}"#),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::Auth(AuthError::InvalidSignature)));
    }
}
