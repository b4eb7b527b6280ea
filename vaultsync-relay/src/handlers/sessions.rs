//! Dashboard session issuance.

use super::{parse_vault_id, AppState};
use crate::auth::authorize;
use crate::error::RelayError;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use vaultsync_core::sync::auth::Operation;
use vaultsync_core::sync::models::SessionResponse;
use vaultsync_core::sync::session::{issue_token, SessionRecord};

/// `POST /v1/vaults/{v}/sessions`: signature only, a session cannot mint another.
pub async fn issue_session(
    State(state): State<AppState>,
    Path(vault): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, RelayError> {
    let vault_id = parse_vault_id(&vault)?;
    let principal = authorize(
        &state.storage,
        &state.config,
        &headers,
        &vault_id,
        Operation::IssueSession,
        &[],
    )?;

    let now = Utc::now().timestamp();
    let issued = issue_token(now, state.config.session_ttl_secs);
    state.storage.insert_session(&SessionRecord {
        token_hash: issued.token_hash,
        vault_id,
        issued_by: principal.fingerprint().to_string(),
        created_at: now,
        expires_at: issued.expires_at,
        revoked_at: None,
    })?;
    tracing::info!(vault = %vault_id, by = %principal.fingerprint(), expires_at = issued.expires_at, "Session issued");

    Ok(Json(SessionResponse {
        token: issued.token,
        expires_at: issued.expires_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{bearer_headers, signed_headers, signing_key, vault_key};
    use crate::handlers::keys::list_keys;
    use crate::handlers::test_state;
    use uuid::Uuid;
    use vaultsync_core::AuthError;

    #[tokio::test]
    async fn signed_request_gets_working_token() {
        let state = test_state();
        let vault = Uuid::new_v4();
        let signing = signing_key(9);
        state
            .storage
            .register_key(&vault, &vault_key(&signing), false)
            .unwrap();

        let headers = signed_headers(&signing, &vault, Operation::IssueSession, &[]);
        let Json(session) = issue_session(State(state.clone()), Path(vault.to_string()), headers)
            .await
            .unwrap();
        assert!(session.token.starts_with("vs_"));
        assert!(session.expires_at > Utc::now().timestamp());

        let Json(keys) = list_keys(
            State(state.clone()),
            Path(vault.to_string()),
            bearer_headers(&session.token),
        )
        .await
        .unwrap();
        assert_eq!(keys.len(), 1);

        // A session cannot mint further sessions.
        let err = issue_session(
            State(state),
            Path(vault.to_string()),
            bearer_headers(&session.token),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::Auth(AuthError::OperationNotPermitted)));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let state = test_state();
        let err = list_keys(
            State(state),
            Path(Uuid::new_v4().to_string()),
            bearer_headers("vs_deadbeef"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::Auth(AuthError::InvalidToken)));
    }
}
