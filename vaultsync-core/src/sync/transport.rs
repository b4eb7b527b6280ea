//! Transport to the managed relay.
//!
//! [`Transport`] is the network seam: the coordinator and CLI talk to it
//! through [`VaultClient`](crate::sync::client::VaultClient), tests swap in an
//! in-memory relay. Request bodies are passed as the exact bytes that were
//! signed so the body digest in the signature matches what the relay hashes.

use async_trait::async_trait;
use uuid::Uuid;

use crate::sync::auth::SignedRequest;
use crate::sync::models::{
    ProfileSummary, PutSyncRulesResponse, RegisterKeyRequest, SessionResponse, VaultKey,
    VaultVersion,
};
use crate::Result;

/// How a request proves who sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Signed(SignedRequest),
    /// Dashboard session token (`vs_...`).
    Session(String),
}

impl Credentials {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Signed(signed) => signed.headers().to_vec(),
            Self::Session(token) => vec![("Authorization", format!("Bearer {}", token))],
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_sync_rules(
        &self,
        vault_id: &Uuid,
        profile: &str,
        auth: &Credentials,
    ) -> Result<Vec<String>>;

    async fn put_sync_rules(
        &self,
        vault_id: &Uuid,
        profile: &str,
        body: &[u8],
        auth: &Credentials,
    ) -> Result<PutSyncRulesResponse>;

    /// Record a pushed snapshot. Returns the existing record when the content hash
    /// equals the profile's latest version.
    async fn record_version(
        &self,
        vault_id: &Uuid,
        profile: &str,
        body: &[u8],
        auth: &Credentials,
    ) -> Result<VaultVersion>;

    /// `None` when the profile has never been pushed.
    async fn latest_version(
        &self,
        vault_id: &Uuid,
        profile: &str,
        auth: &Credentials,
    ) -> Result<Option<VaultVersion>>;

    async fn list_versions(
        &self,
        vault_id: &Uuid,
        profile: &str,
        auth: &Credentials,
    ) -> Result<Vec<VaultVersion>>;

    async fn list_profiles(&self, vault_id: &Uuid, auth: &Credentials)
        -> Result<Vec<ProfileSummary>>;

    async fn register_key(
        &self,
        vault_id: &Uuid,
        request: &RegisterKeyRequest,
        auth: Option<&Credentials>,
    ) -> Result<VaultKey>;

    async fn list_keys(&self, vault_id: &Uuid, auth: &Credentials) -> Result<Vec<VaultKey>>;

    async fn revoke_key(
        &self,
        vault_id: &Uuid,
        fingerprint: &str,
        auth: &Credentials,
    ) -> Result<VaultKey>;

    async fn issue_session(&self, vault_id: &Uuid, auth: &Credentials) -> Result<SessionResponse>;
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::sync::auth::AuthError;
    use crate::{TransferError, ValidationError, VaultSyncError};
    use reqwest::StatusCode;
    use serde::de::DeserializeOwned;
    use std::time::Duration;
    use tracing::debug;

    /// HTTP client for the VaultSync relay.
    pub struct HttpTransport {
        client: reqwest::Client,
        relay_url: String,
        timeout_secs: u64,
    }

    impl HttpTransport {
        pub fn new(relay_url: &str, timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(timeout)
                .build()
                .map_err(|e| VaultSyncError::Configuration(format!("HTTP client: {}", e)))?;

            Ok(Self {
                client,
                relay_url: relay_url.trim_end_matches('/').to_string(),
                timeout_secs: timeout.as_secs(),
            })
        }

        fn url(&self, path: &str) -> String {
            format!("{}{}", self.relay_url, path)
        }

        async fn send(
            &self,
            request: reqwest::RequestBuilder,
            auth: Option<&Credentials>,
        ) -> Result<(StatusCode, Vec<u8>)> {
            let mut request = request;
            if let Some(auth) = auth {
                for (name, value) in auth.headers() {
                    request = request.header(name, value);
                }
            }

            let resp = request.send().await.map_err(|e| self.map_reqwest(e))?;
            let status = resp.status();
            let bytes = resp.bytes().await.map_err(|e| self.map_reqwest(e))?;
            debug!(%status, len = bytes.len(), "Relay response");
            Ok((status, bytes.to_vec()))
        }

        async fn get_json<T: DeserializeOwned>(&self, path: &str, auth: &Credentials) -> Result<T> {
            let (status, body) = self.send(self.client.get(self.url(path)), Some(auth)).await?;
            decode(status, &body)
        }

        async fn post_json<T: DeserializeOwned>(
            &self,
            path: &str,
            body: Vec<u8>,
            auth: Option<&Credentials>,
        ) -> Result<T> {
            let request = self
                .client
                .post(self.url(path))
                .header("Content-Type", "application/json")
                .body(body);
            let (status, body) = self.send(request, auth).await?;
            decode(status, &body)
        }

        fn map_reqwest(&self, err: reqwest::Error) -> VaultSyncError {
            if err.is_timeout() {
                TransferError::Timeout(self.timeout_secs).into()
            } else {
                TransferError::Network(err.to_string()).into()
            }
        }
    }

    fn decode<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T> {
        if !status.is_success() {
            return Err(status_error(status, body));
        }
        serde_json::from_slice(body).map_err(|e| {
            VaultSyncError::Serialization(format!("invalid relay response: {}", e))
        })
    }

    fn status_error(status: StatusCode, body: &[u8]) -> VaultSyncError {
        let message = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                AuthError::Rejected(message).into()
            }
            StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => {
                ValidationError::MalformedPayload(message).into()
            }
            _ => TransferError::Http {
                status: status.as_u16(),
                message,
            }
            .into(),
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn get_sync_rules(
            &self,
            vault_id: &Uuid,
            profile: &str,
            auth: &Credentials,
        ) -> Result<Vec<String>> {
            let path = format!("/v1/vaults/{}/profiles/{}/sync-rules", vault_id, profile);
            let body: crate::sync::models::SyncRulesBody = self.get_json(&path, auth).await?;
            Ok(body.excluded)
        }

        async fn put_sync_rules(
            &self,
            vault_id: &Uuid,
            profile: &str,
            body: &[u8],
            auth: &Credentials,
        ) -> Result<PutSyncRulesResponse> {
            let path = format!("/v1/vaults/{}/profiles/{}/sync-rules", vault_id, profile);
            let request = self
                .client
                .put(self.url(&path))
                .header("Content-Type", "application/json")
                .body(body.to_vec());
            let (status, body) = self.send(request, Some(auth)).await?;
            decode(status, &body)
        }

        async fn record_version(
            &self,
            vault_id: &Uuid,
            profile: &str,
            body: &[u8],
            auth: &Credentials,
        ) -> Result<VaultVersion> {
            let path = format!("/v1/vaults/{}/profiles/{}/versions", vault_id, profile);
            self.post_json(&path, body.to_vec(), Some(auth)).await
        }

        async fn latest_version(
            &self,
            vault_id: &Uuid,
            profile: &str,
            auth: &Credentials,
        ) -> Result<Option<VaultVersion>> {
            let path = format!("/v1/vaults/{}/profiles/{}/versions/latest", vault_id, profile);
            let (status, body) = self
                .send(self.client.get(self.url(&path)), Some(auth))
                .await?;
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            decode(status, &body).map(Some)
        }

        async fn list_versions(
            &self,
            vault_id: &Uuid,
            profile: &str,
            auth: &Credentials,
        ) -> Result<Vec<VaultVersion>> {
            let path = format!("/v1/vaults/{}/profiles/{}/versions", vault_id, profile);
            self.get_json(&path, auth).await
        }

        async fn list_profiles(
            &self,
            vault_id: &Uuid,
            auth: &Credentials,
        ) -> Result<Vec<ProfileSummary>> {
            let path = format!("/v1/vaults/{}/profiles", vault_id);
            self.get_json(&path, auth).await
        }

        async fn register_key(
            &self,
            vault_id: &Uuid,
            request: &RegisterKeyRequest,
            auth: Option<&Credentials>,
        ) -> Result<VaultKey> {
            let path = format!("/v1/vaults/{}/keys", vault_id);
            let body = serde_json::to_vec(request)?;
            self.post_json(&path, body, auth).await
        }

        async fn list_keys(&self, vault_id: &Uuid, auth: &Credentials) -> Result<Vec<VaultKey>> {
            let path = format!("/v1/vaults/{}/keys", vault_id);
            self.get_json(&path, auth).await
        }

        async fn revoke_key(
            &self,
            vault_id: &Uuid,
            fingerprint: &str,
            auth: &Credentials,
        ) -> Result<VaultKey> {
            let path = format!("/v1/vaults/{}/keys/{}/revoke", vault_id, fingerprint);
            self.post_json(&path, Vec::new(), Some(auth)).await
        }

        async fn issue_session(
            &self,
            vault_id: &Uuid,
            auth: &Credentials,
        ) -> Result<SessionResponse> {
            let path = format!("/v1/vaults/{}/sessions", vault_id);
            self.post_json(&path, Vec::new(), Some(auth)).await
        }
    }

}
