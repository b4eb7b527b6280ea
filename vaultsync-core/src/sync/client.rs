//! Signing client for the vault API.
//!
//! Wraps a [`Transport`] and a [`Signer`]: every call builds the operation's
//! scope, signs the canonical string with the current time and hands the
//! credentials to the transport.

use std::sync::Arc;
use uuid::Uuid;

use crate::sync::auth::{body_digest, canonical_string, sign_request, Operation};
use crate::sync::keys::Signer;
use crate::sync::models::{
    NewVersion, ProfileSummary, PutSyncRulesResponse, RegisterKeyRequest, SessionResponse,
    SyncRulesBody, VaultKey, VaultVersion,
};
use crate::sync::rules::{validate_exclusions, DEFAULT_MAX_RULES};
use crate::sync::transport::{Credentials, Transport};
use crate::Result;

#[derive(Clone)]
pub struct VaultClient {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    vault_id: Uuid,
}

impl VaultClient {
    pub fn new(transport: Arc<dyn Transport>, signer: Arc<dyn Signer>, vault_id: Uuid) -> Self {
        Self {
            transport,
            signer,
            vault_id,
        }
    }

    pub fn vault_id(&self) -> &Uuid {
        &self.vault_id
    }

    pub fn signer(&self) -> &dyn Signer {
        self.signer.as_ref()
    }

    /// Sign `op` over `scope` at the current time.
    pub fn sign(&self, op: Operation, scope: &[&str]) -> Result<Credentials> {
        let signed = sign_request(
            self.signer.as_ref(),
            op,
            &self.vault_id.to_string(),
            scope,
            chrono::Utc::now().timestamp(),
        )?;
        Ok(Credentials::Signed(signed))
    }

    pub async fn get_sync_rules(&self, profile: &str) -> Result<Vec<String>> {
        let auth = self.sign(Operation::GetSyncRules, &[profile])?;
        self.transport
            .get_sync_rules(&self.vault_id, profile, &auth)
            .await
    }

    /// Replace the profile's exclusion set. Paths are validated locally first.
    pub async fn put_sync_rules(
        &self,
        profile: &str,
        paths: &[String],
    ) -> Result<PutSyncRulesResponse> {
        let excluded: Vec<String> = validate_exclusions(paths, DEFAULT_MAX_RULES)?
            .into_iter()
            .collect();
        let body = serde_json::to_vec(&SyncRulesBody { excluded })?;
        let digest = body_digest(&body);
        let auth = self.sign(Operation::PutSyncRules, &[profile, digest.as_str()])?;
        self.transport
            .put_sync_rules(&self.vault_id, profile, &body, &auth)
            .await
    }

    pub async fn record_version(&self, profile: &str, version: &NewVersion) -> Result<VaultVersion> {
        let body = serde_json::to_vec(version)?;
        let digest = body_digest(&body);
        let auth = self.sign(Operation::Push, &[profile, digest.as_str()])?;
        self.transport
            .record_version(&self.vault_id, profile, &body, &auth)
            .await
    }

    pub async fn latest_version(&self, profile: &str) -> Result<Option<VaultVersion>> {
        let auth = self.sign(Operation::Pull, &[profile])?;
        self.transport
            .latest_version(&self.vault_id, profile, &auth)
            .await
    }

    pub async fn list_versions(&self, profile: &str) -> Result<Vec<VaultVersion>> {
        let auth = self.sign(Operation::ReadVersions, &[profile])?;
        self.transport
            .list_versions(&self.vault_id, profile, &auth)
            .await
    }

    pub async fn list_profiles(&self) -> Result<Vec<ProfileSummary>> {
        let auth = self.sign(Operation::ListProfiles, &[])?;
        self.transport.list_profiles(&self.vault_id, &auth).await
    }

    /// Register this machine's key. The first key of a vault needs no token;
    /// later keys need a dashboard session token.
    pub async fn register_self(
        &self,
        hostname: &str,
        instance_id: Option<Uuid>,
        session_token: Option<&str>,
    ) -> Result<VaultKey> {
        let fingerprint = self.signer.fingerprint()?;
        let timestamp = chrono::Utc::now().timestamp();
        let message = canonical_string(
            Operation::RegisterKey,
            &self.vault_id.to_string(),
            &[fingerprint.as_str()],
            timestamp,
        );
        let proof = self.signer.sign(message.as_bytes())?;
        let request = RegisterKeyRequest {
            public_key: self.signer.public_key()?.to_vec(),
            hostname: hostname.to_string(),
            instance_id,
            timestamp,
            proof,
        };
        let session = session_token.map(|t| Credentials::Session(t.to_string()));
        self.transport
            .register_key(&self.vault_id, &request, session.as_ref())
            .await
    }

    pub async fn list_keys(&self) -> Result<Vec<VaultKey>> {
        let auth = self.sign(Operation::ListKeys, &[])?;
        self.transport.list_keys(&self.vault_id, &auth).await
    }

    pub async fn revoke_key(&self, fingerprint: &str) -> Result<VaultKey> {
        let auth = self.sign(Operation::RevokeKey, &[fingerprint])?;
        self.transport
            .revoke_key(&self.vault_id, fingerprint, &auth)
            .await
    }

    pub async fn issue_session(&self) -> Result<SessionResponse> {
        let auth = self.sign(Operation::IssueSession, &[])?;
        self.transport.issue_session(&self.vault_id, &auth).await
    }
}
