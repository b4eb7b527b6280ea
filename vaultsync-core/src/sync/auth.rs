//! Request signing and verification for the vault API.
//!
//! Every signed request carries a timestamp and an Ed25519 signature over the
//! canonical string
//!
//! ```text
//! {operation}:{vault_id}:{scope_1}:...:{scope_n}:{timestamp}
//! ```
//!
//! Request bodies are bound by passing [`body_digest`] as the last scope value.

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};

use crate::sync::keys::{fingerprint_of, verify_signature, Signer};
use crate::sync::models::VaultKey;

pub const TIMESTAMP_HEADER: &str = "X-Vault-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Vault-Signature";

/// Default replay window, in seconds either side of the server clock.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Operations a request can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Push,
    Pull,
    ReadVersions,
    GetSyncRules,
    PutSyncRules,
    RegisterKey,
    ListKeys,
    RevokeKey,
    IssueSession,
    ListProfiles,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::ReadVersions => "read-versions",
            Self::GetSyncRules => "get-sync-rules",
            Self::PutSyncRules => "put-sync-rules",
            Self::RegisterKey => "register-key",
            Self::ListKeys => "list-keys",
            Self::RevokeKey => "revoke-key",
            Self::IssueSession => "issue-session",
            Self::ListProfiles => "list-profiles",
        }
    }

    /// Whether a dashboard session token may authorize this operation.
    pub fn dashboard_allowed(&self) -> bool {
        matches!(
            self,
            Self::GetSyncRules
                | Self::PutSyncRules
                | Self::RegisterKey
                | Self::ListKeys
                | Self::RevokeKey
                | Self::ReadVersions
                | Self::ListProfiles
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format the canonical string-to-sign.
pub fn canonical_string(op: Operation, vault_id: &str, scope: &[&str], timestamp: i64) -> String {
    let mut parts = Vec::with_capacity(scope.len() + 3);
    parts.push(op.as_str().to_string());
    parts.push(vault_id.to_string());
    parts.extend(scope.iter().map(|s| s.to_string()));
    parts.push(timestamp.to_string());
    parts.join(":")
}

/// Hex SHA-256 of a request body.
pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Signature and timestamp attached to an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub timestamp: i64,
    /// Base64 signature.
    pub signature: String,
}

impl SignedRequest {
    pub fn headers(&self) -> [(&'static str, String); 2] {
        [
            (TIMESTAMP_HEADER, self.timestamp.to_string()),
            (SIGNATURE_HEADER, self.signature.clone()),
        ]
    }
}

/// Sign a request with the vault key.
pub fn sign_request(
    signer: &dyn Signer,
    op: Operation,
    vault_id: &str,
    scope: &[&str],
    timestamp: i64,
) -> crate::Result<SignedRequest> {
    let message = canonical_string(op, vault_id, scope, timestamp);
    let signature = signer.sign(message.as_bytes())?;
    Ok(SignedRequest {
        timestamp,
        signature: STANDARD.encode(signature),
    })
}

/// Verify a signed request against the keys registered to a vault.
///
/// The timestamp is checked first. The request is accepted on the first
/// non-revoked key whose signature matches; a signature that only matches a
/// revoked key is rejected as [`AuthError::KeyRevoked`].
#[allow(clippy::too_many_arguments)]
pub fn verify_request<'a>(
    keys: &'a [VaultKey],
    vault_id: &str,
    op: Operation,
    scope: &[&str],
    timestamp: i64,
    signature_b64: &str,
    now: i64,
    tolerance_secs: i64,
) -> Result<&'a VaultKey, AuthError> {
    if !within_tolerance(timestamp, now, tolerance_secs) {
        return Err(AuthError::Expired);
    }
    if keys.is_empty() {
        return Err(AuthError::UnknownVault);
    }

    let signature = STANDARD
        .decode(signature_b64.trim())
        .map_err(|_| AuthError::InvalidFormat)?;
    let message = canonical_string(op, vault_id, scope, timestamp);

    let mut matched_revoked = false;
    for key in keys {
        if !verify_signature(&key.public_key, message.as_bytes(), &signature) {
            continue;
        }
        if key.is_revoked() {
            matched_revoked = true;
            continue;
        }
        return Ok(key);
    }

    if matched_revoked {
        Err(AuthError::KeyRevoked)
    } else {
        Err(AuthError::InvalidSignature)
    }
}

fn within_tolerance(timestamp: i64, now: i64, tolerance_secs: i64) -> bool {
    now.abs_diff(timestamp) <= tolerance_secs.max(0) as u64
}

/// Check a key registration's proof of possession: the new key must have signed
/// `register-key:{vault}:{its own fingerprint}:{timestamp}`.
///
/// Returns the fingerprint of the key being registered.
pub fn verify_registration_proof(
    vault_id: &str,
    public_key: &[u8],
    timestamp: i64,
    proof: &[u8],
    now: i64,
    tolerance_secs: i64,
) -> Result<String, AuthError> {
    if !within_tolerance(timestamp, now, tolerance_secs) {
        return Err(AuthError::Expired);
    }
    if public_key.len() != 32 {
        return Err(AuthError::InvalidFormat);
    }
    let fingerprint = fingerprint_of(public_key);
    let message = canonical_string(
        Operation::RegisterKey,
        vault_id,
        &[fingerprint.as_str()],
        timestamp,
    );
    if !verify_signature(public_key, message.as_bytes(), proof) {
        return Err(AuthError::InvalidSignature);
    }
    Ok(fingerprint)
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingCredentials,
    InvalidFormat,
    Expired,
    InvalidSignature,
    KeyRevoked,
    UnknownVault,
    InvalidToken,
    TokenExpired,
    TokenRevoked,
    OperationNotPermitted,
    /// Rejected by the relay; carries the relay's message.
    Rejected(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCredentials => write!(f, "Missing authentication headers"),
            Self::InvalidFormat => write!(f, "Invalid authentication header format"),
            Self::Expired => write!(f, "Request timestamp outside the allowed window"),
            Self::InvalidSignature => write!(f, "Invalid signature"),
            Self::KeyRevoked => write!(f, "Key has been revoked"),
            Self::UnknownVault => write!(f, "Unknown vault"),
            Self::InvalidToken => write!(f, "Invalid session token"),
            Self::TokenExpired => write!(f, "Session token expired"),
            Self::TokenRevoked => write!(f, "Session token revoked"),
            Self::OperationNotPermitted => {
                write!(f, "Operation not permitted for this credential")
            }
            Self::Rejected(msg) => write!(f, "Rejected by relay: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}
