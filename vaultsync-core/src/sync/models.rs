//! Wire models shared between the client and the relay.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A public key authorized to act on a vault. Revoked, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultKey {
    pub fingerprint: String,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    pub hostname: String,
    pub instance_id: Option<Uuid>,
    pub registered_at: i64,
    pub revoked_at: Option<i64>,
}

impl VaultKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Immutable record of one successful push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultVersion {
    pub version_id: Uuid,
    pub vault_id: Uuid,
    pub profile: String,
    /// Opaque location understood by the storage backend.
    pub storage_ref: String,
    pub size_bytes: u64,
    pub content_hash: String,
    /// Fingerprint of the key that signed the push.
    pub key_fingerprint: String,
    pub created_at: i64,
}

/// Body of `POST .../profiles/{p}/versions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVersion {
    pub storage_ref: String,
    pub size_bytes: u64,
    pub content_hash: String,
}

/// Body of both sync-rules endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRulesBody {
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutSyncRulesResponse {
    pub status: String,
    pub excluded_count: usize,
}

/// Body of `POST .../keys`. `proof` is a signature by the key being registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterKeyRequest {
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    pub hostname: String,
    pub instance_id: Option<Uuid>,
    pub timestamp: i64,
    #[serde(with = "base64_bytes")]
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub profile: String,
    pub version_count: u64,
    pub latest_at: Option<i64>,
    pub excluded_count: u64,
}

/// Serde helper for `Vec<u8>` as standard base64.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
