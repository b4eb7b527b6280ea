//! Ed25519 vault key: generation, rotation, self-check, signing.
//!
//! Files live in `<vault>/.keys/`:
//! - `vault_ed25519`: armoured base64 seed, mode 0600
//! - `vault_ed25519.pub`: `vaultsync-ed25519 <base64 key> <comment>`, mode 0644
//! - `archive/`: keypairs retired by rotation

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::layout::VaultLayout;
use crate::{platform, Result, VaultSyncError};

pub const PRIVATE_KEY_FILE: &str = "vault_ed25519";
pub const PUBLIC_KEY_FILE: &str = "vault_ed25519.pub";
pub const ARCHIVE_DIR: &str = "archive";
pub const KEY_TYPE: &str = "vaultsync-ed25519";

const PEM_BEGIN: &str = "-----BEGIN VAULTSYNC ED25519 PRIVATE KEY-----";
const PEM_END: &str = "-----END VAULTSYNC ED25519 PRIVATE KEY-----";

/// Raw signing capability. Injected into the coordinator so tests can use an in-memory key.
pub trait Signer: Send + Sync {
    /// Deterministic signature over `payload`.
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>>;

    fn public_key(&self) -> Result<[u8; 32]>;

    fn fingerprint(&self) -> Result<String> {
        Ok(fingerprint_of(&self.public_key()?))
    }
}

impl Signer for SigningKey {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(ed25519_dalek::Signer::sign(self, payload).to_bytes().to_vec())
    }

    fn public_key(&self) -> Result<[u8; 32]> {
        Ok(self.verifying_key().to_bytes())
    }
}

/// `SHA256:<url-safe base64>` over the raw 32-byte public key. Comments never affect it.
pub fn fingerprint_of(public_key: &[u8]) -> String {
    format!("SHA256:{}", URL_SAFE_NO_PAD.encode(Sha256::digest(public_key)))
}

/// Verify an Ed25519 signature given raw key and signature bytes.
pub fn verify_signature(public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    verifying_key
        .verify(payload, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// Generate a fresh signing key from the OS RNG.
pub fn generate_signing_key() -> SigningKey {
    let mut secret = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(&mut *secret);
    SigningKey::from_bytes(&secret)
}

/// Result of [`KeyManager::generate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    Created {
        fingerprint: String,
        permission_issues: Vec<String>,
    },
    /// A keypair was already present and has been left alone.
    AlreadyExists { fingerprint: String },
}

/// Result of [`KeyManager::rotate`].
#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub previous_fingerprint: String,
    pub new_fingerprint: String,
    pub archived_private: PathBuf,
    pub archived_public: PathBuf,
    /// Always true: every relay registration must be redone with the new key.
    pub reregistration_required: bool,
}

/// Report from [`KeyManager::verify_self`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHealth {
    pub fingerprint: Option<String>,
    /// Public key derived from the private key equals the stored public key.
    pub consistent: bool,
    pub issues: Vec<String>,
}

impl KeyHealth {
    pub fn is_healthy(&self) -> bool {
        self.consistent && self.issues.is_empty()
    }
}

/// Owns the machine's vault keypair on disk.
#[derive(Debug, Clone)]
pub struct KeyManager {
    keys_dir: PathBuf,
    comment: String,
}

impl KeyManager {
    pub fn new(keys_dir: impl Into<PathBuf>, comment: impl Into<String>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
            comment: comment.into(),
        }
    }

    pub fn for_vault(layout: &VaultLayout, comment: impl Into<String>) -> Self {
        Self::new(layout.keys_dir(), comment)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.keys_dir.join(PRIVATE_KEY_FILE)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.keys_dir.join(PUBLIC_KEY_FILE)
    }

    pub fn exists(&self) -> bool {
        self.private_key_path().is_file()
    }

    /// Create a keypair if none exists. Idempotent: an existing keypair is kept with a warning.
    pub fn generate(&self) -> Result<GenerateOutcome> {
        if self.exists() {
            let fingerprint = self.fingerprint()?;
            warn!(%fingerprint, "Vault key already exists, not generating a new one");
            return Ok(GenerateOutcome::AlreadyExists { fingerprint });
        }

        let signing_key = generate_signing_key();
        let permission_issues = self.write_keypair(&signing_key)?;
        let fingerprint = fingerprint_of(&signing_key.verifying_key().to_bytes());
        info!(%fingerprint, "Generated vault key");
        Ok(GenerateOutcome::Created {
            fingerprint,
            permission_issues,
        })
    }

    /// Archive the current keypair under a timestamped name and generate a new one.
    pub fn rotate(&self, confirmed: bool) -> Result<RotationOutcome> {
        if !confirmed {
            return Err(VaultSyncError::ConfirmationRequired(
                "rotating the vault key invalidates every relay registration".to_string(),
            ));
        }
        if !self.exists() {
            return Err(VaultSyncError::Key(
                "no vault key to rotate; run `vaultsync init` first".to_string(),
            ));
        }

        let previous_fingerprint = self.fingerprint()?;
        let archive_dir = self.keys_dir.join(ARCHIVE_DIR);
        std::fs::create_dir_all(&archive_dir)?;
        if let Err(e) = platform::set_mode(&archive_dir, 0o700) {
            warn!(error = %e, "Could not restrict key archive permissions");
        }

        // The new pair is fully written before the active files are touched.
        let signing_key = generate_signing_key();
        let (next_private, next_public) = self.next_key_paths();
        if let Err(e) = self.write_keypair_to(&signing_key, &next_private, &next_public) {
            discard(&[&next_private, &next_public]);
            return Err(e);
        }

        let (archived_private, archived_public) = archive_names(&archive_dir);
        if let Err(e) = self.swap_in(&next_private, &next_public, &archived_private, &archived_public) {
            discard(&[&next_private, &next_public]);
            return Err(e);
        }
        let new_fingerprint = fingerprint_of(&signing_key.verifying_key().to_bytes());

        warn!(
            previous = %previous_fingerprint,
            new = %new_fingerprint,
            "Vault key rotated; re-register this machine with every relay"
        );

        Ok(RotationOutcome {
            previous_fingerprint,
            new_fingerprint,
            archived_private,
            archived_public,
            reregistration_required: true,
        })
    }

    /// Load the private key.
    pub fn signing_key(&self) -> Result<SigningKey> {
        let path = self.private_key_path();
        let armoured = Zeroizing::new(std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultSyncError::Key(format!("no vault key at {}", path.display()))
            } else {
                e.into()
            }
        })?);
        decode_private_key(&armoured)
    }

    /// Load the stored public key and its comment.
    pub fn stored_public_key(&self) -> Result<([u8; 32], String)> {
        let line = std::fs::read_to_string(self.public_key_path())?;
        parse_public_key_line(&line)
    }

    /// `vaultsync-ed25519 <base64> <comment>`
    pub fn public_key_line(&self) -> Result<String> {
        let (key, comment) = self.stored_public_key()?;
        Ok(format_public_key_line(&key, &comment))
    }

    /// Derive the public key from the private key and compare it to the stored one.
    pub fn verify_self(&self) -> Result<KeyHealth> {
        let mut issues = Vec::new();

        let derived = match self.signing_key() {
            Ok(key) => Some(key.verifying_key().to_bytes()),
            Err(e) => {
                issues.push(format!("private key unreadable: {}", e));
                None
            }
        };
        let stored = match self.stored_public_key() {
            Ok((key, _)) => Some(key),
            Err(e) => {
                issues.push(format!("public key unreadable: {}", e));
                None
            }
        };

        let consistent = matches!((derived, stored), (Some(d), Some(s)) if d == s);
        if derived.is_some() && stored.is_some() && !consistent {
            issues.push("stored public key does not match the private key".to_string());
        }

        issues.extend(self.permission_issues());

        Ok(KeyHealth {
            fingerprint: derived.map(|k| fingerprint_of(&k)),
            consistent,
            issues,
        })
    }

    pub fn fingerprint(&self) -> Result<String> {
        Ok(fingerprint_of(&self.signing_key()?.verifying_key().to_bytes()))
    }

    fn next_key_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.keys_dir.join(format!("{}.next", PRIVATE_KEY_FILE)),
            self.keys_dir.join(format!("{}.next", PUBLIC_KEY_FILE)),
        )
    }

    /// Archive the active pair by copy, then rename the staged pair over it.
    /// A failed public key rename puts the archived private key back.
    fn swap_in(
        &self,
        next_private: &Path,
        next_public: &Path,
        archived_private: &Path,
        archived_public: &Path,
    ) -> Result<()> {
        std::fs::copy(self.private_key_path(), archived_private)?;
        if self.public_key_path().exists() {
            std::fs::copy(self.public_key_path(), archived_public)?;
        }
        std::fs::rename(next_private, self.private_key_path())?;
        if let Err(e) = std::fs::rename(next_public, self.public_key_path()) {
            std::fs::copy(archived_private, self.private_key_path())?;
            return Err(e.into());
        }
        Ok(())
    }

    fn write_keypair(&self, signing_key: &SigningKey) -> Result<Vec<String>> {
        self.write_keypair_to(signing_key, &self.private_key_path(), &self.public_key_path())
    }

    fn write_keypair_to(
        &self,
        signing_key: &SigningKey,
        private_path: &Path,
        public_path: &Path,
    ) -> Result<Vec<String>> {
        std::fs::create_dir_all(&self.keys_dir)?;
        let mut issues = Vec::new();
        if let Err(e) = platform::set_mode(&self.keys_dir, 0o700) {
            warn!(error = %e, "Could not restrict keys directory permissions");
            issues.push(format!("keys directory permissions: {}", e));
        }

        let armoured = Zeroizing::new(encode_private_key(signing_key));
        platform::write_atomic(private_path, armoured.as_bytes())?;
        if let Err(e) = platform::set_mode(private_path, 0o600) {
            warn!(error = %e, "Could not set private key permissions to 0600");
            issues.push(format!("private key permissions: {}", e));
        }

        let line = format_public_key_line(&signing_key.verifying_key().to_bytes(), &self.comment);
        platform::write_atomic(public_path, format!("{}\n", line).as_bytes())?;
        if let Err(e) = platform::set_mode(public_path, 0o644) {
            warn!(error = %e, "Could not set public key permissions to 0644");
            issues.push(format!("public key permissions: {}", e));
        }

        Ok(issues)
    }

    fn permission_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        match platform::file_mode(&self.private_key_path()) {
            Ok(Some(mode)) if mode & 0o077 != 0 => issues.push(format!(
                "private key is accessible by group/other (mode {:o}, expected 600)",
                mode
            )),
            Err(e) => issues.push(format!("cannot stat private key: {}", e)),
            _ => {}
        }
        match platform::file_mode(&self.public_key_path()) {
            Ok(Some(mode)) if mode & 0o444 != 0o444 => issues.push(format!(
                "public key is not world-readable (mode {:o}, expected 644)",
                mode
            )),
            Err(e) => issues.push(format!("cannot stat public key: {}", e)),
            _ => {}
        }
        for issue in &issues {
            warn!(%issue, "Vault key health issue");
        }
        issues
    }
}

impl Signer for KeyManager {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Signer::sign(&self.signing_key()?, payload)
    }

    fn public_key(&self) -> Result<[u8; 32]> {
        Ok(self.signing_key()?.verifying_key().to_bytes())
    }
}

fn discard(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Could not remove leftover key file");
            }
        }
    }
}

fn archive_names(archive_dir: &Path) -> (PathBuf, PathBuf) {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let mut suffix = 0u32;
    loop {
        let tag = if suffix == 0 {
            stamp.clone()
        } else {
            format!("{}-{}", stamp, suffix)
        };
        let private = archive_dir.join(format!("{}.{}", PRIVATE_KEY_FILE, tag));
        let public = archive_dir.join(format!("{}.{}", PUBLIC_KEY_FILE, tag));
        if !private.exists() && !public.exists() {
            return (private, public);
        }
        suffix += 1;
    }
}

fn encode_private_key(signing_key: &SigningKey) -> String {
    let seed = Zeroizing::new(signing_key.to_bytes());
    format!("{}\n{}\n{}\n", PEM_BEGIN, STANDARD.encode(&*seed), PEM_END)
}

fn decode_private_key(armoured: &str) -> Result<SigningKey> {
    let body: Zeroizing<String> = Zeroizing::new(
        armoured
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != PEM_BEGIN && *l != PEM_END)
            .collect(),
    );
    let bytes = Zeroizing::new(
        STANDARD
            .decode(body.as_bytes())
            .map_err(|e| VaultSyncError::Key(format!("corrupt private key: {}", e)))?,
    );
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| VaultSyncError::Key("corrupt private key: wrong length".to_string()))?;
    let seed = Zeroizing::new(seed);
    Ok(SigningKey::from_bytes(&seed))
}

pub fn format_public_key_line(public_key: &[u8; 32], comment: &str) -> String {
    let encoded = STANDARD.encode(public_key);
    if comment.is_empty() {
        format!("{} {}", KEY_TYPE, encoded)
    } else {
        format!("{} {} {}", KEY_TYPE, encoded, comment)
    }
}

pub fn parse_public_key_line(line: &str) -> Result<([u8; 32], String)> {
    let mut parts = line.trim().splitn(3, ' ');
    let kind = parts.next().unwrap_or_default();
    if kind != KEY_TYPE {
        return Err(VaultSyncError::Key(format!(
            "unsupported public key type: {}",
            kind
        )));
    }
    let encoded = parts
        .next()
        .ok_or_else(|| VaultSyncError::Key("public key line has no key".to_string()))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| VaultSyncError::Key(format!("corrupt public key: {}", e)))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| VaultSyncError::Key("corrupt public key: wrong length".to_string()))?;
    let comment = parts.next().unwrap_or_default().trim().to_string();
    Ok((key, comment))
}
