//! End-to-end push/pull scenarios against an in-memory relay and a
//! filesystem backend in a temp directory.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use uuid::Uuid;

use crate::config::{ProviderConfig, VaultConfig};
use crate::history::{ChangeTracker, CommitOrigin};
use crate::layout::VaultLayout;
use crate::sync::auth::{
    body_digest, verify_registration_proof, verify_request, AuthError, Operation,
    DEFAULT_TOLERANCE_SECS,
};
use crate::sync::backend::{
    AuthContext, FilesystemBackend, ReceivedSet, StorageBackend, TransferReport, TransferSet,
};
use crate::sync::client::VaultClient;
use crate::sync::engine::{PullOptions, PullOutcome, SyncCoordinator, SyncPhase};
use crate::sync::keys::{fingerprint_of, generate_signing_key, Signer};
use crate::sync::lock::FileLock;
use crate::sync::models::{
    NewVersion, ProfileSummary, PutSyncRulesResponse, RegisterKeyRequest, SessionResponse,
    SyncRulesBody, VaultKey, VaultVersion,
};
use crate::sync::rules::{validate_exclusions, DEFAULT_MAX_RULES};
use crate::sync::session::{hash_token, issue_token, verify_session, SessionRecord};
use crate::sync::transport::{Credentials, Transport};
use crate::{Result, TransferError, VaultSyncError};

/// Relay double enforcing the same auth rules as the real relay.
#[derive(Default)]
struct MemoryRelay {
    keys: Mutex<Vec<VaultKey>>,
    versions: Mutex<Vec<VaultVersion>>,
    rules: Mutex<HashMap<String, BTreeSet<String>>>,
    sessions: Mutex<Vec<SessionRecord>>,
    rules_down: AtomicBool,
}

impl MemoryRelay {
    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn authorize(
        &self,
        vault_id: &Uuid,
        op: Operation,
        scope: &[&str],
        auth: &Credentials,
    ) -> Result<String> {
        match auth {
            Credentials::Signed(signed) => {
                let keys = self.keys.lock().unwrap();
                let key = verify_request(
                    &keys,
                    &vault_id.to_string(),
                    op,
                    scope,
                    signed.timestamp,
                    &signed.signature,
                    Self::now(),
                    DEFAULT_TOLERANCE_SECS,
                )?;
                Ok(key.fingerprint.clone())
            }
            Credentials::Session(token) => {
                let sessions = self.sessions.lock().unwrap();
                let hash = hash_token(token);
                let record = sessions.iter().find(|s| s.token_hash == hash);
                verify_session(record, vault_id, op, Self::now())?;
                Ok(format!("session:{}", hash))
            }
        }
    }

    fn version_count(&self, profile: &str) -> usize {
        self.versions
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v.profile == profile)
            .count()
    }
}

#[async_trait]
impl Transport for MemoryRelay {
    async fn get_sync_rules(
        &self,
        vault_id: &Uuid,
        profile: &str,
        auth: &Credentials,
    ) -> Result<Vec<String>> {
        if self.rules_down.load(Ordering::SeqCst) {
            return Err(TransferError::Http {
                status: 503,
                message: "rules unavailable".to_string(),
            }
            .into());
        }
        self.authorize(vault_id, Operation::GetSyncRules, &[profile], auth)?;
        Ok(self
            .rules
            .lock()
            .unwrap()
            .get(profile)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_sync_rules(
        &self,
        vault_id: &Uuid,
        profile: &str,
        body: &[u8],
        auth: &Credentials,
    ) -> Result<PutSyncRulesResponse> {
        let digest = body_digest(body);
        self.authorize(vault_id, Operation::PutSyncRules, &[profile, digest.as_str()], auth)?;
        let parsed: SyncRulesBody = serde_json::from_slice(body)?;
        let set = validate_exclusions(&parsed.excluded, DEFAULT_MAX_RULES)?;
        let count = set.len();
        self.rules.lock().unwrap().insert(profile.to_string(), set);
        Ok(PutSyncRulesResponse {
            status: "ok".to_string(),
            excluded_count: count,
        })
    }

    async fn record_version(
        &self,
        vault_id: &Uuid,
        profile: &str,
        body: &[u8],
        auth: &Credentials,
    ) -> Result<VaultVersion> {
        let digest = body_digest(body);
        let fingerprint =
            self.authorize(vault_id, Operation::Push, &[profile, digest.as_str()], auth)?;
        let new: NewVersion = serde_json::from_slice(body)?;
        let mut versions = self.versions.lock().unwrap();
        if let Some(latest) = versions.iter().rev().find(|v| v.profile == profile) {
            if latest.content_hash == new.content_hash {
                return Ok(latest.clone());
            }
        }
        let version = VaultVersion {
            version_id: Uuid::new_v4(),
            vault_id: *vault_id,
            profile: profile.to_string(),
            storage_ref: new.storage_ref,
            size_bytes: new.size_bytes,
            content_hash: new.content_hash,
            key_fingerprint: fingerprint,
            created_at: Self::now(),
        };
        versions.push(version.clone());
        Ok(version)
    }

    async fn latest_version(
        &self,
        vault_id: &Uuid,
        profile: &str,
        auth: &Credentials,
    ) -> Result<Option<VaultVersion>> {
        self.authorize(vault_id, Operation::Pull, &[profile], auth)?;
        Ok(self
            .versions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|v| v.profile == profile)
            .cloned())
    }

    async fn list_versions(
        &self,
        vault_id: &Uuid,
        profile: &str,
        auth: &Credentials,
    ) -> Result<Vec<VaultVersion>> {
        self.authorize(vault_id, Operation::ReadVersions, &[profile], auth)?;
        Ok(self
            .versions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|v| v.profile == profile)
            .cloned()
            .collect())
    }

    async fn list_profiles(
        &self,
        vault_id: &Uuid,
        auth: &Credentials,
    ) -> Result<Vec<ProfileSummary>> {
        self.authorize(vault_id, Operation::ListProfiles, &[], auth)?;
        let versions = self.versions.lock().unwrap();
        let mut names: Vec<String> = versions.iter().map(|v| v.profile.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names
            .into_iter()
            .map(|profile| ProfileSummary {
                version_count: versions.iter().filter(|v| v.profile == profile).count() as u64,
                latest_at: versions
                    .iter()
                    .filter(|v| v.profile == profile)
                    .map(|v| v.created_at)
                    .max(),
                excluded_count: 0,
                profile,
            })
            .collect())
    }

    async fn register_key(
        &self,
        vault_id: &Uuid,
        request: &RegisterKeyRequest,
        auth: Option<&Credentials>,
    ) -> Result<VaultKey> {
        let fingerprint = verify_registration_proof(
            &vault_id.to_string(),
            &request.public_key,
            request.timestamp,
            &request.proof,
            Self::now(),
            DEFAULT_TOLERANCE_SECS,
        )?;
        let has_keys = !self.keys.lock().unwrap().is_empty();
        if has_keys {
            let auth = auth.ok_or(AuthError::MissingCredentials)?;
            self.authorize(vault_id, Operation::RegisterKey, &[fingerprint.as_str()], auth)?;
        }
        let key = VaultKey {
            fingerprint,
            public_key: request.public_key.clone(),
            hostname: request.hostname.clone(),
            instance_id: request.instance_id,
            registered_at: Self::now(),
            revoked_at: None,
        };
        self.keys.lock().unwrap().push(key.clone());
        Ok(key)
    }

    async fn list_keys(&self, vault_id: &Uuid, auth: &Credentials) -> Result<Vec<VaultKey>> {
        self.authorize(vault_id, Operation::ListKeys, &[], auth)?;
        Ok(self.keys.lock().unwrap().clone())
    }

    async fn revoke_key(
        &self,
        vault_id: &Uuid,
        fingerprint: &str,
        auth: &Credentials,
    ) -> Result<VaultKey> {
        self.authorize(vault_id, Operation::RevokeKey, &[fingerprint], auth)?;
        let mut keys = self.keys.lock().unwrap();
        let key = keys
            .iter_mut()
            .find(|k| k.fingerprint == fingerprint)
            .ok_or_else(|| VaultSyncError::Key(format!("unknown key {}", fingerprint)))?;
        key.revoked_at.get_or_insert(Self::now());
        Ok(key.clone())
    }

    async fn issue_session(&self, vault_id: &Uuid, auth: &Credentials) -> Result<SessionResponse> {
        if matches!(auth, Credentials::Session(_)) {
            return Err(AuthError::OperationNotPermitted.into());
        }
        let issued_by = self.authorize(vault_id, Operation::IssueSession, &[], auth)?;
        let now = Self::now();
        let issued = issue_token(now, 900);
        self.sessions.lock().unwrap().push(SessionRecord {
            token_hash: issued.token_hash,
            vault_id: *vault_id,
            issued_by,
            created_at: now,
            expires_at: issued.expires_at,
            revoked_at: None,
        });
        Ok(SessionResponse {
            token: issued.token,
            expires_at: issued.expires_at,
        })
    }
}

/// Backend that fails every transfer.
struct BrokenBackend;

impl StorageBackend for BrokenBackend {
    fn push(&self, _set: &TransferSet, _auth: &AuthContext) -> Result<TransferReport> {
        Err(TransferError::Backend("disk unplugged".to_string()).into())
    }

    fn pull(&self, _: &str, _: &str, _: &Path, _: &AuthContext) -> Result<ReceivedSet> {
        Err(TransferError::Backend("disk unplugged".to_string()).into())
    }

    fn test(&self) -> bool {
        false
    }

    fn info(&self) -> String {
        "broken".to_string()
    }
}

struct World {
    _dir: tempfile::TempDir,
    base: PathBuf,
    vault_id: Uuid,
    relay: Arc<MemoryRelay>,
    remote: PathBuf,
    /// Founding key of the vault, used to issue session tokens.
    admin: Arc<SigningKey>,
}

struct Machine {
    root: PathBuf,
    key: Arc<SigningKey>,
    coordinator: SyncCoordinator,
}

impl Machine {
    fn write(&self, path: &str, data: &[u8]) {
        let abs = self.root.join(path);
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(abs, data).unwrap();
    }

    fn read(&self, path: &str) -> Vec<u8> {
        fs::read(self.root.join(path)).unwrap()
    }

    fn has(&self, path: &str) -> bool {
        self.root.join(path).exists()
    }

    fn client(&self) -> &VaultClient {
        self.coordinator.client()
    }

    fn fingerprint(&self) -> String {
        self.key.fingerprint().unwrap()
    }
}

impl World {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        let remote = base.join("remote");
        fs::create_dir_all(&remote).unwrap();

        let admin = Arc::new(generate_signing_key());
        let public_key = admin.public_key().unwrap();
        let relay = Arc::new(MemoryRelay::default());
        relay.keys.lock().unwrap().push(VaultKey {
            fingerprint: fingerprint_of(&public_key),
            public_key: public_key.to_vec(),
            hostname: "admin".to_string(),
            instance_id: None,
            registered_at: MemoryRelay::now(),
            revoked_at: None,
        });

        Self {
            _dir: dir,
            base,
            vault_id: Uuid::new_v4(),
            relay,
            remote,
            admin,
        }
    }

    fn machine_with(
        &self,
        profile: &str,
        local_only: &[&str],
        backend: Arc<dyn StorageBackend>,
    ) -> Machine {
        let root = self.base.join(profile);
        fs::create_dir_all(&root).unwrap();
        let layout = VaultLayout::new(&root);

        let mut config = VaultConfig::new(self.vault_id);
        config.profile = profile.to_string();
        config.hostname = profile.to_string();
        config.local_only = local_only.iter().map(|s| s.to_string()).collect();
        config.provider = ProviderConfig::Filesystem {
            path: self.remote.clone(),
        };

        let key = Arc::new(generate_signing_key());
        let client = VaultClient::new(self.relay.clone(), key.clone(), self.vault_id);
        let tracker = ChangeTracker::open(&layout, &config.local_only, profile).unwrap();
        Machine {
            root,
            key,
            coordinator: SyncCoordinator::new(config, layout, tracker, client, backend),
        }
    }

    fn machine(&self, profile: &str) -> Machine {
        self.machine_with(profile, &[], Arc::new(FilesystemBackend::new(&self.remote)))
    }

    async fn registered(&self, profile: &str) -> Machine {
        let machine = self.machine(profile);
        self.register(&machine).await;
        machine
    }

    /// Register a machine's key with a session token from the admin key.
    async fn register(&self, machine: &Machine) {
        let token = self.admin_client().issue_session().await.unwrap().token;
        machine
            .client()
            .register_self(&machine.coordinator.config().hostname, None, Some(&token))
            .await
            .unwrap();
    }

    fn admin_client(&self) -> VaultClient {
        VaultClient::new(self.relay.clone(), self.admin.clone(), self.vault_id)
    }
}

fn pushed_files(remote: &Path, storage_ref: &str) -> Vec<String> {
    let files = remote.join(storage_ref).join("files");
    let mut out: Vec<String> = walkdir::WalkDir::new(&files)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(&files)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn excluded_path_never_reaches_storage() {
    let world = World::new();
    let laptop = world.registered("alice-laptop").await;
    laptop.write("secrets.yaml", b"token: hunter2");
    laptop.write("notes/todo.md", b"- ship it");

    laptop
        .client()
        .put_sync_rules("alice-laptop", &["secrets.yaml".to_string()])
        .await
        .unwrap();

    let outcome = laptop.coordinator.push().await.unwrap();
    assert_eq!(outcome.excluded, vec!["secrets.yaml"]);
    assert_eq!(outcome.files, 1);
    assert_eq!(
        pushed_files(&world.remote, &outcome.version.storage_ref),
        vec!["notes/todo.md"]
    );

    // Still tracked locally.
    let head = laptop.coordinator.tracker().head_snapshot().unwrap().unwrap();
    assert!(head.entries.contains_key("secrets.yaml"));

    let desktop = world.registered("alice-desktop").await;
    let restored = desktop
        .coordinator
        .restore_profile("alice-laptop", PullOptions::default())
        .await
        .unwrap();
    assert!(matches!(restored, PullOutcome::Applied { .. }));
    assert_eq!(desktop.read("notes/todo.md"), b"- ship it");
    assert!(!desktop.has("secrets.yaml"));
}

#[tokio::test]
async fn rules_outage_does_not_block_push() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    laptop.write("a.txt", b"a");
    world.relay.rules_down.store(true, Ordering::SeqCst);

    let outcome = laptop.coordinator.push().await.unwrap();
    assert!(outcome.excluded.is_empty());
    assert_eq!(outcome.files, 1);
    assert_eq!(laptop.coordinator.phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn profiles_are_isolated() {
    let world = World::new();
    let laptop = world.registered("alice-laptop").await;
    let desktop = world.registered("alice-desktop").await;
    laptop.write("laptop.txt", b"from laptop");
    desktop.write("desktop.txt", b"from desktop");

    laptop.coordinator.push().await.unwrap();
    desktop.coordinator.push().await.unwrap();
    assert_eq!(world.relay.version_count("alice-laptop"), 1);
    assert_eq!(world.relay.version_count("alice-desktop"), 1);

    // Pulling its own profile never brings in the other machine's files.
    let outcome = laptop.coordinator.pull(PullOptions::default()).await.unwrap();
    match outcome {
        PullOutcome::Applied { overwritten, unchanged, .. } => {
            assert!(overwritten.is_empty());
            assert_eq!(unchanged, 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(!laptop.has("desktop.txt"));
    assert!(!world.remote.join("alice-desktop").join("laptop.txt").exists());
}

#[tokio::test]
async fn double_push_records_one_version() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    laptop.write("a.txt", b"same bytes");

    let first = laptop.coordinator.push().await.unwrap();
    let second = laptop.coordinator.push().await.unwrap();
    assert_eq!(first.version.version_id, second.version.version_id);
    assert_eq!(first.report.content_hash, second.report.content_hash);
    assert!(second.report.reused);
    assert_eq!(world.relay.version_count("laptop"), 1);

    let versions = laptop.client().list_versions("laptop").await.unwrap();
    assert_eq!(versions.len(), 1);
}

#[tokio::test]
async fn restore_on_new_machine_reproduces_bytes() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    let payload: Vec<u8> = (0..=255u8).cycle().take(300_000).collect();
    laptop.write("data/blob.bin", &payload);
    laptop.write("readme.md", b"# vault");
    let pushed = laptop.coordinator.push().await.unwrap();

    let fresh = world.registered("replacement").await;
    let outcome = fresh
        .coordinator
        .restore_profile("laptop", PullOptions::default())
        .await
        .unwrap();
    let PullOutcome::Applied { version, overwritten, .. } = outcome else {
        panic!("expected applied pull");
    };
    assert_eq!(version.version_id, pushed.version.version_id);
    assert_eq!(overwritten, vec!["data/blob.bin", "readme.md"]);
    assert_eq!(fresh.read("data/blob.bin"), payload);

    // The pull became a commit; staging is gone.
    let log = fresh.coordinator.tracker().log(Some(1)).unwrap();
    assert_eq!(
        log[0].origin,
        CommitOrigin::Pull {
            profile: "laptop".to_string()
        }
    );
    assert!(fresh.coordinator.tracker().diff().unwrap().is_empty());
    let staging = VaultLayout::new(&fresh.root).staging_dir();
    assert_eq!(fs::read_dir(staging).unwrap().count(), 0);
}

#[tokio::test]
async fn pull_stops_on_uncommitted_edits_unless_forced() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    laptop.write("shared.txt", b"v1");
    laptop.coordinator.push().await.unwrap();

    let desktop = world.registered("desktop").await;
    desktop
        .coordinator
        .restore_profile("laptop", PullOptions::default())
        .await
        .unwrap();

    laptop.write("shared.txt", b"v2 from laptop");
    laptop.coordinator.push().await.unwrap();
    desktop.write("shared.txt", b"unsaved desktop edit");
    desktop.write("desktop-only.txt", b"stays");

    let outcome = desktop
        .coordinator
        .restore_profile("laptop", PullOptions::default())
        .await
        .unwrap();
    match outcome {
        PullOutcome::Conflicts { paths, .. } => assert_eq!(paths, vec!["shared.txt"]),
        other => panic!("expected conflicts, got {:?}", other),
    }
    assert_eq!(desktop.read("shared.txt"), b"unsaved desktop edit");

    let forced = desktop
        .coordinator
        .restore_profile(
            "laptop",
            PullOptions {
                overwrite_uncommitted: true,
            },
        )
        .await
        .unwrap();
    assert!(matches!(forced, PullOutcome::Applied { .. }));
    assert_eq!(desktop.read("shared.txt"), b"v2 from laptop");
    // Files absent from the incoming snapshot are left alone.
    assert_eq!(desktop.read("desktop-only.txt"), b"stays");
}

#[tokio::test]
async fn pull_never_touches_machine_local_paths() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    laptop.write("cache/index", b"laptop cache");
    laptop.write("doc.txt", b"doc");
    laptop.coordinator.push().await.unwrap();

    let desktop = world.machine_with(
        "desktop",
        &["cache"],
        Arc::new(FilesystemBackend::new(&world.remote)),
    );
    world.register(&desktop).await;
    desktop.write("cache/index", b"desktop cache");

    let outcome = desktop
        .coordinator
        .restore_profile("laptop", PullOptions::default())
        .await
        .unwrap();
    let PullOutcome::Applied { kept_local, .. } = outcome else {
        panic!("expected applied pull");
    };
    assert_eq!(kept_local, 1);
    assert_eq!(desktop.read("cache/index"), b"desktop cache");
    assert_eq!(desktop.read("doc.txt"), b"doc");
}

#[tokio::test]
async fn rollback_after_pull_restores_previous_bytes() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    laptop.write("plan.md", b"laptop plan");
    laptop.coordinator.push().await.unwrap();

    let desktop = world.registered("desktop").await;
    desktop.write("plan.md", b"desktop plan");
    desktop.coordinator.commit_local().unwrap();

    desktop
        .coordinator
        .restore_profile("laptop", PullOptions::default())
        .await
        .unwrap();
    assert_eq!(desktop.read("plan.md"), b"laptop plan");

    desktop.coordinator.rollback(true).unwrap();
    assert_eq!(desktop.read("plan.md"), b"desktop plan");
}

#[tokio::test]
async fn rollback_is_refused_while_syncing() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    laptop.write("a.txt", b"first");
    laptop.coordinator.commit_local().unwrap();
    laptop.write("a.txt", b"second");
    laptop.coordinator.commit_local().unwrap();

    let held = FileLock::acquire_sync(&VaultLayout::new(&laptop.root).sync_lock_path()).unwrap();
    assert!(matches!(
        laptop.coordinator.rollback(true),
        Err(VaultSyncError::AlreadySyncing)
    ));
    assert_eq!(laptop.read("a.txt"), b"second");
    assert_eq!(laptop.coordinator.tracker().log(None).unwrap().len(), 2);
    drop(held);

    laptop.coordinator.rollback(true).unwrap();
    assert_eq!(laptop.read("a.txt"), b"first");
}

#[tokio::test]
async fn restoring_another_profile_leaves_own_records_alone() {
    let world = World::new();
    let laptop = world.registered("alice-laptop").await;
    let desktop = world.registered("alice-desktop").await;
    laptop.write("laptop.txt", b"from laptop");
    desktop.write("desktop.txt", b"from desktop");
    laptop.coordinator.push().await.unwrap();
    desktop.coordinator.push().await.unwrap();

    let versions_before = laptop.client().list_versions("alice-laptop").await.unwrap();
    let log_before = laptop.coordinator.tracker().log(None).unwrap();

    let outcome = laptop
        .coordinator
        .restore_profile("alice-desktop", PullOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, PullOutcome::Applied { .. }));
    assert_eq!(laptop.read("desktop.txt"), b"from desktop");
    assert_eq!(laptop.read("laptop.txt"), b"from laptop");

    let versions_after = laptop.client().list_versions("alice-laptop").await.unwrap();
    let ids = |v: &[VaultVersion]| v.iter().map(|v| v.version_id).collect::<Vec<_>>();
    assert_eq!(ids(&versions_after), ids(&versions_before));
    assert_eq!(world.relay.version_count("alice-laptop"), 1);
    assert_eq!(world.relay.version_count("alice-desktop"), 1);

    // Earlier commits are untouched; the restore is one new commit on top.
    let log_after = laptop.coordinator.tracker().log(None).unwrap();
    assert_eq!(log_after.len(), log_before.len() + 1);
    assert_eq!(
        log_after[0].origin,
        CommitOrigin::Pull {
            profile: "alice-desktop".to_string()
        }
    );
    let old_ids: Vec<Uuid> = log_before.iter().map(|c| c.id).collect();
    let kept_ids: Vec<Uuid> = log_after[1..].iter().map(|c| c.id).collect();
    assert_eq!(kept_ids, old_ids);
}

#[tokio::test]
async fn pull_blocked_by_local_file_changes_nothing() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    laptop.write("a.txt", b"laptop a");
    laptop.write("b/c.txt", b"laptop c");
    laptop.coordinator.push().await.unwrap();

    let desktop = world.registered("desktop").await;
    desktop.write("a.txt", b"desktop a");
    desktop.write("b", b"a file where laptop has a directory");
    desktop.coordinator.commit_local().unwrap();
    let log_before = desktop.coordinator.tracker().log(None).unwrap().len();

    let err = desktop
        .coordinator
        .restore_profile("laptop", PullOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultSyncError::Validation(_)));
    assert_eq!(desktop.coordinator.phase(), SyncPhase::Failed);
    assert_eq!(desktop.read("a.txt"), b"desktop a");
    assert_eq!(desktop.read("b"), b"a file where laptop has a directory");
    assert_eq!(desktop.coordinator.tracker().log(None).unwrap().len(), log_before);
    assert!(desktop.coordinator.tracker().diff().unwrap().is_empty());
}

#[tokio::test]
async fn revoked_key_cannot_push() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    laptop.write("a.txt", b"a");
    laptop.coordinator.push().await.unwrap();

    world
        .admin_client()
        .revoke_key(&laptop.fingerprint())
        .await
        .unwrap();

    laptop.write("a.txt", b"changed");
    let err = laptop.coordinator.push().await.unwrap_err();
    assert!(matches!(
        err,
        VaultSyncError::Authentication(AuthError::KeyRevoked)
    ));
    assert!(!err.is_retryable());
    assert_eq!(laptop.coordinator.phase(), SyncPhase::Failed);
    assert_eq!(world.relay.version_count("laptop"), 1);

    // Revocation is a soft delete.
    let keys = world.admin_client().list_keys().await.unwrap();
    let revoked = keys.iter().find(|k| k.fingerprint == laptop.fingerprint()).unwrap();
    assert!(revoked.is_revoked());
}

#[tokio::test]
async fn transfer_failure_records_no_version() {
    let world = World::new();
    let laptop = world.machine_with("laptop", &[], Arc::new(BrokenBackend));
    world.register(&laptop).await;
    laptop.write("a.txt", b"a");

    let err = laptop.coordinator.push().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(laptop.coordinator.phase(), SyncPhase::Failed);
    assert_eq!(world.relay.version_count("laptop"), 0);
    // The local commit stands; nothing is pending.
    assert!(laptop.coordinator.tracker().diff().unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_sync_is_refused() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    laptop.write("a.txt", b"a");

    let held = FileLock::acquire_sync(&VaultLayout::new(&laptop.root).sync_lock_path()).unwrap();
    assert!(matches!(
        laptop.coordinator.push().await,
        Err(VaultSyncError::AlreadySyncing)
    ));
    assert!(matches!(
        laptop.coordinator.pull(PullOptions::default()).await,
        Err(VaultSyncError::AlreadySyncing)
    ));
    drop(held);

    laptop.coordinator.push().await.unwrap();
}

#[tokio::test]
async fn pull_of_unpushed_profile_is_a_noop() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    assert!(matches!(
        laptop.coordinator.pull(PullOptions::default()).await.unwrap(),
        PullOutcome::NothingToPull
    ));
}

#[tokio::test]
async fn unregistered_key_is_rejected() {
    let world = World::new();
    let stranger = world.machine("stranger");
    stranger.write("a.txt", b"a");
    let err = stranger.coordinator.push().await.unwrap_err();
    assert!(matches!(
        err,
        VaultSyncError::Authentication(AuthError::InvalidSignature)
    ));
}

#[tokio::test]
async fn second_key_needs_a_session_token() {
    let world = World::new();
    let laptop = world.machine("laptop");
    let err = laptop
        .client()
        .register_self("laptop", None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VaultSyncError::Authentication(AuthError::MissingCredentials)
    ));

    world.register(&laptop).await;
    let keys = laptop.client().list_keys().await.unwrap();
    assert_eq!(keys.len(), 2);
}

#[tokio::test]
async fn session_token_cannot_push() {
    let world = World::new();
    let token = world.admin_client().issue_session().await.unwrap().token;
    let auth = Credentials::Session(token);
    let body = serde_json::to_vec(&NewVersion {
        storage_ref: "laptop/snapshots/x".to_string(),
        size_bytes: 1,
        content_hash: "x".to_string(),
    })
    .unwrap();

    let err = world
        .relay
        .record_version(&world.vault_id, "laptop", &body, &auth)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VaultSyncError::Authentication(AuthError::OperationNotPermitted)
    ));

    // Dashboard operations are fine.
    let rules = world
        .relay
        .get_sync_rules(&world.vault_id, "laptop", &auth)
        .await
        .unwrap();
    assert!(rules.is_empty());
}

#[tokio::test]
async fn invalid_rules_are_rejected_before_sending() {
    let world = World::new();
    let laptop = world.registered("laptop").await;
    let err = laptop
        .client()
        .put_sync_rules("laptop", &["../escape".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, VaultSyncError::Validation(_)));
    assert!(world.relay.rules.lock().unwrap().is_empty());
}

#[tokio::test]
async fn list_profiles_reports_each_pushed_profile() {
    let world = World::new();
    let laptop = world.registered("alice-laptop").await;
    let desktop = world.registered("alice-desktop").await;
    laptop.write("a", b"1");
    desktop.write("b", b"2");
    laptop.coordinator.push().await.unwrap();
    desktop.coordinator.push().await.unwrap();

    let profiles = laptop.client().list_profiles().await.unwrap();
    let names: Vec<&str> = profiles.iter().map(|p| p.profile.as_str()).collect();
    assert_eq!(names, vec!["alice-desktop", "alice-laptop"]);
}
