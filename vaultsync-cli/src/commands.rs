//! Command implementations. Each returns `anyhow::Result`; `main` maps errors to exit status 1.

use anyhow::{bail, Context as _, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use vaultsync_core::history::{ChangeKind, CommitOutcome};
use vaultsync_core::sync::keys::GenerateOutcome;
use vaultsync_core::sync::transport::HttpTransport;
use vaultsync_core::sync::VaultClient;
use vaultsync_core::watcher::{self, WatcherActivity};
use vaultsync_core::{
    platform, ChangeTracker, KeyManager, ProviderConfig, PullOptions, PullOutcome, Signer,
    SyncCoordinator, VaultConfig, VaultLayout, VaultSyncError,
};

use crate::{KeyAction, ProfileAction, RulesAction, SessionAction, SyncAction};

pub struct Context {
    layout: VaultLayout,
}

impl Context {
    pub fn new(root: PathBuf) -> Self {
        Self {
            layout: VaultLayout::new(root),
        }
    }

    fn config(&self) -> Result<VaultConfig> {
        Ok(VaultConfig::load(&self.layout)?)
    }

    fn keys(&self, config: &VaultConfig) -> KeyManager {
        KeyManager::for_vault(&self.layout, config.hostname.clone())
    }

    fn tracker(&self, config: &VaultConfig) -> Result<ChangeTracker> {
        Ok(ChangeTracker::open(
            &self.layout,
            &config.local_only,
            &config.hostname,
        )?)
    }

    fn coordinator(&self) -> Result<SyncCoordinator> {
        let config = self.config()?;
        Ok(SyncCoordinator::from_config(&self.layout, config)?)
    }

    /// Relay client for commands that never touch the storage provider.
    fn client(&self, config: &VaultConfig) -> Result<VaultClient> {
        let keys = self.keys(config);
        if !keys.exists() {
            bail!("no vault key on this machine; run `vaultsync init` first");
        }
        let transport = HttpTransport::new(
            config.relay_url()?,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(VaultClient::new(
            Arc::new(transport),
            Arc::new(keys),
            config.vault_id,
        ))
    }
}

fn format_time(ts: Option<i64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Ask on the terminal unless `--yes` was given.
fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

pub fn init(
    ctx: &Context,
    vault_id: Option<Uuid>,
    profile: Option<String>,
    relay_url: Option<String>,
    storage: Option<PathBuf>,
) -> Result<()> {
    let layout = &ctx.layout;
    std::fs::create_dir_all(layout.local_dir())
        .with_context(|| format!("creating {}", layout.local_dir().display()))?;

    let config = if layout.is_initialized() {
        println!("Vault already initialized at {}", layout.root().display());
        ctx.config()?
    } else {
        let mut config = VaultConfig::new(vault_id.unwrap_or_else(Uuid::new_v4));
        if let Some(profile) = profile {
            config.profile = profile;
        }
        config.relay_url = relay_url;
        if let Some(path) = storage {
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()?.join(path)
            };
            config.provider = ProviderConfig::Filesystem { path };
        }
        config.save(layout)?;
        println!("Initialized vault {} at {}", config.vault_id, layout.root().display());
        config
    };

    match ctx.keys(&config).generate()? {
        GenerateOutcome::Created {
            fingerprint,
            permission_issues,
        } => {
            println!("Generated vault key {}", fingerprint);
            for issue in permission_issues {
                println!("  warning: {}", issue);
            }
        }
        GenerateOutcome::AlreadyExists { fingerprint } => {
            println!("Using existing vault key {}", fingerprint);
        }
    }

    if let CommitOutcome::Committed(commit) = ctx.tracker(&config)?.init()? {
        println!("Recorded initial commit {}", commit.id);
    }
    println!("Profile: {}", config.profile);
    if config.relay_url.is_some() {
        println!("Next: `vaultsync key register` to register this machine with the relay");
    }
    Ok(())
}

pub fn status(ctx: &Context) -> Result<()> {
    let config = ctx.config()?;
    let status = ctx.tracker(&config)?.status()?;
    println!("Vault:    {} ({})", config.vault_id, ctx.layout.root().display());
    println!("Profile:  {}", config.profile);
    println!("Watcher:  {}", status.watcher);
    println!(
        "Head:     {}",
        status
            .head
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("Commit:   {}", format_time(status.last_commit_at));
    println!("Push:     {}", format_time(status.last_push_at));
    println!("Pull:     {}", format_time(status.last_pull_at));
    println!("Pending:  {} change(s)", status.pending_changes);
    Ok(())
}

pub async fn sync(ctx: &Context, action: SyncAction) -> Result<()> {
    match action {
        SyncAction::Start => start_watcher(ctx),
        SyncAction::Stop => {
            ctx.config()?;
            if matches!(watcher::read_activity(&ctx.layout), WatcherActivity::Stopped) {
                println!("Watcher is not running");
                return Ok(());
            }
            watcher::request_stop(&ctx.layout)?;
            println!("Stop requested");
            Ok(())
        }
        SyncAction::Push => {
            let coordinator = ctx.coordinator()?;
            let outcome = coordinator.push().await?;
            if let CommitOutcome::Committed(commit) = &outcome.commit {
                println!("Committed {} change(s) as {}", commit.changed_paths, commit.id);
            }
            if outcome.report.reused {
                println!(
                    "Remote already had this content; version {}",
                    outcome.version.version_id
                );
            } else {
                println!(
                    "Pushed {} file(s), {} byte(s) as version {}",
                    outcome.report.files_transferred,
                    outcome.report.bytes_transferred,
                    outcome.version.version_id
                );
            }
            if !outcome.excluded.is_empty() {
                println!("Held back by sync rules: {}", outcome.excluded.join(", "));
            }
            Ok(())
        }
        SyncAction::Pull { force } => {
            let coordinator = ctx.coordinator()?;
            let outcome = coordinator
                .pull(PullOptions {
                    overwrite_uncommitted: force,
                })
                .await?;
            report_pull(outcome)
        }
        SyncAction::Status => {
            let config = ctx.config()?;
            println!("Watcher:  {}", watcher::read_activity(&ctx.layout));
            println!("Auto-push: {}", config.auto_push);
            match vaultsync_core::sync::backend::backend_from_config(&config.provider) {
                Ok(backend) => {
                    let reachable = if backend.test() { "reachable" } else { "unreachable" };
                    println!("Storage:  {} ({})", backend.info(), reachable);
                }
                Err(e) => println!("Storage:  {}", e),
            }
            println!(
                "Relay:    {}",
                config.relay_url.as_deref().unwrap_or("not configured")
            );
            Ok(())
        }
    }
}

fn start_watcher(ctx: &Context) -> Result<()> {
    ctx.config()?;
    if let WatcherActivity::Running { pid, .. } = watcher::read_activity(&ctx.layout) {
        println!("Watcher already running (pid {})", pid);
        return Ok(());
    }
    let exe = std::env::current_exe()?;
    let daemon = exe
        .parent()
        .map(|dir| dir.join(platform::get_binary_name("vaultsync-daemon")))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(platform::get_binary_name("vaultsync-daemon")));

    let child = std::process::Command::new(&daemon)
        .arg("--root")
        .arg(ctx.layout.root())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .with_context(|| format!("starting {}", daemon.display()))?;
    println!("Watcher started (pid {})", child.id());
    Ok(())
}

fn report_pull(outcome: PullOutcome) -> Result<()> {
    match outcome {
        PullOutcome::NothingToPull => {
            println!("Nothing to pull: the profile has no pushed version yet");
            Ok(())
        }
        PullOutcome::Conflicts { version, paths } => {
            println!(
                "Version {} would overwrite uncommitted changes in:",
                version.version_id
            );
            for path in &paths {
                println!("  {}", path);
            }
            bail!(
                "pull stopped; review with `vaultsync diff`, commit or rerun with --force"
            )
        }
        PullOutcome::Applied {
            version,
            overwritten,
            unchanged,
            kept_local,
            commit,
        } => {
            println!(
                "Applied version {} from {}: {} updated, {} unchanged, {} machine-local kept",
                version.version_id,
                version.profile,
                overwritten.len(),
                unchanged,
                kept_local
            );
            if let CommitOutcome::Committed(commit) = commit {
                println!("Recorded as commit {} (undo with `vaultsync rollback`)", commit.id);
            }
            Ok(())
        }
    }
}

pub fn log(ctx: &Context, limit: Option<usize>) -> Result<()> {
    let config = ctx.config()?;
    let commits = ctx.tracker(&config)?.log(limit)?;
    if commits.is_empty() {
        println!("No commits");
    }
    for commit in commits {
        println!(
            "{}{} {} {} ({}) {} path(s)",
            if commit.is_head { "* " } else { "  " },
            commit.id,
            format_time(Some(commit.created_at)),
            commit.hostname,
            commit.origin,
            commit.changed_paths
        );
    }
    Ok(())
}

pub fn diff(ctx: &Context) -> Result<()> {
    let config = ctx.config()?;
    let changes = ctx.tracker(&config)?.diff()?;
    if changes.is_empty() {
        println!("No uncommitted changes");
    }
    for change in changes {
        let marker = match change.kind {
            ChangeKind::Added => "A",
            ChangeKind::Modified => "M",
            ChangeKind::Deleted => "D",
        };
        println!("{} {}", marker, change.path);
    }
    Ok(())
}

pub fn rollback(ctx: &Context, yes: bool) -> Result<()> {
    let config = ctx.config()?;
    let tracker = ctx.tracker(&config)?;
    let pending = tracker.diff()?.len();
    let prompt = format!(
        "Restore the previous commit? {} uncommitted change(s) will be lost.",
        pending
    );
    if !confirm(&prompt, yes)? {
        println!("Aborted");
        return Ok(());
    }
    let outcome = tracker.rollback(true)?;
    println!(
        "Rolled back {} -> {}: {} restored, {} removed",
        outcome.from, outcome.to, outcome.restored, outcome.removed
    );
    Ok(())
}

pub async fn key(ctx: &Context, action: KeyAction) -> Result<()> {
    let config = ctx.config()?;
    let keys = ctx.keys(&config);
    match action {
        KeyAction::Show => println!("{}", keys.public_key_line()?),
        KeyAction::Fingerprint => println!("{}", keys.fingerprint()?),
        KeyAction::Rotate { yes } => {
            if !confirm(
                "Rotate the vault key? Every relay registration must be redone.",
                yes,
            )? {
                println!("Aborted");
                return Ok(());
            }
            let outcome = keys.rotate(true)?;
            println!(
                "Rotated {} -> {}",
                outcome.previous_fingerprint, outcome.new_fingerprint
            );
            println!("Archived to {}", outcome.archived_private.display());
            if outcome.reregistration_required {
                println!("Re-register this machine: `vaultsync key register --token <session token>`");
            }
        }
        KeyAction::Verify => {
            let health = keys.verify_self()?;
            if let Some(fp) = &health.fingerprint {
                println!("Fingerprint: {}", fp);
            }
            println!(
                "Keypair:     {}",
                if health.consistent { "consistent" } else { "MISMATCH" }
            );
            for issue in &health.issues {
                println!("  issue: {}", issue);
            }
            if !health.is_healthy() {
                bail!("vault key has {} issue(s)", health.issues.len());
            }
        }
        KeyAction::Sign { payload } => {
            let signature = Signer::sign(&keys, payload.as_bytes())?;
            println!("{}", STANDARD.encode(signature));
        }
        KeyAction::Register { token } => {
            let client = ctx.client(&config)?;
            let key = client
                .register_self(&config.hostname, Some(config.instance_id), token.as_deref())
                .await?;
            println!("Registered {} for {}", key.fingerprint, key.hostname);
        }
        KeyAction::Revoke { fingerprint } => {
            let client = ctx.client(&config)?;
            let key = client.revoke_key(&fingerprint).await?;
            println!("Revoked {} ({})", key.fingerprint, key.hostname);
        }
    }
    Ok(())
}

pub async fn profile(ctx: &Context, action: ProfileAction) -> Result<()> {
    match action {
        ProfileAction::Show => {
            let config = ctx.config()?;
            println!("Profile:  {}", config.profile);
            println!("Hostname: {}", config.hostname);
            println!("Instance: {}", config.instance_id);
            if !config.local_only.is_empty() {
                println!("Local-only: {}", config.local_only.join(", "));
            }
        }
        ProfileAction::List => {
            let config = ctx.config()?;
            let profiles = ctx.client(&config)?.list_profiles().await?;
            if profiles.is_empty() {
                println!("No profiles on the relay yet");
            }
            for p in profiles {
                println!(
                    "{}{:<24} {:>4} version(s)  last {}  {} excluded",
                    if p.profile == config.profile { "* " } else { "  " },
                    p.profile,
                    p.version_count,
                    format_time(p.latest_at),
                    p.excluded_count
                );
            }
        }
        ProfileAction::Rename { name } => {
            let mut config = ctx.config()?;
            let previous = std::mem::replace(&mut config.profile, name);
            config.save(&ctx.layout)?;
            println!("Renamed profile {} -> {}", previous, config.profile);
            println!("Versions pushed as {} stay under that name", previous);
        }
        ProfileAction::Pull { name, force } => {
            let coordinator = ctx.coordinator()?;
            let outcome = coordinator
                .restore_profile(
                    &name,
                    PullOptions {
                        overwrite_uncommitted: force,
                    },
                )
                .await?;
            report_pull(outcome)?;
        }
    }
    Ok(())
}

pub async fn rules(ctx: &Context, action: RulesAction) -> Result<()> {
    let config = ctx.config()?;
    let client = ctx.client(&config)?;
    match action {
        RulesAction::Show { profile } => {
            let profile = profile.unwrap_or_else(|| config.profile.clone());
            vaultsync_core::config::validate_profile_name(&profile)
                .map_err(VaultSyncError::from)?;
            let excluded = client.get_sync_rules(&profile).await?;
            if excluded.is_empty() {
                println!("No paths excluded for {}", profile);
            }
            for path in excluded {
                println!("{}", path);
            }
        }
        RulesAction::Set { paths } => {
            let resp = client.put_sync_rules(&config.profile, &paths).await?;
            println!("{} path(s) excluded for {}", resp.excluded_count, config.profile);
        }
        RulesAction::Clear => {
            client.put_sync_rules(&config.profile, &[]).await?;
            println!("Cleared exclusions for {}", config.profile);
        }
    }
    Ok(())
}

pub async fn session(ctx: &Context, action: SessionAction) -> Result<()> {
    let config = ctx.config()?;
    match action {
        SessionAction::Issue => {
            let session = ctx.client(&config)?.issue_session().await?;
            println!("{}", session.token);
            eprintln!("expires {}", format_time(Some(session.expires_at)));
        }
    }
    Ok(())
}
