//! Per-profile exclusion rules: validation shared by client and relay, and
//! the best-effort fetch performed before every push.

use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::sync::client::VaultClient;
use crate::ValidationError;

pub const MAX_PATH_LEN: usize = 1024;
pub const DEFAULT_MAX_RULES: usize = 10_000;

/// Validate and normalize one vault-relative path.
///
/// Backslashes become `/`, `.` segments and repeated or trailing slashes are
/// dropped. Empty, absolute, NUL-containing and `..` paths are rejected.
pub fn validate_path(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    if trimmed.len() > MAX_PATH_LEN {
        return Err(ValidationError::PathTooLong {
            path: truncate_for_display(trimmed),
            max: MAX_PATH_LEN,
        });
    }
    let invalid = |reason: &str| ValidationError::InvalidPath {
        path: trimmed.to_string(),
        reason: reason.to_string(),
    };
    if trimmed.contains('\0') {
        return Err(invalid("contains NUL"));
    }

    let unified = trimmed.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(invalid("must be relative to the vault root"));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(invalid("must not contain '..'")),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    Ok(segments.join("/"))
}

/// Validate a full exclusion set: every path valid, deduplicated, bounded count.
///
/// Any invalid path rejects the whole set.
pub fn validate_exclusions<I, S>(paths: I, max_rules: usize) -> Result<BTreeSet<String>, ValidationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = BTreeSet::new();
    for path in paths {
        set.insert(validate_path(path.as_ref())?);
        if set.len() > max_rules {
            return Err(ValidationError::TooManyPaths {
                count: set.len(),
                max: max_rules,
            });
        }
    }
    Ok(set)
}

/// Fetch the profile's exclusions, treating any failure as "no exclusions".
///
/// Sync is never blocked on the rules service; during an outage an excluded
/// file may be transferred once.
pub async fn fetch_exclusions_best_effort(client: &VaultClient, profile: &str) -> BTreeSet<String> {
    let fetched = match client.get_sync_rules(profile).await {
        Ok(paths) => paths,
        Err(e) => {
            warn!(%profile, error = %e, "Could not fetch sync rules, continuing without exclusions");
            return BTreeSet::new();
        }
    };

    let mut set = BTreeSet::new();
    for path in fetched {
        match validate_path(&path) {
            Ok(normalized) => {
                set.insert(normalized);
            }
            Err(e) => warn!(%profile, error = %e, "Ignoring invalid exclusion from relay"),
        }
    }
    debug!(%profile, count = set.len(), "Fetched sync rules");
    set
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn truncate_for_display(path: &str) -> String {
    path.chars().take(64).chain("...".chars()).collect()
}
