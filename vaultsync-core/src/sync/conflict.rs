//! Last-write-wins overwrite planning for pulls.

use crate::history::TreeScan;
use crate::layout::MachineLocal;
use crate::sync::backend::ReceivedSet;

/// What a pull does with one incoming path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Replace (or create) the local file with the incoming one.
    Overwrite,
    /// Local content already matches.
    Unchanged,
    /// Path is machine-local here; never touched by a pull.
    KeepMachineLocal,
    /// Local file has uncommitted changes that the incoming file would destroy.
    Conflict,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve one incoming path.
    ///
    /// Incoming content always wins, except that machine-local paths are
    /// skipped and an uncommitted local edit is reported as a conflict
    /// instead of being overwritten silently.
    pub fn resolve(
        incoming_hash: &str,
        local_hash: Option<&str>,
        uncommitted: bool,
        machine_local: bool,
    ) -> Resolution {
        if machine_local {
            Resolution::KeepMachineLocal
        } else if local_hash == Some(incoming_hash) {
            Resolution::Unchanged
        } else if uncommitted {
            Resolution::Conflict
        } else {
            Resolution::Overwrite
        }
    }
}

/// Per-path decisions for applying a received snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverwritePlan {
    pub overwrite: Vec<String>,
    pub unchanged: Vec<String>,
    pub kept_local: Vec<String>,
    pub conflicts: Vec<String>,
}

impl OverwritePlan {
    /// Plan a pull against the current working tree. `scan` must be relative to head.
    pub fn build(received: &ReceivedSet, scan: &TreeScan, machine_local: &MachineLocal) -> Self {
        let uncommitted = scan.changed_paths();
        let mut plan = Self::default();
        for file in &received.files {
            let local_hash = scan.files.get(&file.path).map(|f| f.hash.as_str());
            let resolution = ConflictResolver::resolve(
                &file.hash,
                local_hash,
                uncommitted.contains(file.path.as_str()),
                machine_local.contains(&file.path),
            );
            let bucket = match resolution {
                Resolution::Overwrite => &mut plan.overwrite,
                Resolution::Unchanged => &mut plan.unchanged,
                Resolution::KeepMachineLocal => &mut plan.kept_local,
                Resolution::Conflict => &mut plan.conflicts,
            };
            bucket.push(file.path.clone());
        }
        plan
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Fold conflicts into the overwrite list, discarding the local edits.
    pub fn force(mut self) -> Self {
        self.overwrite.append(&mut self.conflicts);
        self.overwrite.sort();
        self
    }
}
