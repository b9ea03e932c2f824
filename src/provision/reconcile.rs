//! Folder reconciler - deletes files in managed directories that the build no
//! longer declares.
//!
//! This is destructive and has no undo. A file in a managed directory survives
//! only if its name is authorized: declared by a client-side manifest entry under
//! that directory, or written as an archive override. Only regular files directly
//! inside a managed directory are ever removed; nested directories, symlinks and
//! everything outside the managed directories are left alone.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::manifest::BuildManifest;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub kept: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    /// Unauthorized files that could not be removed.
    pub failed: Vec<PathBuf>,
}

fn first_and_last(path: &Path) -> Option<(OsString, OsString)> {
    let mut normal = path.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part),
        _ => None,
    });
    let first = normal.next()?;
    let last = normal.last()?;
    Some((first.to_os_string(), last.to_os_string()))
}

/// Authorized file names per managed directory.
pub fn authorized_names<'a>(
    managed_dirs: &[String],
    declared: impl IntoIterator<Item = &'a Path>,
) -> HashMap<String, HashSet<OsString>> {
    let mut sets: HashMap<String, HashSet<OsString>> = managed_dirs
        .iter()
        .map(|dir| (dir.clone(), HashSet::new()))
        .collect();
    for path in declared {
        let Some((first, last)) = first_and_last(path) else {
            continue;
        };
        if let Some(set) = first.to_str().and_then(|dir| sets.get_mut(dir)) {
            set.insert(last);
        }
    }
    sets
}

/// Reconcile every managed directory under `game_dir`.
pub fn reconcile(
    game_dir: &Path,
    managed_dirs: &[String],
    manifest: &BuildManifest,
    exempt: &[PathBuf],
) -> ReconcileReport {
    let declared = manifest
        .client_files()
        .map(|f| Path::new(f.path.as_str()))
        .chain(exempt.iter().map(PathBuf::as_path));
    let authorized = authorized_names(managed_dirs, declared);

    let mut report = ReconcileReport::default();
    for dir in managed_dirs {
        let allowed = authorized.get(dir).cloned().unwrap_or_default();
        reconcile_dir(&game_dir.join(dir), &allowed, &mut report);
    }

    tracing::info!(
        "Reconciled {:?}: {} kept, {} deleted, {} failed",
        managed_dirs,
        report.kept.len(),
        report.deleted.len(),
        report.failed.len()
    );
    report
}

fn reconcile_dir(dir: &Path, allowed: &HashSet<OsString>, report: &mut ReconcileReport) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("{} does not exist, nothing to reconcile", dir.display());
            return;
        }
        Err(e) => {
            tracing::warn!("Cannot list {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_file = std::fs::symlink_metadata(&path)
            .map(|m| m.file_type().is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }
        if allowed.contains(&entry.file_name()) {
            report.kept.push(path);
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::warn!("Deleted unauthorized file {}", path.display());
                report.deleted.push(path);
            }
            Err(e) => {
                tracing::error!("Failed to delete {}: {}", path.display(), e);
                report.failed.push(path);
            }
        }
    }
}
