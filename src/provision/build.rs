//! Build synchronizer - mod-pack files and archive overrides.
//!
//! Two input shapes:
//! - a resolved [`BuildManifest`]: declared client files are checked and fetched
//! - a pack archive: every entry is read into memory first, the manifest entry is
//!   located by exact name, then the declared files are fetched and every other
//!   entry is written into the game directory with its `overrides/` prefix removed.
//!
//! Buffering the whole archive makes the result independent of where the manifest
//! entry sits in the archive.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{ensure_artifact, Artifact, ArtifactStatus, SyncReport};
use crate::fetch::{ArtifactSource, FetchError};
use crate::manifest::{BuildManifest, BUILD_MANIFEST_ENTRY};
use crate::task::Reporter;

const OVERRIDE_PREFIXES: [&str; 2] = ["overrides", "override"];

#[derive(thiserror::Error, Debug)]
pub enum BuildSyncError {
    #[error("failed to read archive '{}': {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("archive '{}' has no {} entry", path.display(), BUILD_MANIFEST_ENTRY)]
    MissingManifest { path: PathBuf },

    #[error("invalid build manifest in '{}': {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive reader task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

pub enum BuildSource {
    Manifest(BuildManifest),
    Archive(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub manifest: BuildManifest,
    /// Override files written, relative to the game directory.
    pub overrides: Vec<PathBuf>,
    pub report: SyncReport,
}

// ─── Archive reading ─────────────────────────────────────────

#[derive(Debug)]
enum ArchiveEntry {
    Dir(PathBuf),
    File(PathBuf, Vec<u8>),
}

#[derive(Debug)]
struct ArchiveContents {
    manifest: BuildManifest,
    entries: Vec<ArchiveEntry>,
}

/// Remove a leading `overrides`/`override` component.
pub fn strip_override_prefix(path: &Path) -> &Path {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first))
            if OVERRIDE_PREFIXES.iter().any(|p| *first == **p) =>
        {
            components.as_path()
        }
        _ => path,
    }
}

/// A relative path that cannot escape its base.
pub fn confined(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    let ok = !path.as_os_str().is_empty()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    ok.then(|| path.to_path_buf())
}

/// Declared sizes come from the archive header; never preallocate more than this.
const MAX_PREALLOC: u64 = 1 << 20;

fn capacity_hint(declared: u64) -> usize {
    declared.min(MAX_PREALLOC) as usize
}

fn read_archive(path: &Path) -> Result<ArchiveContents, BuildSyncError> {
    let zip_err = |source| BuildSyncError::Archive {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(path).map_err(|source| BuildSyncError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(zip_err)?;

    let mut manifest_bytes = None;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_err)?;

        if entry.name() == BUILD_MANIFEST_ENTRY {
            let mut buf = Vec::with_capacity(capacity_hint(entry.size()));
            entry
                .read_to_end(&mut buf)
                .map_err(|source| BuildSyncError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            manifest_bytes = Some(buf);
            continue;
        }

        let Some(name) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!("Skipping unsafe archive entry '{}'", entry.name());
            continue;
        };
        let relative = strip_override_prefix(&name).to_path_buf();
        if relative.as_os_str().is_empty() {
            continue;
        }

        if entry.is_dir() {
            entries.push(ArchiveEntry::Dir(relative));
        } else {
            let mut buf = Vec::with_capacity(capacity_hint(entry.size()));
            entry
                .read_to_end(&mut buf)
                .map_err(|source| BuildSyncError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            entries.push(ArchiveEntry::File(relative, buf));
        }
    }

    let bytes = manifest_bytes.ok_or_else(|| BuildSyncError::MissingManifest {
        path: path.to_path_buf(),
    })?;
    let manifest = serde_json::from_slice(&bytes).map_err(|source| BuildSyncError::Manifest {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ArchiveContents { manifest, entries })
}

// ─── Synchronizer ────────────────────────────────────────────

pub struct BuildSynchronizer {
    source: Arc<dyn ArtifactSource>,
    game_dir: PathBuf,
}

impl BuildSynchronizer {
    pub fn new(source: Arc<dyn ArtifactSource>, game_dir: &Path) -> Self {
        Self {
            source,
            game_dir: game_dir.to_path_buf(),
        }
    }

    pub async fn sync(
        &self,
        build: BuildSource,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome, BuildSyncError> {
        let (manifest, entries) = match build {
            BuildSource::Manifest(manifest) => (manifest, Vec::new()),
            BuildSource::Archive(path) => {
                tracing::info!("Reading build archive {}", path.display());
                let contents = tokio::task::spawn_blocking(move || read_archive(&path)).await??;
                (contents.manifest, contents.entries)
            }
        };
        tracing::info!(
            "Build {} {} ({} files)",
            manifest.name,
            manifest.version_id,
            manifest.files.len()
        );

        let report = self.sync_files(&manifest, reporter, cancel).await?;
        let overrides = self.write_overrides(entries).await?;

        Ok(BuildOutcome {
            manifest,
            overrides,
            report,
        })
    }

    async fn sync_files(
        &self,
        manifest: &BuildManifest,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, FetchError> {
        let mut report = SyncReport::default();
        let files: Vec<_> = manifest.client_files().collect();
        let task = reporter.create("Mods", &manifest.version_id);

        for (i, file) in files.iter().enumerate() {
            let (Some(relative), Some(url)) = (confined(&file.path), file.primary_url()) else {
                tracing::warn!("Skipping build file '{}': bad path or no download URL", file.path);
                report.record(ArtifactStatus::Failed);
                continue;
            };
            let artifact = Artifact {
                path: self.game_dir.join(relative),
                digest: file.expected_digest(),
                url: url.to_string(),
            };
            let status = ensure_artifact(self.source.as_ref(), &artifact, reporter, cancel).await?;
            report.record(status);
            if i + 1 < files.len() {
                reporter.update(task, (i + 1) as f32 / files.len() as f32);
            }
        }
        reporter.finish(task);

        tracing::info!(
            "Build files synced: {} valid, {} fetched, {} failed",
            report.valid,
            report.fetched,
            report.failed
        );
        Ok(report)
    }

    async fn write_overrides(&self, entries: Vec<ArchiveEntry>) -> Result<Vec<PathBuf>, BuildSyncError> {
        let io_err = |path: &Path, source| BuildSyncError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut written = Vec::new();
        for entry in entries {
            match entry {
                ArchiveEntry::Dir(relative) => {
                    let dest = self.game_dir.join(&relative);
                    tokio::fs::create_dir_all(&dest)
                        .await
                        .map_err(|e| io_err(&dest, e))?;
                }
                ArchiveEntry::File(relative, bytes) => {
                    let dest = self.game_dir.join(&relative);
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| io_err(parent, e))?;
                    }
                    tokio::fs::write(&dest, bytes)
                        .await
                        .map_err(|e| io_err(&dest, e))?;
                    written.push(relative);
                }
            }
        }
        if !written.is_empty() {
            tracing::info!("Wrote {} override files", written.len());
        }
        Ok(written)
    }
}
