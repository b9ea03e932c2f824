//! Provisioning steps: everything that must be on disk before the game starts.
//!
//! All synchronizers share one rule for a single file ([`ensure_artifact`]):
//! a file that exists and matches its digest is left alone, anything else is
//! fetched again over whatever is there. A failed fetch is logged and counted but
//! never aborts the step; only cancellation does.

pub mod build;
pub mod dependency;
pub mod libraries;
pub mod reconcile;
pub mod state_machine;

pub use build::{BuildOutcome, BuildSource, BuildSyncError, BuildSynchronizer};
pub use dependency::{CommandInstaller, DependencyInstaller, DependencySpec, InstallError, PayloadInstaller};
pub use libraries::{LibrarySync, LibrarySynchronizer};
pub use reconcile::{reconcile, ReconcileReport};
pub use state_machine::{InstallMachine, InstallState};

use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::fetch::{ArtifactSource, FetchError, FetchTarget};
use crate::integrity::{self, ExpectedDigest};
use crate::task::Reporter;

/// One file governed by a manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// `None` means presence alone is enough.
    pub digest: Option<ExpectedDigest>,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    /// Already on disk and valid.
    Valid,
    Fetched,
    Failed,
}

/// Per-step tally of artifact outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub valid: usize,
    pub fetched: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn record(&mut self, status: ArtifactStatus) {
        match status {
            ArtifactStatus::Valid => self.valid += 1,
            ArtifactStatus::Fetched => self.fetched += 1,
            ArtifactStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.valid + self.fetched + self.failed
    }
}

/// Digest check off the async threads; hashing large jars is CPU-bound.
pub async fn verify_file(path: PathBuf, digest: Option<ExpectedDigest>) -> bool {
    tokio::task::spawn_blocking(move || integrity::verify(&path, digest.as_ref()))
        .await
        .unwrap_or(false)
}

/// Make sure `artifact` is on disk and valid.
///
/// Errors only on cancellation. Any other fetch failure completes the sub-task
/// at 1.0 and yields [`ArtifactStatus::Failed`].
pub async fn ensure_artifact(
    source: &dyn ArtifactSource,
    artifact: &Artifact,
    reporter: &Reporter,
    cancel: &CancellationToken,
) -> Result<ArtifactStatus, FetchError> {
    if verify_file(artifact.path.clone(), artifact.digest.clone()).await {
        tracing::debug!("Up to date: {}", artifact.path.display());
        return Ok(ArtifactStatus::Valid);
    }

    let name = artifact
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| artifact.url.clone());
    let task = reporter.create(&format!("Downloading {}", name), &artifact.url);
    let progress = |fraction: f32| reporter.update(task, fraction);

    let result = source
        .fetch(
            &artifact.url,
            FetchTarget::File(artifact.path.clone()),
            &progress,
            cancel,
        )
        .await;

    match result {
        Ok(_) => {
            reporter.finish(task);
            if artifact.digest.is_some()
                && !verify_file(artifact.path.clone(), artifact.digest.clone()).await
            {
                tracing::warn!(
                    "{} fetched but does not match its digest",
                    artifact.path.display()
                );
                return Ok(ArtifactStatus::Failed);
            }
            Ok(ArtifactStatus::Fetched)
        }
        Err(e @ FetchError::Cancelled { .. }) => {
            reporter.finish(task);
            Err(e)
        }
        Err(e) => {
            tracing::warn!("Failed to fetch {}: {}", artifact.path.display(), e);
            reporter.finish(task);
            Ok(ArtifactStatus::Failed)
        }
    }
}
