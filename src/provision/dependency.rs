//! Dependency installer - ensures an external dependency (the Java runtime) is
//! installed.
//!
//! ## Flow
//! 1. Target binary already present → done, nothing fetched
//! 2. Fetch the checksum file; its first whitespace-separated token is the digest
//! 3. Fetch the payload and verify it; on mismatch delete it and fetch again
//! 4. Run the installer, then check for the target binary; repeat until it appears
//! 5. Delete payload and checksum file
//!
//! Steps 2-4 retry without backoff, bounded by the configured attempt caps.
//! Exhausting a cap yields [`InstallError::GaveUp`] naming the stage.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::state_machine::{InstallMachine, InstallState, TransitionError};
use super::verify_file;
use crate::config::LauncherConfig;
use crate::fetch::{ArtifactSource, FetchError, FetchTarget};
use crate::integrity::{DigestAlgorithm, ExpectedDigest};
use crate::supervisor::{self, CommandSpec};
use crate::task::{Reporter, TaskId};
use crate::utils::expand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Checksum,
    Payload,
    Install,
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstallStage::Checksum => "checksum download",
            InstallStage::Payload => "payload download/verify",
            InstallStage::Install => "installer",
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InstallError {
    #[error("{name}: {stage} still failing after {attempts} attempts")]
    GaveUp {
        name: String,
        stage: InstallStage,
        attempts: u32,
    },

    #[error("checksum file from {url} contains no digest")]
    ChecksumUnparsable { url: String },

    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("install of {0} was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Where a dependency comes from and how to tell it is installed.
#[derive(Debug, Clone)]
pub struct DependencySpec {
    pub name: String,
    pub payload_url: String,
    pub checksum_url: String,
    pub payload_path: PathBuf,
    pub checksum_path: PathBuf,
    pub target_binary: PathBuf,
    pub algorithm: DigestAlgorithm,
    pub max_download_attempts: u32,
    pub max_install_attempts: u32,
}

impl DependencySpec {
    /// Runtime dependency from the launcher config, paths resolved under the game dir.
    pub fn runtime(config: &LauncherConfig) -> Self {
        let rt = &config.runtime;
        Self {
            name: rt.name.clone(),
            payload_url: rt.payload_url.clone(),
            checksum_url: rt.checksum_url.clone(),
            payload_path: config.resolve(&rt.payload_path),
            checksum_path: config.resolve(&rt.checksum_path),
            target_binary: config.resolve(&rt.target_binary),
            algorithm: rt.algorithm,
            max_download_attempts: config.download_attempts(),
            max_install_attempts: config.install_attempts(),
        }
    }
}

// ─── Installer seam ──────────────────────────────────────────

/// Runs the platform installer on a verified payload.
///
/// Success of the call alone proves nothing; the installer checks for the
/// target binary afterwards.
#[async_trait]
pub trait PayloadInstaller: Send + Sync {
    async fn install(
        &self,
        payload: &Path,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Invokes an external installer through the process supervisor:
/// `<program> <args_before..> <payload> <args..>`.
///
/// `${name}` placeholders in the arguments are filled from `vars`. On Windows the
/// arguments are passed verbatim (msiexec parses `PROP="value"` itself) and the
/// payload path is quoted here.
pub struct CommandInstaller {
    pub program: PathBuf,
    pub args_before: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub vars: HashMap<&'static str, String>,
}

impl CommandInstaller {
    pub fn runtime(config: &LauncherConfig) -> Self {
        let game_dir = crate::utils::absolute(&config.game_dir);
        // <runtime_dir>/bin/<binary>
        let target = crate::utils::resolve_under(&game_dir, &config.runtime.target_binary);
        let runtime_dir = target
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| game_dir.clone());

        Self {
            program: config.runtime.installer.clone(),
            args_before: config.runtime.installer_args_before.clone(),
            args: config.runtime.installer_args.clone(),
            working_dir: game_dir.clone(),
            vars: HashMap::from([
                ("game_dir", game_dir.display().to_string()),
                ("runtime_dir", runtime_dir.display().to_string()),
            ]),
        }
    }

    pub fn command_spec(&self, payload: &Path) -> CommandSpec {
        let verbatim = cfg!(target_os = "windows");
        let payload = if verbatim {
            format!("\"{}\"", payload.display())
        } else {
            payload.display().to_string()
        };
        CommandSpec::new(&self.program, &self.working_dir)
            .args(self.args_before.iter().map(|arg| expand(arg, &self.vars)))
            .args([payload])
            .args(self.args.iter().map(|arg| expand(arg, &self.vars)))
            .verbatim(verbatim)
    }
}

#[async_trait]
impl PayloadInstaller for CommandInstaller {
    async fn install(
        &self,
        payload: &Path,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let spec = self.command_spec(payload);
        tracing::info!("Running installer: {:?} {:?}", spec.program, spec.args);
        let outcome = supervisor::run(&spec, reporter, "Installer", cancel).await;
        match outcome.exit {
            supervisor::ExitState::Exited { code: 0 } => Ok(()),
            other => Err(anyhow::anyhow!("installer ended with {:?}", other)),
        }
    }
}

// ─── Installer ───────────────────────────────────────────────

pub struct DependencyInstaller {
    spec: DependencySpec,
    source: Arc<dyn ArtifactSource>,
    installer: Arc<dyn PayloadInstaller>,
}

impl DependencyInstaller {
    pub fn new(
        spec: DependencySpec,
        source: Arc<dyn ArtifactSource>,
        installer: Arc<dyn PayloadInstaller>,
    ) -> Self {
        Self {
            spec,
            source,
            installer,
        }
    }

    /// Drive the install state machine to `Present`.
    pub async fn ensure(
        &self,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> Result<InstallState, InstallError> {
        let mut machine = InstallMachine::new(&self.spec.name);

        // ── Fast path: already installed ──
        if self.spec.target_binary.exists() {
            tracing::debug!(
                "{} already installed: {}",
                self.spec.name,
                self.spec.target_binary.display()
            );
            machine.transition(InstallState::Present)?;
            return Ok(machine.state);
        }

        tracing::info!("{} missing, installing", self.spec.name);
        let task = reporter.create(&format!("Installing {}", self.spec.name), "");
        let result = self.install(&mut machine, reporter, task, cancel).await;
        reporter.finish(task);

        match result {
            Ok(()) => {
                tracing::info!("{} installed", self.spec.name);
                Ok(machine.state)
            }
            Err(e) => {
                tracing::error!("{} install failed in {:?}: {}", self.spec.name, machine.state, e);
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        machine: &mut InstallMachine,
        reporter: &Reporter,
        task: TaskId,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        machine.transition(InstallState::DownloadingChecksum)?;
        reporter.update_detail(task, 0.0, "Downloading checksum");
        let expected = self.fetch_checksum(cancel).await?;

        self.fetch_verified_payload(machine, reporter, task, &expected, cancel)
            .await?;

        machine.transition(InstallState::Installing)?;
        reporter.update_detail(task, 0.9, "Running installer");
        let attempts = self.spec.max_install_attempts.max(1);
        let mut installed = false;
        for attempt in 1..=attempts {
            self.check_cancelled(cancel)?;
            if attempt > 1 {
                machine.transition(InstallState::Installing)?;
            }
            if let Err(e) = self
                .installer
                .install(&self.spec.payload_path, reporter, cancel)
                .await
            {
                self.check_cancelled(cancel)?;
                tracing::warn!("{} installer attempt {}: {}", self.spec.name, attempt, e);
            }
            if self.spec.target_binary.exists() {
                installed = true;
                break;
            }
            tracing::warn!(
                "{} still missing after installer attempt {}/{}",
                self.spec.target_binary.display(),
                attempt,
                attempts
            );
        }
        if !installed {
            return Err(InstallError::GaveUp {
                name: self.spec.name.clone(),
                stage: InstallStage::Install,
                attempts,
            });
        }

        // ── Cleanup ──
        for leftover in [&self.spec.payload_path, &self.spec.checksum_path] {
            if let Err(e) = tokio::fs::remove_file(leftover).await {
                tracing::debug!("Cleanup of {} skipped: {}", leftover.display(), e);
            }
        }
        machine.transition(InstallState::Present)?;
        Ok(())
    }

    async fn fetch_checksum(&self, cancel: &CancellationToken) -> Result<ExpectedDigest, InstallError> {
        let attempts = self.spec.max_download_attempts.max(1);
        for attempt in 1..=attempts {
            let fetched = self
                .source
                .fetch(
                    &self.spec.checksum_url,
                    FetchTarget::File(self.spec.checksum_path.clone()),
                    &crate::fetch::no_progress,
                    cancel,
                )
                .await;
            match fetched {
                Ok(_) => {
                    let raw = tokio::fs::read_to_string(&self.spec.checksum_path)
                        .await
                        .map_err(|source| InstallError::Io {
                            path: self.spec.checksum_path.clone(),
                            source,
                        })?;
                    return parse_checksum(&raw)
                        .map(|hex| ExpectedDigest::new(self.spec.algorithm, hex))
                        .ok_or_else(|| InstallError::ChecksumUnparsable {
                            url: self.spec.checksum_url.clone(),
                        });
                }
                Err(FetchError::Cancelled { .. }) => {
                    return Err(InstallError::Cancelled(self.spec.name.clone()))
                }
                Err(e) => tracing::warn!(
                    "Checksum fetch attempt {}/{} failed: {}",
                    attempt,
                    attempts,
                    e
                ),
            }
        }
        Err(InstallError::GaveUp {
            name: self.spec.name.clone(),
            stage: InstallStage::Checksum,
            attempts,
        })
    }

    async fn fetch_verified_payload(
        &self,
        machine: &mut InstallMachine,
        reporter: &Reporter,
        task: TaskId,
        expected: &ExpectedDigest,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        let attempts = self.spec.max_download_attempts.max(1);
        let progress = |fraction: f32| reporter.update(task, fraction * 0.8);

        for attempt in 1..=attempts {
            machine.transition(InstallState::DownloadingPayload)?;
            reporter.update_detail(task, 0.0, "Downloading");
            let fetched = self
                .source
                .fetch(
                    &self.spec.payload_url,
                    FetchTarget::File(self.spec.payload_path.clone()),
                    &progress,
                    cancel,
                )
                .await;
            match fetched {
                Ok(_) => {}
                Err(FetchError::Cancelled { .. }) => {
                    return Err(InstallError::Cancelled(self.spec.name.clone()))
                }
                Err(e) => {
                    tracing::warn!("Payload fetch attempt {}/{} failed: {}", attempt, attempts, e);
                    continue;
                }
            }

            machine.transition(InstallState::Verifying)?;
            reporter.update_detail(task, 0.85, "Verifying");
            if verify_file(self.spec.payload_path.clone(), Some(expected.clone())).await {
                return Ok(());
            }
            tracing::warn!(
                "{} digest mismatch (attempt {}/{}), fetching again",
                self.spec.payload_path.display(),
                attempt,
                attempts
            );
            let _ = tokio::fs::remove_file(&self.spec.payload_path).await;
        }
        Err(InstallError::GaveUp {
            name: self.spec.name.clone(),
            stage: InstallStage::Payload,
            attempts,
        })
    }

    fn check_cancelled(&self, cancel: &CancellationToken) -> Result<(), InstallError> {
        if cancel.is_cancelled() {
            Err(InstallError::Cancelled(self.spec.name.clone()))
        } else {
            Ok(())
        }
    }
}

/// First whitespace-delimited token, if it looks like hex.
fn parse_checksum(raw: &str) -> Option<String> {
    raw.split_whitespace()
        .next()
        .filter(|token| token.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_string)
}
