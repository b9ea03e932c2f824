//! Concrete launch steps wired from [`LauncherConfig`].
//!
//! | step          | does                                                    |
//! |---------------|---------------------------------------------------------|
//! | `runtime`     | installs the Java runtime if its binary is missing      |
//! | `libraries`   | libraries, client jar, assets; records the classpath    |
//! | `build`       | mod-pack files and archive overrides                    |
//! | `reconcile`   | deletes undeclared files from the managed directories   |
//! | `loader-setup`| optional setup command (only when configured)           |
//! | `game`        | the game process itself                                 |

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{LaunchPipeline, LaunchState, LaunchStep, StepContext};
use crate::config::{BuildSourceConfig, CommandConfig, LauncherConfig, Settings};
use crate::fetch::{ArtifactSource, FetchError, FetchTarget};
use crate::manifest::{self, VersionManifest};
use crate::provision::{
    self, BuildSource, BuildSynchronizer, CommandInstaller, DependencyInstaller, DependencySpec,
    LibrarySynchronizer, PayloadInstaller,
};
use crate::supervisor::{self, CommandSpec, ExitState};
use crate::utils::expand;

/// Cached copy of a downloaded pack archive, relative to the game directory.
const ARCHIVE_CACHE: &str = "build.mrpack";

// ─── Runtime ─────────────────────────────────────────────────

pub struct RuntimeStep {
    installer: DependencyInstaller,
}

impl RuntimeStep {
    pub fn new(installer: DependencyInstaller) -> Self {
        Self { installer }
    }
}

#[async_trait]
impl LaunchStep for RuntimeStep {
    fn name(&self) -> &str {
        "runtime"
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        self.installer.ensure(&ctx.reporter, &ctx.cancel).await?;
        Ok(())
    }
}

// ─── Libraries ───────────────────────────────────────────────

pub struct LibrariesStep {
    sync: LibrarySynchronizer,
    manifest_path: PathBuf,
}

impl LibrariesStep {
    pub fn new(sync: LibrarySynchronizer, manifest_path: PathBuf) -> Self {
        Self {
            sync,
            manifest_path,
        }
    }
}

#[async_trait]
impl LaunchStep for LibrariesStep {
    fn name(&self) -> &str {
        "libraries"
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let manifest: VersionManifest = manifest::load_json(&self.manifest_path)?;
        let result = self.sync.sync(&manifest, &ctx.reporter, &ctx.cancel).await?;

        let mut state = ctx.state.lock().await;
        state.version_id = Some(manifest.id.clone());
        state.classpath = result.classpath;
        if result.report.failed > 0 {
            anyhow::bail!("{} library artifacts could not be fetched", result.report.failed);
        }
        Ok(())
    }
}

// ─── Build ───────────────────────────────────────────────────

pub struct BuildStep {
    sync: BuildSynchronizer,
    source: Arc<dyn ArtifactSource>,
    build: BuildSourceConfig,
    game_dir: PathBuf,
}

impl BuildStep {
    /// `build` paths must already be resolved against `game_dir`.
    pub fn new(source: Arc<dyn ArtifactSource>, build: BuildSourceConfig, game_dir: &Path) -> Self {
        Self {
            sync: BuildSynchronizer::new(source.clone(), game_dir),
            source,
            build,
            game_dir: game_dir.to_path_buf(),
        }
    }

    async fn resolve_source(&self, ctx: &StepContext) -> Result<BuildSource> {
        if let Some(url) = &self.build.archive_url {
            let dest = self.game_dir.join(ARCHIVE_CACHE);
            let task = ctx.reporter.create("Downloading build", url);
            let progress = |fraction: f32| ctx.reporter.update(task, fraction);
            let fetched = self
                .source
                .fetch(url, FetchTarget::File(dest.clone()), &progress, &ctx.cancel)
                .await;
            ctx.reporter.finish(task);
            return match fetched {
                Ok(_) => Ok(BuildSource::Archive(dest)),
                Err(e @ FetchError::Cancelled { .. }) => Err(e.into()),
                Err(e) if dest.exists() => {
                    tracing::warn!("Build download failed ({}), using cached {}", e, dest.display());
                    Ok(BuildSource::Archive(dest))
                }
                Err(e) => Err(e).context("Build archive unavailable"),
            };
        }
        if let Some(path) = &self.build.archive_path {
            return Ok(BuildSource::Archive(path.clone()));
        }
        if let Some(path) = &self.build.manifest_path {
            return Ok(BuildSource::Manifest(manifest::load_json(path)?));
        }
        anyhow::bail!("No build source configured")
    }
}

#[async_trait]
impl LaunchStep for BuildStep {
    fn name(&self) -> &str {
        "build"
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let source = self.resolve_source(ctx).await?;
        let outcome = self.sync.sync(source, &ctx.reporter, &ctx.cancel).await?;
        let failed = outcome.report.failed;
        ctx.state.lock().await.build = Some(outcome);
        if failed > 0 {
            anyhow::bail!("{} build files could not be fetched", failed);
        }
        Ok(())
    }
}

// ─── Reconcile ───────────────────────────────────────────────

pub struct ReconcileStep {
    game_dir: PathBuf,
    managed_dirs: Vec<String>,
}

impl ReconcileStep {
    pub fn new(game_dir: &Path, managed_dirs: Vec<String>) -> Self {
        Self {
            game_dir: game_dir.to_path_buf(),
            managed_dirs,
        }
    }
}

#[async_trait]
impl LaunchStep for ReconcileStep {
    fn name(&self) -> &str {
        "reconcile"
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let (manifest, overrides) = {
            let state = ctx.state.lock().await;
            match &state.build {
                Some(build) => (build.manifest.clone(), build.overrides.clone()),
                // without a manifest every managed file would look unauthorized
                None => anyhow::bail!("No build manifest resolved, refusing to reconcile"),
            }
        };

        let task = ctx.reporter.create("Cleaning up", &self.managed_dirs.join(", "));
        let game_dir = self.game_dir.clone();
        let managed_dirs = self.managed_dirs.clone();
        let report = tokio::task::spawn_blocking(move || {
            provision::reconcile(&game_dir, &managed_dirs, &manifest, &overrides)
        })
        .await?;
        ctx.reporter.finish(task);

        let failed = report.failed.len();
        ctx.state.lock().await.reconcile = Some(report);
        if failed > 0 {
            anyhow::bail!("{} unauthorized files could not be deleted", failed);
        }
        Ok(())
    }
}

// ─── External commands ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Setup,
    Game,
}

pub struct CommandStep {
    name: String,
    title: String,
    kind: CommandKind,
    command: CommandConfig,
    game_dir: PathBuf,
    settings: Settings,
}

impl CommandStep {
    pub fn setup(command: CommandConfig, game_dir: &Path, settings: &Settings) -> Self {
        Self::new("loader-setup", "Setting up loader", CommandKind::Setup, command, game_dir, settings)
    }

    pub fn game(command: CommandConfig, game_dir: &Path, settings: &Settings) -> Self {
        Self::new("game", "Starting game", CommandKind::Game, command, game_dir, settings)
    }

    fn new(
        name: &str,
        title: &str,
        kind: CommandKind,
        command: CommandConfig,
        game_dir: &Path,
        settings: &Settings,
    ) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            kind,
            command,
            game_dir: game_dir.to_path_buf(),
            settings: settings.clone(),
        }
    }

    /// Bare program names are looked up on `PATH`; anything with a directory
    /// part is relative to the game directory.
    fn program(&self) -> PathBuf {
        let program = &self.command.program;
        if program.components().count() > 1 {
            crate::utils::resolve_under(&self.game_dir, program)
        } else {
            program.clone()
        }
    }

    pub fn command_spec(&self, state: &LaunchState) -> CommandSpec {
        let vars = template_vars(&self.settings, &self.game_dir, state);
        let working_dir = self
            .command
            .working_dir
            .as_deref()
            .map(|dir| crate::utils::resolve_under(&self.game_dir, dir))
            .unwrap_or_else(|| self.game_dir.clone());
        CommandSpec::new(self.program(), working_dir)
            .args(self.command.args.iter().map(|arg| expand(arg, &vars)))
    }
}

#[async_trait]
impl LaunchStep for CommandStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let spec = {
            let state = ctx.state.lock().await;
            self.command_spec(&state)
        };
        tracing::info!("Running {}: {:?} {:?}", self.name, spec.program, spec.args);
        let outcome = supervisor::run(&spec, &ctx.reporter, &self.title, &ctx.cancel).await;
        let exit = outcome.exit.clone();

        let mut state = ctx.state.lock().await;
        match self.kind {
            CommandKind::Setup => state.setup = Some(outcome),
            CommandKind::Game => state.game = Some(outcome),
        }
        match exit {
            ExitState::Exited { code: 0 } => Ok(()),
            other => anyhow::bail!("{} ended with {:?}", self.name, other),
        }
    }
}

// ─── Templating ──────────────────────────────────────────────

fn template_vars(settings: &Settings, game_dir: &Path, state: &LaunchState) -> HashMap<&'static str, String> {
    let classpath = state
        .classpath
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(crate::utils::path_list_separator());
    let build_version = state
        .build
        .as_ref()
        .map(|b| b.manifest.version_id.clone())
        .unwrap_or_else(|| settings.build_version.clone());

    HashMap::from([
        ("nickname", settings.nick_name.clone()),
        ("game_dir", game_dir.display().to_string()),
        ("classpath", classpath),
        ("version", state.version_id.clone().unwrap_or_default()),
        ("build_version", build_version),
    ])
}

// ─── Assembly ────────────────────────────────────────────────

/// The fixed steps plus the game launch, in launch order.
pub fn standard_pipeline(
    config: &LauncherConfig,
    settings: &Settings,
    source: Arc<dyn ArtifactSource>,
    installer: Arc<dyn PayloadInstaller>,
) -> LaunchPipeline {
    let game_dir = &config.game_dir;
    let build = BuildSourceConfig {
        archive_url: config.build.archive_url.clone(),
        archive_path: config.build.archive_path.as_deref().map(|p| config.resolve(p)),
        manifest_path: config.build.manifest_path.as_deref().map(|p| config.resolve(p)),
    };

    let mut pipeline = LaunchPipeline::new();
    pipeline
        .add_step(RuntimeStep::new(DependencyInstaller::new(
            DependencySpec::runtime(config),
            source.clone(),
            installer,
        )))
        .add_step(LibrariesStep::new(
            LibrarySynchronizer::new(source.clone(), game_dir, &config.asset_base_url),
            config.resolve(&config.version_manifest),
        ))
        .add_step(BuildStep::new(source, build, game_dir))
        .add_step(ReconcileStep::new(game_dir, config.managed_dirs.clone()));
    if let Some(setup) = &config.setup {
        pipeline.add_step(CommandStep::setup(setup.clone(), game_dir, settings));
    }
    pipeline.set_launch(CommandStep::game(config.launch.clone(), game_dir, settings));
    pipeline
}

/// [`standard_pipeline`] with the configured runtime installer command.
pub fn configured_pipeline(
    config: &LauncherConfig,
    settings: &Settings,
    source: Arc<dyn ArtifactSource>,
) -> LaunchPipeline {
    let installer = Arc::new(CommandInstaller::runtime(config));
    standard_pipeline(config, settings, source, installer)
}
