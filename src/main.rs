use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use packlaunch::config::{settings::DEFAULT_SETTINGS_PATH, LauncherConfig, Settings, DEFAULT_CONFIG_PATH};
use packlaunch::fetch::Fetcher;
use packlaunch::pipeline::{steps, StepStatus};
use packlaunch::task::{Reporter, TaskBoard, TaskEvent};

#[derive(Parser, Debug)]
#[command(name = "packlaunch")]
#[command(about = "Provisions the runtime, libraries and mod-pack, then launches the game")]
struct Cli {
    /// Launcher config (TOML)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// User settings (JSON), created if missing
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    /// Player name; saved to the settings file
    #[arg(long)]
    nickname: Option<String>,

    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Provision everything but do not start the game
    #[arg(long, default_value_t = false)]
    skip_launch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
    tracing::info!("packlaunch {} starting", env!("CARGO_PKG_VERSION"));

    let config = LauncherConfig::load(&cli.config)?;
    let mut settings = Settings::load_or_create(&cli.settings)?;
    if let Some(nickname) = cli.nickname {
        settings.nick_name = nickname;
        settings.save(&cli.settings)?;
    }
    if settings.nick_name.is_empty() {
        tracing::warn!("No nickname set; pass --nickname to choose one");
    }

    let board = Arc::new(TaskBoard::new());
    tokio::spawn(log_task_events(board.subscribe()));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let fetcher = Arc::new(Fetcher::new().context("Failed to create HTTP client")?);
    let mut pipeline = steps::configured_pipeline(&config, &settings, fetcher);
    if cli.skip_launch {
        pipeline.clear_launch();
    }

    let report = pipeline.run(Reporter::new(board), cancel).await;

    if let Some(build) = &report.state.build {
        if settings.build_version != build.manifest.version_id {
            settings.build_version = build.manifest.version_id.clone();
            settings.save(&cli.settings)?;
        }
    }

    println!();
    for step in &report.steps {
        match &step.status {
            StepStatus::Ok => println!("  ✓ {}", step.name),
            StepStatus::Failed(e) => println!("  ✗ {}: {}", step.name, e),
        }
    }
    if report.cancelled {
        println!("  cancelled");
    }
    if let Some(game) = &report.state.game {
        println!("  game exit: {:?}", game.exit);
    }

    Ok(())
}

async fn log_task_events(mut events: broadcast::Receiver<TaskEvent>) {
    loop {
        match events.recv().await {
            Ok(TaskEvent::Created(task)) => tracing::info!("▶ {} {}", task.title, task.detail),
            Ok(TaskEvent::Updated(task)) => {
                tracing::debug!("  {} {:>3.0}% {}", task.title, task.progress * 100.0, task.detail)
            }
            Ok(TaskEvent::Retired(task)) => tracing::info!("✓ {}", task.title),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Task log skipped {} events", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
