//! Launch pipeline - runs provisioning steps, hooks and the game strictly in
//! sequence.
//!
//! ## Order
//! fixed steps → pre-launch hooks → game launch → post-launch hooks
//!
//! A single "Launching" task tracks coarse progress. Each fixed step and each hook
//! weighs `1/N` (N = fixed steps + pre hooks + post hooks); the task advances by one
//! unit after each of them finishes, whatever the step's own sub-tasks did.
//!
//! A failing step is logged and recorded, and the next step runs anyway.
//! Only cancellation stops the pipeline early.

pub mod steps;

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::provision::{BuildOutcome, ReconcileReport};
use crate::supervisor::ProcessOutcome;
use crate::task::Reporter;

// ─── Step seam ───────────────────────────────────────────────

#[async_trait]
pub trait LaunchStep: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &StepContext) -> anyhow::Result<()>;
}

/// Results earlier steps hand to later ones.
#[derive(Debug, Default)]
pub struct LaunchState {
    pub version_id: Option<String>,
    pub classpath: Vec<PathBuf>,
    pub build: Option<BuildOutcome>,
    pub reconcile: Option<ReconcileReport>,
    pub setup: Option<ProcessOutcome>,
    pub game: Option<ProcessOutcome>,
}

pub struct StepContext {
    pub reporter: Reporter,
    pub cancel: CancellationToken,
    pub state: Mutex<LaunchState>,
}

/// A hook built from a closure. The closure gets its own reporter handle.
pub struct FnStep<F> {
    name: String,
    f: F,
}

pub fn hook<F, Fut>(name: &str, f: F) -> FnStep<F>
where
    F: Fn(Reporter) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnStep {
        name: name.to_string(),
        f,
    }
}

#[async_trait]
impl<F, Fut> LaunchStep for FnStep<F>
where
    F: Fn(Reporter) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> anyhow::Result<()> {
        (self.f)(ctx.reporter.clone()).await
    }
}

// ─── Report ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fixed,
    PreLaunch,
    Launch,
    PostLaunch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub phase: Phase,
    pub status: StepStatus,
}

#[derive(Debug)]
pub struct PipelineReport {
    pub steps: Vec<StepRecord>,
    pub cancelled: bool,
    pub state: LaunchState,
}

impl PipelineReport {
    pub fn failures(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed(_)))
    }
}

// ─── Pipeline ────────────────────────────────────────────────

#[derive(Default)]
pub struct LaunchPipeline {
    steps: Vec<Box<dyn LaunchStep>>,
    pre_launch: Vec<Box<dyn LaunchStep>>,
    launch: Option<Box<dyn LaunchStep>>,
    post_launch: Vec<Box<dyn LaunchStep>>,
}

impl LaunchPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step(&mut self, step: impl LaunchStep + 'static) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn add_pre_launch(&mut self, step: impl LaunchStep + 'static) -> &mut Self {
        self.pre_launch.push(Box::new(step));
        self
    }

    pub fn add_post_launch(&mut self, step: impl LaunchStep + 'static) -> &mut Self {
        self.post_launch.push(Box::new(step));
        self
    }

    pub fn set_launch(&mut self, step: impl LaunchStep + 'static) -> &mut Self {
        self.launch = Some(Box::new(step));
        self
    }

    pub fn clear_launch(&mut self) -> &mut Self {
        self.launch = None;
        self
    }

    /// Steps that advance the top-level task.
    pub fn weighted_len(&self) -> usize {
        self.steps.len() + self.pre_launch.len() + self.post_launch.len()
    }

    pub async fn run(&self, reporter: Reporter, cancel: CancellationToken) -> PipelineReport {
        let ctx = StepContext {
            reporter: reporter.clone(),
            cancel,
            state: Mutex::new(LaunchState::default()),
        };
        let total = self.weighted_len();
        let main = reporter.create("Launching", "");
        let mut done = 0usize;
        let mut records = Vec::new();
        let mut cancelled = false;

        let phases: [(Phase, Vec<&dyn LaunchStep>); 4] = [
            (Phase::Fixed, self.steps.iter().map(|s| s.as_ref()).collect()),
            (Phase::PreLaunch, self.pre_launch.iter().map(|s| s.as_ref()).collect()),
            (Phase::Launch, self.launch.iter().map(|s| s.as_ref()).collect()),
            (Phase::PostLaunch, self.post_launch.iter().map(|s| s.as_ref()).collect()),
        ];

        'phases: for (phase, steps) in phases {
            for step in steps {
                if ctx.cancel.is_cancelled() {
                    tracing::warn!("Pipeline cancelled before '{}'", step.name());
                    cancelled = true;
                    break 'phases;
                }

                if done < total {
                    reporter.update_detail(main, done as f32 / total as f32, step.name());
                }
                tracing::info!("Step '{}' started", step.name());
                let status = match step.run(&ctx).await {
                    Ok(()) => {
                        tracing::info!("Step '{}' finished", step.name());
                        StepStatus::Ok
                    }
                    Err(e) => {
                        tracing::error!("Step '{}' failed: {:#}", step.name(), e);
                        StepStatus::Failed(format!("{:#}", e))
                    }
                };
                records.push(StepRecord {
                    name: step.name().to_string(),
                    phase,
                    status,
                });

                if phase != Phase::Launch {
                    done += 1;
                    reporter.update(main, done as f32 / total as f32);
                }
            }
        }

        if total == 0 || (cancelled && done < total) {
            reporter.finish(main);
        }

        PipelineReport {
            steps: records,
            cancelled,
            state: ctx.state.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskBoard, TaskError, TaskId, TaskReporter};
    use std::sync::{Arc, Mutex as StdMutex};

    /// Records every update to the first task created (the main task).
    #[derive(Default)]
    struct MainTaskProbe {
        board: TaskBoard,
        main: StdMutex<Option<TaskId>>,
        progress: StdMutex<Vec<f32>>,
    }

    impl TaskReporter for MainTaskProbe {
        fn create_task(&self, title: &str, detail: &str) -> TaskId {
            let id = self.board.create_task(title, detail);
            self.main.lock().unwrap().get_or_insert(id);
            id
        }

        fn update_task(&self, id: TaskId, progress: f32, detail: Option<&str>) -> Result<(), TaskError> {
            if *self.main.lock().unwrap() == Some(id) && detail.is_none() {
                self.progress.lock().unwrap().push(progress);
            }
            self.board.update_task(id, progress, detail)
        }
    }

    struct Recording {
        name: &'static str,
        log: Arc<StdMutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl LaunchStep for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, ctx: &StepContext) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            ctx.state.lock().await.classpath.push(PathBuf::from(self.name));
            if self.fail {
                anyhow::bail!("{} broke", self.name);
            }
            Ok(())
        }
    }

    fn step(name: &'static str, log: &Arc<StdMutex<Vec<&'static str>>>) -> Recording {
        Recording {
            name,
            log: log.clone(),
            fail: false,
        }
    }

    #[tokio::test]
    async fn test_runs_in_order_with_equal_weights() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut pipeline = LaunchPipeline::new();
        pipeline
            .add_step(step("runtime", &log))
            .add_step(step("libraries", &log))
            .add_post_launch(step("post", &log))
            .set_launch(step("game", &log))
            .add_pre_launch(step("pre", &log));

        let probe = Arc::new(MainTaskProbe::default());
        let report = pipeline
            .run(Reporter::new(probe.clone()), CancellationToken::new())
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["runtime", "libraries", "pre", "game", "post"]
        );
        assert_eq!(pipeline.weighted_len(), 4);
        assert_eq!(*probe.progress.lock().unwrap(), vec![0.25, 0.5, 0.75, 1.0]);
        assert!(probe.board.is_empty());
        assert_eq!(report.steps.len(), 5);
        assert_eq!(report.steps[3].phase, Phase::Launch);
        assert_eq!(report.state.classpath.len(), 5);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_pipeline() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut pipeline = LaunchPipeline::new();
        pipeline
            .add_step(Recording {
                name: "broken",
                log: log.clone(),
                fail: true,
            })
            .add_step(step("after", &log));

        let report = pipeline
            .run(Reporter::new(Arc::new(TaskBoard::new())), CancellationToken::new())
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["broken", "after"]);
        let failures: Vec<_> = report.failures().map(|s| s.name.as_str()).collect();
        assert_eq!(failures, vec!["broken"]);
        assert!(matches!(&report.steps[0].status, StepStatus::Failed(msg) if msg.contains("broken broke")));
    }

    #[tokio::test]
    async fn test_cancellation_stops_remaining_steps() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut pipeline = LaunchPipeline::new();
        pipeline
            .add_step(step("first", &log))
            .add_step(hook("cancel", move |_reporter| {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    Ok(())
                }
            }))
            .add_step(step("never", &log));

        let report = pipeline
            .run(Reporter::new(Arc::new(TaskBoard::new())), cancel)
            .await;
        assert!(report.cancelled);
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        assert_eq!(report.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_hook_gets_reporter() {
        let board = Arc::new(TaskBoard::new());
        let mut events = board.subscribe();
        let mut pipeline = LaunchPipeline::new();
        pipeline.add_pre_launch(hook("announce", |reporter: Reporter| async move {
            let id = reporter.create("Hook work", "");
            reporter.finish(id);
            Ok(())
        }));

        pipeline
            .run(Reporter::new(board.clone()), CancellationToken::new())
            .await;

        let mut titles = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let crate::task::TaskEvent::Created(task) = event {
                titles.push(task.title);
            }
        }
        assert_eq!(titles, vec!["Launching", "Hook work"]);
        assert!(board.is_empty());
    }

    #[tokio::test]
    async fn test_empty_pipeline_completes_main_task() {
        let board = Arc::new(TaskBoard::new());
        let report = LaunchPipeline::new()
            .run(Reporter::new(board.clone()), CancellationToken::new())
            .await;
        assert!(report.steps.is_empty());
        assert!(board.is_empty());
    }
}
