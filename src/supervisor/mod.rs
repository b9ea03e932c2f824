//! Process supervisor - runs an external command to completion with its
//! combined stdout/stderr streamed into task updates.
//!
//! Output is pulled by two reader tasks (one per pipe) into a single channel and
//! interpreted by a drain task. The caller is blocked until the child has exited
//! AND the drain task has joined, so every line the child printed has been
//! interpreted before the outcome is returned.
//!
//! Failures are not propagated: a command that cannot be spawned, or that is
//! cancelled, is logged and reported through [`ExitState`].

pub mod output;

pub use output::{classify_line, OutputInterpreter, OutputLine};

use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::task::Reporter;

/// Lines kept in [`ProcessOutcome::lines`]; older lines are dropped first.
const OUTPUT_BUFFER_LINES: usize = 10_000;

/// How long to wait for the pipes to close after the child exits.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

// ─── Types ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Pass `args` to the program exactly as written, without the platform's
    /// quoting. Only Windows quotes arguments, so elsewhere this changes nothing.
    pub verbatim: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            verbatim: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn verbatim(mut self, verbatim: bool) -> Self {
        self.verbatim = verbatim;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessLine {
    pub source: StreamSource,
    pub text: String,
    pub parsed: OutputLine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExitState {
    Exited { code: i32 },
    /// Ended without an exit code (killed by a signal).
    Terminated,
    SpawnFailed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub exit: ExitState,
    pub lines: Vec<ProcessLine>,
}

impl ProcessOutcome {
    fn without_output(exit: ExitState) -> Self {
        Self {
            exit,
            lines: Vec::new(),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.exit {
            ExitState::Exited { code } => Some(code),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code() == Some(0)
    }
}

// ─── Supervisor ──────────────────────────────────────────────

#[cfg(target_os = "windows")]
fn push_args(cmd: &mut Command, spec: &CommandSpec) {
    if spec.verbatim {
        for arg in &spec.args {
            cmd.raw_arg(arg);
        }
    } else {
        cmd.args(&spec.args);
    }
}

#[cfg(not(target_os = "windows"))]
fn push_args(cmd: &mut Command, spec: &CommandSpec) {
    cmd.args(&spec.args);
}

/// Run `spec` to completion. Sub-tasks titled `title` track its output.
pub async fn run(
    spec: &CommandSpec,
    reporter: &Reporter,
    title: &str,
    cancel: &CancellationToken,
) -> ProcessOutcome {
    let program = spec.program.display().to_string();

    let mut cmd = Command::new(&spec.program);
    push_args(&mut cmd, spec);
    cmd.current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    crate::utils::apply_creation_flags(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("Failed to spawn '{}': {}", program, e);
            return ProcessOutcome::without_output(ExitState::SpawnFailed {
                reason: e.to_string(),
            });
        }
    };
    tracing::info!(
        "Spawned '{}' (pid {:?}) in {}",
        program,
        child.id(),
        spec.working_dir.display()
    );

    let (line_tx, line_rx) = mpsc::channel::<(StreamSource, String)>(256);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, StreamSource::Stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, StreamSource::Stderr, line_tx.clone()));
    }
    drop(line_tx);

    let interpreter = OutputInterpreter::new(reporter.clone(), title);
    let mut drain = tokio::spawn(drain_output(line_rx, interpreter));

    let exit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::warn!("Cancelling '{}'", program);
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill '{}': {}", program, e);
            }
            ExitState::Cancelled
        }
        status = child.wait() => match status {
            Ok(status) => match status.code() {
                Some(code) => ExitState::Exited { code },
                None => ExitState::Terminated,
            },
            Err(e) => {
                tracing::error!("Failed to wait on '{}': {}", program, e);
                ExitState::Terminated
            }
        },
    };

    let drained = match tokio::time::timeout(DRAIN_GRACE, &mut drain).await {
        Ok(joined) => joined,
        Err(_) => {
            tracing::warn!(
                "Output of '{}' still open {}s after exit; closing readers",
                program,
                DRAIN_GRACE.as_secs()
            );
            for reader in &readers {
                reader.abort();
            }
            drain.await
        }
    };

    let lines = match drained {
        Ok((interpreter, lines)) => {
            interpreter.finish();
            lines.into_iter().collect()
        }
        Err(e) => {
            tracing::error!("Output drain for '{}' failed: {}", program, e);
            Vec::new()
        }
    };

    match &exit {
        ExitState::Exited { code: 0 } => tracing::info!("'{}' finished", program),
        other => tracing::warn!("'{}' ended with {:?}", program, other),
    }

    ProcessOutcome { exit, lines }
}

/// Forward lines from one pipe. Reads raw bytes so non-UTF-8 output cannot stall
/// the pipe.
fn spawn_reader<R>(
    pipe: R,
    source: StreamSource,
    tx: mpsc::Sender<(StreamSource, String)>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send((source, text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("{:?} reader stopped: {}", source, e);
                    break;
                }
            }
        }
    })
}

async fn drain_output(
    mut rx: mpsc::Receiver<(StreamSource, String)>,
    mut interpreter: OutputInterpreter,
) -> (OutputInterpreter, VecDeque<ProcessLine>) {
    let mut lines = VecDeque::new();
    while let Some((source, text)) = rx.recv().await {
        tracing::debug!(target: "packlaunch::process", "[{:?}] {}", source, text);
        let parsed = interpreter.feed(&text);
        if lines.len() >= OUTPUT_BUFFER_LINES {
            lines.pop_front();
        }
        lines.push_back(ProcessLine {
            source,
            text,
            parsed,
        });
    }
    (interpreter, lines)
}
