//! Content fetcher - single HTTP GET streamed to a file or into memory.
//!
//! A fetch is one suspending call that returns exactly one result. Progress is a
//! separate observer: it receives non-decreasing fractions while the body streams
//! (only when the server sent a length) and always ends at exactly `1.0` on success.
//!
//! File targets are written to `<dest>.part` and renamed into place once the body
//! is complete, so a failed or cancelled fetch never leaves a truncated file under
//! the real name.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const USER_AGENT: &str = concat!("packlaunch/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the body goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchTarget {
    File(PathBuf),
    Memory,
}

/// Result of a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    File { path: PathBuf, bytes: u64 },
    Memory(Vec<u8>),
}

impl Fetched {
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Fetched::Memory(bytes) => Some(bytes),
            Fetched::File { .. } => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("GET {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("network error while fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fetch of {url} was cancelled")]
    Cancelled { url: String },
}

/// Progress observer; receives fractions in `[0, 1]`.
pub type ProgressFn<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// No-op progress observer.
pub fn no_progress(_: f32) {}

/// Anything that can materialize a URL.
///
/// [`Fetcher`] is the HTTP implementation; provisioning code takes the trait so the
/// retry and skip-if-valid logic can be driven by scripted sources in tests.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        target: FetchTarget,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<Fetched, FetchError>;
}

// ─── HTTP Fetcher ────────────────────────────────────────────

#[derive(Clone)]
pub struct Fetcher {
    http: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { http })
    }

    async fn run(
        &self,
        url: &str,
        target: FetchTarget,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<Fetched, FetchError> {
        let cancelled = || FetchError::Cancelled {
            url: url.to_string(),
        };
        let network = |source| FetchError::Network {
            url: url.to_string(),
            source,
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            res = self.http.get(url).send() => res.map_err(network)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length().filter(|n| *n > 0);
        let mut sink = Sink::open(target).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;
        let mut last_reported = 0.0f32;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    sink.discard().await;
                    return Err(cancelled());
                }
                next = stream.next() => next,
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    sink.discard().await;
                    return Err(network(e));
                }
            };

            if let Err(e) = sink.write(&chunk).await {
                sink.discard().await;
                return Err(e);
            }
            received += chunk.len() as u64;

            if let Some(total) = total {
                let fraction = (received as f64 / total as f64).min(1.0) as f32;
                if fraction > last_reported {
                    last_reported = fraction;
                    progress(fraction);
                }
            }
        }

        let fetched = sink.finish().await?;
        if last_reported < 1.0 {
            progress(1.0);
        }
        tracing::debug!("Fetched {} ({} bytes)", url, received);
        Ok(fetched)
    }
}

#[async_trait]
impl ArtifactSource for Fetcher {
    async fn fetch(
        &self,
        url: &str,
        target: FetchTarget,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<Fetched, FetchError> {
        self.run(url, target, progress, cancel).await
    }
}

// ─── Sink ────────────────────────────────────────────────────

enum Sink {
    File {
        file: tokio::fs::File,
        part: PathBuf,
        dest: PathBuf,
        written: u64,
    },
    Memory(Vec<u8>),
}

impl Sink {
    async fn open(target: FetchTarget) -> Result<Self, FetchError> {
        match target {
            FetchTarget::Memory => Ok(Sink::Memory(Vec::new())),
            FetchTarget::File(dest) => {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|source| FetchError::Io {
                            path: parent.to_path_buf(),
                            source,
                        })?;
                }
                let part = part_path(&dest);
                let file = tokio::fs::File::create(&part)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: part.clone(),
                        source,
                    })?;
                Ok(Sink::File {
                    file,
                    part,
                    dest,
                    written: 0,
                })
            }
        }
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        match self {
            Sink::Memory(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            Sink::File {
                file,
                part,
                written,
                ..
            } => {
                file.write_all(chunk)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: part.clone(),
                        source,
                    })?;
                *written += chunk.len() as u64;
                Ok(())
            }
        }
    }

    async fn finish(self) -> Result<Fetched, FetchError> {
        match self {
            Sink::Memory(buf) => Ok(Fetched::Memory(buf)),
            Sink::File {
                mut file,
                part,
                dest,
                written,
            } => {
                let io_err = |path: &Path, source| FetchError::Io {
                    path: path.to_path_buf(),
                    source,
                };
                if let Err(e) = file.flush().await {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(io_err(&part, e));
                }
                drop(file);
                if let Err(e) = tokio::fs::rename(&part, &dest).await {
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(io_err(&dest, e));
                }
                Ok(Fetched::File {
                    path: dest,
                    bytes: written,
                })
            }
        }
    }

    async fn discard(self) {
        if let Sink::File { file, part, .. } = self {
            drop(file);
            let _ = tokio::fs::remove_file(&part).await;
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}
