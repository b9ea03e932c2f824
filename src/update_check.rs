//! Launcher version check against a plain-text version file.

use tokio_util::sync::CancellationToken;

use crate::fetch::{no_progress, ArtifactSource, FetchError, FetchTarget};

/// Fetch the published launcher version (first line of the file, trimmed).
pub async fn fetch_latest_version(
    source: &dyn ArtifactSource,
    url: &str,
    cancel: &CancellationToken,
) -> Result<String, FetchError> {
    let bytes = source
        .fetch(url, FetchTarget::Memory, &no_progress, cancel)
        .await?
        .into_bytes()
        .unwrap_or_default();
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.lines().next().unwrap_or_default().trim().to_string())
}

/// Any difference counts as an update; an empty `latest` never does.
pub fn update_available(current: &str, latest: &str) -> bool {
    let latest = latest.trim();
    !latest.is_empty() && current.trim() != latest
}
