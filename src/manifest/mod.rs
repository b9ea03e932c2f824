//! Read-only manifest models consumed by the provisioning steps.

pub mod build;
pub mod version;

pub use build::{BuildFile, BuildManifest, BUILD_MANIFEST_ENTRY};
pub use version::{AssetObjects, Library, VersionManifest};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Load a JSON manifest from disk.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse manifest {}", path.display()))
}
