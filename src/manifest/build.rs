//! Mod-pack (build) manifest, `modrinth.index.json`-shaped.

use serde::{Deserialize, Serialize};

use crate::integrity::ExpectedDigest;

/// Name of the distinguished archive entry holding the manifest.
pub const BUILD_MANIFEST_ENTRY: &str = "modrinth.index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildManifest {
    #[serde(default)]
    pub game: String,
    #[serde(default)]
    pub format_version: u32,
    #[serde(default)]
    pub version_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub files: Vec<BuildFile>,
    #[serde(default)]
    pub dependencies: BuildDependencies,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildDependencies {
    #[serde(rename = "fabric-loader", default)]
    pub fabric_loader: Option<String>,
    #[serde(default)]
    pub minecraft: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFile {
    /// Path relative to the game directory, e.g. `mods/sodium.jar`.
    pub path: String,
    pub hashes: Hashes,
    #[serde(default)]
    pub env: Option<Environment>,
    pub downloads: Vec<String>,
    #[serde(default)]
    pub file_size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hashes {
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub sha512: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub client: EnvSupport,
    pub server: EnvSupport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvSupport {
    Required,
    Optional,
    Unsupported,
}

impl BuildFile {
    /// Strongest digest the entry declares (SHA-512 before SHA-1).
    pub fn expected_digest(&self) -> Option<ExpectedDigest> {
        if let Some(sha512) = self.hashes.sha512.as_deref().filter(|h| !h.is_empty()) {
            return Some(ExpectedDigest::sha512(sha512));
        }
        self.hashes
            .sha1
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(ExpectedDigest::sha1)
    }

    /// Whether the client side needs this file.
    pub fn applies_to_client(&self) -> bool {
        !matches!(
            self.env,
            Some(Environment {
                client: EnvSupport::Unsupported,
                ..
            })
        )
    }

    pub fn primary_url(&self) -> Option<&str> {
        self.downloads.first().map(String::as_str)
    }
}

impl BuildManifest {
    /// Files the client installs, in declaration order.
    pub fn client_files(&self) -> impl Iterator<Item = &BuildFile> {
        self.files.iter().filter(|f| f.applies_to_client())
    }
}
