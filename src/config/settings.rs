//! Per-user launcher settings (`config.json`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_SETTINGS_PATH: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Launcher version the settings were written by.
    pub version: String,
    /// Installed build (mod-pack) version.
    pub build_version: String,
    pub nick_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            build_version: String::new(),
            nick_name: String::new(),
        }
    }
}

impl Settings {
    /// Read settings, creating the file with defaults when it does not exist.
    ///
    /// Missing fields take their defaults. Content that cannot be decoded at all
    /// is logged and replaced by defaults in memory; the file is left untouched.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let settings = Self::default();
            settings.save(path)?;
            tracing::info!("Created default settings at {}", path.display());
            return Ok(settings);
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        Ok(Self::parse_lenient(&raw, path))
    }

    fn parse_lenient(raw: &str, path: &Path) -> Self {
        match serde_json::from_str::<Self>(raw) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(
                    "Settings at {} are unreadable ({}), using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Write settings as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings {}", path.display()))?;
        Ok(())
    }
}
