pub mod settings;

pub use settings::Settings;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::integrity::DigestAlgorithm;

pub const DEFAULT_CONFIG_PATH: &str = "config/launcher.toml";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Launcher configuration, `config/launcher.toml`.
///
/// Every field has a default so a partial file (or none at all) still yields a
/// usable configuration. Relative paths resolve against `game_dir`.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct LauncherConfig {
    /// Root of the game installation; managed directories live below it.
    pub game_dir: PathBuf,
    pub runtime: RuntimeConfig,
    /// Bundled runtime/library manifest.
    pub version_manifest: PathBuf,
    pub build: BuildSourceConfig,
    /// Sub-directories reconciled against the build manifest.
    pub managed_dirs: Vec<String>,
    /// Base URL for asset objects (`<base>/<xx>/<hash>`).
    pub asset_base_url: String,
    /// Optional loader setup command, run before the game.
    pub setup: Option<CommandConfig>,
    pub launch: CommandConfig,
    pub max_download_attempts: u32,
    pub max_install_attempts: u32,
}

/// Runtime (JRE) installer parameters.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub name: String,
    pub payload_url: String,
    pub checksum_url: String,
    pub payload_path: PathBuf,
    pub checksum_path: PathBuf,
    /// Binary whose presence means the runtime is installed.
    pub target_binary: PathBuf,
    pub algorithm: DigestAlgorithm,
    /// Installer program; the payload path is appended after `installer_args_before`.
    /// Arguments may use `${game_dir}` and `${runtime_dir}` (both absolute). On
    /// Windows they reach the installer unquoted, so quote values yourself.
    pub installer: PathBuf,
    pub installer_args_before: Vec<String>,
    pub installer_args: Vec<String>,
}

/// Where the build (mod-pack) manifest comes from. First set source wins:
/// `archive_url`, then `archive_path`, then `manifest_path`.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct BuildSourceConfig {
    pub archive_url: Option<String>,
    pub archive_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct CommandConfig {
    pub program: PathBuf,
    /// Arguments; `${nickname}`, `${game_dir}`, `${classpath}`, `${version}` and
    /// `${build_version}` are substituted at launch.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            game_dir: PathBuf::from("."),
            runtime: RuntimeConfig::default(),
            version_manifest: PathBuf::from("files/1.20.1-0.16.5.json"),
            build: BuildSourceConfig::default(),
            managed_dirs: vec!["mods".to_string(), "resourcepacks".to_string()],
            asset_base_url: "https://resources.download.minecraft.net".to_string(),
            setup: None,
            launch: CommandConfig {
                program: PathBuf::from("runtime/bin/java"),
                args: vec![
                    "-cp".to_string(),
                    "${classpath}".to_string(),
                    "net.fabricmc.loader.impl.launch.knot.KnotClient".to_string(),
                    "--username".to_string(),
                    "${nickname}".to_string(),
                    "--gameDir".to_string(),
                    "${game_dir}".to_string(),
                ],
                working_dir: None,
            },
            max_download_attempts: 5,
            max_install_attempts: 3,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let base = "https://github.com/adoptium/temurin17-binaries/releases/download/jdk-17.0.12%2B7/OpenJDK17U-jre_x86-32_windows_hotspot_17.0.12_7.msi";
        Self {
            name: "Java runtime".to_string(),
            payload_url: base.to_string(),
            checksum_url: format!("{}.sha256.txt", base),
            payload_path: PathBuf::from("jre.msi"),
            checksum_path: PathBuf::from("jre.msi.sha256.txt"),
            target_binary: PathBuf::from(if cfg!(windows) {
                "runtime/bin/javaw.exe"
            } else {
                "runtime/bin/java"
            }),
            algorithm: DigestAlgorithm::Sha256,
            installer: PathBuf::from("msiexec"),
            installer_args_before: vec!["/i".to_string()],
            installer_args: vec![
                "/quiet".to_string(),
                "/norestart".to_string(),
                if cfg!(windows) {
                    "INSTALLDIR=\"${runtime_dir}\"".to_string()
                } else {
                    "INSTALLDIR=${runtime_dir}".to_string()
                },
            ],
        }
    }
}

impl Default for BuildSourceConfig {
    fn default() -> Self {
        Self {
            archive_url: None,
            archive_path: None,
            manifest_path: Some(PathBuf::from("files/build.json")),
        }
    }
}

impl LauncherConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Resolve a configured path against the game directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        crate::utils::resolve_under(&self.game_dir, path)
    }

    pub fn download_attempts(&self) -> u32 {
        self.max_download_attempts.max(1)
    }

    pub fn install_attempts(&self) -> u32 {
        self.max_install_attempts.max(1)
    }
}
