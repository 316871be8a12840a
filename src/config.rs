//! Configuration model
//!
//! The core receives a populated [`Config`]; the TOML file on disk is
//! a convenience for the CLI. Unset keys fall back to defaults under
//! `~/.gotya`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::platform::{self, Platform};

/// Errors from loading, saving or mutating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Underlying filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed TOML on disk.
    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization failure (should not happen for valid configs).
    #[error("configuration serialization failed: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Unknown key or invalid value for `config get`/`config set`.
    #[error("{0}")]
    Validation(String),
}

/// Per-repository authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Auth {
    /// HTTP basic auth.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// `Authorization: Bearer <token>`.
    Bearer {
        /// The bearer token.
        token: String,
    },
    /// Arbitrary extra request headers.
    Headers {
        /// Header name to value.
        headers: BTreeMap<String, String>,
    },
}

/// A configured artifact repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Unique repository name.
    pub name: String,
    /// URL of the repository's `index.json`.
    pub url: String,
    /// Disabled repositories are ignored by sync and resolution.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Higher priority wins duplicate index entries.
    #[serde(default)]
    pub priority: u32,
    /// Optional authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
}

/// Platform override section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Operating system token.
    #[serde(default = "default_os")]
    pub os: String,
    /// Architecture token.
    #[serde(default = "default_arch")]
    pub arch: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            os: default_os(),
            arch: default_arch(),
        }
    }
}

/// The full configuration consumed by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root of the download cache.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Where `data/` payloads are installed.
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
    /// Where per-artifact `meta/` trees are kept.
    #[serde(default = "default_meta_dir")]
    pub meta_dir: PathBuf,
    /// Where the installed database lives.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Total per-request HTTP timeout.
    #[serde(default = "default_http_timeout", with = "duration_secs")]
    pub http_timeout: Duration,
    /// Bound on concurrent repository syncs.
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: usize,
    /// Wall-clock timeout for a single hook script.
    #[serde(default = "default_hook_timeout", with = "duration_secs")]
    pub hook_timeout: Duration,
    /// Log filter level (trace/debug/info/warn/error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format: `text` or `json`.
    #[serde(default = "default_output_format")]
    pub output_format: String,
    /// Whether CLI output may use color.
    #[serde(default = "default_true")]
    pub color_output: bool,
    /// Platform artifacts are resolved for.
    #[serde(default)]
    pub platform: PlatformConfig,
    /// Configured repositories, in priority-tie order.
    #[serde(default)]
    pub repositories: Vec<Repository>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            install_dir: default_install_dir(),
            meta_dir: default_meta_dir(),
            state_dir: default_state_dir(),
            http_timeout: default_http_timeout(),
            max_concurrent_syncs: default_max_concurrent_syncs(),
            hook_timeout: default_hook_timeout(),
            platform: PlatformConfig::default(),
            log_level: default_log_level(),
            output_format: default_output_format(),
            color_output: true,
            repositories: Vec::new(),
        }
    }
}

impl Config {
    /// Default configuration file path: `~/.gotya/config.toml`.
    pub fn default_path() -> PathBuf {
        crate::gotya_home().join("config.toml")
    }

    /// Load the configuration, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Save the configuration atomically (sibling temp + rename).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        fs::write(tmp.path(), text)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Directory of synced repository indexes (derived from the
    /// cache dir).
    pub fn index_dir(&self) -> PathBuf {
        self.cache_dir.join("indexes")
    }

    /// Directory of cached artifact bundles.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.cache_dir.join("artifacts")
    }

    /// Path of the installed database file.
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("installed.json")
    }

    /// The platform artifacts are resolved against.
    pub fn resolve_platform(&self) -> Platform {
        Platform {
            os: self.platform.os.clone(),
            arch: self.platform.arch.clone(),
        }
    }

    /// Enabled repositories in configuration order.
    pub fn enabled_repositories(&self) -> Vec<Repository> {
        self.repositories
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect()
    }

    /// Read an enumerated key as a display string.
    pub fn get(&self, key: &str) -> Result<String, ConfigError> {
        let value = match key {
            "cache_dir" => self.cache_dir.display().to_string(),
            "install_dir" => self.install_dir.display().to_string(),
            "meta_dir" => self.meta_dir.display().to_string(),
            "state_dir" => self.state_dir.display().to_string(),
            "index_dir" => self.index_dir().display().to_string(),
            "http_timeout" => format!("{}s", self.http_timeout.as_secs()),
            "max_concurrent_syncs" => self.max_concurrent_syncs.to_string(),
            "hook_timeout" => format!("{}s", self.hook_timeout.as_secs()),
            "platform.os" => self.platform.os.clone(),
            "platform.arch" => self.platform.arch.clone(),
            "log_level" => self.log_level.clone(),
            "output_format" => self.output_format.clone(),
            "color_output" => self.color_output.to_string(),
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown configuration key '{other}'"
                )));
            }
        };
        Ok(value)
    }

    /// Set an enumerated key from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "cache_dir" => self.cache_dir = PathBuf::from(value),
            "install_dir" => self.install_dir = PathBuf::from(value),
            "meta_dir" => self.meta_dir = PathBuf::from(value),
            "state_dir" => self.state_dir = PathBuf::from(value),
            "http_timeout" => self.http_timeout = parse_duration(key, value)?,
            "hook_timeout" => self.hook_timeout = parse_duration(key, value)?,
            "max_concurrent_syncs" => {
                self.max_concurrent_syncs = value.parse().map_err(|_| {
                    ConfigError::Validation(format!(
                        "invalid value '{value}' for {key}: expected an integer"
                    ))
                })?;
            }
            "platform.os" => {
                if !platform::is_valid_os(value) {
                    return Err(ConfigError::Validation(format!(
                        "unknown os token '{value}'"
                    )));
                }
                self.platform.os = value.to_string();
            }
            "platform.arch" => {
                if !platform::is_valid_arch(value) {
                    return Err(ConfigError::Validation(format!(
                        "unknown arch token '{value}'"
                    )));
                }
                self.platform.arch = value.to_string();
            }
            "log_level" => self.log_level = value.to_string(),
            "output_format" => {
                if !matches!(value, "text" | "json") {
                    return Err(ConfigError::Validation(format!(
                        "invalid output format '{value}': expected text or json"
                    )));
                }
                self.output_format = value.to_string();
            }
            "color_output" => {
                self.color_output = value.parse().map_err(|_| {
                    ConfigError::Validation(format!(
                        "invalid value '{value}' for {key}: expected true or false"
                    ))
                })?;
            }
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown configuration key '{other}'"
                )));
            }
        }
        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let digits = value.strip_suffix('s').unwrap_or(value);
    let secs: u64 = digits.parse().map_err(|_| {
        ConfigError::Validation(format!(
            "invalid value '{value}' for {key}: expected seconds (e.g. 30 or 30s)"
        ))
    })?;
    Ok(Duration::from_secs(secs))
}

fn default_true() -> bool {
    true
}

fn default_os() -> String {
    platform::current_os().to_string()
}

fn default_arch() -> String {
    platform::current_arch().to_string()
}

fn default_cache_dir() -> PathBuf {
    crate::gotya_home().join("cache")
}

fn default_install_dir() -> PathBuf {
    crate::gotya_home().join("install")
}

fn default_meta_dir() -> PathBuf {
    crate::gotya_home().join("meta")
}

fn default_state_dir() -> PathBuf {
    crate::gotya_home().join("state")
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrent_syncs() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_format() -> String {
    "text".to_string()
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
