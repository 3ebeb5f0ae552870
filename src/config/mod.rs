//! Configuration module
//!
//! Handles loading and managing configuration. Values come from, in increasing
//! precedence: defaults, a YAML/JSON config file, `TAPSWARM_*` environment
//! variables, and command-line flags.

pub mod env;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::executor::PluginError;
use crate::utils::shell::SplitError;
use crate::utils::RetryPolicy;

pub const DEFAULT_ADDR: &str = "127.0.0.1:19300";

/// Startup problems; all of them are fatal
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Failed to write config file {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("{path}: {source}")]
    MissingPath {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid duration '{0}' (expected e.g. 500ms, 3s, 10m, 1h)")]
    InvalidDuration(String),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Invalid command template: {0}")]
    Command(#[from] SplitError),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Application configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub dispatcher: DispatcherConfig,
    pub agent: AgentConfig,
    pub retry: RetryPolicy,
    pub output: OutputConfig,
}

/// Dispatcher (master) settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Listen address
    pub addr: String,

    /// Idle timeout in milliseconds: abort if no agent pulls within it
    pub timeout_ms: u64,

    /// Files or directories to run; directories are walked
    pub paths: Vec<String>,

    /// Suffix selecting test files inside directories
    pub suffix: String,

    /// Take the file list from the first agent that submits one
    pub accept_submitted: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            timeout_ms: 600_000,
            paths: Vec::new(),
            suffix: ".t".to_string(),
            accept_submitted: false,
        }
    }
}

impl DispatcherConfig {
    /// Idle timeout; zero would abort every run at once
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "dispatcher.timeout_ms".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(Duration::from_millis(self.timeout_ms))
    }

    /// Paths to discover, falling back to the conventional `t` directory
    pub fn search_paths(&self) -> Vec<String> {
        if self.paths.is_empty() {
            vec!["t".to_string()]
        } else {
            self.paths.clone()
        }
    }
}

/// Agent (slave) settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Dispatcher address
    pub addr: String,

    /// Number of worker lanes
    pub jobs: usize,

    /// Command template; the test path is appended
    pub exec: String,

    /// Merge child stderr into the parsed stream
    pub merge: bool,

    /// Discard child stderr
    pub quiet: bool,

    /// Plugin specifications (`name` or `name=args`), outermost first
    pub plugins: Vec<String>,

    /// Discover these paths locally and submit them on the first pull
    pub submit: Option<Vec<String>>,

    /// Suffix used for local discovery
    pub suffix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            jobs: 1,
            exec: "perl".to_string(),
            merge: false,
            quiet: false,
            plugins: Vec::new(),
            submit: None,
            suffix: ".t".to_string(),
        }
    }
}

/// Report settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// table, summary, json, json-pretty, csv or junit
    pub format: String,

    /// Write the report here instead of stdout
    pub file: Option<String>,

    pub color: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "table".to_string(),
            file: None,
            color: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = expand_path(path.as_ref());
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let parsed = if is_yaml_file(&path) {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        };

        parsed.map_err(|reason| ConfigError::Parse { path, reason })
    }

    /// Load `path` if given, else the default location if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load(path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_err = |reason: String| ConfigError::Write {
            path: path.to_path_buf(),
            reason,
        };

        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).map_err(|e| write_err(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?
        };

        std::fs::write(path, content).map_err(|e| write_err(e.to_string()))
    }
}

/// `~/.config/tapswarm/config.yaml` on Linux
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tapswarm").join("config.yaml"))
}

/// Expand ~ to home directory
fn expand_path(path: &Path) -> PathBuf {
    if let Some(stripped) = path.to_str().and_then(|p| p.strip_prefix("~/")) {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}

/// Parse an idle timeout into milliseconds, rejecting zero
pub fn parse_timeout_ms(s: &str) -> Result<u64, ConfigError> {
    let ms = parse_duration(s)?.as_millis();
    if ms == 0 {
        return Err(ConfigError::InvalidDuration(s.to_string()));
    }
    u64::try_from(ms).map_err(|_| ConfigError::InvalidDuration(s.to_string()))
}

/// Parse `500ms`, `3s`, `10m`, `1h` or a bare number of seconds
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(ConfigError::InvalidDuration(s.to_string())),
    }
}
