use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine the configuration directory")]
    NoConfigDir,
    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Threshold for guest `logger` output, independent of the host's own filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    None,
}

impl ScriptLogLevel {
    /// Whether a line logged at `line` passes this threshold
    pub fn allows(self, line: ScriptLogLevel) -> bool {
        line != ScriptLogLevel::None && line >= self
    }

    /// `EnvFilter` directive level for the `script` target
    pub fn directive(self) -> &'static str {
        match self {
            ScriptLogLevel::Debug => "debug",
            ScriptLogLevel::Info => "info",
            ScriptLogLevel::Warn => "warn",
            ScriptLogLevel::Error => "error",
            ScriptLogLevel::None => "off",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Application base directory (default: directory of the location hint)
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// Script run against every new context before anything else
    #[serde(default = "default_bootstrap_script")]
    pub bootstrap_script: String,

    /// Extension appended to module paths that lack one
    #[serde(default = "default_module_extension")]
    pub module_extension: String,

    /// Upper bound on macro-tasks run per pump call (default: 5)
    #[serde(default = "default_max_tasks_per_frame")]
    pub max_tasks_per_frame: usize,

    /// Global function receiving dispatched events
    #[serde(default = "default_event_handler")]
    pub event_handler: String,

    /// Interval used by setInterval when no delay is given (default: 10ms)
    #[serde(default = "default_interval_ms")]
    pub interval_default_ms: u64,

    /// Delay used by setTimeout when no delay is given (default: 0ms)
    #[serde(default)]
    pub timeout_default_ms: u64,

    /// Lowest level of guest `logger` lines that get emitted (default: info)
    #[serde(default)]
    pub script_log_level: ScriptLogLevel,

    /// Tag attached to every guest log line (default: "unknown")
    #[serde(default = "default_script_module_name")]
    pub script_module_name: String,
}

fn default_bootstrap_script() -> String {
    "global.js".to_string()
}

fn default_module_extension() -> String {
    ".js".to_string()
}

fn default_max_tasks_per_frame() -> usize {
    5
}

fn default_event_handler() -> String {
    "_handleEvent".to_string()
}

fn default_interval_ms() -> u64 {
    10
}

fn default_script_module_name() -> String {
    "unknown".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            bootstrap_script: default_bootstrap_script(),
            module_extension: default_module_extension(),
            max_tasks_per_frame: default_max_tasks_per_frame(),
            event_handler: default_event_handler(),
            interval_default_ms: default_interval_ms(),
            timeout_default_ms: 0,
            script_log_level: ScriptLogLevel::default(),
            script_module_name: default_script_module_name(),
        }
    }
}

impl RuntimeConfig {
    /// Default location: `<config dir>/hearth/runtime.toml`
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("", "", "hearth").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("runtime.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(target: "hearth", "Loaded config from {}", path.display());
        Ok(config)
    }

    /// Loads the config at the default location, falling back to defaults when it does not exist
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }
}
