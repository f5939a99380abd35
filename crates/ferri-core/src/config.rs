//! ferri configuration (`config.toml`).
//!
//! ```toml
//! db_path = "/home/amy/.local/share/ferri/ferri.db"
//! log_level = "info"
//! log_path = "/home/amy/.local/share/ferri/logs"
//! log_rotation = "daily"
//! case_sensitive_masks = true
//! max_depth = 32
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolver::{DEFAULT_MAX_DEPTH, ResolverOptions};

const APP_DIR: &str = "ferri";

/// Error type for config operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Log file rotation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Directory for the rolling app log. No file log when unset.
    pub log_path: Option<PathBuf>,
    /// Directory for the rolling error-only log.
    pub log_error_path: Option<PathBuf>,
    pub log_rotation: LogRotation,
    pub case_sensitive_masks: bool,
    /// Cap on delegation and mask nesting.
    pub max_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data = data_dir();
        Self {
            db_path: data.join("ferri.db"),
            log_level: "info".to_string(),
            log_path: None,
            log_error_path: None,
            log_rotation: LogRotation::Daily,
            case_sensitive_masks: true,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Config {
    /// `<config dir>/ferri/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let cfg: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save config to a TOML file, creating the parent directory.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        }
        fs::write(path, content).map_err(|e| ConfigError::io(path, e))
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let cfg = Self::default();
        cfg.save(path)?;
        tracing::info!(path = %path.display(), "wrote default config");
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_depth must be at least 1".into(),
            ));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed("db_path is empty".into()));
        }
        Ok(())
    }

    /// Create log directories and the database's parent directory.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        let parents = [
            self.log_path.as_deref(),
            self.log_error_path.as_deref(),
            self.db_path.parent().filter(|p| !p.as_os_str().is_empty()),
        ];
        for dir in parents.into_iter().flatten() {
            fs::create_dir_all(dir).map_err(|e| ConfigError::io(dir, e))?;
        }
        Ok(())
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions::from(self)
    }
}

impl From<&Config> for ResolverOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            case_sensitive: cfg.case_sensitive_masks,
            max_depth: cfg.max_depth,
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}
