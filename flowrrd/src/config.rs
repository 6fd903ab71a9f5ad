//! Process configuration.
//!
//! Loaded once from a TOML file, optionally overridden from the environment,
//! validated, and then shared read-only (typically as `Arc<Config>`).
//!
//! ```toml
//! [general]
//! sources = ["gw", "edge"]
//! ports = [80, 443]
//! db = "rrd"
//! storage_root = "/var/lib/flowrrd"
//!
//! [log]
//! level = "info"
//! ```
//!
//! Environment overrides: `FLOWRRD_STORAGE_ROOT`, `FLOWRRD_DB`,
//! `FLOWRRD_LOG_LEVEL`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::datasource::Backend;
use crate::error::{ConfigError, Result};
use crate::path::validate_source;

/// Environment variable overriding `general.storage_root`.
pub const ENV_STORAGE_ROOT: &str = "FLOWRRD_STORAGE_ROOT";
/// Environment variable overriding `general.db`.
pub const ENV_DB: &str = "FLOWRRD_DB";
/// Environment variable overriding `log.level`.
pub const ENV_LOG_LEVEL: &str = "FLOWRRD_LOG_LEVEL";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Sources, ports and storage settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

/// The `[general]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Known source names, in display order.
    #[serde(default)]
    pub sources: Vec<String>,

    /// Tracked ports, in display order. Port 0 is implicit.
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Storage backend name.
    #[serde(default = "default_db")]
    pub db: String,

    /// Directory holding the data files.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
}

fn default_db() -> String {
    "rrd".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            ports: Vec::new(),
            db: default_db(),
            storage_root: default_storage_root(),
        }
    }
}

/// The `[log]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default `tracing` filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Loads, overrides from the environment, and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// the resulting configuration is invalid.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut config: Config = toml::from_str(&content).map_err(ConfigError::from)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates configuration from a TOML string. The
    /// environment is not consulted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the text is not valid TOML for this shape or
    /// the configuration is invalid.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowrrd::config::Config;
    ///
    /// let config = Config::from_toml_str(r#"
    ///     [general]
    ///     sources = ["gw"]
    ///     ports = [443]
    /// "#).unwrap();
    /// assert_eq!(config.general.db, "rrd");
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `FLOWRRD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_STORAGE_ROOT) {
            self.general.storage_root = PathBuf::from(root);
        }
        if let Some(db) = lookup(ENV_DB) {
            self.general.db = db;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log.level = level;
        }
    }

    /// Validates sources, ports and the backend name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a source that cannot be mapped to a unique
    /// file, a duplicate source or port, port 0, or an unknown backend.
    pub fn validate(&self) -> Result<()> {
        let mut sources = HashSet::new();
        for name in &self.general.sources {
            validate_source(name).map_err(|reason| ConfigError::InvalidSource {
                name: name.clone(),
                reason: reason.to_string(),
            })?;
            if !sources.insert(name.as_str()) {
                return Err(ConfigError::DuplicateSource(name.clone()).into());
            }
        }

        let mut ports = HashSet::new();
        for &port in &self.general.ports {
            if port == 0 {
                return Err(ConfigError::ZeroPort.into());
            }
            if !ports.insert(port) {
                return Err(ConfigError::DuplicatePort(port).into());
            }
        }

        self.backend()?;
        Ok(())
    }

    /// The configured storage backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownBackend`] for an unknown name.
    pub fn backend(&self) -> Result<Backend> {
        Ok(self.general.db.parse()?)
    }

    /// Configured sources.
    pub fn sources(&self) -> &[String] {
        &self.general.sources
    }

    /// Configured ports, without the implicit port 0.
    pub fn ports(&self) -> &[u16] {
        &self.general.ports
    }

    /// Storage root directory.
    pub fn storage_root(&self) -> &Path {
        &self.general.storage_root
    }
}
