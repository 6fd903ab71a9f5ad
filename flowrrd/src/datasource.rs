//! Storage backend contract.
//!
//! Callers program against [`Datasource`] and obtain an implementation from
//! [`open_datasource`], which picks the backend named in the configuration.
//! The round-robin file store ([`RrdStore`]) is the only backend today.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::layout::Field;
use crate::query::{QueryRequest, ResultMatrix};
use crate::store::RrdStore;

/// One counter sample for a storage key.
///
/// Fields missing from `fields` are recorded as unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Source name; empty for a port-only aggregate.
    #[serde(default)]
    pub source: String,
    /// Port scope; 0 for the unscoped aggregate.
    #[serde(default)]
    pub port: u16,
    /// Sample time in seconds since the epoch. Floored to the base step.
    pub timestamp: u64,
    /// Counter values observed since the previous sample.
    pub fields: BTreeMap<Field, f64>,
}

/// Operations every storage backend provides.
///
/// Implementations are shared across threads; operations on distinct
/// storage keys must not block each other.
pub trait Datasource: Send + Sync {
    /// First and last timestamp held for `source`'s unscoped file.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the file cannot be read.
    fn date_boundaries(&self, source: &str) -> Result<(u64, u64)>;

    /// Time of the last accepted sample for `(source, port)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the file cannot be read.
    fn last_update(&self, source: &str, port: u16) -> Result<u64>;

    /// Creates the file for `(source, port)`, replacing it when `reset` is
    /// set.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError`](crate::error::CreateError) if the key is
    /// invalid, the directory is not writable, or the file exists and
    /// `reset` is false.
    fn create(&self, source: &str, port: u16, reset: bool) -> Result<()>;

    /// Stores a sample, creating the file on first use.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`](crate::error::WriteError) if the sample was
    /// rejected.
    fn write(&self, sample: &Sample) -> Result<()>;

    /// Answers a graph query.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`](crate::error::QueryError) with the underlying
    /// diagnostic if the query cannot be answered.
    fn query(&self, request: &QueryRequest) -> Result<ResultMatrix>;

    /// Recreates every file for `sources` (all configured sources when
    /// empty) and every configured port.
    ///
    /// # Errors
    ///
    /// Returns the first creation failure; files created before it stay.
    fn reset(&self, sources: &[String]) -> Result<()>;

    /// Path of the file for `(source, port)`. Pure mapping; distinct keys
    /// get distinct paths only when they pass
    /// [`validate_key`](crate::path::validate_key).
    fn resolve_path(&self, source: &str, port: u16) -> PathBuf;
}

/// Available storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Round-robin files, one per storage key.
    Rrd,
}

impl Backend {
    /// Backend name as used in configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rrd => "rrd",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rrd" => Ok(Self::Rrd),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

/// Builds the backend selected by `config.general.db`.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownBackend`] if the name is not known.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowrrd::config::Config;
/// use flowrrd::datasource::open_datasource;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Arc::new(Config::load("flowrrd.toml")?);
/// let datasource = open_datasource(config)?;
/// datasource.reset(&[])?;
/// # Ok(())
/// # }
/// ```
pub fn open_datasource(config: Arc<Config>) -> Result<Box<dyn Datasource>> {
    match config.backend()? {
        Backend::Rrd => Ok(Box::new(RrdStore::new(config))),
    }
}
