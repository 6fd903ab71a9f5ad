//! Round-robin file store: the `rrd` backend.
//!
//! One file per storage key under the configured storage root (see
//! [`crate::path`]). Files are created on demand by the first write, or
//! explicitly via [`Datasource::create`] and [`Datasource::reset`].
//!
//! # Concurrency
//!
//! [`RrdStore`] keeps no mutable state. Writers take an exclusive lock on the
//! file they update and readers a shared one, so different storage keys
//! never contend. New files are built in a temporary file next to their
//! final path and moved into place atomically; a reader sees either no file
//! or a complete one.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use flowrrd::config::Config;
//! use flowrrd::datasource::{Datasource, Sample};
//! use flowrrd::layout::{Field, MetricClass, Protocol};
//! use flowrrd::store::RrdStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RrdStore::new(Arc::new(Config::load("flowrrd.toml")?));
//!
//! let mut fields = BTreeMap::new();
//! fields.insert(Field::new(MetricClass::Flows, Protocol::Any), 1200.0);
//! fields.insert(Field::new(MetricClass::Flows, Protocol::Tcp), 800.0);
//! store.write(&Sample {
//!     source: "gw".to_string(),
//!     port: 0,
//!     timestamp: 1_700_000_000,
//!     fields,
//! })?;
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::consolidate::{self, UpdateSummary};
use crate::datasource::{Datasource, Sample};
use crate::error::{CreateError, FlowError, Result, WriteError};
use crate::file::{self, RrdFile};
use crate::layout::{ArchiveLayout, ArchiveTier, BASE_STEP, ConsolidationFn, Field, floor_to_step};
use crate::path::{PathResolver, validate_key};
use crate::query::{self, QueryRequest, ResultMatrix};
use crate::ring::Ring;

/// How far back a new file's coverage starts.
const HISTORY_MONTHS: u32 = 36;

/// Computes the start time of a file created at `now`: three calendar years
/// earlier, floored to the base step.
///
/// # Errors
///
/// Returns [`CreateError::Clock`] if the result is before the epoch or not
/// representable.
pub fn creation_start(now: DateTime<Utc>) -> std::result::Result<u64, CreateError> {
    let start = now
        .checked_sub_months(Months::new(HISTORY_MONTHS))
        .ok_or(CreateError::Clock)?;
    let secs = u64::try_from(start.timestamp()).map_err(|_| CreateError::Clock)?;
    Ok(floor_to_step(secs, BASE_STEP))
}

/// Summary of one archive, for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveSummary {
    /// Consolidation function.
    pub cf: ConsolidationFn,
    /// Base steps per row.
    pub pdp_per_row: u32,
    /// Rows in the ring.
    pub rows: u32,
    /// Seconds per row.
    pub resolution: u64,
    /// Seconds covered by the full ring.
    pub span: u64,
    /// End of the newest written row.
    pub newest: Option<u64>,
}

/// Self-description of a storage file, for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInfo {
    /// File path.
    pub path: PathBuf,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Base step in seconds.
    pub step: u64,
    /// First timestamp covered by the finest archive.
    pub first: u64,
    /// Time of the last accepted sample.
    pub last_update: u64,
    /// Field names in storage order.
    pub fields: Vec<String>,
    /// Archives in storage order.
    pub archives: Vec<ArchiveSummary>,
}

/// Round-robin file backend.
#[derive(Debug, Clone)]
pub struct RrdStore {
    config: Arc<Config>,
    resolver: PathResolver,
    layout: ArchiveLayout,
}

impl RrdStore {
    /// Creates a store over `config.general.storage_root`.
    pub fn new(config: Arc<Config>) -> Self {
        let resolver = PathResolver::new(config.storage_root());
        Self {
            config,
            resolver,
            layout: ArchiveLayout::flows(),
        }
    }

    /// The configuration this store was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The layout of every file this store creates.
    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    /// Creates the file for `(source, port)` with coverage starting at
    /// `start`. [`Datasource::create`] calls this with
    /// [`creation_start`] of the current time.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError`] as described on [`Datasource::create`].
    pub fn create_at(&self, source: &str, port: u16, reset: bool, start: u64) -> Result<PathBuf> {
        self.try_create(source, port, reset, start).map_err(|e| {
            error!(source, port, error = %e, "file creation failed");
            FlowError::from(e)
        })
    }

    fn try_create(&self, source: &str, port: u16, reset: bool, start: u64) -> std::result::Result<PathBuf, CreateError> {
        validate_key(source, port).map_err(|reason| CreateError::InvalidKey {
            source_name: source.to_string(),
            port,
            reason: reason.to_string(),
        })?;

        let path = self.resolver.resolve(source, port);
        let dir = path.parent().unwrap_or(self.resolver.root()).to_path_buf();
        let io_err = |source: io::Error| match source.kind() {
            io::ErrorKind::PermissionDenied => CreateError::NotWritable { path: path.clone() },
            _ => CreateError::Io {
                path: path.clone(),
                source,
            },
        };

        fs::create_dir_all(&dir).map_err(io_err)?;
        if fs::metadata(&dir).map_err(io_err)?.permissions().readonly() {
            return Err(CreateError::NotWritable { path: path.clone() });
        }
        if !reset && path.exists() {
            return Err(CreateError::AlreadyExists { path: path.clone() });
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix(".flowrrd-").suffix(".tmp");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(fs::Permissions::from_mode(0o644));
        }
        let tmp = builder.tempfile_in(&dir).map_err(io_err)?;

        file::format(tmp.as_file(), tmp.path(), &self.layout, start).map_err(|source| CreateError::Init {
            path: path.clone(),
            source,
        })?;

        let persisted = if reset {
            tmp.persist(&path)
        } else {
            tmp.persist_noclobber(&path)
        };
        persisted.map_err(|e| match e.error.kind() {
            io::ErrorKind::AlreadyExists => CreateError::AlreadyExists { path: path.clone() },
            _ => io_err(e.error),
        })?;

        info!(path = %path.display(), start, reset, "created data file");
        Ok(path)
    }

    fn try_write(&self, sample: &Sample) -> std::result::Result<UpdateSummary, FlowError> {
        validate_key(&sample.source, sample.port).map_err(|reason| {
            WriteError::Create(CreateError::InvalidKey {
                source_name: sample.source.clone(),
                port: sample.port,
                reason: reason.to_string(),
            })
        })?;

        let path = self.resolver.locate(&sample.source, sample.port);
        if !path.exists() {
            let start = creation_start(Utc::now()).map_err(WriteError::Create)?;
            match self.try_create(&sample.source, sample.port, false, start) {
                // Another writer won the race; its file is just as good.
                Ok(_) | Err(CreateError::AlreadyExists { .. }) => {}
                Err(e) => return Err(WriteError::Create(e).into()),
            }
        }

        let timestamp = floor_to_step(sample.timestamp, BASE_STEP);
        let mut file = RrdFile::open_mut(&path).map_err(WriteError::File)?;

        let values: Vec<f64> = (0..file.field_count())
            .map(|i| {
                file.field_name(i)
                    .parse::<Field>()
                    .ok()
                    .and_then(|field| sample.fields.get(&field).copied())
                    .unwrap_or(f64::NAN)
            })
            .collect();

        debug!(path = %path.display(), timestamp, "writing sample");
        let summary = consolidate::update(&mut file, timestamp, &values)?;
        file.sync().map_err(WriteError::File)?;
        Ok(summary)
    }

    /// Describes the file for `(source, port)`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidParameter`](crate::error::QueryError) for
    /// an invalid key and
    /// [`FileError`](crate::error::FileError) if the file cannot be opened.
    pub fn info(&self, source: &str, port: u16) -> Result<FileInfo> {
        let path = self.existing_path(source, port)?;
        let file = RrdFile::open(&path)?;
        let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let archives = (0..file.archive_count())
            .map(|a| {
                let ring = Ring::new(&file, a);
                let info = ring.info();
                let tier = ArchiveTier {
                    pdp_per_row: info.pdp_per_row,
                    rows: info.rows,
                };
                ArchiveSummary {
                    cf: info.cf,
                    pdp_per_row: info.pdp_per_row,
                    rows: info.rows,
                    resolution: ring.resolution(),
                    span: tier.span(file.step()),
                    newest: ring.newest_timestamp(),
                }
            })
            .collect();

        Ok(FileInfo {
            size_bytes,
            step: file.step(),
            first: Ring::new(&file, 0).oldest_timestamp(),
            last_update: file.last_update(),
            fields: file.field_names(),
            archives,
            path,
        })
    }

    /// Path of an existing key's file. Reads go through the same key
    /// validation as writes so they never leave the storage root.
    fn existing_path(&self, source: &str, port: u16) -> Result<PathBuf> {
        Ok(query::checked_path(&self.resolver, source, port)?)
    }

    fn open_existing(&self, source: &str, port: u16) -> Result<RrdFile> {
        let path = self.existing_path(source, port)?;
        Ok(RrdFile::open(path)?)
    }
}

impl Datasource for RrdStore {
    fn date_boundaries(&self, source: &str) -> Result<(u64, u64)> {
        let file = self.open_existing(source, 0)?;
        Ok((Ring::new(&file, 0).oldest_timestamp(), file.last_update()))
    }

    fn last_update(&self, source: &str, port: u16) -> Result<u64> {
        Ok(self.open_existing(source, port)?.last_update())
    }

    fn create(&self, source: &str, port: u16, reset: bool) -> Result<()> {
        let start = creation_start(Utc::now()).map_err(|e| {
            error!(source, port, error = %e, "file creation failed");
            FlowError::from(e)
        })?;
        self.create_at(source, port, reset, start).map(|_| ())
    }

    fn write(&self, sample: &Sample) -> Result<()> {
        match self.try_write(sample) {
            Ok(summary) => {
                debug!(
                    source = %sample.source,
                    port = sample.port,
                    steps = summary.steps,
                    rows = summary.rows_written,
                    "sample stored"
                );
                Ok(())
            }
            Err(e) => {
                warn!(source = %sample.source, port = sample.port, error = %e, "sample rejected");
                Err(e)
            }
        }
    }

    fn query(&self, request: &QueryRequest) -> Result<ResultMatrix> {
        query::run(&self.config, &self.resolver, request).inspect_err(|e| {
            warn!(error = %e, display = %request.display, "query failed");
        })
    }

    fn reset(&self, sources: &[String]) -> Result<()> {
        let sources = if sources.is_empty() {
            self.config.sources()
        } else {
            sources
        };
        let ports = self.config.ports().iter().copied().chain([0]);

        for port in ports {
            if port != 0 {
                self.create("", port, true)?;
            }
            for source in sources {
                self.create(source, port, true)?;
            }
        }

        info!(sources = sources.len(), ports = self.config.ports().len(), "reset data files");
        Ok(())
    }

    fn resolve_path(&self, source: &str, port: u16) -> PathBuf {
        self.resolver.locate(source, port)
    }
}

/// Returns the total size of the data files under `root`.
///
/// # Errors
///
/// Returns an I/O error if `root` cannot be listed.
pub fn storage_size(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == crate::path::EXTENSION) {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
