//! Error types for the flowrrd storage and query engine.
//!
//! Every public operation returns [`Result`], whose error side is the
//! umbrella [`FlowError`]. Callers that need to tell failures apart (a dropped
//! sample versus a broken configuration versus a failed query) match on the
//! wrapped category.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all flowrrd operations.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Configuration is missing or invalid. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A storage file could not be created.
    #[error("create error: {0}")]
    Create(#[from] CreateError),

    /// A sample was not accepted by the store and has been dropped.
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// A range query or export could not be answered.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// A storage file could not be opened, mapped or synced.
    #[error("file error: {0}")]
    File(#[from] FileError),

    /// The archive layout is inconsistent.
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),
}

/// Errors raised while loading or validating process configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Io {
        /// The configuration file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for the expected shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A configured source name cannot be mapped to a unique file.
    #[error("invalid source name '{name}': {reason}")]
    InvalidSource {
        /// The offending source name.
        name: String,
        /// Why the name was rejected.
        reason: String,
    },

    /// A source name appears more than once.
    #[error("source '{0}' is configured more than once")]
    DuplicateSource(String),

    /// Port 0 is reserved for the unscoped aggregate.
    #[error("port 0 cannot be configured; it denotes the unscoped aggregate")]
    ZeroPort,

    /// A port appears more than once.
    #[error("port {0} is configured more than once")]
    DuplicatePort(u16),

    /// The configured storage backend does not exist.
    #[error("unknown storage backend '{0}' (available: rrd)")]
    UnknownBackend(String),
}

/// Errors raised while materializing a storage file.
#[derive(Error, Debug)]
pub enum CreateError {
    /// The `(source, port)` pair does not identify a storage file.
    #[error("invalid storage key (source '{source_name}', port {port}): {reason}")]
    InvalidKey {
        /// The requested source.
        source_name: String,
        /// The requested port.
        port: u16,
        /// Why the key was rejected.
        reason: String,
    },

    /// The parent directory cannot be written.
    #[error("error creating '{}': not writable", path.display())]
    NotWritable {
        /// The file that was to be created.
        path: PathBuf,
    },

    /// The file exists and no reset was requested.
    #[error("error creating '{}': file already exists", path.display())]
    AlreadyExists {
        /// The existing file.
        path: PathBuf,
    },

    /// Any other filesystem failure while building or persisting the file.
    #[error("error saving data structure to '{}': {source}", path.display())]
    Io {
        /// The file that was to be created.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The new file could not be initialized.
    #[error("error initializing '{}': {source}", path.display())]
    Init {
        /// The file that was to be created.
        path: PathBuf,
        /// What went wrong while laying out the file.
        #[source]
        source: FileError,
    },

    /// The local clock cannot produce a creation start time.
    #[error("cannot compute archive start time from the system clock")]
    Clock,
}

/// Reasons a sample was rejected.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The timestamp is not newer than the last recorded update.
    #[error("illegal attempt to update using time {timestamp} when last update time is {last_update}")]
    Outdated {
        /// The (floored) timestamp of the rejected sample.
        timestamp: u64,
        /// The last update recorded in the file.
        last_update: u64,
    },

    /// The number of values does not match the file's field count.
    #[error("expected {expected} values, got {actual}")]
    FieldCount {
        /// Field count of the file.
        expected: usize,
        /// Number of values supplied.
        actual: usize,
    },

    /// A value cannot be stored.
    #[error("invalid value for field '{field}': {value}")]
    InvalidValue {
        /// The field name.
        field: String,
        /// The rejected value.
        value: f64,
    },

    /// The target file was missing and could not be created.
    #[error("cannot create target file: {0}")]
    Create(#[source] CreateError),

    /// The target file could not be opened or synced.
    #[error("cannot update target file: {0}")]
    File(#[source] FileError),
}

/// Errors returned by the query engine and the export underneath it.
///
/// These are values for the caller to display, distinct from buckets that
/// merely contain no data.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The time range is empty or inverted after alignment.
    #[error("start ({start}) must be before end ({end})")]
    InvalidTimeRange {
        /// Aligned start.
        start: u64,
        /// Aligned end.
        end: u64,
    },

    /// The row budget is zero.
    #[error("row budget must be positive")]
    InvalidRowBudget,

    /// No series could be constructed from the request.
    #[error("no series to export: {0}")]
    NoSeries(String),

    /// A file named by a series definition could not be read.
    #[error("opening '{}': {reason}", path.display())]
    Unreadable {
        /// The file path.
        path: PathBuf,
        /// The underlying diagnostic.
        reason: String,
    },

    /// The file does not contain the requested field.
    #[error("no data source named '{field}' in '{}'", path.display())]
    UnknownField {
        /// The file path.
        path: PathBuf,
        /// The missing field name.
        field: String,
    },

    /// The file has no archive for the requested consolidation function.
    #[error("no {cf} archive in '{}'", path.display())]
    NoMatchingArchive {
        /// The file path.
        path: PathBuf,
        /// The requested consolidation function.
        cf: String,
    },

    /// A request parameter could not be parsed.
    #[error("invalid {what}: '{value}'")]
    InvalidParameter {
        /// Which parameter was invalid.
        what: &'static str,
        /// The raw value supplied.
        value: String,
    },
}

/// Errors raised by the memory-mapped file layer.
#[derive(Error, Debug)]
pub enum FileError {
    /// Failed to open or lock the file.
    #[error("failed to open '{}': {source}", path.display())]
    Open {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping failed.
    #[error("memory mapping failed for '{}': {source}", path.display())]
    Map {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to flush the mapping to disk.
    #[error("failed to sync '{}': {source}", path.display())]
    Sync {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid flowrrd file.
    #[error("'{}' is corrupted: {reason}", path.display())]
    Corrupted {
        /// The file path.
        path: PathBuf,
        /// Description of the corruption.
        reason: String,
    },

    /// A mutation was attempted through a read-only handle.
    #[error("'{}' is opened read-only", path.display())]
    ReadOnly {
        /// The file path.
        path: PathBuf,
    },
}

/// Errors raised when validating an archive layout.
#[derive(Error, Debug)]
pub enum LayoutError {
    /// The base step must be positive.
    #[error("base step must be positive")]
    ZeroStep,

    /// The heartbeat is shorter than one step.
    #[error("heartbeat ({heartbeat}s) must be at least one step ({step}s)")]
    HeartbeatTooShort {
        /// The configured heartbeat.
        heartbeat: u64,
        /// The base step.
        step: u64,
    },

    /// At least one field is required.
    #[error("at least one field must be defined")]
    NoFields,

    /// A field name cannot be stored.
    #[error("invalid field name '{name}': {reason}")]
    InvalidFieldName {
        /// The field name.
        name: String,
        /// Why it is invalid.
        reason: String,
    },

    /// At least one tier is required.
    #[error("at least one tier must be configured")]
    NoTiers,

    /// A tier has zero rows or a zero step multiplier.
    #[error("tier {tier} is empty: pdp_per_row {pdp_per_row}, rows {rows}")]
    EmptyTier {
        /// The tier index.
        tier: usize,
        /// The step multiplier.
        pdp_per_row: u32,
        /// The row count.
        rows: u32,
    },

    /// Tiers are not ordered from finest to coarsest.
    #[error("tiers must be ordered from finest to coarsest resolution")]
    TiersNotOrdered,

    /// The x-files factor is out of range.
    #[error("xff must be in [0, 1), got {0}")]
    InvalidXff(f64),
}

/// Type alias for `Result<T, FlowError>`.
pub type Result<T> = std::result::Result<T, FlowError>;
