//! Mapping from storage keys to file paths.
//!
//! | source | port | path                      |
//! |--------|------|---------------------------|
//! | `gw`   | 0    | `<root>/gw.rrd`           |
//! | (none) | 443  | `<root>/443.rrd`          |
//! | `gw`   | 443  | `<root>/gw_443.rrd`       |
//!
//! The mapping is injective only for source names accepted by
//! [`validate_source`]; configuration and the store reject anything else.

use std::path::{Path, PathBuf};

use tracing::info;

/// File extension of storage files.
pub const EXTENSION: &str = "rrd";

/// Source name reserved for "all sources" in port queries.
pub const ANY_SOURCE: &str = "any";

/// Checks that `name` can be used as a source without colliding with
/// another key's file.
///
/// # Errors
///
/// Returns a short reason when the name is rejected.
///
/// # Examples
///
/// ```rust
/// use flowrrd::path::validate_source;
///
/// assert!(validate_source("edge-router.1").is_ok());
/// assert!(validate_source("443").is_err());
/// assert!(validate_source("gw_443").is_err());
/// assert!(validate_source("../etc").is_err());
/// ```
pub fn validate_source(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name.contains(['/', '\\', '\0']) {
        return Err("name contains a path separator");
    }
    if name.starts_with('.') {
        return Err("name starts with '.'");
    }
    if name.bytes().all(|b| b.is_ascii_digit()) {
        // Would collide with the port-only file.
        return Err("name is all digits");
    }
    if let Some((_, suffix)) = name.rsplit_once('_')
        && !suffix.is_empty()
        && suffix.bytes().all(|b| b.is_ascii_digit())
    {
        // Would collide with another source's port file.
        return Err("name ends in '_' followed by digits");
    }
    if name == ANY_SOURCE {
        return Err("'any' is reserved");
    }
    Ok(())
}

/// Checks that `(source, port)` identifies a storage file.
///
/// # Errors
///
/// Returns a short reason when the key is rejected.
pub fn validate_key(source: &str, port: u16) -> Result<(), &'static str> {
    if source.is_empty() {
        return if port == 0 {
            Err("an empty source requires a port")
        } else {
            Ok(())
        };
    }
    validate_source(source)
}

/// Resolves storage keys to paths under a storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Creates a resolver rooted at `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file for `(source, port)`. Pure; never touches the disk.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::path::Path;
    /// use flowrrd::path::PathResolver;
    ///
    /// let resolver = PathResolver::new("/var/flows");
    /// assert_eq!(resolver.resolve("gw", 0), Path::new("/var/flows/gw.rrd"));
    /// assert_eq!(resolver.resolve("", 443), Path::new("/var/flows/443.rrd"));
    /// assert_eq!(resolver.resolve("gw", 443), Path::new("/var/flows/gw_443.rrd"));
    /// ```
    pub fn resolve(&self, source: &str, port: u16) -> PathBuf {
        let stem = match (source, port) {
            (source, 0) => source.to_string(),
            ("", port) => port.to_string(),
            (source, port) => format!("{source}_{port}"),
        };
        self.root.join(format!("{stem}.{EXTENSION}"))
    }

    /// Like [`resolve`](Self::resolve), but logs when the file does not exist
    /// yet. The path is returned either way.
    pub fn locate(&self, source: &str, port: u16) -> PathBuf {
        let path = self.resolve(source, port);
        if !path.exists() {
            info!(path = %path.display(), source, port, "no data file for key yet");
        }
        path
    }
}
