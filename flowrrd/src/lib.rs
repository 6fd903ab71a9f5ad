//! # flowrrd
//!
//! Round-robin storage and query engine for network flow counters.
//!
//! flowrrd keeps per-source, per-port traffic counters (flows, packets and
//! bytes, split by protocol) in fixed-size memory-mapped files. Each file
//! holds several consolidation tiers, from 5-minute rows kept for 45 days
//! down to daily rows kept for three years, so its size never grows with the
//! data. Queries pick the best tier for the requested range and reshape the
//! result into a time-indexed matrix ready for graphing.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - One file per `(source, port)` key, laid out up front
//! - Consolidation (average and maximum) happens at write time
//! - Readers take shared locks and writers exclusive ones, per file
//! - No background threads and no compaction
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use flowrrd::{open_datasource, Config, Field, MetricClass, Protocol, QueryRequest, Sample};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(Config::from_toml_str(r#"
//!     [general]
//!     sources = ["gw"]
//!     ports = [443]
//!     storage_root = "./data"
//! "#)?);
//! let datasource = open_datasource(config)?;
//!
//! // Record one 5-minute sample
//! let mut fields = BTreeMap::new();
//! fields.insert(Field::new(MetricClass::Flows, Protocol::Any), 1200.0);
//! fields.insert(Field::new(MetricClass::Flows, Protocol::Tcp), 900.0);
//! datasource.write(&Sample {
//!     source: "gw".to_string(),
//!     port: 0,
//!     timestamp: 1_700_000_000,
//!     fields,
//! })?;
//!
//! // Flows per second by protocol over the last day
//! let result = datasource.query(&QueryRequest {
//!     start: 1_700_000_000 - 86_400,
//!     end: 1_700_000_000,
//!     sources: vec!["gw".to_string()],
//!     ..QueryRequest::default()
//! })?;
//! for (timestamp, values) in &result.data {
//!     println!("{timestamp}: {values:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`datasource`] - Backend contract and backend selection
//! - [`store`] - The round-robin file backend
//! - [`query`] - Graph queries and result reshaping
//! - [`export`] - Multi-series export over a common time grid
//! - [`consolidate`] - Sample ingestion and consolidation
//! - [`ring`] - Time-indexed view over one archive
//! - [`file`] - Memory-mapped file format
//! - [`layout`] - Fields, tiers and archive layout
//! - [`path`] - Storage key to file path mapping
//! - [`config`] - Process configuration
//! - [`error`] - Error types

pub mod config;
pub mod consolidate;
pub mod datasource;
pub mod error;
pub mod export;
pub mod file;
pub mod layout;
pub mod path;
pub mod query;
pub mod ring;
pub mod store;

// Re-export primary API types at crate root for convenience.
pub use config::Config;
pub use datasource::{Backend, Datasource, Sample, open_datasource};
pub use error::{FlowError, Result};
pub use export::{Export, ExportRequest, SeriesDef, export};
pub use layout::{ArchiveLayout, ConsolidationFn, Field, MetricClass, Protocol};
pub use path::PathResolver;
pub use query::{Display, QueryRequest, ResultMatrix};
pub use store::{FileInfo, RrdStore};
