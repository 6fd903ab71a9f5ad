//! Graph queries over many storage keys.
//!
//! A query names one metric class and three axes (sources, protocols,
//! ports). The `display` mode picks the axis that becomes the series of the
//! result; the other axes contribute only their first element.
//!
//! | display     | one series per | file                       | field             |
//! |-------------|----------------|----------------------------|-------------------|
//! | `protocols` | protocol       | `sources[0]`               | `type[_protocol]` |
//! | `sources`   | source         | source                     | `type[_protocols[0]]` |
//! | `ports`     | port           | `(sources[0], port)`       | `type[_protocols[0]]` |
//!
//! In `ports` mode a first source of `any` reads the port-only files.
//! Protocol `any` reads the unscoped total.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowrrd::config::Config;
//! use flowrrd::datasource::open_datasource;
//! use flowrrd::layout::MetricClass;
//! use flowrrd::query::{Display, QueryRequest};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let datasource = open_datasource(Arc::new(Config::load("flowrrd.toml")?))?;
//! let request = QueryRequest {
//!     start: 1_700_000_000,
//!     end: 1_700_086_400,
//!     class: MetricClass::Bytes,
//!     display: Display::Protocols,
//!     ..QueryRequest::default()
//! };
//! let matrix = datasource.query(&request)?;
//! println!("{:?}", matrix.legend);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{QueryError, Result};
use crate::export::{Export, ExportRequest, SeriesDef, export};
use crate::layout::{BASE_STEP, ConsolidationFn, Field, MetricClass, Protocol, floor_to_step};
use crate::path::{ANY_SOURCE, PathResolver, validate_key};

/// Upper bound on the rows of a query result.
pub const MAX_ROWS: usize = 300;

/// Axis that becomes the series of a query result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Display {
    /// One series per protocol of the first source.
    Protocols,
    /// One series per source.
    #[default]
    Sources,
    /// One series per port of the first source.
    Ports,
}

impl fmt::Display for Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Protocols => "protocols",
            Self::Sources => "sources",
            Self::Ports => "ports",
        })
    }
}

impl FromStr for Display {
    type Err = QueryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "protocols" => Ok(Self::Protocols),
            "sources" => Ok(Self::Sources),
            "ports" => Ok(Self::Ports),
            other => Err(QueryError::InvalidParameter {
                what: "display",
                value: other.to_string(),
            }),
        }
    }
}

/// A graph query. Empty axes fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Range start, seconds since the epoch.
    pub start: u64,
    /// Range end, seconds since the epoch.
    pub end: u64,
    /// Sources; defaults to the configured sources.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Protocols; defaults to tcp, udp, icmp and other.
    #[serde(default)]
    pub protocols: Vec<Protocol>,
    /// Ports; defaults to the configured ports.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Metric class.
    #[serde(rename = "type", default = "default_class")]
    pub class: MetricClass,
    /// Series axis.
    #[serde(default)]
    pub display: Display,
}

fn default_class() -> MetricClass {
    MetricClass::Flows
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            start: 0,
            end: 0,
            sources: Vec::new(),
            protocols: Vec::new(),
            ports: Vec::new(),
            class: default_class(),
            display: Display::default(),
        }
    }
}

/// Time-aligned query output.
///
/// `data` maps each bucket timestamp to one value per legend entry, in
/// legend order. `None` marks a bucket without data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMatrix {
    /// Values per bucket timestamp.
    pub data: BTreeMap<u64, Vec<Option<f64>>>,
    /// Start of the result grid.
    pub start: u64,
    /// End of the result grid.
    pub end: u64,
    /// Bucket width in seconds.
    pub step: u64,
    /// Series names.
    pub legend: Vec<String>,
}

impl From<Export> for ResultMatrix {
    fn from(export: Export) -> Self {
        let data = export
            .rows
            .into_iter()
            .map(|(ts, values)| {
                let values = values.into_iter().map(|v| v.is_finite().then_some(v)).collect();
                (ts, values)
            })
            .collect();

        Self {
            data,
            start: export.start,
            end: export.end,
            step: export.step,
            legend: export.legends,
        }
    }
}

/// Joins the non-empty legend parts with `_`.
fn legend(parts: &[&str]) -> String {
    parts.iter().filter(|p| !p.is_empty()).copied().collect::<Vec<_>>().join("_")
}

/// Legend part for a port; the unscoped port 0 contributes nothing.
fn port_part(port: u16) -> String {
    if port == 0 { String::new() } else { port.to_string() }
}

/// Rejects keys that do not name a storage file under the root.
pub(crate) fn checked_path(resolver: &PathResolver, source: &str, port: u16) -> std::result::Result<std::path::PathBuf, QueryError> {
    validate_key(source, port).map_err(|_| QueryError::InvalidParameter {
        what: "source",
        value: if port == 0 { source.to_string() } else { format!("{source}:{port}") },
    })?;
    Ok(resolver.locate(source, port))
}

/// Builds the export series for `request`, applying axis defaults from
/// `config`.
///
/// # Errors
///
/// Returns [`QueryError::NoSeries`] when a needed axis is empty after
/// defaulting, and [`QueryError::InvalidParameter`] for a source (or
/// source and port) that does not name a storage file.
pub fn build_series(config: &Config, resolver: &PathResolver, request: &QueryRequest) -> Result<Vec<SeriesDef>> {
    let protocols: Vec<Protocol> = if request.protocols.is_empty() {
        Protocol::DEFAULT_QUERY.to_vec()
    } else {
        request.protocols.clone()
    };
    let sources: Vec<String> = if request.sources.is_empty() {
        config.sources().to_vec()
    } else {
        request.sources.clone()
    };
    let ports: Vec<u16> = if request.ports.is_empty() {
        config.ports().to_vec()
    } else {
        request.ports.clone()
    };

    let class = request.class;
    let first_source = || {
        sources
            .first()
            .map(String::as_str)
            .ok_or_else(|| QueryError::NoSeries("no source configured or requested".to_string()))
    };
    // Protocols always has at least the defaults.
    let first_protocol = protocols.first().copied().unwrap_or(Protocol::Any);

    let series = match request.display {
        Display::Protocols => {
            let source = first_source()?;
            let path = checked_path(resolver, source, 0)?;
            protocols
                .iter()
                .map(|&protocol| SeriesDef {
                    path: path.clone(),
                    field: Field::new(class, protocol).name(),
                    cf: ConsolidationFn::Average,
                    legend: legend(&[protocol.as_str(), class.as_str(), source]),
                })
                .collect::<Vec<_>>()
        }
        Display::Sources => sources
            .iter()
            .map(|source| {
                Ok(SeriesDef {
                    path: checked_path(resolver, source, 0)?,
                    field: Field::new(class, first_protocol).name(),
                    cf: ConsolidationFn::Average,
                    legend: legend(&[source.as_str(), class.as_str(), first_protocol.as_str()]),
                })
            })
            .collect::<std::result::Result<Vec<_>, QueryError>>()?,
        Display::Ports => {
            let source = match first_source()? {
                ANY_SOURCE => "",
                source => source,
            };
            ports
                .iter()
                .map(|&port| {
                    Ok(SeriesDef {
                        path: checked_path(resolver, source, port)?,
                        field: Field::new(class, first_protocol).name(),
                        cf: ConsolidationFn::Average,
                        legend: legend(&[port_part(port).as_str(), class.as_str(), source, first_protocol.as_str()]),
                    })
                })
                .collect::<std::result::Result<Vec<_>, QueryError>>()?
        }
    };

    if series.is_empty() {
        return Err(QueryError::NoSeries(format!("no {} to display", request.display)).into());
    }
    Ok(series)
}

/// Runs a query: floors the range, builds the series, exports with the
/// AVERAGE archives and reshapes the result.
///
/// # Errors
///
/// Returns [`QueryError`] if no series can be built or the export fails.
pub fn run(config: &Config, resolver: &PathResolver, request: &QueryRequest) -> Result<ResultMatrix> {
    let series = build_series(config, resolver, request)?;
    let export = export(&ExportRequest {
        start: floor_to_step(request.start, BASE_STEP),
        end: floor_to_step(request.end, BASE_STEP),
        max_rows: MAX_ROWS,
        series,
    })?;
    Ok(export.into())
}
