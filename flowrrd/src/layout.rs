//! Archive layout and counter vocabulary for flowrrd files.
//!
//! The layout determines which counters a file holds and how samples are
//! downsampled into retention tiers. flowrrd uses a single compiled-in
//! layout, [`ArchiveLayout::flows`], for every storage key; the type stays
//! general so the file and consolidation layers can be exercised with small
//! layouts in tests.
//!
//! # Fixed layout
//!
//! | tier | step multiplier | rows  | resolution | span      |
//! |------|-----------------|-------|------------|-----------|
//! | 0    | 1               | 12960 | 5 min      | 45 days   |
//! | 1    | 6               | 4320  | 30 min     | 90 days   |
//! | 2    | 24              | 4320  | 2 h        | 360 days  |
//! | 3    | 288             | 1080  | 1 day      | 1080 days |
//!
//! Every tier is materialized once with [`ConsolidationFn::Average`] and once
//! with [`ConsolidationFn::Max`], giving eight archives per file.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, QueryError, Result};

/// Base sampling interval in seconds. Samples are floored to this grid.
pub const BASE_STEP: u64 = 300;

/// Longest gap, in seconds, between two updates before rates become unknown.
pub const HEARTBEAT: u64 = 600;

/// Fraction of unknown primary points a consolidated row may contain.
pub const XFF: f64 = 0.5;

/// Longest field name the file format can store (name slots are 20 bytes,
/// NUL terminated).
pub const MAX_FIELD_NAME_LEN: usize = 19;

/// Floors a timestamp to the previous multiple of `step`.
///
/// # Examples
///
/// ```rust
/// use flowrrd::layout::floor_to_step;
///
/// assert_eq!(floor_to_step(1_000, 300), 900);
/// assert_eq!(floor_to_step(900, 300), 900);
/// ```
#[inline]
pub fn floor_to_step(timestamp: u64, step: u64) -> u64 {
    timestamp - timestamp % step
}

/// Metric class of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricClass {
    /// Number of flows.
    Flows,
    /// Number of packets.
    Packets,
    /// Number of bytes.
    Bytes,
}

impl MetricClass {
    /// All metric classes in file order.
    pub const ALL: [Self; 3] = [Self::Flows, Self::Packets, Self::Bytes];

    /// Returns the lowercase name used in field names and legends.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flows => "flows",
            Self::Packets => "packets",
            Self::Bytes => "bytes",
        }
    }
}

impl fmt::Display for MetricClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricClass {
    type Err = QueryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "flows" => Ok(Self::Flows),
            "packets" => Ok(Self::Packets),
            "bytes" => Ok(Self::Bytes),
            other => Err(QueryError::InvalidParameter {
                what: "type",
                value: other.to_string(),
            }),
        }
    }
}

/// Protocol scope of a counter or query axis.
///
/// [`Protocol::Any`] selects the unscoped (total) counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// All protocols together.
    Any,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
    /// Everything that is not TCP, UDP or ICMP.
    Other,
}

impl Protocol {
    /// Protocol scopes in file order, starting with the unscoped total.
    pub const ALL: [Self; 5] = [Self::Any, Self::Tcp, Self::Udp, Self::Icmp, Self::Other];

    /// Protocols queried when a request names none.
    pub const DEFAULT_QUERY: [Self; 4] = [Self::Tcp, Self::Udp, Self::Icmp, Self::Other];

    /// Returns the lowercase protocol name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = QueryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "any" => Ok(Self::Any),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            "other" => Ok(Self::Other),
            other => Err(QueryError::InvalidParameter {
                what: "protocol",
                value: other.to_string(),
            }),
        }
    }
}

/// One of the fifteen counters stored per file.
///
/// # Examples
///
/// ```rust
/// use flowrrd::layout::{Field, MetricClass, Protocol};
///
/// let field = Field::new(MetricClass::Packets, Protocol::Udp);
/// assert_eq!(field.name(), "packets_udp");
/// assert_eq!("packets_udp".parse::<Field>().unwrap(), field);
/// assert_eq!(Field::new(MetricClass::Flows, Protocol::Any).name(), "flows");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Field {
    /// The metric class.
    pub class: MetricClass,
    /// The protocol scope; [`Protocol::Any`] is the unscoped total.
    pub protocol: Protocol,
}

impl Field {
    /// Creates a field from its class and protocol scope.
    pub fn new(class: MetricClass, protocol: Protocol) -> Self {
        Self { class, protocol }
    }

    /// Iterates over all fifteen fields in file order.
    pub fn all() -> impl Iterator<Item = Self> {
        MetricClass::ALL
            .into_iter()
            .flat_map(|class| Protocol::ALL.into_iter().map(move |p| Self::new(class, p)))
    }

    /// Returns the stored field name, e.g. `bytes` or `flows_icmp`.
    pub fn name(self) -> String {
        match self.protocol {
            Protocol::Any => self.class.as_str().to_string(),
            p => format!("{}_{}", self.class, p),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Field {
    type Err = QueryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || QueryError::InvalidParameter {
            what: "field",
            value: s.to_string(),
        };
        let (class, protocol) = match s.split_once('_') {
            Some((class, protocol)) => {
                let protocol: Protocol = protocol.parse().map_err(|_| invalid())?;
                if protocol == Protocol::Any {
                    return Err(invalid());
                }
                (class, protocol)
            }
            None => (s, Protocol::Any),
        };
        let class = class.parse().map_err(|_| invalid())?;
        Ok(Self::new(class, protocol))
    }
}

impl TryFrom<String> for Field {
    type Error = QueryError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Field> for String {
    fn from(field: Field) -> Self {
        field.name()
    }
}

/// Aggregation used when downsampling primary points into a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsolidationFn {
    /// Arithmetic mean of the known points.
    Average,
    /// Maximum of the known points.
    Max,
}

impl ConsolidationFn {
    /// Numeric code stored in the file.
    pub(crate) fn code(self) -> u32 {
        match self {
            Self::Average => 0,
            Self::Max => 1,
        }
    }

    /// Decodes a stored code.
    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Average),
            1 => Some(Self::Max),
            _ => None,
        }
    }

    /// Returns the rrdtool-style name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::Max => "MAX",
        }
    }
}

impl fmt::Display for ConsolidationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsolidationFn {
    type Err = QueryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AVERAGE" => Ok(Self::Average),
            "MAX" => Ok(Self::Max),
            _ => Err(QueryError::InvalidParameter {
                what: "consolidation function",
                value: s.to_string(),
            }),
        }
    }
}

/// A retention rule: one row per `pdp_per_row` base steps, `rows` rows kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveTier {
    /// Base steps consolidated into one row.
    pub pdp_per_row: u32,
    /// Number of rows retained.
    pub rows: u32,
}

impl ArchiveTier {
    /// Resolution of this tier in seconds.
    pub fn resolution(&self, step: u64) -> u64 {
        u64::from(self.pdp_per_row) * step
    }

    /// Time span covered by this tier in seconds.
    pub fn span(&self, step: u64) -> u64 {
        self.resolution(step) * u64::from(self.rows)
    }
}

/// One materialized archive: a tier paired with a consolidation function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSpec {
    /// Consolidation function.
    pub cf: ConsolidationFn,
    /// Base steps per row.
    pub pdp_per_row: u32,
    /// Rows retained.
    pub rows: u32,
    /// Fraction of unknown points tolerated per row.
    pub xff: f64,
}

/// Field set and retention tiers of a storage file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveLayout {
    /// Base step in seconds.
    pub step: u64,
    /// Heartbeat in seconds, shared by all fields.
    pub heartbeat: u64,
    /// X-files factor shared by all archives.
    pub xff: f64,
    /// Field names in storage order.
    pub fields: Vec<String>,
    /// Tiers, finest first.
    pub tiers: Vec<ArchiveTier>,
}

impl ArchiveLayout {
    /// The compiled-in layout used for every flow counter file.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowrrd::layout::ArchiveLayout;
    ///
    /// let layout = ArchiveLayout::flows();
    /// assert_eq!(layout.fields.len(), 15);
    /// assert_eq!(layout.archives().count(), 8);
    /// ```
    pub fn flows() -> Self {
        Self {
            step: BASE_STEP,
            heartbeat: HEARTBEAT,
            xff: XFF,
            fields: Field::all().map(Field::name).collect(),
            tiers: vec![
                // 45 days of 5 minute rows
                ArchiveTier { pdp_per_row: 1, rows: 12 * 24 * 45 },
                // 90 days of 30 minute rows
                ArchiveTier { pdp_per_row: 6, rows: 2 * 24 * 90 },
                // 360 days of 2 hour rows
                ArchiveTier { pdp_per_row: 24, rows: 12 * 360 },
                // 1080 days of daily rows
                ArchiveTier { pdp_per_row: 288, rows: 1080 },
            ],
        }
    }

    /// Iterates over the archives in file order: every tier, AVERAGE then MAX.
    pub fn archives(&self) -> impl Iterator<Item = ArchiveSpec> + '_ {
        self.tiers.iter().flat_map(move |tier| {
            [ConsolidationFn::Average, ConsolidationFn::Max]
                .into_iter()
                .map(move |cf| ArchiveSpec {
                    cf,
                    pdp_per_row: tier.pdp_per_row,
                    rows: tier.rows,
                    xff: self.xff,
                })
        })
    }

    /// Validates the layout.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError`] if the layout cannot be stored or consolidated.
    pub fn validate(&self) -> Result<()> {
        if self.step == 0 {
            return Err(LayoutError::ZeroStep.into());
        }

        if self.heartbeat < self.step {
            return Err(LayoutError::HeartbeatTooShort {
                heartbeat: self.heartbeat,
                step: self.step,
            }
            .into());
        }

        if !(0.0..1.0).contains(&self.xff) {
            return Err(LayoutError::InvalidXff(self.xff).into());
        }

        if self.fields.is_empty() {
            return Err(LayoutError::NoFields.into());
        }

        let mut seen = HashSet::new();
        for name in &self.fields {
            let reason = if name.is_empty() {
                Some("name is empty")
            } else if name.len() > MAX_FIELD_NAME_LEN {
                Some("name is longer than 19 bytes")
            } else if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                Some("only ASCII letters, digits and '_' are allowed")
            } else if !seen.insert(name.as_str()) {
                Some("name is defined twice")
            } else {
                None
            };

            if let Some(reason) = reason {
                return Err(LayoutError::InvalidFieldName {
                    name: name.clone(),
                    reason: reason.to_string(),
                }
                .into());
            }
        }

        if self.tiers.is_empty() {
            return Err(LayoutError::NoTiers.into());
        }

        for (tier, config) in self.tiers.iter().enumerate() {
            if config.pdp_per_row == 0 || config.rows == 0 {
                return Err(LayoutError::EmptyTier {
                    tier,
                    pdp_per_row: config.pdp_per_row,
                    rows: config.rows,
                }
                .into());
            }
        }

        for window in self.tiers.windows(2) {
            if window[0].pdp_per_row >= window[1].pdp_per_row {
                return Err(LayoutError::TiersNotOrdered.into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(0, 300), 0);
        assert_eq!(floor_to_step(299, 300), 0);
        assert_eq!(floor_to_step(300, 300), 300);
        assert_eq!(floor_to_step(1_700_000_123, 300), 1_700_000_100);
    }

    #[test]
    fn test_field_names_in_file_order() {
        let names: Vec<String> = Field::all().map(Field::name).collect();
        assert_eq!(names, vec![
            "flows",
            "flows_tcp",
            "flows_udp",
            "flows_icmp",
            "flows_other",
            "packets",
            "packets_tcp",
            "packets_udp",
            "packets_icmp",
            "packets_other",
            "bytes",
            "bytes_tcp",
            "bytes_udp",
            "bytes_icmp",
            "bytes_other",
        ]);
    }

    #[test]
    fn test_field_parse() {
        for field in Field::all() {
            assert_eq!(field.name().parse::<Field>().unwrap(), field);
        }
        assert!("flows_any".parse::<Field>().is_err());
        assert!("traffic".parse::<Field>().is_err());
        assert!("flows_sctp".parse::<Field>().is_err());
    }

    #[test]
    fn test_field_serde_as_string() {
        let field = Field::new(MetricClass::Bytes, Protocol::Icmp);
        let json = serde_json::to_string(&field).unwrap();
        assert_eq!(json, "\"bytes_icmp\"");
        let back: Field = serde_json::from_str(&json).unwrap();
        assert_eq!(back, field);
    }

    #[test]
    fn test_flows_layout() {
        let layout = ArchiveLayout::flows();
        layout.validate().unwrap();

        assert_eq!(layout.step, 300);
        assert_eq!(layout.heartbeat, 600);
        assert_eq!(layout.fields.len(), 15);

        let spans: Vec<u64> = layout.tiers.iter().map(|t| t.span(layout.step) / 86_400).collect();
        assert_eq!(spans, vec![45, 90, 360, 1080]);

        let archives: Vec<_> = layout.archives().collect();
        assert_eq!(archives.len(), 8);
        assert_eq!(archives[0].cf, ConsolidationFn::Average);
        assert_eq!(archives[1].cf, ConsolidationFn::Max);
        assert_eq!(archives[1].pdp_per_row, 1);
        assert_eq!(archives[7].pdp_per_row, 288);
        assert_eq!(archives[7].rows, 1080);
    }

    #[test]
    fn test_layout_validation() {
        let mut layout = ArchiveLayout::flows();
        layout.tiers.reverse();
        assert!(layout.validate().is_err());

        let mut layout = ArchiveLayout::flows();
        layout.fields.push("flows".to_string());
        assert!(layout.validate().is_err());

        let mut layout = ArchiveLayout::flows();
        layout.fields.push("a_very_long_field_name".to_string());
        assert!(layout.validate().is_err());

        let mut layout = ArchiveLayout::flows();
        layout.heartbeat = 100;
        assert!(layout.validate().is_err());

        let mut layout = ArchiveLayout::flows();
        layout.xff = 1.0;
        assert!(layout.validate().is_err());

        let mut layout = ArchiveLayout::flows();
        layout.tiers[0].rows = 0;
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_parse_axes() {
        assert_eq!("bytes".parse::<MetricClass>().unwrap(), MetricClass::Bytes);
        assert!("traffic".parse::<MetricClass>().is_err());
        assert_eq!("any".parse::<Protocol>().unwrap(), Protocol::Any);
        assert_eq!("max".parse::<ConsolidationFn>().unwrap(), ConsolidationFn::Max);
    }
}
