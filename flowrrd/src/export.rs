//! Multi-series range export.
//!
//! An export reads one field from one or more files and aligns the results
//! on a common time grid, consolidating as needed to stay within a row
//! budget. Each series picks its own archive; the grid step is the least
//! common multiple of the chosen archive resolutions, widened until the
//! requested range fits into `max_rows` buckets.
//!
//! # Archive selection
//!
//! The requested resolution is `max(step, ceil((end - start) / max_rows))`.
//! Among the archives with the requested consolidation function that cover
//! `start`, the one with the resolution closest to that wins, finer on ties.
//! When no archive reaches back to `start`, the one reaching furthest back
//! is used instead.
//!
//! # Buckets
//!
//! The grid runs from `start` floored to the output step to `end` rounded up
//! to it. A bucket is labeled with its end time and covers `(ts - step, ts]`;
//! its value is the mean of the known archive rows inside it, NaN if there
//! are none.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowrrd::export::{ExportRequest, SeriesDef, export};
//! use flowrrd::layout::ConsolidationFn;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let request = ExportRequest {
//!     start: 1_700_000_000,
//!     end: 1_700_086_400,
//!     max_rows: 300,
//!     series: vec![SeriesDef {
//!         path: "data/gw.rrd".into(),
//!         field: "flows_tcp".to_string(),
//!         cf: ConsolidationFn::Average,
//!         legend: "gw".to_string(),
//!     }],
//! };
//! let result = export(&request)?;
//! println!("{} rows at {}s", result.rows.len(), result.step);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{QueryError, Result};
use crate::file::RrdFile;
use crate::layout::{ConsolidationFn, floor_to_step};
use crate::ring::Ring;

/// One exported series: a field of a file under a display name.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesDef {
    /// File to read.
    pub path: PathBuf,
    /// Field name within the file.
    pub field: String,
    /// Archive consolidation function to read from.
    pub cf: ConsolidationFn,
    /// Display name of the series.
    pub legend: String,
}

/// Parameters of an export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    /// Range start in seconds since the epoch.
    pub start: u64,
    /// Range end in seconds since the epoch.
    pub end: u64,
    /// Upper bound on the number of output rows.
    pub max_rows: usize,
    /// Series in output column order.
    pub series: Vec<SeriesDef>,
}

/// Export output, row-major.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Export {
    /// Start of the grid (exclusive lower bound of the first bucket).
    pub start: u64,
    /// End of the grid (timestamp of the last bucket).
    pub end: u64,
    /// Bucket width in seconds.
    pub step: u64,
    /// Series legends in column order.
    pub legends: Vec<String>,
    /// Bucket end timestamps with one value per series; NaN means no data.
    pub rows: Vec<(u64, Vec<f64>)>,
}

/// A resolved series: where its rows come from.
#[derive(Debug, Clone, Copy)]
struct Source<'a> {
    ring: Ring<'a>,
    field: usize,
}

/// Runs an export.
///
/// Every file is opened once under a shared lock, however many series read
/// from it.
///
/// # Errors
///
/// Returns [`QueryError`] for an empty series list, an empty or inverted
/// range, a zero row budget, or a series whose file is unreadable, lacks the
/// field, or has no archive with the requested consolidation function.
pub fn export(request: &ExportRequest) -> Result<Export> {
    if request.series.is_empty() {
        return Err(QueryError::NoSeries("no series definitions given".to_string()).into());
    }
    if request.max_rows == 0 {
        return Err(QueryError::InvalidRowBudget.into());
    }
    if request.start >= request.end {
        return Err(QueryError::InvalidTimeRange {
            start: request.start,
            end: request.end,
        }
        .into());
    }

    let mut files: HashMap<&PathBuf, RrdFile> = HashMap::new();
    for def in &request.series {
        if files.contains_key(&def.path) {
            continue;
        }
        let file = RrdFile::open(&def.path).map_err(|e| QueryError::Unreadable {
            path: def.path.clone(),
            reason: e.to_string(),
        })?;
        files.insert(&def.path, file);
    }

    let mut sources = Vec::with_capacity(request.series.len());
    for def in &request.series {
        let Some(file) = files.get(&def.path) else {
            continue;
        };
        let field = file.field_index(&def.field).ok_or_else(|| QueryError::UnknownField {
            path: def.path.clone(),
            field: def.field.clone(),
        })?;
        let ring = select_archive(file, def.cf, request).ok_or_else(|| {
            QueryError::NoMatchingArchive {
                path: def.path.clone(),
                cf: def.cf.to_string(),
            }
        })?;
        sources.push(Source { ring, field });
    }

    let base = sources.iter().map(|s| s.ring.resolution()).fold(1, lcm);
    let (step, grid_start, grid_end) = fit_grid(base, request).ok_or(QueryError::InvalidTimeRange {
        start: request.start,
        end: request.end,
    })?;
    let bucket_count = usize::try_from((grid_end - grid_start) / step).unwrap_or(usize::MAX);

    let mut sums = vec![vec![(0.0_f64, 0_u32); sources.len()]; bucket_count];
    for (column, source) in sources.iter().enumerate() {
        for (ts, value) in source.ring.read(source.field, grid_start, grid_end) {
            let Ok(bucket) = usize::try_from((ts - grid_start - 1) / step) else {
                continue;
            };
            let (sum, count) = &mut sums[bucket][column];
            *sum += value;
            *count += 1;
        }
    }

    let rows = sums
        .into_iter()
        .zip((1..).map(|i| grid_start + i * step))
        .map(|(bucket, ts)| {
            let values = bucket
                .into_iter()
                .map(|(sum, count)| if count == 0 { f64::NAN } else { sum / f64::from(count) })
                .collect();
            (ts, values)
        })
        .collect();

    Ok(Export {
        start: grid_start,
        end: grid_end,
        step,
        legends: request.series.iter().map(|s| s.legend.clone()).collect(),
        rows,
    })
}

/// Picks the archive of `file` to read for `cf` over the request range.
fn select_archive<'a>(file: &'a RrdFile, cf: ConsolidationFn, request: &ExportRequest) -> Option<Ring<'a>> {
    let span = request.end - request.start;
    let wanted = file.step().max(span.div_ceil(request.max_rows as u64));

    let candidates: Vec<Ring<'a>> = (0..file.archive_count())
        .map(|a| Ring::new(file, a))
        .filter(|ring| ring.info().cf == cf)
        .collect();

    let covering = candidates
        .iter()
        .filter(|ring| ring.window_start() <= request.start)
        .min_by_key(|ring| (ring.resolution().abs_diff(wanted), ring.resolution()));

    covering
        .or_else(|| {
            candidates
                .iter()
                .min_by_key(|ring| (ring.window_start(), ring.resolution()))
        })
        .copied()
}

/// Widens `base` until the aligned grid over the request range has at most
/// `max_rows` buckets. Returns `(step, grid_start, grid_end)`, or `None` when
/// the grid does not fit in `u64` seconds.
fn fit_grid(base: u64, request: &ExportRequest) -> Option<(u64, u64, u64)> {
    let span = request.end - request.start;
    let max_rows = request.max_rows as u64;

    let mut multiple = span.div_ceil(max_rows.saturating_mul(base)).max(1);
    loop {
        let step = base.checked_mul(multiple)?;
        let grid_start = floor_to_step(request.start, step);
        let grid_end = request.end.div_ceil(step).checked_mul(step)?;
        if (grid_end - grid_start) / step <= max_rows {
            return Some((step, grid_start, grid_end));
        }
        multiple = multiple.checked_add(1)?;
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::update;
    use crate::file;
    use crate::layout::{ArchiveLayout, ArchiveTier};
    use crate::FlowError;
    use std::fs::OpenOptions;
    use std::path::Path;

    const START: u64 = 1_699_920_000;

    fn create(path: &Path, rates: &[f64]) {
        let layout = ArchiveLayout {
            step: 300,
            heartbeat: 600,
            xff: 0.5,
            fields: vec!["flows".to_string(), "bytes".to_string()],
            tiers: vec![
                ArchiveTier { pdp_per_row: 1, rows: 12 },
                ArchiveTier { pdp_per_row: 4, rows: 6 },
            ],
        };
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .unwrap();
        file::format(&f, path, &layout, START).unwrap();
        drop(f);

        let mut f = RrdFile::open_mut(path).unwrap();
        for (i, rate) in rates.iter().enumerate() {
            let ts = START + (i as u64 + 1) * 300;
            update(&mut f, ts, &[rate * 300.0, rate * 3000.0]).unwrap();
        }
    }

    fn series(path: &Path, field: &str, legend: &str) -> SeriesDef {
        SeriesDef {
            path: path.to_path_buf(),
            field: field.to_string(),
            cf: ConsolidationFn::Average,
            legend: legend.to_string(),
        }
    }

    #[test]
    fn test_lcm() {
        assert_eq!(lcm(300, 1800), 1800);
        assert_eq!(lcm(1200, 1800), 3600);
        assert_eq!(lcm(1, 300), 300);
    }

    #[test]
    fn test_fine_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rrd");
        create(&path, &[1.0, 2.0, 3.0, 4.0]);

        let result = export(&ExportRequest {
            start: START,
            end: START + 1200,
            max_rows: 300,
            series: vec![series(&path, "flows", "a"), series(&path, "bytes", "a_bytes")],
        })
        .unwrap();

        assert_eq!(result.step, 300);
        assert_eq!(result.start, START);
        assert_eq!(result.end, START + 1200);
        assert_eq!(result.legends, vec!["a", "a_bytes"]);
        let expected: Vec<(u64, Vec<f64>)> = (1..=4)
            .map(|i| (START + i * 300, vec![i as f64, i as f64 * 10.0]))
            .collect();
        assert_eq!(result.rows, expected);
    }

    #[test]
    fn test_missing_rows_are_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rrd");
        create(&path, &[1.0, 2.0]);

        let result = export(&ExportRequest {
            start: START - 600,
            end: START + 600,
            max_rows: 300,
            series: vec![series(&path, "flows", "a")],
        })
        .unwrap();

        let values: Vec<f64> = result.rows.iter().map(|(_, v)| v[0]).collect();
        assert_eq!(values.len(), 4);
        assert!(values[0].is_nan());
        assert!(values[1].is_nan());
        assert_eq!(&values[2..], &[1.0, 2.0]);
    }

    #[test]
    fn test_row_budget_selects_coarse_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rrd");
        create(&path, &[1.0, 2.0, 3.0, 6.0, 2.0, 2.0, 2.0, 2.0]);

        let result = export(&ExportRequest {
            start: START,
            end: START + 2400,
            max_rows: 2,
            series: vec![series(&path, "flows", "a")],
        })
        .unwrap();

        assert_eq!(result.step, 1200);
        assert_eq!(result.rows, vec![(START + 1200, vec![3.0]), (START + 2400, vec![2.0])]);
    }

    #[test]
    fn test_budget_widens_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rrd");
        create(&path, &[1.0, 3.0, 5.0, 7.0]);

        // 400 s requested: the fine archive is closest and its rows are averaged in pairs.
        let result = export(&ExportRequest {
            start: START,
            end: START + 1200,
            max_rows: 3,
            series: vec![series(&path, "flows", "a")],
        })
        .unwrap();

        assert_eq!(result.step, 600);
        assert_eq!(result.rows, vec![(START + 600, vec![2.0]), (START + 1200, vec![6.0])]);
    }

    #[test]
    fn test_files_with_shared_path_open_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.rrd");
        let b = dir.path().join("b.rrd");
        create(&a, &[1.0, 1.0]);
        create(&b, &[5.0, 5.0]);

        let result = export(&ExportRequest {
            start: START,
            end: START + 600,
            max_rows: 300,
            series: vec![series(&a, "flows", "a"), series(&b, "flows", "b"), series(&a, "bytes", "a2")],
        })
        .unwrap();

        assert_eq!(result.rows[1], (START + 600, vec![1.0, 5.0, 10.0]));
    }

    #[test]
    fn test_grid_overflow_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rrd");
        create(&path, &[1.0]);

        let err = export(&ExportRequest {
            start: 0,
            end: u64::MAX,
            max_rows: 300,
            series: vec![series(&path, "flows", "a")],
        })
        .unwrap_err();
        assert!(matches!(err, FlowError::Query(QueryError::InvalidTimeRange { start: 0, end: u64::MAX })));

        // Wide ranges that still fit are served.
        let result = export(&ExportRequest {
            start: 0,
            end: 4_000_000_000,
            max_rows: 300,
            series: vec![series(&path, "flows", "a")],
        })
        .unwrap();
        assert!(result.rows.len() <= 300);
    }

    #[test]
    fn test_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rrd");
        create(&path, &[1.0]);

        let request = |series: Vec<SeriesDef>, start: u64, end: u64, max_rows: usize| ExportRequest {
            start,
            end,
            max_rows,
            series,
        };

        assert!(matches!(
            export(&request(vec![], START, START + 300, 300)),
            Err(FlowError::Query(QueryError::NoSeries(_)))
        ));
        assert!(matches!(
            export(&request(vec![series(&path, "flows", "a")], START, START, 300)),
            Err(FlowError::Query(QueryError::InvalidTimeRange { .. }))
        ));
        assert!(matches!(
            export(&request(vec![series(&path, "flows", "a")], START, START + 300, 0)),
            Err(FlowError::Query(QueryError::InvalidRowBudget))
        ));
        assert!(matches!(
            export(&request(vec![series(&path, "packets", "a")], START, START + 300, 300)),
            Err(FlowError::Query(QueryError::UnknownField { .. }))
        ));

        let missing = dir.path().join("missing.rrd");
        let err = export(&request(vec![series(&missing, "flows", "a")], START, START + 300, 300)).unwrap_err();
        assert!(matches!(err, FlowError::Query(QueryError::Unreadable { .. })));
        assert!(err.to_string().contains("missing.rrd"));
    }
}
