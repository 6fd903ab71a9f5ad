//! Update engine: turns counter samples into primary points and consolidated
//! archive rows.
//!
//! # Counter semantics
//!
//! Every field is an absolute counter: each sample carries the amount
//! observed since the previous sample, and the stored quantity is the rate
//! `value / seconds since the previous update`. The rate is unknown when the
//! value is NaN or when the gap exceeds the field's heartbeat.
//!
//! # Primary points
//!
//! Seconds inside the current base step accumulate `rate * seconds` (or
//! unknown seconds) in the field's [`PdpPrep`]. Once an update crosses one or
//! more step boundaries, every completed step receives the same primary data
//! point (PDP): the accumulated amount divided by the known seconds of the
//! covered interval. A PDP is unknown when more than half of the covered
//! seconds are unknown, or when the update itself exceeded the heartbeat.
//!
//! # Consolidation
//!
//! PDP number `k` (the step ending at `k * step`) completes a row of an
//! archive with `M` steps per row whenever `k % M == 0`. The archive's
//! [`CdpPrep`] folds PDPs until then: AVERAGE keeps a sum, MAX a running
//! maximum, and both count known and unknown PDPs. A finished row is unknown
//! when unknown PDPs exceed `xff * M`.
//!
//! ```text
//!   samples ─► PdpPrep ─► PDP per step ─┬─► CdpPrep (M=1)   ─► rows
//!                                       ├─► CdpPrep (M=6)   ─► rows
//!                                       └─► CdpPrep (M=288) ─► rows
//! ```
//!
//! Long gaps are applied in closed form. All PDPs of one update share a
//! value, so every full row inside the gap has that value too, and only the
//! last `rows` of them can survive in the ring.

use serde::Serialize;

use crate::error::{Result, WriteError};
use crate::file::RrdFile;
use crate::layout::{ConsolidationFn, floor_to_step};
use crate::ring::RingWriter;

/// Scratch state of a field's current base step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdpPrep {
    /// Amount accumulated in the current step.
    pub value: f64,
    /// Seconds of the current step with an unknown rate.
    pub unknown_secs: u64,
}

impl PdpPrep {
    /// State of a freshly created file whose last update is `start`.
    pub fn primed(start: u64, step: u64) -> Self {
        Self {
            value: 0.0,
            unknown_secs: start % step,
        }
    }
}

/// Scratch state of an archive's current row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CdpPrep {
    /// Running sum (AVERAGE) or maximum (MAX), NaN before the first known PDP.
    pub value: f64,
    /// Known PDPs folded into the current row.
    pub known: u32,
    /// Unknown PDPs folded into the current row.
    pub unknown: u32,
}

impl CdpPrep {
    /// An empty row.
    pub const EMPTY: Self = Self {
        value: f64::NAN,
        known: 0,
        unknown: 0,
    };

    /// State of a freshly created file whose last update is `start`: the
    /// steps of the current row that precede `start` count as unknown.
    #[allow(clippy::cast_possible_truncation)] // bounded by pdp_per_row (u32)
    pub fn primed(start: u64, step: u64, pdp_per_row: u32) -> Self {
        Self {
            unknown: ((start / step) % u64::from(pdp_per_row)) as u32,
            ..Self::EMPTY
        }
    }

    /// Folds `count` copies of `pdp` into the row.
    fn fold(&mut self, cf: ConsolidationFn, pdp: f64, count: u32) {
        if count == 0 {
            return;
        }
        if pdp.is_nan() {
            self.unknown += count;
            return;
        }

        self.known += count;
        self.value = match (cf, self.value.is_nan()) {
            (ConsolidationFn::Average, true) => pdp * f64::from(count),
            (ConsolidationFn::Average, false) => self.value + pdp * f64::from(count),
            (ConsolidationFn::Max, true) => pdp,
            (ConsolidationFn::Max, false) => self.value.max(pdp),
        };
    }

    /// Final row value.
    fn finish(&self, cf: ConsolidationFn, pdp_per_row: u32, xff: f64) -> f64 {
        if f64::from(self.unknown) > xff * f64::from(pdp_per_row) || self.known == 0 {
            return f64::NAN;
        }
        match cf {
            ConsolidationFn::Average => self.value / f64::from(self.known),
            ConsolidationFn::Max => self.value,
        }
    }
}

/// What a single update did to the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    /// Base steps completed by the update.
    pub steps: u64,
    /// Archive rows written across all archives.
    pub rows_written: u64,
}

/// Applies one sample to `file`.
///
/// `values` holds one counter value per field in storage order; NaN marks a
/// value as unknown.
///
/// # Errors
///
/// Returns [`WriteError::Outdated`] if `timestamp` is not newer than the last
/// update, [`WriteError::FieldCount`] or [`WriteError::InvalidValue`] for
/// malformed values, and [`WriteError::File`] if the file cannot be updated.
/// Rejected samples leave the file untouched.
///
/// # Examples
///
/// ```rust,no_run
/// use flowrrd::consolidate::update;
/// use flowrrd::file::RrdFile;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut file = RrdFile::open_mut("data/gw.rrd")?;
/// let next = file.last_update() + 300;
/// let values = vec![10.0; file.field_count()];
/// update(&mut file, next, &values)?;
/// # Ok(())
/// # }
/// ```
#[allow(clippy::cast_precision_loss)] // second counts stay far below 2^52
pub fn update(file: &mut RrdFile, timestamp: u64, values: &[f64]) -> Result<UpdateSummary> {
    let last = file.last_update();
    if timestamp <= last {
        return Err(WriteError::Outdated {
            timestamp,
            last_update: last,
        }
        .into());
    }

    let field_count = file.field_count();
    if values.len() != field_count {
        return Err(WriteError::FieldCount {
            expected: field_count,
            actual: values.len(),
        }
        .into());
    }

    if let Some((field, &value)) = values.iter().enumerate().find(|(_, v)| v.is_infinite()) {
        return Err(WriteError::InvalidValue {
            field: file.field_name(field).to_string(),
            value,
        }
        .into());
    }

    let step = file.step();
    let interval = timestamp - last;
    let proc_start = floor_to_step(last, step);
    let occu_start = floor_to_step(timestamp, step);

    let mut pdps = Vec::with_capacity(field_count);
    for (field, &value) in values.iter().enumerate() {
        let heartbeat = file.heartbeat(field);
        let rate = (interval <= heartbeat && !value.is_nan()).then(|| value / interval as f64);
        let mut prep = file.pdp_prep(field);

        if occu_start <= proc_start {
            // Still inside the same step.
            match rate {
                Some(rate) => prep.value += rate * interval as f64,
                None => prep.unknown_secs += interval,
            }
            file.set_pdp_prep(field, prep).map_err(WriteError::File)?;
            continue;
        }

        let pre_int = occu_start - last;
        let post_int = timestamp - occu_start;
        match rate {
            Some(rate) => prep.value += rate * pre_int as f64,
            None => prep.unknown_secs += pre_int,
        }

        let covered = occu_start - proc_start;
        // An unknown closing value only counts for its own seconds; a gap
        // beyond the heartbeat voids the whole step.
        let pdp = if interval > heartbeat || prep.unknown_secs * 2 > covered {
            f64::NAN
        } else {
            prep.value / (covered - prep.unknown_secs) as f64
        };
        pdps.push(pdp);

        let next = match rate {
            Some(rate) => PdpPrep {
                value: rate * post_int as f64,
                unknown_secs: 0,
            },
            None => PdpPrep {
                value: 0.0,
                unknown_secs: post_int,
            },
        };
        file.set_pdp_prep(field, next).map_err(WriteError::File)?;
    }

    let mut summary = UpdateSummary::default();
    if occu_start > proc_start {
        summary.steps = (occu_start - proc_start) / step;
        summary.rows_written = consolidate(file, proc_start / step, summary.steps, &pdps)?;
    }

    file.set_last_update(timestamp).map_err(WriteError::File)?;
    Ok(summary)
}

/// Folds `steps` PDPs (per field, all equal to `pdps[field]`) following PDP
/// number `first_pdp` into every archive. Returns the number of rows written.
fn consolidate(file: &mut RrdFile, first_pdp: u64, steps: u64, pdps: &[f64]) -> Result<u64> {
    let step = file.step();
    let mut rows_written = 0;
    let mut row = vec![f64::NAN; pdps.len()];

    for archive in 0..file.archive_count() {
        let info = file.archive(archive);
        let per_row = u64::from(info.pdp_per_row);

        // Steps already folded into the current row.
        let done = first_pdp % per_row;
        let first_chunk = steps.min(per_row - done);
        let completes = first_chunk == per_row - done;

        let mut preps: Vec<CdpPrep> = (0..pdps.len()).map(|f| file.cdp_prep(archive, f)).collect();
        for (prep, &pdp) in preps.iter_mut().zip(pdps) {
            prep.fold(info.cf, pdp, chunk_count(first_chunk));
        }

        if completes {
            let mut writer = RingWriter::new(file, archive).map_err(WriteError::File)?;

            let first_row_end = (first_pdp + first_chunk) * step;
            for (value, prep) in row.iter_mut().zip(&preps) {
                *value = prep.finish(info.cf, info.pdp_per_row, info.xff);
            }
            writer.write_row(first_row_end, &row).map_err(WriteError::File)?;
            rows_written += 1;

            let remaining = steps - first_chunk;
            let full_rows = remaining / per_row;
            let tail = remaining % per_row;

            // A full row inside the gap holds `per_row` copies of the same PDP.
            for (value, &pdp) in row.iter_mut().zip(pdps) {
                let mut full = CdpPrep::EMPTY;
                full.fold(info.cf, pdp, info.pdp_per_row);
                *value = full.finish(info.cf, info.pdp_per_row, info.xff);
            }

            let kept = full_rows.min(u64::from(info.rows));
            for i in (full_rows - kept + 1)..=full_rows {
                writer.write_row(first_row_end + i * per_row * step, &row).map_err(WriteError::File)?;
                rows_written += 1;
            }

            for (prep, &pdp) in preps.iter_mut().zip(pdps) {
                *prep = CdpPrep::EMPTY;
                prep.fold(info.cf, pdp, chunk_count(tail));
            }
        }

        for (field, prep) in preps.into_iter().enumerate() {
            file.set_cdp_prep(archive, field, prep).map_err(WriteError::File)?;
        }
    }

    Ok(rows_written)
}

/// Narrows a chunk length to a PDP count. Chunks never exceed one row.
#[allow(clippy::cast_possible_truncation)]
fn chunk_count(steps: u64) -> u32 {
    steps as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{self, RrdFile};
    use crate::layout::{ArchiveLayout, ArchiveTier};
    use crate::ring::Ring;
    use std::fs::OpenOptions;
    use std::path::Path;

    const START: u64 = 1_699_920_000;

    fn layout() -> ArchiveLayout {
        ArchiveLayout {
            step: 300,
            heartbeat: 600,
            xff: 0.5,
            fields: vec!["flows".to_string(), "bytes".to_string()],
            tiers: vec![
                ArchiveTier { pdp_per_row: 1, rows: 12 },
                ArchiveTier { pdp_per_row: 4, rows: 6 },
            ],
        }
    }

    fn create(path: &Path, start: u64) -> RrdFile {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .unwrap();
        file::format(&f, path, &layout(), start).unwrap();
        drop(f);
        RrdFile::open_mut(path).unwrap()
    }

    #[test]
    fn test_primed_state() {
        assert_eq!(PdpPrep::primed(START, 300), PdpPrep { value: 0.0, unknown_secs: 0 });
        assert_eq!(PdpPrep::primed(START + 45, 300).unknown_secs, 45);

        // START is day aligned, so 300 s later one step of a 4-step row is done.
        assert_eq!(CdpPrep::primed(START, 300, 4).unknown, 0);
        assert_eq!(CdpPrep::primed(START + 300, 300, 4).unknown, 1);
        assert_eq!(CdpPrep::primed(START + 300, 300, 1).unknown, 0);
    }

    #[test]
    fn test_single_step_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        let summary = update(&mut f, START + 300, &[30.0, 3000.0]).unwrap();
        assert_eq!(summary.steps, 1);
        // One row in each of the two finest archives, none in the coarse ones.
        assert_eq!(summary.rows_written, 2);

        let ring = Ring::new(&f, 0);
        assert_eq!(ring.get(0, START + 300), 0.1);
        assert_eq!(ring.get(1, START + 300), 10.0);
        assert_eq!(f.last_update(), START + 300);
    }

    #[test]
    fn test_outdated_sample_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        update(&mut f, START + 300, &[1.0, 1.0]).unwrap();
        let err = update(&mut f, START + 300, &[1.0, 1.0]).unwrap_err();
        assert!(matches!(
            err,
            crate::FlowError::Write(WriteError::Outdated { last_update, .. }) if last_update == START + 300
        ));
        assert!(update(&mut f, START, &[1.0, 1.0]).is_err());
        assert_eq!(f.last_update(), START + 300);
    }

    #[test]
    fn test_malformed_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        assert!(matches!(
            update(&mut f, START + 300, &[1.0]),
            Err(crate::FlowError::Write(WriteError::FieldCount { expected: 2, actual: 1 }))
        ));
        assert!(matches!(
            update(&mut f, START + 300, &[1.0, f64::INFINITY]),
            Err(crate::FlowError::Write(WriteError::InvalidValue { .. }))
        ));
        assert_eq!(f.last_update(), START);
    }

    #[test]
    fn test_unknown_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        update(&mut f, START + 300, &[f64::NAN, 600.0]).unwrap();
        let ring = Ring::new(&f, 0);
        assert!(ring.get(0, START + 300).is_nan());
        assert_eq!(ring.get(1, START + 300), 2.0);
    }

    #[test]
    fn test_heartbeat_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        // 900 s gap is longer than the 600 s heartbeat.
        let summary = update(&mut f, START + 900, &[90.0, 90.0]).unwrap();
        assert_eq!(summary.steps, 3);

        let ring = Ring::new(&f, 0);
        for i in 1..=3 {
            assert!(ring.get(0, START + i * 300).is_nan());
        }

        // The next regular sample is known again.
        update(&mut f, START + 1200, &[30.0, 30.0]).unwrap();
        assert_eq!(Ring::new(&f, 0).get(0, START + 1200), 0.1);
    }

    #[test]
    fn test_two_step_gap_within_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        update(&mut f, START + 600, &[60.0, 0.0]).unwrap();
        let ring = Ring::new(&f, 0);
        assert_eq!(ring.get(0, START + 300), 0.1);
        assert_eq!(ring.get(0, START + 600), 0.1);
        assert_eq!(ring.get(1, START + 600), 0.0);
    }

    #[test]
    fn test_sub_step_updates_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        let summary = update(&mut f, START + 100, &[10.0, 0.0]).unwrap();
        assert_eq!(summary, UpdateSummary::default());
        update(&mut f, START + 300, &[50.0, 0.0]).unwrap();

        // 60 units over one 300 s step.
        assert_eq!(Ring::new(&f, 0).get(0, START + 300), 0.2);
    }

    #[test]
    fn test_unknown_closing_value_keeps_known_share() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        // 200 known seconds at 10/s, then 100 unknown seconds.
        update(&mut f, START + 200, &[2000.0, 0.0]).unwrap();
        update(&mut f, START + 300, &[f64::NAN, 0.0]).unwrap();
        assert_eq!(Ring::new(&f, 0).get(0, START + 300), 10.0);

        // Mostly unknown steps are still dropped.
        update(&mut f, START + 400, &[1000.0, 0.0]).unwrap();
        update(&mut f, START + 600, &[f64::NAN, 0.0]).unwrap();
        assert!(Ring::new(&f, 0).get(0, START + 600).is_nan());
    }

    #[test]
    fn test_average_and_max_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        // Rates 1, 2, 3, 6 per second over one 4-step row.
        for (i, rate) in [1.0, 2.0, 3.0, 6.0].into_iter().enumerate() {
            let ts = START + (i as u64 + 1) * 300;
            update(&mut f, ts, &[rate * 300.0, 0.0]).unwrap();
        }

        let avg = Ring::new(&f, 2);
        let max = Ring::new(&f, 3);
        assert_eq!(avg.get(0, START + 1200), 3.0);
        assert_eq!(max.get(0, START + 1200), 6.0);
        assert_eq!(max.newest_timestamp(), Some(START + 1200));
    }

    #[test]
    fn test_xff_marks_sparse_rows_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        // Two known steps out of four: exactly xff, still known.
        update(&mut f, START + 300, &[300.0, 0.0]).unwrap();
        update(&mut f, START + 600, &[f64::NAN, 0.0]).unwrap();
        update(&mut f, START + 900, &[f64::NAN, 0.0]).unwrap();
        update(&mut f, START + 1200, &[900.0, 0.0]).unwrap();
        assert_eq!(Ring::new(&f, 2).get(0, START + 1200), 2.0);

        // Three unknown steps out of four: too sparse.
        update(&mut f, START + 1500, &[f64::NAN, 0.0]).unwrap();
        update(&mut f, START + 1800, &[f64::NAN, 0.0]).unwrap();
        update(&mut f, START + 2100, &[f64::NAN, 0.0]).unwrap();
        update(&mut f, START + 2400, &[300.0, 0.0]).unwrap();
        assert!(Ring::new(&f, 2).get(0, START + 2400).is_nan());
    }

    #[test]
    fn test_row_alignment_after_mid_row_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        // Two steps of the first 4-step row precede creation.
        let mut f = create(&path, START + 600);

        update(&mut f, START + 900, &[300.0, 0.0]).unwrap();
        update(&mut f, START + 1200, &[300.0, 0.0]).unwrap();

        // 2 unknown + 2 known PDPs: not above xff, so the row is known.
        let avg = Ring::new(&f, 2);
        assert_eq!(avg.get(0, START + 1200), 1.0);
    }

    #[test]
    fn test_long_gap_writes_at_most_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.rrd");
        let mut f = create(&path, START);

        // 1000 steps later: far beyond both the heartbeat and the ring sizes.
        let summary = update(&mut f, START + 300_000, &[1.0, 1.0]).unwrap();
        assert_eq!(summary.steps, 1000);
        // Fine archives: 1 row completing the gap + 12 kept full rows.
        // Coarse archives: 1 completing row + 6 kept full rows.
        assert_eq!(summary.rows_written, 2 * 13 + 2 * 7);

        let ring = Ring::new(&f, 0);
        assert_eq!(ring.newest_timestamp(), Some(START + 300_000));
        assert!(ring.get(0, START + 300_000).is_nan());

        // Regular sampling resumes from the new position.
        update(&mut f, START + 300_300, &[30.0, 30.0]).unwrap();
        assert_eq!(Ring::new(&f, 0).get(0, START + 300_300), 0.1);
    }
}
