//! Ring semantics over one archive of a [`RrdFile`].
//!
//! Every archive is a fixed ring of rows. A row consolidated for the window
//! ending at `ts` lives in slot `(ts / resolution) % rows`, and the slot's
//! timestamp column records `ts`. A slot whose recorded timestamp differs
//! from the one being looked up is stale (overwritten by a newer lap or
//! never written) and reads as unknown.
//!
//! # Coverage
//!
//! An archive nominally covers the `rows` windows ending at the newest row
//! boundary at or before the file's last update, whether or not every one
//! of those rows holds data. [`Ring::oldest_timestamp`] and
//! [`Ring::window_start`] are derived from that nominal coverage, which is
//! what archive selection during export needs.

use crate::error::FileError;
use crate::file::{ArchiveInfo, FileResult, RrdFile};
use crate::layout::floor_to_step;

/// Read view of a single archive.
#[derive(Debug, Clone, Copy)]
pub struct Ring<'a> {
    file: &'a RrdFile,
    archive: usize,
    info: ArchiveInfo,
    resolution: u64,
}

impl<'a> Ring<'a> {
    /// Creates a view of archive `archive` of `file`.
    pub fn new(file: &'a RrdFile, archive: usize) -> Self {
        let info = file.archive(archive);
        let resolution = file.step() * u64::from(info.pdp_per_row);
        Self {
            file,
            archive,
            info,
            resolution,
        }
    }

    /// Archive definition.
    pub fn info(&self) -> ArchiveInfo {
        self.info
    }

    /// Seconds covered by one row.
    pub fn resolution(&self) -> u64 {
        self.resolution
    }

    /// Slot holding the row that ends at `timestamp`.
    #[inline]
    #[allow(clippy::cast_possible_truncation)] // bounded by rows (u32)
    pub fn slot(&self, timestamp: u64) -> usize {
        ((timestamp / self.resolution) % u64::from(self.info.rows)) as usize
    }

    /// Value of `field` for the row ending at `timestamp`, NaN when the row is
    /// stale or was never written.
    pub fn get(&self, field: usize, timestamp: u64) -> f64 {
        let slot = self.slot(timestamp);
        if self.file.row_timestamp(self.archive, slot) == timestamp {
            self.file.value(self.archive, slot, field)
        } else {
            f64::NAN
        }
    }

    /// End time of the newest row that has been written.
    pub fn newest_timestamp(&self) -> Option<u64> {
        match self.file.row_timestamp(self.archive, self.info.cur_row as usize) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// End time of the oldest row the archive nominally covers.
    pub fn oldest_timestamp(&self) -> u64 {
        let last_row = floor_to_step(self.file.last_update(), self.resolution);
        last_row.saturating_sub(u64::from(self.info.rows - 1) * self.resolution)
    }

    /// Earliest instant covered by the archive (start of its oldest row).
    pub fn window_start(&self) -> u64 {
        self.oldest_timestamp().saturating_sub(self.resolution)
    }

    /// Iterates over the rows of `field` ending in `(start, end]`, oldest
    /// first, skipping stale slots and unknown values.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use flowrrd::file::RrdFile;
    /// use flowrrd::ring::Ring;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let file = RrdFile::open("data/gw.rrd")?;
    /// let end = file.last_update();
    /// for (ts, flows) in Ring::new(&file, 0).read(0, end - 3600, end) {
    ///     println!("{ts}: {flows}");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn read(&self, field: usize, start: u64, end: u64) -> RingIterator<'a> {
        let first = floor_to_step(start, self.resolution) + self.resolution;
        RingIterator {
            ring: *self,
            field,
            next: first.max(self.oldest_timestamp()),
            end,
        }
    }
}

/// Iterator returned by [`Ring::read`].
#[derive(Debug)]
pub struct RingIterator<'a> {
    ring: Ring<'a>,
    field: usize,
    next: u64,
    end: u64,
}

impl Iterator for RingIterator<'_> {
    type Item = (u64, f64);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next <= self.end {
            let ts = self.next;
            self.next += self.ring.resolution;

            let value = self.ring.get(self.field, ts);
            if !value.is_nan() {
                return Some((ts, value));
            }
        }
        None
    }
}

/// Write access to a single archive.
#[derive(Debug)]
pub struct RingWriter<'a> {
    file: &'a mut RrdFile,
    archive: usize,
    resolution: u64,
    rows: u64,
}

impl<'a> RingWriter<'a> {
    /// Creates a writer for archive `archive` of `file`.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::ReadOnly`] if `file` was opened for reading.
    pub fn new(file: &'a mut RrdFile, archive: usize) -> FileResult<Self> {
        if !file.is_writable() {
            return Err(FileError::ReadOnly {
                path: file.path().to_path_buf(),
            });
        }
        let info = file.archive(archive);
        let resolution = file.step() * u64::from(info.pdp_per_row);
        Ok(Self {
            file,
            archive,
            resolution,
            rows: u64::from(info.rows),
        })
    }

    /// Writes the row ending at `timestamp` and makes it the newest row.
    ///
    /// `values` holds one value per field, in storage order.
    ///
    /// # Errors
    ///
    /// Returns [`FileError`] if the underlying file rejects the write.
    #[allow(clippy::cast_possible_truncation)] // bounded by rows (u32)
    pub fn write_row(&mut self, timestamp: u64, values: &[f64]) -> FileResult<()> {
        let slot = ((timestamp / self.resolution) % self.rows) as usize;
        self.file.set_row_timestamp(self.archive, slot, timestamp)?;
        for (field, &value) in values.iter().enumerate() {
            self.file.set_value(self.archive, slot, field, value)?;
        }
        self.file.set_cur_row(self.archive, slot as u32)
    }
}
