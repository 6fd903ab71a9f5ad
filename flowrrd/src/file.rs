//! Memory-mapped round-robin file format.
//!
//! One file holds every counter of a single storage key. The layout is fixed
//! at creation and never changes afterwards; only the header state, the
//! consolidation scratch areas and the archive rows are rewritten in place.
//!
//! # File Format
//!
//! All integers and floats are little-endian.
//!
//! ```text
//! [0..64)                    Header
//! [64..64+48F)               Field definitions (F = field count)
//! [..+48A)                   Archive definitions (A = archive count)
//! [..+16AF)                  Consolidation scratch, per archive then field
//! [..)                       Archive data, per archive:
//!                              timestamp column (rows * u64)
//!                              one value column per field (rows * f64)
//! ```
//!
//! Header: magic `FRRD`, version u32, step u64, last update u64, field count
//! u32, archive count u32, 32 reserved bytes.
//!
//! Field definition: NUL padded name (20 bytes), 4 padding bytes, heartbeat
//! u64, primary point scratch value f64, primary point unknown seconds u64.
//!
//! Archive definition: consolidation code u32, steps per row u32, rows u32,
//! newest row u32, xff f64, 24 reserved bytes.
//!
//! Consolidation scratch: value f64, known count u32, unknown count u32.
//!
//! A timestamp of zero marks a row that was never written. Value slots start
//! as NaN.
//!
//! # Locking
//!
//! [`RrdFile::open`] takes a shared advisory lock and maps the file
//! read-only; [`RrdFile::open_mut`] takes an exclusive lock and maps it
//! read-write. Locks are held for the lifetime of the handle.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::consolidate::{CdpPrep, PdpPrep};
use crate::error::FileError;
use crate::layout::{ArchiveLayout, ConsolidationFn};

/// Magic bytes identifying a flowrrd file.
const MAGIC: [u8; 4] = *b"FRRD";

/// Current file format version.
const VERSION: u32 = 1;

const HEADER_SIZE: usize = 64;
const FIELD_DEF_SIZE: usize = 48;
const ARCHIVE_DEF_SIZE: usize = 48;
const CDP_PREP_SIZE: usize = 16;
const SLOT_SIZE: usize = 8;
const FIELD_NAME_SIZE: usize = 20;

/// Result type of the file layer.
pub type FileResult<T> = std::result::Result<T, FileError>;

/// Archive definition as stored in the file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveInfo {
    /// Consolidation function.
    pub cf: ConsolidationFn,
    /// Base steps per row.
    pub pdp_per_row: u32,
    /// Rows in the ring.
    pub rows: u32,
    /// Index of the newest written row.
    pub cur_row: u32,
    /// X-files factor.
    pub xff: f64,
}

/// Byte offsets of every region, derived from the counts in the header.
#[derive(Debug, Clone)]
struct Geometry {
    field_count: usize,
    archive_defs_offset: usize,
    cdp_offset: usize,
    data_offsets: Vec<usize>,
    rows: Vec<usize>,
    file_size: usize,
}

impl Geometry {
    fn new(field_count: usize, rows: &[usize]) -> Self {
        let archive_defs_offset = HEADER_SIZE + field_count * FIELD_DEF_SIZE;
        let cdp_offset = archive_defs_offset + rows.len() * ARCHIVE_DEF_SIZE;
        let mut offset = cdp_offset + rows.len() * field_count * CDP_PREP_SIZE;

        let mut data_offsets = Vec::with_capacity(rows.len());
        for &r in rows {
            data_offsets.push(offset);
            offset += r * SLOT_SIZE * (field_count + 1);
        }

        Self {
            field_count,
            archive_defs_offset,
            cdp_offset,
            data_offsets,
            rows: rows.to_vec(),
            file_size: offset,
        }
    }

    fn field_def(&self, field: usize) -> usize {
        HEADER_SIZE + field * FIELD_DEF_SIZE
    }

    fn archive_def(&self, archive: usize) -> usize {
        self.archive_defs_offset + archive * ARCHIVE_DEF_SIZE
    }

    fn cdp_prep(&self, archive: usize, field: usize) -> usize {
        self.cdp_offset + (archive * self.field_count + field) * CDP_PREP_SIZE
    }

    fn timestamp(&self, archive: usize, row: usize) -> usize {
        self.data_offsets[archive] + row * SLOT_SIZE
    }

    fn value(&self, archive: usize, row: usize, field: usize) -> usize {
        let rows = self.rows[archive];
        self.data_offsets[archive] + (1 + field) * rows * SLOT_SIZE + row * SLOT_SIZE
    }
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn get_f64(buf: &[u8], at: usize) -> f64 {
    f64::from_bits(get_u64(buf, at))
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_f64(buf: &mut [u8], at: usize, value: f64) {
    put_u64(buf, at, value.to_bits());
}

#[derive(Debug)]
enum Mapping {
    Read(Mmap),
    Write(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Read(map) => map,
            Self::Write(map) => map,
        }
    }
}

/// Writes a fresh file for `layout` into an already opened, empty file.
///
/// Every archive row is unwritten, the last update is `start`, and the
/// consolidation scratch areas are primed so that the first consolidated
/// rows line up with calendar boundaries of their resolution.
///
/// # Errors
///
/// Returns [`FileError`] if the layout is invalid or the file cannot be
/// resized, mapped or flushed.
pub fn format(file: &File, path: &Path, layout: &ArchiveLayout, start: u64) -> FileResult<()> {
    let corrupted = |reason: String| FileError::Corrupted {
        path: path.to_path_buf(),
        reason,
    };
    layout.validate().map_err(|e| corrupted(e.to_string()))?;

    let archives: Vec<_> = layout.archives().collect();
    let rows: Vec<usize> = archives.iter().map(|a| a.rows as usize).collect();
    let geometry = Geometry::new(layout.fields.len(), &rows);

    file.set_len(geometry.file_size as u64).map_err(|e| FileError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;

    // SAFETY: The file was sized above and is exclusively owned by the caller
    // until it is persisted under its final name.
    let mut map = unsafe {
        MmapMut::map_mut(file).map_err(|e| FileError::Map {
            path: path.to_path_buf(),
            source: e,
        })?
    };
    let buf: &mut [u8] = &mut map;

    buf[0..4].copy_from_slice(&MAGIC);
    put_u32(buf, 4, VERSION);
    put_u64(buf, 8, layout.step);
    put_u64(buf, 16, start);
    put_u32(buf, 24, u32::try_from(layout.fields.len()).map_err(|e| corrupted(e.to_string()))?);
    put_u32(buf, 28, u32::try_from(archives.len()).map_err(|e| corrupted(e.to_string()))?);

    let pdp = PdpPrep::primed(start, layout.step);
    for (i, name) in layout.fields.iter().enumerate() {
        let at = geometry.field_def(i);
        buf[at..at + name.len()].copy_from_slice(name.as_bytes());
        put_u64(buf, at + 24, layout.heartbeat);
        put_f64(buf, at + 32, pdp.value);
        put_u64(buf, at + 40, pdp.unknown_secs);
    }

    for (a, spec) in archives.iter().enumerate() {
        let at = geometry.archive_def(a);
        put_u32(buf, at, spec.cf.code());
        put_u32(buf, at + 4, spec.pdp_per_row);
        put_u32(buf, at + 8, spec.rows);
        put_u32(buf, at + 12, 0);
        put_f64(buf, at + 16, spec.xff);

        let cdp = CdpPrep::primed(start, layout.step, spec.pdp_per_row);
        for f in 0..layout.fields.len() {
            let at = geometry.cdp_prep(a, f);
            put_f64(buf, at, cdp.value);
            put_u32(buf, at + 8, cdp.known);
            put_u32(buf, at + 12, cdp.unknown);
        }

        // Timestamp column stays zero; value columns start unknown.
        let values_start = geometry.value(a, 0, 0);
        let values_end = geometry.data_offsets[a] + rows[a] * SLOT_SIZE * (layout.fields.len() + 1);
        let nan = f64::NAN.to_bits().to_le_bytes();
        for slot in buf[values_start..values_end].chunks_exact_mut(SLOT_SIZE) {
            slot.copy_from_slice(&nan);
        }
    }

    map.flush().map_err(|e| FileError::Sync {
        path: path.to_path_buf(),
        source: e,
    })
}

/// An open flowrrd file.
///
/// Read-only handles share the file with other readers. Writable handles are
/// exclusive: a second writer or any reader blocks until the handle is
/// dropped.
#[derive(Debug)]
pub struct RrdFile {
    map: Mapping,
    geometry: Geometry,
    path: PathBuf,
    // Holds the advisory lock for the lifetime of the handle.
    _file: File,
}

impl RrdFile {
    /// Opens a file for reading under a shared lock.
    ///
    /// # Errors
    ///
    /// Returns [`FileError`] if the file cannot be opened, locked or mapped,
    /// or if its contents are not a valid flowrrd file.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use flowrrd::file::RrdFile;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let file = RrdFile::open("data/router1.rrd")?;
    /// println!("{} fields, last update {}", file.field_count(), file.last_update());
    /// # Ok(())
    /// # }
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        let path = path.as_ref();
        let open_err = |e| FileError::Open {
            path: path.to_path_buf(),
            source: e,
        };

        let file = File::open(path).map_err(open_err)?;
        file.lock_shared().map_err(open_err)?;

        // SAFETY: Writers take an exclusive lock before mutating the mapping,
        // and the shared lock held here keeps them out while we read.
        let map = unsafe {
            Mmap::map(&file).map_err(|e| FileError::Map {
                path: path.to_path_buf(),
                source: e,
            })?
        };

        Self::from_mapping(Mapping::Read(map), file, path)
    }

    /// Opens a file for updating under an exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`FileError`] if the file cannot be opened, locked or mapped,
    /// or if its contents are not a valid flowrrd file.
    pub fn open_mut<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        let path = path.as_ref();
        let open_err = |e| FileError::Open {
            path: path.to_path_buf(),
            source: e,
        };

        let file = OpenOptions::new().read(true).write(true).open(path).map_err(open_err)?;
        file.lock().map_err(open_err)?;

        // SAFETY: The exclusive lock held by this handle keeps every other
        // flowrrd reader and writer away from the mapping.
        let map = unsafe {
            MmapMut::map_mut(&file).map_err(|e| FileError::Map {
                path: path.to_path_buf(),
                source: e,
            })?
        };

        Self::from_mapping(Mapping::Write(map), file, path)
    }

    fn from_mapping(map: Mapping, file: File, path: &Path) -> FileResult<Self> {
        let corrupted = |reason: String| FileError::Corrupted {
            path: path.to_path_buf(),
            reason,
        };
        let buf = map.bytes();

        if buf.len() < HEADER_SIZE {
            return Err(corrupted(format!(
                "file too small: {} bytes, expected at least {HEADER_SIZE}",
                buf.len()
            )));
        }
        if buf[0..4] != MAGIC {
            return Err(corrupted(format!("invalid magic bytes: {:?}", &buf[0..4])));
        }
        let version = get_u32(buf, 4);
        if version != VERSION {
            return Err(corrupted(format!(
                "unsupported version: expected {VERSION}, found {version}"
            )));
        }
        if get_u64(buf, 8) == 0 {
            return Err(corrupted("step is zero".to_string()));
        }

        let field_count = get_u32(buf, 24) as usize;
        let archive_count = get_u32(buf, 28) as usize;
        let defs_end = HEADER_SIZE + field_count * FIELD_DEF_SIZE + archive_count * ARCHIVE_DEF_SIZE;
        if field_count == 0 || archive_count == 0 || buf.len() < defs_end {
            return Err(corrupted(format!(
                "invalid counts: {field_count} fields, {archive_count} archives"
            )));
        }

        let archive_defs_offset = HEADER_SIZE + field_count * FIELD_DEF_SIZE;
        let mut rows = Vec::with_capacity(archive_count);
        for a in 0..archive_count {
            let at = archive_defs_offset + a * ARCHIVE_DEF_SIZE;
            let code = get_u32(buf, at);
            let archive_rows = get_u32(buf, at + 8);
            if ConsolidationFn::from_code(code).is_none() {
                return Err(corrupted(format!("archive {a} has unknown consolidation code {code}")));
            }
            if archive_rows == 0 || get_u32(buf, at + 4) == 0 {
                return Err(corrupted(format!("archive {a} is empty")));
            }
            if get_u32(buf, at + 12) >= archive_rows {
                return Err(corrupted(format!("archive {a} row cursor out of range")));
            }
            rows.push(archive_rows as usize);
        }

        let geometry = Geometry::new(field_count, &rows);
        if buf.len() != geometry.file_size {
            return Err(corrupted(format!(
                "file size mismatch: {} bytes, expected {}",
                buf.len(),
                geometry.file_size
            )));
        }

        Ok(Self {
            map,
            geometry,
            path: path.to_path_buf(),
            _file: file,
        })
    }

    fn bytes(&self) -> &[u8] {
        self.map.bytes()
    }

    fn bytes_mut(&mut self) -> FileResult<&mut [u8]> {
        match &mut self.map {
            Mapping::Write(map) => Ok(map),
            Mapping::Read(_) => Err(FileError::ReadOnly {
                path: self.path.clone(),
            }),
        }
    }

    /// Returns the path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether this handle may mutate the file.
    pub fn is_writable(&self) -> bool {
        matches!(self.map, Mapping::Write(_))
    }

    /// Base step in seconds.
    pub fn step(&self) -> u64 {
        get_u64(self.bytes(), 8)
    }

    /// Time of the last accepted update.
    pub fn last_update(&self) -> u64 {
        get_u64(self.bytes(), 16)
    }

    /// Records the time of the last accepted update.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::ReadOnly`] on a read-only handle.
    pub fn set_last_update(&mut self, timestamp: u64) -> FileResult<()> {
        put_u64(self.bytes_mut()?, 16, timestamp);
        Ok(())
    }

    /// Number of fields.
    pub fn field_count(&self) -> usize {
        self.geometry.field_count
    }

    /// Name of the field at `field`.
    pub fn field_name(&self, field: usize) -> &str {
        let at = self.geometry.field_def(field);
        let raw = &self.bytes()[at..at + FIELD_NAME_SIZE];
        let len = raw.iter().position(|&b| b == 0).unwrap_or(FIELD_NAME_SIZE);
        std::str::from_utf8(&raw[..len]).unwrap_or("")
    }

    /// Names of all fields in storage order.
    pub fn field_names(&self) -> Vec<String> {
        (0..self.field_count()).map(|f| self.field_name(f).to_string()).collect()
    }

    /// Index of the field called `name`.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        (0..self.field_count()).find(|&f| self.field_name(f) == name)
    }

    /// Heartbeat of the field at `field`, in seconds.
    pub fn heartbeat(&self, field: usize) -> u64 {
        get_u64(self.bytes(), self.geometry.field_def(field) + 24)
    }

    /// Primary point scratch state of a field.
    pub fn pdp_prep(&self, field: usize) -> PdpPrep {
        let at = self.geometry.field_def(field);
        PdpPrep {
            value: get_f64(self.bytes(), at + 32),
            unknown_secs: get_u64(self.bytes(), at + 40),
        }
    }

    /// Stores the primary point scratch state of a field.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::ReadOnly`] on a read-only handle.
    pub fn set_pdp_prep(&mut self, field: usize, prep: PdpPrep) -> FileResult<()> {
        let at = self.geometry.field_def(field);
        let buf = self.bytes_mut()?;
        put_f64(buf, at + 32, prep.value);
        put_u64(buf, at + 40, prep.unknown_secs);
        Ok(())
    }

    /// Number of archives.
    pub fn archive_count(&self) -> usize {
        self.geometry.rows.len()
    }

    /// Definition of the archive at `archive`.
    pub fn archive(&self, archive: usize) -> ArchiveInfo {
        let at = self.geometry.archive_def(archive);
        let buf = self.bytes();
        ArchiveInfo {
            // Codes were validated when the file was opened.
            cf: ConsolidationFn::from_code(get_u32(buf, at)).unwrap_or(ConsolidationFn::Average),
            pdp_per_row: get_u32(buf, at + 4),
            rows: get_u32(buf, at + 8),
            cur_row: get_u32(buf, at + 12),
            xff: get_f64(buf, at + 16),
        }
    }

    /// Marks `row` as the newest row of an archive.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::ReadOnly`] on a read-only handle.
    pub fn set_cur_row(&mut self, archive: usize, row: u32) -> FileResult<()> {
        let at = self.geometry.archive_def(archive) + 12;
        put_u32(self.bytes_mut()?, at, row);
        Ok(())
    }

    /// Consolidation scratch state of one archive and field.
    pub fn cdp_prep(&self, archive: usize, field: usize) -> CdpPrep {
        let at = self.geometry.cdp_prep(archive, field);
        let buf = self.bytes();
        CdpPrep {
            value: get_f64(buf, at),
            known: get_u32(buf, at + 8),
            unknown: get_u32(buf, at + 12),
        }
    }

    /// Stores the consolidation scratch state of one archive and field.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::ReadOnly`] on a read-only handle.
    pub fn set_cdp_prep(&mut self, archive: usize, field: usize, prep: CdpPrep) -> FileResult<()> {
        let at = self.geometry.cdp_prep(archive, field);
        let buf = self.bytes_mut()?;
        put_f64(buf, at, prep.value);
        put_u32(buf, at + 8, prep.known);
        put_u32(buf, at + 12, prep.unknown);
        Ok(())
    }

    /// Timestamp stored in a row, zero if the row was never written.
    pub fn row_timestamp(&self, archive: usize, row: usize) -> u64 {
        get_u64(self.bytes(), self.geometry.timestamp(archive, row))
    }

    /// Sets the timestamp of a row.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::ReadOnly`] on a read-only handle.
    pub fn set_row_timestamp(&mut self, archive: usize, row: usize, timestamp: u64) -> FileResult<()> {
        let at = self.geometry.timestamp(archive, row);
        put_u64(self.bytes_mut()?, at, timestamp);
        Ok(())
    }

    /// Value stored for one field in a row.
    pub fn value(&self, archive: usize, row: usize, field: usize) -> f64 {
        get_f64(self.bytes(), self.geometry.value(archive, row, field))
    }

    /// Sets the value of one field in a row.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::ReadOnly`] on a read-only handle.
    pub fn set_value(&mut self, archive: usize, row: usize, field: usize, value: f64) -> FileResult<()> {
        let at = self.geometry.value(archive, row, field);
        put_f64(self.bytes_mut()?, at, value);
        Ok(())
    }

    /// Flushes pending changes to disk. A no-op on read-only handles.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Sync`] if the flush fails.
    pub fn sync(&self) -> FileResult<()> {
        match &self.map {
            Mapping::Write(map) => map.flush().map_err(|e| FileError::Sync {
                path: self.path.clone(),
                source: e,
            }),
            Mapping::Read(_) => Ok(()),
        }
    }
}
