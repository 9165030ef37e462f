//! Rotating data loggers.
//!
//! Each instrument owns two sinks: a raw sink receiving frames as they came
//! off the wire ([`raw::RawLogger`]) and a product sink receiving parsed or
//! calibrated records as CSV ([`product::ProductLogger`]). Both are written
//! synchronously by the worker, in frame order.
//!
//! Files are opened lazily on the first write and rotated when the UTC day
//! changes or when the file has been open for the rotation period. Names
//! follow `<prefix><model><serial>_YYYYMMDD_HHmmss[_N][_suffix].<ext>`,
//! where `_N` is added only if that path already exists. Existing files are
//! never overwritten.
//!
//! Failing to open a file is reported to the caller ([`InlininoError::Logger`]);
//! failing to write a single line only logs a warning.

pub mod product;
pub mod raw;

pub use product::{ProductLogger, ProductStream};
pub use raw::{RawFormat, RawLogger, TimestampLayout};

use crate::error::{AppResult, InlininoError};
use crate::record::{to_utc, utc_day};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Default rotation period.
pub const DEFAULT_ROTATION_SECS: f64 = 3600.0;

/// Where and under which name a sink creates its files.
#[derive(Debug, Clone, PartialEq)]
pub struct FileNaming {
    /// Output directory, created on first open.
    pub dir: PathBuf,
    /// `<prefix><model><serial>`
    pub basename: String,
    /// Optional suffix appended after the timestamp.
    pub suffix: Option<String>,
    /// File extension without dot.
    pub extension: String,
}

impl FileNaming {
    /// Naming without suffix.
    pub fn new(dir: impl Into<PathBuf>, basename: impl Into<String>, extension: &str) -> Self {
        Self {
            dir: dir.into(),
            basename: basename.into(),
            suffix: None,
            extension: extension.to_string(),
        }
    }

    /// Set the suffix.
    pub fn with_suffix(mut self, suffix: Option<String>) -> Self {
        self.suffix = suffix;
        self
    }

    /// Candidate path for a file stamped `timestamp`, disambiguated by `n`.
    pub fn path_for(&self, timestamp: f64, n: usize) -> PathBuf {
        let mut name = format!(
            "{}_{}",
            self.basename,
            to_utc(timestamp).format("%Y%m%d_%H%M%S")
        );
        if n > 0 {
            name.push_str(&format!("_{n}"));
        }
        if let Some(suffix) = &self.suffix {
            name.push('_');
            name.push_str(suffix);
        }
        name.push('.');
        name.push_str(&self.extension);
        self.dir.join(name)
    }

    /// Create a new file stamped `timestamp`, never reusing an existing path.
    pub fn create_unique(&self, timestamp: f64) -> AppResult<(PathBuf, File)> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            InlininoError::Logger(format!("Unable to create {}: {e}", self.dir.display()))
        })?;
        let mut n = 0;
        loop {
            let path = self.path_for(timestamp, n);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
                Err(e) => {
                    return Err(InlininoError::Logger(format!(
                        "Unable to open {}: {e}",
                        path.display()
                    )))
                }
            }
        }
    }
}

/// Rotation bookkeeping shared by every sink.
#[derive(Debug, Clone)]
pub struct Rotation {
    naming: FileNaming,
    period: f64,
    open_ts: Option<f64>,
    path: Option<PathBuf>,
}

impl Rotation {
    /// Rotate after `period` seconds (and at every UTC midnight).
    pub fn new(naming: FileNaming, period: f64) -> Self {
        Self {
            naming,
            period,
            open_ts: None,
            path: None,
        }
    }

    /// Whether a write at `t` must go to a new file.
    pub fn is_due(&self, t: f64) -> bool {
        match self.open_ts {
            None => true,
            Some(open) => utc_day(t) != utc_day(open) || t - open >= self.period,
        }
    }

    /// Create the next file. Its name is stamped `stamp`, its age counts from `t`.
    pub fn open(&mut self, t: f64, stamp: f64) -> AppResult<File> {
        let (path, file) = self.naming.create_unique(stamp)?;
        tracing::debug!(path = %path.display(), "Log file opened");
        self.open_ts = Some(t);
        self.path = Some(path);
        Ok(file)
    }

    /// Mark the current file closed.
    pub fn closed(&mut self) {
        self.open_ts = None;
    }

    /// Timestamp the current file was opened at.
    pub fn open_timestamp(&self) -> Option<f64> {
        self.open_ts
    }

    /// Path of the current (or last) file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Naming rule.
    pub fn naming(&self) -> &FileNaming {
        &self.naming
    }

    /// Rotation period in seconds.
    pub fn period(&self) -> f64 {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_pattern() {
        let naming = FileNaming::new("/data", "ACS-PROTO0042", "csv");
        // 2025-03-31T23:59:58Z
        let t = 1_743_465_598.0;
        assert_eq!(
            naming.path_for(t, 0),
            PathBuf::from("/data/ACS-PROTO0042_20250331_235958.csv")
        );
        let naming = naming.with_suffix(Some("SATPAR0001".into()));
        assert_eq!(
            naming.path_for(t, 2),
            PathBuf::from("/data/ACS-PROTO0042_20250331_235958_2_SATPAR0001.csv")
        );
    }

    #[test]
    fn same_second_files_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let naming = FileNaming::new(dir.path(), "GPS01", "raw");
        let t = 1_700_000_000.25;
        let paths: Vec<PathBuf> = (0..4)
            .map(|_| naming.create_unique(t).unwrap().0)
            .collect();
        let mut unique = paths.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 4);
        assert!(paths[1].to_string_lossy().ends_with("_1.raw"));
        assert!(paths[3].to_string_lossy().ends_with("_3.raw"));
    }

    #[test]
    fn rotation_fires_on_period_and_day() {
        let mut rotation = Rotation::new(FileNaming::new("/tmp", "x", "csv"), 10.0);
        assert!(rotation.is_due(0.0));
        rotation.open_ts = Some(1_743_465_598.0);
        assert!(!rotation.is_due(1_743_465_599.9));
        // next UTC day
        assert!(rotation.is_due(1_743_465_600.1));
        rotation.open_ts = Some(1_743_400_000.0);
        assert!(!rotation.is_due(1_743_400_009.9));
        assert!(rotation.is_due(1_743_400_010.0));
        rotation.closed();
        assert!(rotation.is_due(1_743_400_001.0));
    }
}
