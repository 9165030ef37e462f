//! Raw frame sink.
//!
//! Text instruments log one line per frame (`time,<frame>`, invalid UTF-8
//! replaced). Binary instruments log `<frame bytes><timestamp>` after an
//! optional fixed header block written once per file. The timestamp is a
//! big-endian IEEE-754 double, or the 7-byte SatView date/time tag for
//! Satlantic instruments.

use super::{FileNaming, Rotation};
use crate::error::AppResult;
use crate::record::{format_log_time, to_utc};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Layout of the raw log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFormat {
    /// One line per frame.
    Text {
        /// Write the `time,packet` header line.
        header: bool,
        /// Bytes prepended to every frame (registration or prompt).
        prefix: Vec<u8>,
    },
    /// Packed frames followed by their timestamp.
    Binary {
        /// Block written at the top of every file.
        header_block: Option<Vec<u8>>,
        /// Encoding of the trailing timestamp.
        timestamp: TimestampLayout,
        /// File extension.
        extension: &'static str,
    },
}

/// Encoding of the timestamp appended to binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampLayout {
    /// Seconds since epoch, big-endian `f64`.
    Double,
    /// `YYYYDDD` and `HHMMSSmmm` as big-endian `i32`s, first byte dropped.
    SatView,
}

impl TimestampLayout {
    /// Encode `t`.
    pub fn encode(&self, t: f64) -> Vec<u8> {
        match self {
            TimestampLayout::Double => t.to_be_bytes().to_vec(),
            TimestampLayout::SatView => {
                let utc = to_utc(t.trunc());
                let millis = ((t - t.trunc()) * 1000.0) as i32;
                let date: i32 = utc.format("%Y%j").to_string().parse().unwrap_or_default();
                let time: i32 = utc.format("%H%M%S").to_string().parse().unwrap_or_default();
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(&date.to_be_bytes());
                out.extend_from_slice(&(time * 1000 + millis).to_be_bytes());
                out.split_off(1)
            }
        }
    }
}

impl RawFormat {
    /// Text layout with the default header and no prefix.
    pub fn text() -> Self {
        RawFormat::Text {
            header: true,
            prefix: Vec::new(),
        }
    }

    /// Binary layout with a trailing double and no header block.
    pub fn binary() -> Self {
        RawFormat::Binary {
            header_block: None,
            timestamp: TimestampLayout::Double,
            extension: "bin",
        }
    }

    /// File extension.
    pub fn extension(&self) -> &'static str {
        match self {
            RawFormat::Text { .. } => "raw",
            RawFormat::Binary { extension, .. } => *extension,
        }
    }
}

/// Raw logger of one instrument.
#[derive(Debug)]
pub struct RawLogger {
    rotation: Rotation,
    format: RawFormat,
    writer: Option<BufWriter<File>>,
}

impl RawLogger {
    /// Create a logger under `dir`. No file is created until the first write.
    pub fn new(dir: impl Into<PathBuf>, basename: &str, period: f64, format: RawFormat) -> Self {
        let naming = FileNaming::new(dir, basename, format.extension());
        Self {
            rotation: Rotation::new(naming, period),
            format,
            writer: None,
        }
    }

    fn open(&mut self, t: f64) -> AppResult<()> {
        self.close();
        let file = self.rotation.open(t, t)?;
        let mut writer = BufWriter::new(file);
        let header = match &self.format {
            RawFormat::Text { header: true, .. } => Some(b"time,packet\r\n".to_vec()),
            RawFormat::Binary {
                header_block: Some(block),
                ..
            } => Some(block.clone()),
            _ => None,
        };
        if let Some(header) = header {
            if let Err(e) = writer.write_all(&header).and_then(|_| writer.flush()) {
                warn!(path = ?self.rotation.path(), "Unable to write raw header: {}", e);
            }
        }
        self.writer = Some(writer);
        Ok(())
    }

    /// Append a frame received at `t`.
    ///
    /// Returns whether the frame was written. Fails only when a file cannot
    /// be opened.
    pub fn write(&mut self, frame: &[u8], t: f64) -> AppResult<bool> {
        if self.writer.is_none() || self.rotation.is_due(t) {
            self.open(t)?;
        }
        let line = match &self.format {
            RawFormat::Text { prefix, .. } => {
                let mut line = format_log_time(t).into_bytes();
                line.push(b',');
                line.extend_from_slice(String::from_utf8_lossy(prefix).as_bytes());
                line.extend_from_slice(String::from_utf8_lossy(frame).as_bytes());
                line.extend_from_slice(b"\r\n");
                line
            }
            RawFormat::Binary { timestamp, .. } => {
                let mut packed = Vec::with_capacity(frame.len() + 8);
                packed.extend_from_slice(frame);
                packed.extend_from_slice(&timestamp.encode(t));
                packed
            }
        };
        let Some(writer) = self.writer.as_mut() else {
            return Ok(false);
        };
        match writer.write_all(&line).and_then(|_| writer.flush()) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(path = ?self.rotation.path(), "Unable to write raw frame: {}", e);
                Ok(false)
            }
        }
    }

    /// Flush and close the current file.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!(path = ?self.rotation.path(), "Unable to flush raw log: {}", e);
            }
        }
        self.rotation.closed();
    }

    /// Timestamp the current file was opened at.
    pub fn open_timestamp(&self) -> Option<f64> {
        self.rotation.open_timestamp()
    }

    /// Path of the current (or last) file.
    pub fn path(&self) -> Option<&Path> {
        self.rotation.path()
    }

    /// Layout in use.
    pub fn format(&self) -> &RawFormat {
        &self.format
    }
}

impl Drop for RawLogger {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_lines_replace_invalid_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = RawLogger::new(dir.path(), "GPS01", 3600.0, RawFormat::text());
        let t = 1_743_465_598.0;
        assert!(logger.write(b"$GPZDA,1", t).unwrap());
        assert!(logger.write(&[b'a', 0xff, b'b'], t + 0.5).unwrap());
        let path = logger.path().unwrap().to_path_buf();
        logger.close();
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            content,
            "time,packet\r\n\
             2025/03/31 23:59:58.000,$GPZDA,1\r\n\
             2025/03/31 23:59:58.500,a\u{fffd}b\r\n"
        );
    }

    #[test]
    fn prefix_is_logged_before_each_frame() {
        let dir = tempfile::tempdir().unwrap();
        let format = RawFormat::Text {
            header: false,
            prefix: b"L100x:>".to_vec(),
        };
        let mut logger = RawLogger::new(dir.path(), "LISST", 3600.0, format);
        logger.write(b"{1\r\n2}", 0.0).unwrap();
        let content = std::fs::read_to_string(logger.path().unwrap()).unwrap();
        assert_eq!(content, "1970/01/01 00:00:00.000,L100x:>{1\r\n2}\r\n");
    }

    #[test]
    fn binary_frames_carry_big_endian_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let format = RawFormat::Binary {
            header_block: Some(b"HDR".to_vec()),
            timestamp: TimestampLayout::Double,
            extension: "bin",
        };
        let mut logger = RawLogger::new(dir.path(), "ACS", 3600.0, format);
        logger.write(&[0xff, 0x00, 0xff, 0x00, 0x42], 1.5).unwrap();
        let path = logger.path().unwrap().to_path_buf();
        assert_eq!(path.extension().unwrap(), "bin");
        logger.close();
        let bytes = std::fs::read(path).unwrap();
        assert_eq!(&bytes[..3], b"HDR");
        assert_eq!(&bytes[3..8], &[0xff, 0x00, 0xff, 0x00, 0x42]);
        assert_eq!(f64::from_be_bytes(bytes[8..16].try_into().unwrap()), 1.5);
    }

    #[test]
    fn satview_timestamp_is_seven_bytes() {
        // 2025-03-31T23:59:58.250Z, day of year 090
        let tag = TimestampLayout::SatView.encode(1_743_465_598.25);
        assert_eq!(tag.len(), 7);
        assert_eq!(&tag[..3], &2_025_090i32.to_be_bytes()[1..]);
        assert_eq!(&tag[3..], &235_958_250i32.to_be_bytes());
    }

    #[test]
    fn rotation_opens_new_file_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = RawLogger::new(dir.path(), "R", 10.0, RawFormat::text());
        logger.write(b"a", 100.0).unwrap();
        let first = logger.path().unwrap().to_path_buf();
        logger.write(b"b", 110.0).unwrap();
        let second = logger.path().unwrap().to_path_buf();
        assert_ne!(first, second);
        let content = std::fs::read_to_string(second).unwrap();
        assert!(content.starts_with("time,packet\r\n"));
        assert_eq!(logger.open_timestamp(), Some(110.0));
    }
}
