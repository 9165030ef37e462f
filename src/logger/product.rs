//! CSV product sink.
//!
//! One rotating CSV file per product stream. Most instruments have a single
//! stream; instruments multiplexing several frame types (Satlantic) declare
//! one stream per frame header, and the stream name becomes the file suffix.

use super::{FileNaming, Rotation};
use crate::error::AppResult;
use crate::record::{format_log_time, utc_day, Record, Schema};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Second header line marker for the time column.
pub const TIME_FORMAT_MARKER: &str = "yyyy/mm/dd HH:MM:SS.fff";

/// A product stream declared by an instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductStream {
    /// Stream name; `None` for the default stream.
    pub name: Option<String>,
    /// Columns written to the stream.
    pub schema: Schema,
}

impl ProductStream {
    /// The default (unnamed) stream.
    pub fn single(schema: Schema) -> Self {
        Self { name: None, schema }
    }

    /// A named stream, written to files suffixed with its name.
    pub fn named(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: Some(name.into()),
            schema,
        }
    }
}

#[derive(Debug)]
struct ProductSink {
    rotation: Rotation,
    schema: Schema,
    writer: Option<csv::Writer<File>>,
}

impl ProductSink {
    fn new(naming: FileNaming, period: f64, schema: Schema) -> Self {
        Self {
            rotation: Rotation::new(naming, period),
            schema,
            writer: None,
        }
    }

    fn open(&mut self, t: f64, stamp: f64) -> AppResult<()> {
        self.close();
        let file = self.rotation.open(t, stamp)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .terminator(csv::Terminator::CRLF)
            .from_writer(file);

        let names = std::iter::once("time").chain(self.schema.names.iter().map(String::as_str));
        let units =
            std::iter::once(TIME_FORMAT_MARKER).chain(self.schema.units.iter().map(String::as_str));
        let header = writer
            .write_record(names)
            .and_then(|_| writer.write_record(units))
            .and_then(|_| writer.flush().map_err(csv::Error::from));
        if let Err(e) = header {
            warn!(path = ?self.rotation.path(), "Unable to write header: {}", e);
        }
        self.writer = Some(writer);
        Ok(())
    }

    fn write(&mut self, record: &Record, t: f64, stamp: f64) -> AppResult<bool> {
        if self.writer.is_none() || self.rotation.is_due(t) {
            self.open(t, stamp)?;
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(false);
        };
        let mut row = Vec::with_capacity(self.schema.len() + 1);
        row.push(format_log_time(t));
        row.extend(self.schema.format_row(&record.values));
        let written = writer
            .write_record(&row)
            .and_then(|_| writer.flush().map_err(csv::Error::from));
        match written {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(path = ?self.rotation.path(), "Unable to write product line: {}", e);
                Ok(false)
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!(path = ?self.rotation.path(), "Unable to flush product log: {}", e);
            }
        }
        self.rotation.closed();
    }
}

/// Product logger of one instrument.
#[derive(Debug)]
pub struct ProductLogger {
    sinks: BTreeMap<Option<String>, ProductSink>,
}

impl ProductLogger {
    /// Create a logger writing `streams` under `dir`.
    ///
    /// No file is created until the first write.
    pub fn new(
        dir: impl Into<PathBuf>,
        basename: &str,
        period: f64,
        streams: Vec<ProductStream>,
    ) -> Self {
        let dir = dir.into();
        let sinks = streams
            .into_iter()
            .map(|stream| {
                let naming =
                    FileNaming::new(&dir, basename, "csv").with_suffix(stream.name.clone());
                (stream.name, ProductSink::new(naming, period, stream.schema))
            })
            .collect();
        Self { sinks }
    }

    /// Write a record to the stream it belongs to.
    ///
    /// `stamp_hint` is the open timestamp of the companion raw file, so both
    /// sinks of an instrument carry the same name stamp. Returns whether a
    /// line was written. Fails only when a file cannot be opened.
    pub fn write(&mut self, record: &Record, t: f64, stamp_hint: Option<f64>) -> AppResult<bool> {
        let key = if self.sinks.contains_key(&record.stream) {
            record.stream.clone()
        } else if record.stream.is_none() && self.sinks.len() == 1 {
            self.sinks.keys().next().cloned().flatten()
        } else {
            warn!(stream = ?record.stream, "No product stream for record");
            return Ok(false);
        };
        let Some(sink) = self.sinks.get_mut(&key) else {
            return Ok(false);
        };
        let stamp = stamp_hint
            .filter(|s| utc_day(*s) == utc_day(t) && t - s < sink.rotation.period() && *s <= t)
            .unwrap_or(t);
        sink.write(record, t, stamp)
    }

    /// Flush and close every open file.
    pub fn close(&mut self) {
        for sink in self.sinks.values_mut() {
            sink.close();
        }
    }

    /// Path of the current (or last) file of a stream.
    pub fn path(&self, stream: Option<&str>) -> Option<&Path> {
        self.sinks
            .get(&stream.map(str::to_string))
            .and_then(|s| s.rotation.path())
    }

    /// Declared stream names.
    pub fn streams(&self) -> impl Iterator<Item = Option<&str>> {
        self.sinks.keys().map(|k| k.as_deref())
    }
}

impl Drop for ProductLogger {
    fn drop(&mut self) {
        self.close();
    }
}
