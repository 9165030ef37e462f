//! Satlantic radiometers and other instruments described by telemetry
//! definition files.
//!
//! Each `.tdf`/`.cal` file describes one frame type. A field line reads
//!
//! ```text
//! TYPE ID 'UNITS' LENGTH DATATYPE CALLINES FIT
//! ```
//!
//! followed by `CALLINES` lines of coefficients. The `INSTRUMENT` and `SN`
//! ids make up the frame header. Fields with the `DELIMITER` fit separate
//! variable length ASCII fields; their units hold the delimiter bytes.
//!
//! Every frame type is written to its own product file, suffixed with its
//! header. The spectral group (the largest run of fields sharing a type
//! with numeric ids) is written as a single array column.

use super::{
    ActiveChannels, ControlCommand, FeatureFlags, InstrumentConfig, InstrumentStrategy,
    UiDescriptor,
};
use crate::bus::{InstrumentEvent, MetadataEntry};
use crate::error::{AppResult, InlininoError, ParseError};
use crate::framer::{find, Frame, FrameEnd, FramingStrategy, HeaderRule};
use crate::logger::{ProductStream, RawFormat, TimestampLayout};
use crate::record::{Record, Schema, Value};
use crate::store::bytes::ByteString;
use crate::transport::SerialParams;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extensions accepted for telemetry definition files.
pub const VALID_EXTENSIONS: &[&str] = &["tdf", "cal"];

/// Keys of fields closing a frame.
pub const TERMINATOR_KEYS: &[&str] = &["CRLF_TERMINATOR", "TERMINATOR"];

/// Keys kept in the product log but not shown as metadata.
pub const HIDDEN_METADATA_KEYS: &[&str] = &["DATEFIELD", "TIMEFIELD", "CHECK_SUM"];

/// Keys of the SatView header block, in file order.
pub const SATHDR_KEYS: [&str; 25] = [
    "CRUISE-ID",
    "OPERATOR",
    "INVESTIGATOR",
    "AFFILIATION",
    "CONTACT",
    "EXPERIMENT",
    "LATITUDE",
    "LONGITUDE",
    "ZONE",
    "CLOUD_PERCENT",
    "WAVE_HEIGHT",
    "WIND_SPEED",
    "COMMENT",
    "DOCUMENT",
    "STATION-ID",
    "CAST",
    "TIME-STAMP",
    "MODE",
    "TIMETAG",
    "DATETAG",
    "TIMETAG2",
    "PROFILER",
    "REFERENCE",
    "PRO-DARK",
    "REF-DARK",
];

const SATHDR_SENTENCE_LEN: usize = 128;

/// Raw log rotation of Satlantic instruments (one file per day).
pub const SATLANTIC_ROTATION_SECS: f64 = 86_400.0;

/// Buffer ceiling; hyperspectral frames are large.
pub const SATLANTIC_BUFFER_CEILING: usize = 1 << 18;

/// SatView header block written at the top of every raw file.
pub fn sathdr_block(comment: &str) -> Vec<u8> {
    let mut block = Vec::with_capacity(SATHDR_KEYS.len() * SATHDR_SENTENCE_LEN);
    for key in SATHDR_KEYS {
        let value = if key == "COMMENT" { comment } else { "" };
        let mut sentence = format!("SATHDR {value} ({key})\r\n").into_bytes();
        if sentence.len() > SATHDR_SENTENCE_LEN {
            tracing::warn!("SATHDR {key} too long");
            sentence.truncate(SATHDR_SENTENCE_LEN);
        }
        sentence.resize(SATHDR_SENTENCE_LEN, 0);
        block.extend_from_slice(&sentence);
    }
    block
}

// =============================================================================
// Telemetry definition
// =============================================================================

/// Encoding of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// ASCII text (`AS`).
    AsciiString,
    /// ASCII integer (`AI`).
    AsciiInt,
    /// ASCII float (`AF`).
    AsciiFloat,
    /// Big-endian unsigned integer (`BU`).
    BinaryUnsigned,
    /// Big-endian signed integer (`BS`).
    BinarySigned,
    /// Big-endian `f32` (`BF`).
    BinaryFloat,
    /// Big-endian `f64` (`BD`).
    BinaryDouble,
}

impl DataType {
    fn parse(s: &str) -> AppResult<Self> {
        Ok(match s {
            "AS" => DataType::AsciiString,
            "AI" => DataType::AsciiInt,
            "AF" => DataType::AsciiFloat,
            "BU" => DataType::BinaryUnsigned,
            "BS" => DataType::BinarySigned,
            "BF" => DataType::BinaryFloat,
            "BD" => DataType::BinaryDouble,
            other => return Err(tdf_error(format!("unknown data type {other}"))),
        })
    }

    fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::AsciiInt | DataType::BinaryUnsigned | DataType::BinarySigned
        )
    }
}

/// Calibration of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// Raw value.
    None,
    /// Raw counts.
    Count,
    /// `sum(a_i * x^i)`.
    PolyU,
    /// `im * a1 * (x - a0)`.
    Optic2,
    /// `im * a1 * (x - a0) * cint / aint`.
    Optic3,
    /// Separator, not a variable.
    Delimiter,
}

impl Fit {
    fn parse(s: &str) -> AppResult<Self> {
        Ok(match s {
            "NONE" => Fit::None,
            "COUNT" => Fit::Count,
            "POLYU" => Fit::PolyU,
            "OPTIC2" => Fit::Optic2,
            "OPTIC3" => Fit::Optic3,
            "DELIMITER" => Fit::Delimiter,
            other => return Err(tdf_error(format!("unknown fit type {other}"))),
        })
    }
}

fn tdf_error(msg: impl Into<String>) -> InlininoError {
    InlininoError::CalibrationFile(msg.into())
}

/// One line of a telemetry definition.
#[derive(Debug, Clone, PartialEq)]
pub struct TdfField {
    /// Field type (`ES`, `INTTIME`, ...).
    pub kind: String,
    /// Field id, `NONE` when not applicable.
    pub id: String,
    /// Units, or delimiter bytes for delimiters.
    pub units: String,
    /// Length in bytes, `None` for variable length.
    pub length: Option<usize>,
    /// Encoding.
    pub data_type: DataType,
    /// Calibration.
    pub fit: Fit,
    /// Calibration coefficients.
    pub coefficients: Vec<f64>,
}

impl TdfField {
    /// Variable name: `TYPE` or `TYPE_ID`.
    pub fn key(&self) -> String {
        if self.id == "NONE" {
            self.kind.clone()
        } else {
            format!("{}_{}", self.kind, self.id)
        }
    }

    fn is_terminator(&self) -> bool {
        TERMINATOR_KEYS.contains(&self.kind.as_str())
    }

    fn delimiter(&self) -> Vec<u8> {
        ByteString::from_escaped(&self.units)
            .map(|b| b.0)
            .unwrap_or_else(|| self.units.as_bytes().to_vec())
    }

    fn apply(&self, x: f64, immersed: bool, aint: Option<f64>) -> Result<f64, ParseError> {
        let c = |i: usize| {
            self.coefficients.get(i).copied().ok_or_else(|| {
                ParseError::calibration(format!("{} is missing coefficient {i}", self.key()))
            })
        };
        let im = |v: f64| if immersed { v } else { 1.0 };
        Ok(match self.fit {
            Fit::None | Fit::Count | Fit::Delimiter => x,
            Fit::PolyU => self
                .coefficients
                .iter()
                .rev()
                .fold(0.0, |acc, a| acc * x + a),
            Fit::Optic2 => im(c(2)?) * c(1)? * (x - c(0)?),
            Fit::Optic3 => {
                let aint = aint.ok_or_else(|| {
                    ParseError::calibration(format!("{} needs an integration time", self.key()))
                })?;
                im(c(2)?) * c(1)? * (x - c(0)?) * c(3)? / aint
            }
        })
    }

    fn decode(&self, raw: &[u8]) -> Result<Value, ParseError> {
        let text = || {
            std::str::from_utf8(raw)
                .map(str::trim)
                .map_err(|_| ParseError::bad_field(format!("{} is not ASCII", self.key())))
        };
        let number = |v: Option<f64>| {
            v.map(Value::Float).ok_or_else(|| {
                ParseError::bad_field(format!(
                    "{} has {} bytes, cannot decode",
                    self.key(),
                    raw.len()
                ))
            })
        };
        match self.data_type {
            DataType::AsciiString => Ok(Value::Text(text()?.to_string())),
            DataType::AsciiInt => text()?
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| ParseError::bad_field(format!("{} is not an int", self.key()))),
            DataType::AsciiFloat => text()?
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| ParseError::bad_field(format!("{} is not a float", self.key()))),
            DataType::BinaryUnsigned if raw.len() <= 8 => Ok(Value::Int(
                raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)) as i64,
            )),
            DataType::BinarySigned if (1..=8).contains(&raw.len()) => {
                let unsigned = raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
                let shift = 64 - 8 * raw.len() as u32;
                Ok(Value::Int(((unsigned << shift) as i64) >> shift))
            }
            DataType::BinaryFloat => number(
                <[u8; 4]>::try_from(raw)
                    .ok()
                    .map(|b| f64::from(f32::from_be_bytes(b))),
            ),
            DataType::BinaryDouble => number(<[u8; 8]>::try_from(raw).ok().map(f64::from_be_bytes)),
            _ => number(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Column {
    Scalar(usize),
    Core(std::ops::Range<usize>),
}

/// Telemetry definition of one frame type.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// Frame header (`INSTRUMENT` + `SN`).
    pub header: String,
    /// Immersed coefficients apply.
    pub immersed: bool,
    fields: Vec<TdfField>,
    // Indices in `fields` of every variable
    variables: Vec<usize>,
    core: Option<std::ops::Range<usize>>,
    columns: Vec<Column>,
}

fn tokenize(line: &str) -> AppResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut rest = line.trim_start();
    while !rest.is_empty() {
        if let Some(quoted) = rest.strip_prefix('\'') {
            let end = quoted
                .find('\'')
                .ok_or_else(|| tdf_error(format!("unterminated quote in {line:?}")))?;
            tokens.push(quoted[..end].to_string());
            rest = quoted[end + 1..].trim_start();
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            tokens.push(rest[..end].to_string());
            rest = rest[end..].trim_start();
        }
    }
    Ok(tokens)
}

impl Telemetry {
    /// Read a telemetry definition file.
    pub fn load(path: &Path, immersed: bool) -> AppResult<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !VALID_EXTENSIONS.contains(&extension.as_str()) {
            return Err(tdf_error(format!(
                "File extension incorrect: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| tdf_error(format!("{}: {e}", path.display())))?;
        debug!("Reading [immersed={immersed}] {}", path.display());
        Self::parse(&text, immersed)
    }

    /// Parse the content of a telemetry definition file.
    pub fn parse(text: &str, immersed: bool) -> AppResult<Self> {
        let mut instrument = None;
        let mut serial = None;
        let mut fields = Vec::new();
        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));
        while let Some(line) = lines.next() {
            let tokens = tokenize(line)?;
            if tokens.len() != 7 {
                return Err(tdf_error(format!("expected 7 fields in {line:?}")));
            }
            let n_lines: usize = tokens[5]
                .parse()
                .map_err(|_| tdf_error(format!("invalid CALLINES in {line:?}")))?;
            let mut coefficients = Vec::new();
            for _ in 0..n_lines {
                let cal = lines
                    .next()
                    .ok_or_else(|| tdf_error(format!("missing coefficients of {line:?}")))?;
                for v in cal.split_whitespace() {
                    coefficients.push(
                        v.parse::<f64>()
                            .map_err(|_| tdf_error(format!("invalid coefficient {v:?}")))?,
                    );
                }
            }
            let field = TdfField {
                kind: tokens[0].clone(),
                id: tokens[1].clone(),
                units: tokens[2].clone(),
                length: match tokens[3].as_str() {
                    "V" | "v" => None,
                    n => Some(
                        n.parse()
                            .map_err(|_| tdf_error(format!("invalid LENGTH in {line:?}")))?,
                    ),
                },
                data_type: DataType::parse(&tokens[4])?,
                fit: Fit::parse(&tokens[6])?,
                coefficients,
            };
            match field.kind.as_str() {
                "INSTRUMENT" => instrument = Some(field.id),
                "SN" => serial = Some(field.id),
                _ => fields.push(field),
            }
        }
        let header = format!(
            "{}{}",
            instrument.ok_or_else(|| tdf_error("missing INSTRUMENT"))?,
            serial.ok_or_else(|| tdf_error("missing SN"))?
        );

        let variables: Vec<usize> = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.fit != Fit::Delimiter && !f.is_terminator())
            .map(|(i, _)| i)
            .collect();

        // Largest run of consecutive variables sharing a type with numeric ids
        let mut core: Option<std::ops::Range<usize>> = None;
        let mut start = 0;
        while start < variables.len() {
            let kind = &fields[variables[start]].kind;
            let numeric = |i: usize| fields[variables[i]].id.parse::<f64>().is_ok();
            let mut end = start;
            while end < variables.len() && &fields[variables[end]].kind == kind && numeric(end) {
                end += 1;
            }
            if end - start >= 2 && core.as_ref().map_or(true, |c| end - start > c.len()) {
                core = Some(start..end);
            }
            start = end.max(start + 1);
        }

        let mut columns = Vec::new();
        for i in 0..variables.len() {
            match &core {
                Some(c) if i == c.start => columns.push(Column::Core(c.clone())),
                Some(c) if c.contains(&i) => {}
                _ => columns.push(Column::Scalar(i)),
            }
        }

        Ok(Self {
            header,
            immersed,
            fields,
            variables,
            core,
            columns,
        })
    }

    /// Variable names in frame order.
    pub fn keys(&self) -> Vec<String> {
        self.variables.iter().map(|i| self.fields[*i].key()).collect()
    }

    /// Name of the spectral group, if any.
    pub fn core_group(&self) -> Option<&str> {
        self.core
            .as_ref()
            .map(|c| self.fields[self.variables[c.start]].kind.as_str())
    }

    /// Wavelengths of the spectral group.
    pub fn core_wavelengths(&self) -> Vec<f64> {
        self.core
            .clone()
            .map(|c| {
                c.filter_map(|i| self.fields[self.variables[i]].id.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Frame end rule.
    pub fn frame_end(&self) -> FrameEnd {
        let lengths: Option<usize> = self.fields.iter().map(|f| f.length).sum();
        match lengths {
            Some(n) => FrameEnd::Length(self.header.len() + n),
            None => FrameEnd::Terminator(
                self.fields
                    .iter()
                    .find(|f| f.is_terminator())
                    .map(TdfField::delimiter)
                    .unwrap_or_else(|| b"\r\n".to_vec()),
            ),
        }
    }

    /// Product schema: spectral group collapsed into one column.
    pub fn schema(&self) -> Schema {
        let mut names = Vec::new();
        let mut units = Vec::new();
        let mut precisions = Vec::new();
        for column in &self.columns {
            match column {
                Column::Core(range) => {
                    let f = &self.fields[self.variables[range.start]];
                    names.push(f.kind.clone());
                    units.push(f.units.clone());
                    precisions.push("%s".to_string());
                }
                Column::Scalar(i) => {
                    let f = &self.fields[self.variables[*i]];
                    names.push(f.key());
                    units.push(f.units.clone());
                    precisions.push(
                        match (f.data_type, f.fit) {
                            (DataType::AsciiString, _) => "%s",
                            (t, Fit::None | Fit::Count) if t.is_integer() => "%d",
                            _ => "%.5f",
                        }
                        .to_string(),
                    );
                }
            }
        }
        Schema::new(&names, &units, &precisions)
    }

    fn slices<'a>(&self, body: &'a [u8]) -> Result<Vec<&'a [u8]>, ParseError> {
        let mut pos = 0;
        let mut out = Vec::with_capacity(self.variables.len());
        for (i, field) in self.fields.iter().enumerate() {
            if field.fit == Fit::Delimiter || field.is_terminator() {
                let delimiter = field.delimiter();
                let n = if delimiter.is_empty() {
                    field.length.unwrap_or(0)
                } else {
                    delimiter.len()
                };
                if !delimiter.is_empty() && !body[pos..].starts_with(&delimiter) {
                    return Err(ParseError::bad_field(format!(
                        "expected delimiter {} at byte {pos}",
                        field.key()
                    )));
                }
                pos = (pos + n).min(body.len());
                continue;
            }
            let len = match field.length {
                Some(n) => n,
                None => {
                    let next = self
                        .fields
                        .get(i + 1)
                        .filter(|f| f.fit == Fit::Delimiter || f.is_terminator())
                        .ok_or_else(|| {
                            ParseError::bad_field(format!(
                                "variable length field {} is not followed by a delimiter",
                                field.key()
                            ))
                        })?;
                    find(&body[pos..], &next.delimiter()).ok_or_else(|| {
                        ParseError::wrong_field_count(self.variables.len(), out.len())
                    })?
                }
            };
            let slice = body.get(pos..pos + len).ok_or_else(|| {
                ParseError::incomplete(format!("frame ends before {}", field.key()))
            })?;
            out.push(slice);
            pos += len;
        }
        Ok(out)
    }

    /// Decode and calibrate a frame body (header excluded).
    pub fn parse_frame(&self, body: &[u8]) -> Result<Record, ParseError> {
        let raw = self
            .slices(body)?
            .into_iter()
            .zip(&self.variables)
            .map(|(slice, i)| self.fields[*i].decode(slice))
            .collect::<Result<Vec<_>, _>>()?;
        let aint = self
            .variables
            .iter()
            .zip(&raw)
            .find(|(i, _)| self.fields[**i].kind == "INTTIME")
            .map(|(i, v)| self.fields[*i].apply(v.as_f64(), self.immersed, None))
            .transpose()?;

        let mut calibrated = Vec::with_capacity(raw.len());
        for (i, value) in self.variables.iter().zip(raw) {
            let field = &self.fields[*i];
            calibrated.push(match (value, field.fit) {
                (Value::Text(s), _) => Value::Text(s),
                (v, Fit::None | Fit::Count) => v,
                (v, _) => Value::Float(field.apply(v.as_f64(), self.immersed, aint)?),
            });
        }

        let mut values = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            match column {
                Column::Scalar(i) => values.push(calibrated[*i].clone()),
                Column::Core(range) => values.push(Value::Array(
                    calibrated[range.clone()].iter().map(Value::as_f64).collect(),
                )),
            }
        }
        Ok(Record::on_stream(self.header.clone(), values))
    }

    /// One value per variable, spectral group expanded.
    pub fn expand(&self, record: &Record) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.variables.len());
        for (column, value) in self.columns.iter().zip(&record.values) {
            match (column, value) {
                (Column::Core(range), Value::Array(a)) => {
                    out.extend(a.iter().copied());
                    out.resize(out.len() + range.len().saturating_sub(a.len()), f64::NAN);
                }
                (Column::Core(range), _) => {
                    out.extend(std::iter::repeat(f64::NAN).take(range.len()));
                }
                (Column::Scalar(_), v) => out.push(v.as_f64()),
            }
        }
        out
    }

    /// Metadata keys: every scalar variable except the hidden ones.
    pub fn metadata_keys(&self) -> Vec<String> {
        self.metadata_columns()
            .map(|(_, i)| self.fields[self.variables[i]].key())
            .collect()
    }

    fn metadata_columns(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(c, column)| match column {
                Column::Scalar(i) => Some((c, *i)),
                Column::Core(_) => None,
            })
            .filter(|(_, i)| {
                !HIDDEN_METADATA_KEYS.contains(&self.fields[self.variables[*i]].key().as_str())
            })
    }

    fn metadata_values(&self, record: &Record) -> Vec<String> {
        let schema = self.schema();
        self.metadata_columns()
            .map(|(c, _)| {
                record
                    .values
                    .get(c)
                    .map(|v| schema.precisions[c].format(v))
                    .unwrap_or_else(|| "nan".into())
            })
            .collect()
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// Satlantic strategy.
#[derive(Debug, Clone)]
pub struct Satlantic {
    telemetry: Vec<Telemetry>,
    channels: ActiveChannels,
    // First channel of each frame type
    offsets: Vec<usize>,
    counters: Vec<u64>,
}

impl Satlantic {
    /// Build from a checked configuration.
    pub fn new(config: &InstrumentConfig) -> AppResult<Self> {
        let files: Vec<PathBuf> = config.require("tdf_files")?;
        let immersed: Vec<bool> = config.require("immersed")?;
        if files.len() != immersed.len() {
            return Err(InlininoError::Validation(
                "tdf_files and immersed must have the same length".into(),
            ));
        }
        if files.is_empty() {
            return Err(InlininoError::Config("No telemetry definition file".into()));
        }
        let telemetry = files
            .iter()
            .zip(immersed)
            .map(|(f, i)| Telemetry::load(f, i))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self::with_telemetry(telemetry))
    }

    /// Build from parsed telemetry definitions.
    pub fn with_telemetry(telemetry: Vec<Telemetry>) -> Self {
        let mut names = Vec::new();
        let mut offsets = Vec::new();
        let mut defaults = Vec::new();
        for t in &telemetry {
            offsets.push(names.len());
            // Middle wavelength of the spectral group
            if let Some(core) = &t.core {
                defaults.push(names.len() + core.start + core.len() / 2);
            }
            names.extend(t.keys().into_iter().map(|k| format!("{}_{k}", t.header)));
        }
        let mut channels = ActiveChannels::new(names);
        for i in defaults {
            channels.set_index(i, true);
        }
        let counters = vec![0; telemetry.len()];
        Self {
            telemetry,
            channels,
            offsets,
            counters,
        }
    }

    fn position(&self, header: &[u8]) -> Option<usize> {
        self.telemetry
            .iter()
            .position(|t| t.header.as_bytes() == header)
    }
}

impl InstrumentStrategy for Satlantic {
    fn module(&self) -> &'static str {
        "satlantic"
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        self.telemetry
            .iter()
            .map(|t| ProductStream::named(t.header.clone(), t.schema()))
            .collect()
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::HeaderDispatched(
            self.telemetry
                .iter()
                .map(|t| HeaderRule {
                    header: t.header.as_bytes().to_vec(),
                    end: t.frame_end(),
                })
                .collect(),
        )
    }

    fn buffer_ceiling(&self) -> usize {
        SATLANTIC_BUFFER_CEILING
    }

    fn raw_format(&self) -> RawFormat {
        RawFormat::Binary {
            header_block: Some(sathdr_block(&format!(
                "Logged with Inlinino v{}",
                env!("CARGO_PKG_VERSION")
            ))),
            timestamp: TimestampLayout::SatView,
            extension: "raw",
        }
    }

    fn rotation_period(&self) -> f64 {
        SATLANTIC_ROTATION_SECS
    }

    fn default_serial(&self, port: &str) -> SerialParams {
        SerialParams::new(port)
            .with_baudrate(115_200)
            .with_timeout(5.0)
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        let index = self.position(&frame.header).ok_or_else(|| {
            ParseError::unknown_header(format!(
                "unknown frame header {}",
                frame.header.escape_ascii()
            ))
        })?;
        self.telemetry[index].parse_frame(&frame.body)
    }

    fn events(&mut self, record: &Record, t: f64, out: &mut Vec<InstrumentEvent>) {
        let Some(index) = record
            .stream
            .as_deref()
            .and_then(|s| self.position(s.as_bytes()))
        else {
            return;
        };
        let telemetry = &self.telemetry[index];

        self.counters[index] += 1;
        let mut metadata: Vec<MetadataEntry> = vec![None; self.telemetry.len()];
        metadata[index] = Some((self.counters[index], telemetry.metadata_values(record)));
        out.push(InstrumentEvent::NewMetadata(metadata));

        let mut all = vec![f64::NAN; self.channels.names().len()];
        for (slot, v) in all[self.offsets[index]..]
            .iter_mut()
            .zip(telemetry.expand(record))
        {
            *slot = v;
        }
        out.push(InstrumentEvent::NewTimeseries {
            values: self.channels.select(&all),
            timestamp: t,
        });

        if telemetry.core.is_some() {
            let mut spectrum = Vec::new();
            for (i, other) in self.telemetry.iter().enumerate() {
                if other.core.is_none() {
                    continue;
                }
                spectrum.push(if i == index {
                    record.values.iter().find_map(|v| v.as_array().map(<[f64]>::to_vec))
                } else {
                    None
                });
            }
            out.push(InstrumentEvent::NewSpectrum(spectrum));
        }
    }

    fn features(&self) -> FeatureFlags {
        FeatureFlags {
            spectrum_plot: true,
            metadata: true,
            select_channel: true,
            ..Default::default()
        }
    }

    fn ui(&self) -> UiDescriptor {
        let spectral = self.telemetry.iter().filter(|t| t.core.is_some());
        UiDescriptor {
            timeseries: self.channels.names().to_vec(),
            active_timeseries: self.channels.active_names(),
            spectrum_traces: spectral
                .clone()
                .map(|t| format!("{} {}", t.header, t.core_group().unwrap_or_default()))
                .collect(),
            spectrum_x: spectral.map(Telemetry::core_wavelengths).collect(),
            metadata: self
                .telemetry
                .iter()
                .map(|t| (t.header.clone(), t.metadata_keys()))
                .collect(),
            ..Default::default()
        }
    }

    fn command(&mut self, command: &ControlCommand) -> AppResult<()> {
        match command {
            ControlCommand::SelectTimeseries { name, enabled } => self.channels.set(name, *enabled),
            other => Err(InlininoError::Config(format!(
                "satlantic does not support {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseErrorKind;

    const HYPERSPECTRAL: &str = "# Binary radiometer
INSTRUMENT SATHPR '' 6 AS 0 NONE
SN 0001 '' 4 AS 0 NONE
INTTIME LU 'sec' 2 BU 1 POLYU
  0 0.001
ES 400.0 'uW/cm^2/nm' 2 BU 1 OPTIC3
  100 0.5 1.5 0.128
ES 410.0 'uW/cm^2/nm' 2 BU 1 OPTIC3
  100 0.5 1.5 0.128
ES 420.0 'uW/cm^2/nm' 2 BU 1 OPTIC3
  100 0.5 1.5 0.128
TEMP PCB 'C' 2 BS 1 POLYU
  0 0.1
CHECK_SUM NONE '' 1 BU 0 NONE
CRLF_TERMINATOR NONE '\\x0D\\x0A' 2 AS 0 DELIMITER
";

    const PAR: &str = "INSTRUMENT SATPAR '' 6 AS 0 NONE
SN 0002 '' 4 AS 0 NONE
FIELD NONE ',' 1 AS 0 DELIMITER
PAR NONE 'uE/cm^2/s' V AF 1 OPTIC2
  1.0 2.0 1.5
FIELD NONE ',' 1 AS 0 DELIMITER
STATUS NONE '' V AS 0 NONE
TERMINATOR NONE '\\x0D\\x0A' 2 AS 0 DELIMITER
";

    fn binary_body() -> Vec<u8> {
        let mut body = Vec::new();
        for v in [128u16, 300, 500, 100] {
            body.extend_from_slice(&v.to_be_bytes());
        }
        body.extend_from_slice(&(-215i16).to_be_bytes());
        body.push(0x7f);
        body.extend_from_slice(b"\r\n");
        body
    }

    fn strategy() -> Satlantic {
        Satlantic::with_telemetry(vec![
            Telemetry::parse(HYPERSPECTRAL, false).unwrap(),
            Telemetry::parse(PAR, true).unwrap(),
        ])
    }

    #[test]
    fn telemetry_layout() {
        let t = Telemetry::parse(HYPERSPECTRAL, false).unwrap();
        assert_eq!(t.header, "SATHPR0001");
        assert_eq!(t.core_group(), Some("ES"));
        assert_eq!(t.core_wavelengths(), vec![400.0, 410.0, 420.0]);
        assert_eq!(t.frame_end(), FrameEnd::Length(10 + 13));
        let schema = t.schema();
        assert_eq!(schema.names, vec!["INTTIME_LU", "ES", "TEMP_PCB", "CHECK_SUM"]);
        assert_eq!(t.metadata_keys(), vec!["INTTIME_LU", "TEMP_PCB"]);

        let par = Telemetry::parse(PAR, true).unwrap();
        assert_eq!(par.frame_end(), FrameEnd::Terminator(b"\r\n".to_vec()));
        assert_eq!(par.core_group(), None);
    }

    #[test]
    fn binary_frame_is_calibrated() {
        let t = Telemetry::parse(HYPERSPECTRAL, false).unwrap();
        let r = t.parse_frame(&binary_body()).unwrap();
        assert_eq!(r.stream.as_deref(), Some("SATHPR0001"));
        assert!((r.values[0].as_f64() - 0.128).abs() < 1e-12);
        // Not immersed: 0.5 * (x - 100) * 0.128 / 0.128
        let es = r.values[1].as_array().unwrap();
        assert!((es[0] - 100.0).abs() < 1e-9);
        assert!((es[1] - 200.0).abs() < 1e-9);
        assert!((es[2] - 0.0).abs() < 1e-9);
        assert!((r.values[2].as_f64() + 21.5).abs() < 1e-9);
        assert_eq!(r.values[3], Value::Int(0x7f));
    }

    #[test]
    fn ascii_frame_uses_delimiters_and_immersion() {
        let t = Telemetry::parse(PAR, true).unwrap();
        let r = t.parse_frame(b",3.0,OK\r\n").unwrap();
        assert_eq!(r.values, vec![Value::Float(6.0), Value::Text("OK".into())]);
        let dry = Telemetry::parse(PAR, false).unwrap();
        assert_eq!(dry.parse_frame(b",3.0,OK\r\n").unwrap().values[0], Value::Float(4.0));
        let e = t.parse_frame(b",x,OK\r\n").unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::BadField);
    }

    #[test]
    fn unknown_header_is_rejected() {
        let s = strategy();
        let e = s
            .parse(&Frame {
                header: b"SATXXX9999".to_vec(),
                body: Vec::new(),
            })
            .unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::UnknownHeader);
    }

    #[test]
    fn events_fill_own_frame_type_only() {
        let mut s = strategy();
        assert_eq!(s.ui().active_timeseries, vec!["SATHPR0001_ES_410.0"]);
        s.command(&ControlCommand::SelectTimeseries {
            name: "SATPAR0002_PAR".into(),
            enabled: true,
        })
        .unwrap();
        let r = s
            .parse(&Frame {
                header: b"SATPAR0002".to_vec(),
                body: b",3.0,OK\r\n".to_vec(),
            })
            .unwrap();
        let mut events = Vec::new();
        s.events(&r, 1.0, &mut events);
        assert_eq!(events[0], InstrumentEvent::NewMetadata(vec![None, Some((1, vec!["6.00000".into(), "OK".into()]))]));
        match &events[1] {
            InstrumentEvent::NewTimeseries { values, .. } => {
                assert!(values[0].is_nan());
                assert_eq!(values[1], 6.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        // PAR has no spectral group
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn sathdr_sentences_are_padded() {
        let block = sathdr_block("Logged with Inlinino v0.1.0");
        assert_eq!(block.len(), 25 * 128);
        assert!(block.starts_with(b"SATHDR  (CRUISE-ID)\r\n\0"));
        let comment = &block[12 * 128..13 * 128];
        assert!(comment.starts_with(b"SATHDR Logged with Inlinino v0.1.0 (COMMENT)\r\n"));
        assert_eq!(comment[127], 0);
    }
}
