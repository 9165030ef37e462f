//! GPS NMEA 0183.
//!
//! Sentences end with `\r\n`. When a sentence carries a `*hh` checksum it is
//! verified; a mismatch makes the frame corrupted. Configured variables pick
//! fields by name, e.g. `lat`, `num_sats`, or the derived decimal
//! `latitude`/`longitude`. Fields absent from a sentence, empty or not
//! numeric are written `nan`.

use super::{InstrumentConfig, InstrumentStrategy, UiDescriptor};
use crate::bus::InstrumentEvent;
use crate::error::{AppResult, InlininoError, ParseError};
use crate::framer::{Frame, FramingStrategy};
use crate::logger::ProductStream;
use crate::record::{Record, Schema, Value};
use crate::transport::SerialParams;

/// Field names of the supported sentences.
pub const SENTENCES: &[(&str, &[&str])] = &[
    (
        "GGA",
        &[
            "timestamp",
            "lat",
            "lat_dir",
            "lon",
            "lon_dir",
            "gps_qual",
            "num_sats",
            "horizontal_dil",
            "altitude",
            "altitude_units",
            "geo_sep",
            "geo_sep_units",
            "age_gps_data",
            "ref_station_id",
        ],
    ),
    (
        "RMC",
        &[
            "timestamp",
            "status",
            "lat",
            "lat_dir",
            "lon",
            "lon_dir",
            "spd_over_grnd",
            "true_course",
            "datestamp",
            "mag_variation",
            "mag_var_dir",
        ],
    ),
    (
        "GLL",
        &["lat", "lat_dir", "lon", "lon_dir", "timestamp", "status"],
    ),
    (
        "VTG",
        &[
            "true_track",
            "true_track_sym",
            "mag_track",
            "mag_track_sym",
            "spd_over_grnd_kts",
            "spd_over_grnd_kts_sym",
            "spd_over_grnd_kmph",
            "spd_over_grnd_kmph_sym",
        ],
    ),
    ("HDT", &["heading", "hdg_true"]),
    (
        "ZDA",
        &[
            "timestamp",
            "day",
            "month",
            "year",
            "local_zone",
            "local_zone_minutes",
        ],
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Int,
    Float,
    Str,
}

/// A decoded sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    /// Talker id (`GP`, `GN`, ...).
    pub talker: String,
    /// Sentence type (`GGA`, ...).
    pub kind: String,
    /// Raw data fields.
    pub fields: Vec<String>,
}

impl Sentence {
    /// Decode `$TTSSS,f1,f2,...[*hh]`.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let start = line
            .find(&['$', '!'][..])
            .ok_or_else(|| ParseError::bad_field("no sentence start"))?;
        let line = line[start + 1..].trim_end();
        let data = match line.split_once('*') {
            Some((data, checksum)) => {
                let expected = u8::from_str_radix(checksum.trim(), 16)
                    .map_err(|_| ParseError::bad_field(format!("invalid checksum {checksum:?}")))?;
                let actual = data.bytes().fold(0u8, |acc, b| acc ^ b);
                if actual != expected {
                    return Err(ParseError::checksum(format!(
                        "checksum {actual:02X} != {expected:02X}"
                    )));
                }
                data
            }
            None => line,
        };
        let mut parts = data.split(',');
        let address = parts.next().unwrap_or_default();
        if address.len() < 5 || !address.is_ascii() {
            return Err(ParseError::bad_field(format!("invalid address {address:?}")));
        }
        let (talker, kind) = address.split_at(address.len() - 3);
        Ok(Self {
            talker: talker.to_string(),
            kind: kind.to_string(),
            fields: parts.map(str::to_string).collect(),
        })
    }

    /// Raw field by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        let (_, names) = SENTENCES.iter().find(|(k, _)| *k == self.kind)?;
        let index = names.iter().position(|n| *n == name)?;
        self.fields.get(index).map(String::as_str)
    }

    fn coordinate(&self, value: &str, hemisphere: &str) -> Option<f64> {
        let raw: f64 = self.field(value)?.parse().ok()?;
        let degrees = (raw / 100.0).trunc();
        let decimal = degrees + (raw - degrees * 100.0) / 60.0;
        match self.field(hemisphere)? {
            "S" | "W" => Some(-decimal),
            _ => Some(decimal),
        }
    }

    /// Signed decimal latitude.
    pub fn latitude(&self) -> Option<f64> {
        self.coordinate("lat", "lat_dir")
    }

    /// Signed decimal longitude.
    pub fn longitude(&self) -> Option<f64> {
        self.coordinate("lon", "lon_dir")
    }
}

/// NMEA strategy.
#[derive(Debug, Clone)]
pub struct Nmea {
    schema: Schema,
    variables: Vec<(String, FieldType)>,
}

impl Nmea {
    /// Build from a checked configuration.
    pub fn new(config: &InstrumentConfig) -> AppResult<Self> {
        let variables = config
            .variable_names
            .iter()
            .zip(&config.variable_types)
            .map(|(name, t)| {
                let kind = match t.as_str() {
                    "int" => FieldType::Int,
                    "float" => FieldType::Float,
                    "str" => FieldType::Str,
                    other => {
                        return Err(InlininoError::Config(format!(
                            "Variable type {other} not supported."
                        )))
                    }
                };
                Ok((name.clone(), kind))
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            schema: Schema::new(
                &config.variable_names,
                &config.variable_units,
                &config.variable_precision,
            ),
            variables,
        })
    }

    fn numeric_names(&self) -> Vec<String> {
        self.variables
            .iter()
            .filter(|(_, t)| *t != FieldType::Str)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

impl InstrumentStrategy for Nmea {
    fn module(&self) -> &'static str {
        "nmea"
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        vec![ProductStream::single(self.schema.clone())]
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::Terminator(b"\r\n".to_vec())
    }

    fn default_serial(&self, port: &str) -> SerialParams {
        SerialParams::new(port).with_baudrate(4800).with_timeout(10.0)
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        let line = std::str::from_utf8(&frame.body)
            .map_err(|_| ParseError::bad_field("sentence is not ASCII"))?;
        let sentence = Sentence::parse(line)?;
        let values = self
            .variables
            .iter()
            .map(|(name, kind)| {
                let raw = match name.as_str() {
                    "latitude" => sentence.latitude().map(|v| v.to_string()),
                    "longitude" => sentence.longitude().map(|v| v.to_string()),
                    _ => sentence.field(name).map(str::to_string),
                };
                match (kind, raw) {
                    (FieldType::Str, Some(s)) => Value::Text(s),
                    (FieldType::Str, None) => Value::Text("nan".into()),
                    (FieldType::Int, Some(s)) => {
                        s.trim().parse().map(Value::Int).unwrap_or(Value::Missing)
                    }
                    (FieldType::Float, Some(s)) => s
                        .trim()
                        .parse()
                        .map(Value::Float)
                        .unwrap_or(Value::Missing),
                    (_, None) => Value::Missing,
                }
            })
            .collect();
        Ok(Record::new(values))
    }

    fn events(&mut self, record: &Record, t: f64, out: &mut Vec<InstrumentEvent>) {
        let values: Vec<f64> = self
            .variables
            .iter()
            .zip(&record.values)
            .filter(|((_, kind), _)| *kind != FieldType::Str)
            .map(|(_, v)| v.as_f64())
            .collect();
        if !values.is_empty() {
            out.push(InstrumentEvent::NewTimeseries {
                values,
                timestamp: t,
            });
        }
    }

    fn ui(&self) -> UiDescriptor {
        UiDescriptor {
            timeseries: self.numeric_names(),
            active_timeseries: self.numeric_names(),
            ..Default::default()
        }
    }
}
