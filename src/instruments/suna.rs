//! Satlantic SUNA nitrate sensor, V1 and V2, in full ASCII frame mode.
//!
//! Every `\r\n` terminated frame is a comma separated list: a header
//! (`SATSLF####` for light, `SATSDF####` for dark), fit results and
//! housekeeping, and the raw spectrometer channels. Light frames feed the
//! timeseries, the light trace and the auxiliary table; dark frames only
//! the dark trace. Both are logged.
//!
//! The calibration file provides the polynomial registering pixels to
//! wavelengths (`C0` .. `C4` lines). An unreadable file or a degenerate
//! registration falls back to channel numbers.

use super::{nearest_index, FeatureFlags, InstrumentConfig, InstrumentStrategy, UiDescriptor};
use crate::bus::InstrumentEvent;
use crate::error::{AppResult, InlininoError, ParseError};
use crate::framer::{Frame, FramingStrategy};
use crate::logger::ProductStream;
use crate::record::{Record, Schema, Value};
use crate::transport::SerialParams;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Int,
    Float,
}

use Kind::{Float, Int, Text};

type FieldSpec = (&'static str, &'static str, &'static str, Kind);

const V2_LEADING: &[FieldSpec] = &[
    ("header", "SAT$$$####", "%s", Text),
    ("suna_date", "yyyyjjj", "%d", Int),
    ("suna_time", "HH.HHHHHH", "%.6f", Float),
    ("nitrate", "uM", "%.2f", Float),
    ("nitrogen_in_nitrate", "mgN/L", "%.4f", Float),
    ("absorbance_254", "", "%.4f", Float),
    ("absorbance_350", "", "%.4f", Float),
    ("bromide_trace", "mg/L", "%.2f", Float),
    ("spectrum_average", "counts", "%d", Int),
    ("dark_value_used_for_fit", "", "%d", Int),
    ("int_time_factor", "", "%d", Int),
];

const V2_TRAILING: &[FieldSpec] = &[
    ("int_temp", "degC", "%.1f", Float),
    ("spec_temp", "degC", "%.1f", Float),
    ("lamp_temp", "degC", "%.1f", Float),
    ("lamp_time", "s", "%d", Int),
    ("rel_humid", "%", "%.1f", Float),
    ("main_volt", "V", "%.1f", Float),
    ("lamp_volt", "V", "%.1f", Float),
    ("int_volt", "V", "%.1f", Float),
    ("main_current", "mA", "%d", Int),
    ("fit_aux1", "", "%.2f", Float),
    ("fit_aux2", "", "%.2f", Float),
    ("fit_base1", "", "%.4f", Float),
    ("fit_base2", "", "%.6f", Float),
    ("fit_rmse", "", "%.6f", Float),
    ("ctd_time", "s", "%.0f", Float),
    ("ctd_sal", "PSU", "%.4f", Float),
    ("ctd_temp", "degC", "%.4f", Float),
    ("ctd_pres", "dBar", "%.4f", Float),
    ("checksum", "", "%d", Int),
];

const V1_LEADING: &[FieldSpec] = &[
    ("header", "SAT$$$####", "%s", Text),
    ("suna_timestamp", "seconds", "%.3f", Float),
    ("nitrate", "uMolar", "%.2f", Float),
    ("nitrogen_in_nitrate", "mgN/L", "%.4f", Float),
    ("fit_rmse", "", "%.6f", Float),
    ("lamp_temp", "degC", "%.3f", Float),
    ("spec_temp", "degC", "%.3f", Float),
    ("lamp_time", "s", "%d", Int),
    ("rel_humid", "%", "%.1f", Float),
    ("lamp_volt", "V", "%.2f", Float),
    ("reg_volt", "V", "%.2f", Float),
    ("main_volt", "V", "%.2f", Float),
    ("spectrum_average", "", "%d", Int),
    ("dark_average", "", "%d", Int),
];

const V1_TRAILING: &[FieldSpec] = &[("checksum", "", "%d", Int)];

/// Hardware generation; decides the frame layout and serial defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SunaModel {
    /// SUNA V1, 226 channels.
    V1,
    /// SUNA V2, 256 channels.
    V2,
}

impl SunaModel {
    /// Spectrometer channels per frame.
    pub fn n_channels(self) -> usize {
        match self {
            SunaModel::V1 => 226,
            SunaModel::V2 => 256,
        }
    }

    fn leading(self) -> &'static [FieldSpec] {
        match self {
            SunaModel::V1 => V1_LEADING,
            SunaModel::V2 => V2_LEADING,
        }
    }

    fn trailing(self) -> &'static [FieldSpec] {
        match self {
            SunaModel::V1 => V1_TRAILING,
            SunaModel::V2 => V2_TRAILING,
        }
    }

    /// Index of the first channel in a frame.
    pub fn channels_start(self) -> usize {
        self.leading().len()
    }

    /// Fields per frame.
    pub fn n_fields(self) -> usize {
        self.leading().len() + self.n_channels() + self.trailing().len()
    }
}

/// Pixel to wavelength registration.
///
/// Returns `None` when the file has no usable coefficients or when two
/// channels would share a wavelength.
pub fn register_wavelengths(calibration: &str, n_channels: usize) -> Option<Vec<f64>> {
    let mut c = [0.0f64; 5];
    for line in calibration.lines() {
        if line.starts_with("/*") {
            continue;
        }
        let Some(rest) = line.strip_prefix('C') else {
            continue;
        };
        let index = rest.get(..1)?.parse::<usize>().ok().filter(|i| *i < c.len())?;
        c[index] = line.split(' ').nth(1)?.trim().parse().ok()?;
    }
    let wavelengths: Vec<f64> = (1..=n_channels)
        .map(|x| {
            let x = x as f64;
            c[0] + c[1] * x + c[2] * x.powi(2) + c[3] * x.powi(3) + c[4] * x.powi(4)
        })
        .collect();
    wavelengths
        .windows(2)
        .all(|w| w[1] != w[0])
        .then_some(wavelengths)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Light,
    Dark,
}

/// SUNA strategy.
#[derive(Debug, Clone)]
pub struct Suna {
    model: SunaModel,
    kinds: Vec<Kind>,
    schema: Schema,
    wavelengths: Vec<f64>,
    registered: bool,
    index_254: usize,
    index_350: usize,
}

impl Suna {
    /// Build from a checked configuration, reading `calibration_file`.
    pub fn new(model: SunaModel, config: &InstrumentConfig) -> AppResult<Self> {
        let path: PathBuf = config.require("calibration_file")?;
        let calibration = match std::fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Error registering wavelengths from {}: {e}", path.display());
                None
            }
        };
        Ok(Self::with_calibration(model, calibration.as_deref()))
    }

    /// Build from the content of a calibration file.
    pub fn with_calibration(model: SunaModel, calibration: Option<&str>) -> Self {
        let n = model.n_channels();
        let registered = calibration.and_then(|text| register_wavelengths(text, n));
        if calibration.is_some() && registered.is_none() {
            warn!("Invalid wavelength registration.");
        }
        let (wavelengths, registered) = match registered {
            Some(wl) => (wl, true),
            None => ((0..n).map(|c| c as f64).collect(), false),
        };

        let channel_names: Vec<String> = (0..n).map(|k| format!("channel_{k}")).collect();
        let mut names = Vec::with_capacity(model.n_fields());
        let mut units = Vec::with_capacity(model.n_fields());
        let mut precisions = Vec::with_capacity(model.n_fields());
        let mut kinds = Vec::with_capacity(model.n_fields());
        for (name, unit, precision, kind) in model.leading() {
            names.push(name.to_string());
            units.push(unit.to_string());
            precisions.push(precision.to_string());
            kinds.push(*kind);
        }
        for name in channel_names {
            names.push(name);
            units.push("counts".to_string());
            precisions.push("%d".to_string());
            kinds.push(Int);
        }
        for (name, unit, precision, kind) in model.trailing() {
            names.push(name.to_string());
            units.push(unit.to_string());
            precisions.push(precision.to_string());
            kinds.push(*kind);
        }

        Self {
            index_254: nearest_index(&wavelengths, 254.0).unwrap_or(0),
            index_350: nearest_index(&wavelengths, 350.0).unwrap_or(0),
            model,
            kinds,
            schema: Schema::new(&names, &units, &precisions),
            wavelengths,
            registered,
        }
    }

    /// Wavelength (or channel number) of every channel.
    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    /// Whether the spectrum axis is in nanometers rather than channels.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    fn frame_kind(record: &Record) -> Option<FrameKind> {
        match record.values.first() {
            Some(Value::Text(h)) if h.contains('L') => Some(FrameKind::Light),
            Some(Value::Text(h)) if h.contains('D') => Some(FrameKind::Dark),
            _ => None,
        }
    }

    fn value(&self, record: &Record, name: &str) -> f64 {
        self.schema
            .names
            .iter()
            .position(|n| n == name)
            .and_then(|i| record.values.get(i))
            .map_or(f64::NAN, Value::as_f64)
    }

    fn channels(&self, record: &Record) -> Vec<f64> {
        let start = self.model.channels_start();
        record.values[start..start + self.model.n_channels()]
            .iter()
            .map(Value::as_f64)
            .collect()
    }

    fn timeseries(&self, record: &Record, channels: &[f64]) -> Vec<f64> {
        match self.model {
            SunaModel::V1 => vec![
                self.value(record, "nitrate"),
                channels[self.index_254],
                channels[self.index_350],
            ],
            SunaModel::V2 => vec![
                self.value(record, "nitrate"),
                self.value(record, "absorbance_254"),
                self.value(record, "absorbance_350"),
            ],
        }
    }

    fn aux(&self, record: &Record) -> Vec<String> {
        let v = |name| self.value(record, name);
        match self.model {
            SunaModel::V1 => vec![
                format!("{:.2}", v("nitrate")),
                format!("{:.2}", v("lamp_temp")),
                format!("{:.2}", v("spec_temp")),
            ],
            SunaModel::V2 => vec![
                format!("{:.2}", v("nitrate")),
                format!("{:.4}", v("absorbance_254")),
                format!("{:.4}", v("absorbance_350")),
                format!("{:.1}", v("int_temp")),
            ],
        }
    }
}

impl InstrumentStrategy for Suna {
    fn module(&self) -> &'static str {
        match self.model {
            SunaModel::V1 => "sunav1",
            SunaModel::V2 => "sunav2",
        }
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        vec![ProductStream::single(self.schema.clone())]
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::Terminator(b"\r\n".to_vec())
    }

    fn default_serial(&self, port: &str) -> SerialParams {
        let baudrate = match self.model {
            SunaModel::V1 => 38_400,
            SunaModel::V2 => 57_600,
        };
        SerialParams::new(port).with_baudrate(baudrate).with_timeout(5.0)
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        let line = std::str::from_utf8(&frame.body)
            .map_err(|_| ParseError::bad_field("frame is not ASCII"))?;
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        if fields.len() < self.kinds.len() {
            return Err(ParseError::wrong_field_count(self.kinds.len(), fields.len()));
        }
        let values = self
            .kinds
            .iter()
            .zip(fields)
            .map(|(kind, raw)| -> Result<Value, ParseError> {
                let raw = raw.trim();
                if raw.is_empty() {
                    return Ok(Value::Missing);
                }
                let bad = || ParseError::bad_field(format!("invalid field {raw:?}"));
                Ok(match kind {
                    Text => Value::Text(raw.to_string()),
                    Int => Value::Int(raw.parse().map_err(|_| bad())?),
                    Float => Value::Float(raw.parse().map_err(|_| bad())?),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let record = Record::new(values);
        if Self::frame_kind(&record).is_none() {
            info!("Unknown data frame: {}", line.split(',').next().unwrap_or_default());
            return Err(ParseError::unknown_header("neither light nor dark frame"));
        }
        Ok(record)
    }

    fn events(&mut self, record: &Record, t: f64, out: &mut Vec<InstrumentEvent>) {
        let channels = self.channels(record);
        match Self::frame_kind(record) {
            Some(FrameKind::Light) => {
                out.push(InstrumentEvent::NewTimeseries {
                    values: self.timeseries(record, &channels),
                    timestamp: t,
                });
                out.push(InstrumentEvent::NewSpectrum(vec![Some(channels), None]));
                out.push(InstrumentEvent::NewAux(self.aux(record)));
            }
            Some(FrameKind::Dark) => {
                out.push(InstrumentEvent::NewSpectrum(vec![None, Some(channels)]));
            }
            None => {}
        }
    }

    fn features(&self) -> FeatureFlags {
        FeatureFlags {
            spectrum_plot: true,
            aux_data: true,
            ..Default::default()
        }
    }

    fn ui(&self) -> UiDescriptor {
        let absorbance = match self.model {
            SunaModel::V1 => "counts",
            SunaModel::V2 => "Au",
        };
        let timeseries = vec![
            "Nitrate (µM)".to_string(),
            format!("A(254) ({absorbance})"),
            format!("A(350) ({absorbance})"),
        ];
        let aux = match self.model {
            SunaModel::V1 => vec!["Nitrate (µM)", "Lamp Temp. (ºC)", "Spec Temp. (ºC)"],
            SunaModel::V2 => vec![
                "Nitrate (µM)",
                "Absorbance(254) (Au)",
                "Absorbance(350) (Au)",
                "Internal Temp. (ºC)",
            ],
        };
        UiDescriptor {
            active_timeseries: timeseries.clone(),
            timeseries,
            aux: aux.into_iter().map(String::from).collect(),
            spectrum_traces: vec!["light".into(), "dark".into()],
            spectrum_x: vec![self.wavelengths.clone(), self.wavelengths.clone()],
            ..Default::default()
        }
    }
}

impl TryFrom<&str> for SunaModel {
    type Error = InlininoError;

    fn try_from(module: &str) -> AppResult<Self> {
        match module {
            "sunav1" => Ok(SunaModel::V1),
            "sunav2" => Ok(SunaModel::V2),
            other => Err(InlininoError::Config(format!("Unknown SUNA module {other}"))),
        }
    }
}
