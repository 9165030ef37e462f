//! WET Labs ACS spectrophotometer.
//!
//! Binary frames start with the registration `FF 00 FF 00`, followed by a
//! 28 byte header, four `u16` counts per wavelength, a `u16` checksum and a
//! pad byte. The number of wavelengths comes from the device file, so the
//! frame length is fixed for a given instrument.
//!
//! Calibration follows the device file: absorption and attenuation are
//! computed from signal/reference counts, offsets and a temperature
//! correction interpolated at the internal temperature.

use super::{
    nearest_index, ActiveChannels, ControlCommand, FeatureFlags, InstrumentConfig,
    InstrumentStrategy, UiDescriptor,
};
use crate::bus::InstrumentEvent;
use crate::error::{AppResult, InlininoError, ParseError};
use crate::framer::{Frame, FramingStrategy};
use crate::logger::{ProductStream, RawFormat};
use crate::record::{Record, Schema, Value};
use crate::transport::SerialParams;
use std::path::Path;
use tracing::warn;

/// Start of frame marker.
pub const REGISTRATION: [u8; 4] = [0xff, 0x00, 0xff, 0x00];

/// Header bytes after the registration.
pub const HEADER_LEN: usize = 28;

/// Buffer ceiling of ACS instruments.
pub const ACS_BUFFER_CEILING: usize = 10 * 1024;

const FLAG_WARNING_INTERVAL: f64 = 120.0;

// =============================================================================
// Device file
// =============================================================================

/// Calibration of one instrument, read from its `.dev` file.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFile {
    /// Meter serial number.
    pub serial_number: u32,
    /// Baud rate, when listed.
    pub baudrate: Option<u32>,
    /// Path length in meters.
    pub path_length: f64,
    /// Attenuation wavelengths.
    pub lambda_c: Vec<f64>,
    /// Absorption wavelengths.
    pub lambda_a: Vec<f64>,
    /// Attenuation offsets.
    pub offset_c: Vec<f64>,
    /// Absorption offsets.
    pub offset_a: Vec<f64>,
    /// Temperature bins.
    pub t_bins: Vec<f64>,
    /// Attenuation temperature corrections, one row per wavelength.
    pub delta_t_c: Vec<Vec<f64>>,
    /// Absorption temperature corrections, one row per wavelength.
    pub delta_t_a: Vec<Vec<f64>>,
}

fn dev_error(msg: impl Into<String>) -> InlininoError {
    InlininoError::CalibrationFile(msg.into())
}

fn leading_value(line: &str) -> &str {
    line.split(';').next().unwrap_or_default().trim()
}

fn parse_floats(s: &str) -> AppResult<Vec<f64>> {
    s.split_whitespace()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| dev_error(format!("invalid number {v:?}")))
        })
        .collect()
}

impl DeviceFile {
    /// Read a device file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| dev_error(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Parse the content of a device file.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut serial_number = None;
        let mut baudrate = None;
        let mut path_length = None;
        let mut n_wavelengths = None;
        let mut t_bins = None;
        let mut rows = Vec::new();

        let mut lines = text.lines();
        while let Some(line) = lines.next() {
            let lower = line.to_ascii_lowercase();
            let value = leading_value(line);
            if lower.contains("serial number") {
                let hex = value.trim_start_matches("0x").trim_start_matches("0X");
                serial_number = Some(
                    u32::from_str_radix(hex, 16)
                        .map_err(|_| dev_error(format!("invalid serial number {value:?}")))?,
                );
            } else if lower.contains("baud rate") {
                baudrate = value.parse().ok();
            } else if lower.contains("path length") {
                path_length = Some(
                    value
                        .parse::<f64>()
                        .map_err(|_| dev_error(format!("invalid path length {value:?}")))?,
                );
            } else if lower.contains("output wavelengths") || lower.contains("number of wavelengths")
            {
                n_wavelengths = value.parse::<usize>().ok();
            } else if lower.contains("number of temperature bins") {
                let bins = lines
                    .next()
                    .ok_or_else(|| dev_error("missing temperature bins"))?;
                t_bins = Some(parse_floats(leading_value(bins))?);
            } else if value.starts_with('C')
                && value[1..].starts_with(|c: char| c.is_ascii_digit())
            {
                rows.push(value.to_string());
            }
        }

        let serial_number = serial_number.ok_or_else(|| dev_error("missing serial number"))?;
        let path_length = path_length.ok_or_else(|| dev_error("missing path length"))?;
        let t_bins = t_bins.ok_or_else(|| dev_error("missing temperature bins"))?;
        if t_bins.is_empty() {
            return Err(dev_error("no temperature bins"));
        }
        let nt = t_bins.len();

        let mut dev = Self {
            serial_number,
            baudrate,
            path_length,
            lambda_c: Vec::new(),
            lambda_a: Vec::new(),
            offset_c: Vec::new(),
            offset_a: Vec::new(),
            t_bins,
            delta_t_c: Vec::new(),
            delta_t_a: Vec::new(),
        };
        for row in rows {
            let fields: Vec<&str> = row.split_whitespace().collect();
            if fields.len() != 5 + 2 * nt {
                return Err(dev_error(format!(
                    "wavelength row has {} fields, expected {}",
                    fields.len(),
                    5 + 2 * nt
                )));
            }
            let wavelength = |s: &str| {
                s[1..]
                    .parse::<f64>()
                    .map_err(|_| dev_error(format!("invalid wavelength {s:?}")))
            };
            dev.lambda_c.push(wavelength(fields[0])?);
            dev.lambda_a.push(wavelength(fields[1])?);
            let numbers = parse_floats(&fields[3..].join(" "))?;
            dev.offset_c.push(numbers[0]);
            dev.offset_a.push(numbers[1]);
            dev.delta_t_c.push(numbers[2..2 + nt].to_vec());
            dev.delta_t_a.push(numbers[2 + nt..].to_vec());
        }
        if let Some(n) = n_wavelengths {
            if n != dev.lambda_c.len() {
                return Err(dev_error(format!(
                    "{n} wavelengths announced, {} listed",
                    dev.lambda_c.len()
                )));
            }
        }
        if dev.lambda_c.is_empty() {
            return Err(dev_error("no wavelengths"));
        }
        Ok(dev)
    }

    /// Number of wavelengths.
    pub fn n_wavelengths(&self) -> usize {
        self.lambda_c.len()
    }

    /// Frame length after the registration.
    pub fn frame_length(&self) -> usize {
        HEADER_LEN + 8 * self.n_wavelengths() + 2
    }
}

// =============================================================================
// Frame decoding and calibration
// =============================================================================

/// Counts of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Milliseconds since power up.
    pub time_ms: u32,
    /// Internal temperature counts.
    pub t_int: u16,
    /// External temperature counts.
    pub t_ext: u16,
    /// Attenuation reference counts.
    pub c_ref: Vec<f64>,
    /// Absorption reference counts.
    pub a_ref: Vec<f64>,
    /// Attenuation signal counts.
    pub c_sig: Vec<f64>,
    /// Absorption signal counts.
    pub a_sig: Vec<f64>,
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

/// Decode the frame body (registration excluded) of `n` wavelengths.
pub fn unpack_frame(body: &[u8], n: usize) -> Result<RawFrame, ParseError> {
    let expected = HEADER_LEN + 8 * n + 2;
    if body.len() < expected {
        return Err(ParseError::incomplete(format!(
            "frame of {} bytes, expected {expected}",
            body.len()
        )));
    }
    let checksum_at = HEADER_LEN + 8 * n;
    let sum = REGISTRATION
        .iter()
        .chain(&body[..checksum_at])
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
    let checksum = be_u16(body, checksum_at);
    if sum != checksum {
        return Err(ParseError::checksum(format!(
            "checksum {sum:#06x} != {checksum:#06x}"
        )));
    }
    let n_in_frame = usize::from(body[HEADER_LEN - 1]);
    if n_in_frame != n {
        return Err(ParseError::bad_field(format!(
            "frame has {n_in_frame} wavelengths, device file {n}"
        )));
    }
    let mut frame = RawFrame {
        time_ms: u32::from_be_bytes([body[22], body[23], body[24], body[25]]),
        t_ext: be_u16(body, 14),
        t_int: be_u16(body, 16),
        c_ref: Vec::with_capacity(n),
        a_ref: Vec::with_capacity(n),
        c_sig: Vec::with_capacity(n),
        a_sig: Vec::with_capacity(n),
    };
    for i in 0..n {
        let at = HEADER_LEN + 8 * i;
        frame.c_ref.push(f64::from(be_u16(body, at)));
        frame.a_ref.push(f64::from(be_u16(body, at + 2)));
        frame.c_sig.push(f64::from(be_u16(body, at + 4)));
        frame.a_sig.push(f64::from(be_u16(body, at + 6)));
    }
    Ok(frame)
}

/// Internal temperature (thermistor) in degrees Celsius.
pub fn internal_temperature(counts: f64) -> f64 {
    let volts = 5.0 * counts / 65535.0;
    let resistance = 10000.0 * volts / (4.516 - volts);
    let ln_r = resistance.ln();
    1.0 / (0.000_931_35 + 0.000_221_631 * ln_r + 0.000_000_125_741 * ln_r.powi(3)) - 273.15
}

/// External temperature in degrees Celsius.
pub fn external_temperature(counts: f64) -> f64 {
    -7.102_331_7e-13 * counts.powi(3) + 7.093_419_20e-08 * counts.powi(2)
        - 3.870_656_73e-03 * counts
        + 95.824_139_7
}

/// Linear interpolation of `ys` over `xs` at `x`, clamped at both ends.
pub fn interp(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let n = xs.len().min(ys.len());
    if n == 0 || x.is_nan() {
        return f64::NAN;
    }
    if n == 1 || x <= xs[0] {
        return ys[0];
    }
    if x >= xs[n - 1] {
        return ys[n - 1];
    }
    let i = xs[..n].iter().position(|v| *v > x).unwrap_or(n - 1).max(1);
    let (x0, x1, y0, y1) = (xs[i - 1], xs[i], ys[i - 1], ys[i]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

// =============================================================================
// Strategy
// =============================================================================

/// ACS strategy.
#[derive(Debug, Clone)]
pub struct Acs {
    dev: DeviceFile,
    channels: ActiveChannels,
    last_flag_warning: Option<f64>,
    flag_alarm_raised: bool,
}

impl Acs {
    /// Build from a checked configuration.
    pub fn new(config: &InstrumentConfig) -> AppResult<Self> {
        let path: std::path::PathBuf = config.require("device_file")?;
        Ok(Self::with_device(DeviceFile::load(&path)?))
    }

    /// Build from a parsed device file.
    pub fn with_device(dev: DeviceFile) -> Self {
        let names = dev
            .lambda_c
            .iter()
            .map(|wl| format!("c({wl})"))
            .chain(dev.lambda_a.iter().map(|wl| format!("a({wl})")))
            .collect();
        let mut channels = ActiveChannels::new(names);
        let n = dev.n_wavelengths();
        if let Some(i) = nearest_index(&dev.lambda_c, 532.0) {
            channels.set_index(i, true);
        }
        for wl in [532.0, 676.0] {
            if let Some(i) = nearest_index(&dev.lambda_a, wl) {
                channels.set_index(n + i, true);
            }
        }
        Self {
            dev,
            channels,
            last_flag_warning: None,
            flag_alarm_raised: false,
        }
    }

    /// Device file in use.
    pub fn device(&self) -> &DeviceFile {
        &self.dev
    }

    fn array(values: &[Value], i: usize) -> Result<&[f64], ParseError> {
        values
            .get(i)
            .and_then(Value::as_array)
            .ok_or_else(|| ParseError::calibration(format!("missing array at {i}")))
    }
}

impl InstrumentStrategy for Acs {
    fn module(&self) -> &'static str {
        "acs"
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        let lambda = |wls: &[f64]| {
            let joined: Vec<String> = wls.iter().map(|w| w.to_string()).collect();
            format!("1/m\tlambda={}", joined.join(" "))
        };
        let c_units = lambda(&self.dev.lambda_c);
        let a_units = lambda(&self.dev.lambda_a);
        vec![ProductStream::single(Schema::new(
            &[
                "acs_timestamp",
                "c",
                "a",
                "T_int",
                "T_ext",
                "flag_outside_calibration_range",
            ],
            &["ms", c_units.as_str(), a_units.as_str(), "deg_C", "deg_C", "bool"],
            &["%d", "%s", "%s", "%.2f", "%.2f", "%s"],
        ))]
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::Registration {
            registration: REGISTRATION.to_vec(),
            length: self.dev.frame_length(),
        }
    }

    fn buffer_ceiling(&self) -> usize {
        ACS_BUFFER_CEILING
    }

    fn raw_format(&self) -> RawFormat {
        RawFormat::binary()
    }

    fn default_serial(&self, port: &str) -> SerialParams {
        SerialParams::new(port)
            .with_baudrate(self.dev.baudrate.unwrap_or(115_200))
            .with_timeout(1.0)
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        let raw = unpack_frame(&frame.body, self.dev.n_wavelengths())?;
        Ok(Record::new(vec![
            Value::Int(i64::from(raw.time_ms)),
            Value::Array(raw.c_ref),
            Value::Array(raw.a_ref),
            Value::Array(raw.c_sig),
            Value::Array(raw.a_sig),
            Value::Int(i64::from(raw.t_int)),
            Value::Int(i64::from(raw.t_ext)),
        ]))
    }

    fn calibrate(&mut self, record: Record) -> Result<Record, ParseError> {
        let v = &record.values;
        let (c_ref, a_ref) = (Self::array(v, 1)?, Self::array(v, 2)?);
        let (c_sig, a_sig) = (Self::array(v, 3)?, Self::array(v, 4)?);
        let t_int = internal_temperature(v.get(5).map(Value::as_f64).unwrap_or(f64::NAN));
        let t_ext = external_temperature(v.get(6).map(Value::as_f64).unwrap_or(f64::NAN));
        let x = self.dev.path_length;
        let bins = &self.dev.t_bins;
        let c = (0..self.dev.n_wavelengths())
            .map(|i| {
                self.dev.offset_c[i]
                    - (c_sig[i] / c_ref[i]).ln() / x
                    - interp(bins, &self.dev.delta_t_c[i], t_int)
            })
            .collect();
        let a = (0..self.dev.n_wavelengths())
            .map(|i| {
                self.dev.offset_a[i]
                    - (a_sig[i] / a_ref[i]).ln() / x
                    - interp(bins, &self.dev.delta_t_a[i], t_int)
            })
            .collect();
        let outside = match (bins.first(), bins.last()) {
            (Some(lo), Some(hi)) => t_int.is_nan() || t_int < *lo || t_int > *hi,
            _ => false,
        };
        Ok(Record::new(vec![
            v.first().cloned().unwrap_or(Value::Missing),
            Value::Array(c),
            Value::Array(a),
            Value::Float(t_int),
            Value::Float(t_ext),
            Value::Bool(outside),
        ]))
    }

    fn events(&mut self, record: &Record, t: f64, out: &mut Vec<InstrumentEvent>) {
        let v = &record.values;
        let c = v.get(1).and_then(Value::as_array).unwrap_or_default().to_vec();
        let a = v.get(2).and_then(Value::as_array).unwrap_or_default().to_vec();
        let all: Vec<f64> = c.iter().chain(&a).copied().collect();
        out.push(InstrumentEvent::NewTimeseries {
            values: self.channels.select(&all),
            timestamp: t,
        });
        let flag = matches!(v.get(5), Some(Value::Bool(true)));
        out.push(InstrumentEvent::NewAux(vec![
            format!("{:.2}", v.get(3).map(Value::as_f64).unwrap_or(f64::NAN)),
            format!("{:.2}", v.get(4).map(Value::as_f64).unwrap_or(f64::NAN)),
            if flag { "True" } else { "False" }.to_string(),
        ]));
        out.push(InstrumentEvent::NewSpectrum(vec![Some(c), Some(a)]));
        if flag
            && self
                .last_flag_warning
                .map_or(true, |last| t - last > FLAG_WARNING_INTERVAL)
        {
            self.last_flag_warning = Some(t);
            warn!("Internal temperature outside calibration range.");
            if !self.flag_alarm_raised {
                self.flag_alarm_raised = true;
                out.push(InstrumentEvent::AlarmCustom {
                    text: "Internal temperature outside calibration range.".into(),
                    info: "Data are extrapolated from the closest temperature bin.".into(),
                });
            }
        }
    }

    fn features(&self) -> FeatureFlags {
        FeatureFlags {
            spectrum_plot: true,
            aux_data: true,
            select_channel: true,
            ..Default::default()
        }
    }

    fn ui(&self) -> UiDescriptor {
        UiDescriptor {
            timeseries: self.channels.names().to_vec(),
            active_timeseries: self.channels.active_names(),
            aux: vec![
                "Internal Temp. (ºC)".into(),
                "External Temp. (ºC)".into(),
                "Outside Cal Range".into(),
            ],
            spectrum_traces: vec!["c".into(), "a".into()],
            spectrum_x: vec![self.dev.lambda_c.clone(), self.dev.lambda_a.clone()],
            ..Default::default()
        }
    }

    fn command(&mut self, command: &ControlCommand) -> AppResult<()> {
        match command {
            ControlCommand::SelectTimeseries { name, enabled } => self.channels.set(name, *enabled),
            other => Err(InlininoError::Config(format!(
                "acs does not support {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ParseErrorKind;

    pub(crate) const DEVICE_FILE: &str = "ACS Meter\n\
0x5300012C\t;Serial number\n\
19\t; temperature when calibrated (tcal)\n\
0.25\t;Path Length (meters)\n\
2\t;number of output wavelengths\n\
3\t; number of temperature bins\n\
10.0 20.0 30.0\t; the temperature bins\n\
C500.0\tA501.0\t0\t0.5\t0.25\t0.01 0.02 0.03\t0.1 0.2 0.3\t; C and A offset, and temp corrections\n\
C532.1\tA530.2\t0\t1.5\t1.25\t0.0 0.0 0.0\t0.0 0.0 0.0\t; C and A offset, and temp corrections\n";

    /// Frame body (registration excluded) with valid checksum.
    pub(crate) fn frame_body(counts: &[[u16; 4]], t_int: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(32 + 8 * counts.len() as u16 + 2).to_be_bytes());
        body.push(5); // packet type
        body.push(0);
        body.extend_from_slice(&0x5300_012Ci32.to_be_bytes());
        for v in [0u16, 0, 0, 30_000, t_int, 0, 0] {
            body.extend_from_slice(&v.to_be_bytes());
        }
        body.extend_from_slice(&123_456u32.to_be_bytes());
        body.push(0);
        body.push(counts.len() as u8);
        for c in counts {
            for v in c {
                body.extend_from_slice(&v.to_be_bytes());
            }
        }
        let sum = REGISTRATION
            .iter()
            .chain(&body)
            .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
        body.extend_from_slice(&sum.to_be_bytes());
        body
    }

    fn acs() -> Acs {
        Acs::with_device(DeviceFile::parse(DEVICE_FILE).unwrap())
    }

    #[test]
    fn device_file_is_read() {
        let dev = DeviceFile::parse(DEVICE_FILE).unwrap();
        assert_eq!(dev.serial_number, 0x5300_012C);
        assert_eq!(dev.lambda_c, vec![500.0, 532.1]);
        assert_eq!(dev.lambda_a, vec![501.0, 530.2]);
        assert_eq!(dev.offset_a, vec![0.25, 1.25]);
        assert_eq!(dev.delta_t_a[0], vec![0.1, 0.2, 0.3]);
        assert_eq!(dev.frame_length(), 28 + 16 + 2);
    }

    #[test]
    fn internal_temperature_is_plausible() {
        // About 3.4 V across the thermistor divider
        let t = internal_temperature(44_300.0);
        assert!(t > 20.0 && t < 30.0, "{t}");
        assert!((external_temperature(0.0) - 95.824_139_7).abs() < 1e-9);
    }

    #[test]
    fn calibrates_counts() {
        let mut acs = acs();
        let body = frame_body(&[[1000, 1000, 500, 1000], [1000, 1000, 1000, 1000]], 29_000);
        let frame = Frame {
            header: REGISTRATION.to_vec(),
            body,
        };
        let raw = acs.parse(&frame).unwrap();
        assert_eq!(raw.values[0], Value::Int(123_456));
        let cal = acs.calibrate(raw).unwrap();
        let c = cal.values[1].as_array().unwrap();
        let t_int = cal.values[3].as_f64();
        let expected = 0.5 - (0.5f64).ln() / 0.25 - interp(&[10.0, 20.0, 30.0], &[0.01, 0.02, 0.03], t_int);
        assert!((c[0] - expected).abs() < 1e-12);
        let a = cal.values[2].as_array().unwrap();
        assert!((a[1] - 1.25).abs() < 1e-12);
    }

    #[test]
    fn saturated_thermistor_with_one_bin() {
        let text = DEVICE_FILE
            .replace("3\t; number of temperature bins\n10.0 20.0 30.0", "1\t; number of temperature bins\n20.0")
            .replace("0.01 0.02 0.03\t0.1 0.2 0.3", "0.02\t0.2")
            .replace("0.0 0.0 0.0\t0.0 0.0 0.0", "0.0\t0.0");
        let mut acs = Acs::with_device(DeviceFile::parse(&text).unwrap());
        assert!(internal_temperature(65_000.0).is_nan());
        let frame = Frame {
            header: REGISTRATION.to_vec(),
            body: frame_body(&[[1000, 1000, 500, 1000], [1000, 1000, 1000, 1000]], 65_000),
        };
        let raw = acs.parse(&frame).unwrap();
        let cal = acs.calibrate(raw).unwrap();
        assert!(cal.values[3].as_f64().is_nan());
        assert!(cal.values[1].as_array().unwrap()[0].is_nan());
        assert_eq!(cal.values[5], Value::Bool(true));
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let mut body = frame_body(&[[1, 2, 3, 4], [5, 6, 7, 8]], 29_000);
        body[30] ^= 0x01;
        let e = unpack_frame(&body, 2).unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::Checksum);
    }

    #[test]
    fn interpolation_clamps() {
        let xs = [10.0, 20.0];
        let ys = [1.0, 3.0];
        assert_eq!(interp(&xs, &ys, 5.0), 1.0);
        assert_eq!(interp(&xs, &ys, 15.0), 2.0);
        assert_eq!(interp(&xs, &ys, 25.0), 3.0);
    }

    #[test]
    fn interpolation_single_bin_and_nan() {
        assert_eq!(interp(&[15.0], &[0.7], 3.0), 0.7);
        assert_eq!(interp(&[15.0], &[0.7], 40.0), 0.7);
        assert!(interp(&[15.0], &[0.7], f64::NAN).is_nan());
        assert!(interp(&[10.0, 20.0], &[1.0, 3.0], f64::NAN).is_nan());
        assert!(interp(&[], &[], 1.0).is_nan());
    }

    #[test]
    fn default_channels_near_532_and_676() {
        let acs = acs();
        assert_eq!(
            acs.ui().active_timeseries,
            vec!["c(532.1)", "a(530.2)"]
        );
    }
}
