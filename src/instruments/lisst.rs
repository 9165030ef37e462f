//! Sequoia LISST-100(X) laser diffraction particle sizer.
//!
//! The instrument answers `GX` with one sample between braces, 40 integers
//! on their own lines: 32 ring detectors, 6 housekeeping channels, then
//! day/hour and minute/second. Frames are delimited by the `L100x:>` prompt.
//!
//! Four files calibrate it:
//! - the instrument data file (serial number, type `b`/`c`, volume
//!   conversion constant, `X` flag)
//! - `Lisst.ini`, housekeeping labels, units, scales and offsets
//! - the ring area file (`dcal`, 32 values)
//! - the zero scatter file (`zsc`, 40 values)
//!
//! The product log keeps the raw ring counts and the calibrated
//! housekeeping; calibrated scattering only feeds the plots.

use super::{
    nearest_index, ActiveChannels, ControlCommand, FeatureFlags, InstrumentConfig,
    InstrumentStrategy, LoopTick, UiDescriptor,
};
use crate::bus::InstrumentEvent;
use crate::error::{AppResult, InlininoError, ParseError};
use crate::framer::{Frame, FramingStrategy};
use crate::logger::{ProductStream, RawFormat};
use crate::record::{Record, Schema, Value};
use crate::transport::{SerialParams, Transport};
use config::{Config, File, FileFormat};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prompt closing every answer.
pub const PROMPT: &[u8] = b"L100x:>";

/// Auxiliary variable names of the product log.
pub const AUX_NAMES: [&str; 7] = [
    "laser_power",
    "battery",
    "ext_instr",
    "laser_reference",
    "depth",
    "temperature",
    "timestamp",
];

const LINE_ENDING: &str = "\r\n";
const N_RINGS: usize = 32;
const N_HOUSEKEEPING: usize = 6;
const N_VALUES: usize = 40;
const INDEX_LASER_POWER: usize = 0;
const INDEX_LASER_REFERENCE: usize = 3;
const INDEX_TEMPERATURE: usize = 5;
const PATH_LENGTH: f64 = 0.05;
// Fraction of the circle covered by the detectors
const PHI: f64 = 1.0 / 6.0;
const REFRACTIVE_INDEX_WATER: f64 = 1.3308;
const DEFAULT_TIMESERIES_ANGLES: [f64; 4] = [0.08, 0.32, 1.28, 5.12];
const AUX_DISPLAYED: [usize; 3] = [0, 3, 5];

fn cal_error(msg: impl Into<String>) -> InlininoError {
    InlininoError::CalibrationFile(msg.into())
}

fn read_text(path: &Path) -> AppResult<String> {
    std::fs::read_to_string(path).map_err(|e| cal_error(format!("{}: {e}", path.display())))
}

fn parse_numbers(text: &str, what: &str) -> AppResult<Vec<f64>> {
    text.split_whitespace()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| cal_error(format!("Invalid {what} value {v:?}")))
        })
        .collect()
}

/// Calibration of one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct LisstCalibration {
    /// Serial number.
    pub serial_number: u32,
    /// Detector type, `b` or `c`.
    pub kind: char,
    /// Volume conversion constant.
    pub vcc: i64,
    /// Divider of LISST-X counts.
    pub x: f64,
    /// Center of each ring, in degrees in water.
    pub angles: Vec<f64>,
    edges_rad: Vec<f64>,
    /// Housekeeping labels, `Day` last.
    pub aux_labels: Vec<String>,
    /// Housekeeping units, `decimal day` last.
    pub aux_units: Vec<String>,
    aux_scales: Vec<f64>,
    aux_offsets: Vec<f64>,
    dcal: Vec<f64>,
    zsc: Vec<f64>,
    zsc_aux: Vec<f64>,
}

impl LisstCalibration {
    /// Load the four calibration files.
    pub fn load(device: &Path, ini: &Path, dcal: &Path, zsc: &Path) -> AppResult<Self> {
        Self::parse(
            &read_text(device)?,
            &read_text(ini)?,
            &read_text(dcal)?,
            &read_text(zsc)?,
        )
    }

    /// Build from the content of the four calibration files.
    pub fn parse(device: &str, ini: &str, dcal: &str, zsc: &str) -> AppResult<Self> {
        let header: Vec<&str> = device
            .lines()
            .next()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .collect();
        if header.len() < 4 {
            return Err(cal_error("Invalid instrument data file"));
        }
        let serial_number: u32 = header[0]
            .parse()
            .map_err(|_| cal_error(format!("Invalid serial number {:?}", header[0])))?;
        let start = match header[1] {
            "b" => 0.1,
            "c" => 0.05,
            other => return Err(cal_error(format!("Unknown LISST Type {other}"))),
        };
        let kind = header[1].chars().next().unwrap_or('b');
        let vcc: i64 = header[3]
            .parse()
            .map_err(|_| cal_error(format!("Invalid volume conversion constant {:?}", header[3])))?;
        let x = if header.get(4) == Some(&"X") { 10.0 } else { 1.0 };

        // 33 ring edges spaced logarithmically over a 200:1 range
        let edges: Vec<f64> = (0..=N_RINGS)
            .map(|k| 200f64.powf(k as f64 / N_RINGS as f64) * start / REFRACTIVE_INDEX_WATER)
            .collect();
        let angles = edges.windows(2).map(|w| (w[0] * w[1]).sqrt()).collect();
        let edges_rad = edges.iter().map(|e| e * PI / 180.0).collect();

        let section = Self::ini_section(ini, serial_number)?;
        let key = |name: String| {
            section
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&name))
                .map(|(_, v)| v.trim().to_string())
                .ok_or_else(|| cal_error(format!("Missing {name} in initialization file")))
        };
        let number = |name: String| {
            let v = key(name.clone())?;
            v.parse::<f64>()
                .map_err(|_| cal_error(format!("Invalid {name} {v:?}")))
        };
        let mut cal = Self {
            serial_number,
            kind,
            vcc,
            x,
            angles,
            edges_rad,
            aux_labels: Vec::new(),
            aux_units: Vec::new(),
            aux_scales: Vec::new(),
            aux_offsets: Vec::new(),
            dcal: parse_numbers(dcal, "dcal")?,
            zsc: Vec::new(),
            zsc_aux: Vec::new(),
        };
        for i in 0..N_HOUSEKEEPING {
            cal.aux_labels.push(key(format!("HK{i}Label"))?);
            cal.aux_units.push(key(format!("HK{i}Units"))?);
            cal.aux_scales.push(number(format!("HK{i}Scale"))?);
            cal.aux_offsets.push(number(format!("HK{i}Off"))?);
        }
        cal.aux_labels.push("Day".into());
        cal.aux_units.push("decimal day".into());

        if cal.dcal.len() != N_RINGS {
            return Err(cal_error("Invalid dcal file"));
        }
        let zsc = parse_numbers(zsc, "zsc")?;
        if zsc.len() != N_VALUES {
            return Err(cal_error("Invalid zsc file"));
        }
        cal.zsc_aux = cal.calibrate_auxiliaries(&zsc[N_RINGS..]);
        cal.zsc = zsc[..N_RINGS].to_vec();
        Ok(cal)
    }

    fn ini_section(ini: &str, serial_number: u32) -> AppResult<HashMap<String, String>> {
        let sections: HashMap<String, HashMap<String, String>> = Config::builder()
            .add_source(File::from_str(ini, FileFormat::Ini))
            .build()?
            .try_deserialize()?;
        let name = format!("Instrument{serial_number}");
        sections
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
            .map(|(_, v)| v)
            .ok_or_else(|| {
                cal_error(format!(
                    "Initialization file does not contain the instrument {name}"
                ))
            })
    }

    /// Housekeeping in physical units followed by the decimal day.
    pub fn calibrate_auxiliaries(&self, raw: &[f64]) -> Vec<f64> {
        let mut out: Vec<f64> = (0..N_HOUSEKEEPING)
            .map(|i| {
                let mut v = raw.get(i).copied().unwrap_or(f64::NAN);
                // Temperature is a signed 16-bit value
                if i == INDEX_TEMPERATURE && v > 32767.0 {
                    v -= 65536.0;
                }
                self.aux_scales[i] * v + self.aux_offsets[i]
            })
            .collect();
        let ddhh = raw.get(N_HOUSEKEEPING).copied().unwrap_or(f64::NAN);
        let mmss = raw.get(N_HOUSEKEEPING + 1).copied().unwrap_or(f64::NAN);
        out.push(
            (ddhh / 100.0).floor()
                + (ddhh % 100.0) / 24.0
                + (mmss / 100.0).floor() / 1440.0
                + (mmss % 100.0) / 86400.0,
        );
        out
    }

    /// Scattering, beam attenuation and housekeeping of one sample.
    pub fn calibrate(&self, raw: &[f64]) -> (Vec<f64>, f64, Vec<f64>) {
        let (raw_beta, raw_aux) = raw.split_at(N_RINGS.min(raw.len()));
        let aux = self.calibrate_auxiliaries(raw_aux);
        // Drift of the laser output since the zero scatter
        let r = self.zsc_aux[INDEX_LASER_POWER] / self.zsc_aux[INDEX_LASER_REFERENCE];
        let tau = aux[INDEX_LASER_POWER] / r / aux[INDEX_LASER_REFERENCE];
        let c = -tau.ln() / PATH_LENGTH;
        let reference = aux[INDEX_LASER_REFERENCE] / self.zsc_aux[INDEX_LASER_REFERENCE];
        let beta = raw_beta
            .iter()
            .enumerate()
            .map(|(i, counts)| {
                let corrected = (counts / self.x / tau - self.zsc[i] * reference) * self.dcal[i];
                let area = PATH_LENGTH
                    * PI
                    * PHI
                    * (self.edges_rad[i + 1].powi(2) - self.edges_rad[i].powi(2));
                corrected / area
            })
            .collect();
        (beta, c, aux)
    }
}

/// Decode the 40 integers between braces.
pub fn unpack_packet(body: &[u8]) -> Result<Vec<f64>, ParseError> {
    let text = String::from_utf8_lossy(body);
    let (Some(open), Some(close)) = (text.find('{'), text.rfind('}')) else {
        return Err(ParseError::incomplete("Unable to find sample between braces"));
    };
    if close < open {
        return Err(ParseError::bad_field("Unable to find sample between braces"));
    }
    let values = text[open + 1..close]
        .split_whitespace()
        .map(|v| {
            v.parse::<i64>()
                .map(|v| v as f64)
                .map_err(|_| ParseError::bad_field(format!("Invalid value {v:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != N_VALUES {
        return Err(ParseError::wrong_field_count(N_VALUES, values.len()));
    }
    Ok(values)
}

/// LISST strategy.
#[derive(Debug, Clone)]
pub struct Lisst {
    cal: LisstCalibration,
    channels: ActiveChannels,
    beta: Vec<f64>,
}

impl Lisst {
    /// Build from a checked configuration.
    pub fn new(config: &InstrumentConfig) -> AppResult<Self> {
        let path = |key: &str| config.require::<PathBuf>(key);
        Ok(Self::with_calibration(LisstCalibration::load(
            &path("device_file")?,
            &path("ini_file")?,
            &path("dcal_file")?,
            &path("zsc_file")?,
        )?))
    }

    /// Build from a loaded calibration.
    pub fn with_calibration(cal: LisstCalibration) -> Self {
        let mut channels = ActiveChannels::new(
            cal.angles
                .iter()
                .map(|a| format!("beta({a:.5})"))
                .collect(),
        );
        for theta in DEFAULT_TIMESERIES_ANGLES {
            if let Some(i) = nearest_index(&cal.angles, theta) {
                channels.set_index(i, true);
            }
        }
        Self {
            cal,
            channels,
            beta: Vec::new(),
        }
    }

    /// Calibration in use.
    pub fn calibration(&self) -> &LisstCalibration {
        &self.cal
    }

    fn command_line(command: &str) -> Vec<u8> {
        format!("{command}{LINE_ENDING}").into_bytes()
    }
}

impl InstrumentStrategy for Lisst {
    fn module(&self) -> &'static str {
        "lisst"
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        let angles: Vec<String> = self.cal.angles.iter().map(|a| format!("{a:.2}")).collect();
        let mut units = vec![format!("counts\tangle={}", angles.join(" "))];
        units.extend(self.cal.aux_units.iter().cloned());
        let names: Vec<String> = std::iter::once("beta")
            .chain(AUX_NAMES)
            .map(str::to_string)
            .collect();
        let precisions: Vec<String> = [
            "%s", "%.6f", "%.2f", "%.2f", "%.6f", "%.2f", "%.2f", "%.6f",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        vec![ProductStream::single(Schema::new(&names, &units, &precisions))]
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::Terminator(PROMPT.to_vec())
    }

    fn raw_format(&self) -> RawFormat {
        RawFormat::Text {
            header: false,
            prefix: PROMPT.to_vec(),
        }
    }

    fn default_serial(&self, port: &str) -> SerialParams {
        SerialParams::new(port).with_baudrate(9600).with_timeout(10.0)
    }

    fn init_sequence(&mut self, io: &mut dyn Transport, _t: f64) -> AppResult<()> {
        // Real time mode, one sample of 250 measurements every 6 s
        for command in ["OM 1", "BI 6", "SB 1", "SI 6", "MA 250"] {
            io.write(&Self::command_line(command))?;
        }
        std::thread::sleep(Duration::from_millis(100));
        io.read()?;
        io.write(&Self::command_line("GX"))
    }

    fn control_step(&mut self, io: &mut dyn Transport, tick: LoopTick) -> AppResult<()> {
        if tick.frames > 0 || tick.idle {
            io.write(&Self::command_line("GX"))?;
        }
        Ok(())
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        Ok(Record::new(vec![Value::Array(unpack_packet(&frame.body)?)]))
    }

    fn calibrate(&mut self, record: Record) -> Result<Record, ParseError> {
        let raw = record
            .values
            .first()
            .and_then(Value::as_array)
            .filter(|r| r.len() == N_VALUES)
            .ok_or_else(|| ParseError::wrong_field_count(N_VALUES, 0))?;
        let (beta, _c, aux) = self.cal.calibrate(raw);
        self.beta = beta;
        let mut values = vec![Value::Array(raw[..N_RINGS].to_vec())];
        values.extend(aux.into_iter().map(Value::Float));
        Ok(Record::new(values))
    }

    fn events(&mut self, record: &Record, t: f64, out: &mut Vec<InstrumentEvent>) {
        out.push(InstrumentEvent::NewTimeseries {
            values: self.channels.select(&self.beta),
            timestamp: t,
        });
        out.push(InstrumentEvent::NewAux(
            AUX_DISPLAYED
                .iter()
                .map(|i| {
                    let v = record.values.get(i + 1).map_or(f64::NAN, Value::as_f64);
                    format!("{v:.2}")
                })
                .collect(),
        ));
        out.push(InstrumentEvent::NewSpectrum(vec![Some(self.beta.clone())]));
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
            aux: AUX_DISPLAYED
                .iter()
                .map(|i| format!("{} ({})", self.cal.aux_labels[*i], self.cal.aux_units[*i]))
                .collect(),
            spectrum_traces: vec!["beta".into()],
            spectrum_x: vec![self.cal.angles.iter().map(|a| a.log10()).collect()],
            ..Default::default()
        }
    }

    fn command(&mut self, command: &ControlCommand) -> AppResult<()> {
        match command {
            ControlCommand::SelectTimeseries { name, enabled } => self.channels.set(name, *enabled),
            other => Err(InlininoError::Config(format!(
                "lisst does not support {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseErrorKind;
    use crate::transport::mock::MockTransport;

    const DEVICE: &str = "1234, c, 0, 20000\n";

    fn ini() -> String {
        let mut ini = String::from("[Instrument1234]\n");
        let labels = ["Laser Power", "Battery", "Ext Instr", "Laser Ref", "Depth", "Temperature"];
        let units = ["mW", "V", "V", "mW", "m", "degC"];
        for i in 0..6 {
            ini.push_str(&format!(
                "HK{i}Label={}\nHK{i}Units={}\nHK{i}Scale=1\nHK{i}Off=0\n",
                labels[i], units[i]
            ));
        }
        ini.push_str("[Instrument9999]\nHK0Label=Other\n");
        ini
    }

    fn zsc() -> String {
        let mut values = vec!["0"; 32];
        values.extend(["100", "12", "0", "100", "0", "20", "0", "0"]);
        values.join("\n")
    }

    fn calibration() -> LisstCalibration {
        LisstCalibration::parse(DEVICE, &ini(), &vec!["1"; 32].join("  "), &zsc()).unwrap()
    }

    fn packet(values: &[i64]) -> Vec<u8> {
        let lines: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        format!("GX\r\n{{\r\n{}\r\n}}\r\n", lines.join("\r\n")).into_bytes()
    }

    fn sample() -> Vec<i64> {
        let mut values = vec![10; 32];
        values.extend([50, 12, 0, 100, 0, 65535, 1512, 3000]);
        values
    }

    #[test]
    fn angles_span_the_detector() {
        let cal = calibration();
        assert_eq!(cal.angles.len(), 32);
        let first = (0.05f64 * 0.05 * 200f64.powf(1.0 / 32.0)).sqrt() / 1.3308;
        assert!((cal.angles[0] - first).abs() < 1e-12);
        assert_eq!(cal.aux_labels[6], "Day");
        assert_eq!(cal.x, 1.0);
    }

    #[test]
    fn housekeeping_and_decimal_day() {
        let cal = calibration();
        let aux = cal.calibrate_auxiliaries(&[50.0, 12.0, 0.0, 100.0, 0.0, 65535.0, 1512.0, 3000.0]);
        assert_eq!(aux[5], -1.0);
        assert!((aux[6] - (15.5 + 30.0 / 1440.0)).abs() < 1e-12);
    }

    #[test]
    fn scattering_is_corrected_for_attenuation() {
        let cal = calibration();
        let raw: Vec<f64> = sample().iter().map(|v| *v as f64).collect();
        let (beta, c, _) = cal.calibrate(&raw);
        // tau = 0.5
        assert!((c - 2f64.ln() / 0.05).abs() < 1e-9);
        let area = 0.05 * PI / 6.0 * (cal.edges_rad[1].powi(2) - cal.edges_rad[0].powi(2));
        assert!((beta[0] - 20.0 / area).abs() / beta[0] < 1e-12);
    }

    #[test]
    fn packet_needs_forty_values() {
        let lisst = Lisst::with_calibration(calibration());
        let r = lisst.parse(&Frame::from_body(packet(&sample()))).unwrap();
        assert_eq!(r.values[0].as_array().map(<[f64]>::len), Some(40));
        let e = lisst
            .parse(&Frame::from_body(packet(&sample()[..39])))
            .unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::WrongFieldCount);
        let e = lisst.parse(&Frame::from_body(b"GX\r\n".to_vec())).unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::Incomplete);
    }

    #[test]
    fn product_keeps_raw_counts() {
        let mut lisst = Lisst::with_calibration(calibration());
        let raw = lisst.parse(&Frame::from_body(packet(&sample()))).unwrap();
        let r = lisst.calibrate(raw).unwrap();
        assert_eq!(r.values.len(), 8);
        assert_eq!(r.values[0], Value::Array(vec![10.0; 32]));
        let mut events = Vec::new();
        lisst.events(&r, 0.0, &mut events);
        assert_eq!(
            events[1],
            InstrumentEvent::NewAux(vec!["50.00".into(), "100.00".into(), "-1.00".into()])
        );
        assert_eq!(lisst.ui().active_timeseries.len(), 4);
        assert_eq!(lisst.ui().aux[0], "Laser Power (mW)");
    }

    #[test]
    fn polls_after_each_frame() {
        let mut io = MockTransport::new();
        let mut lisst = Lisst::with_calibration(calibration());
        lisst.init_sequence(&mut io, 0.0).unwrap();
        lisst
            .control_step(&mut io, LoopTick { t: 0.0, frames: 0, idle: false })
            .unwrap();
        lisst
            .control_step(&mut io, LoopTick { t: 0.0, frames: 1, idle: false })
            .unwrap();
        let writes = io.writes();
        let writes = writes.lock();
        assert_eq!(writes.len(), 7);
        assert_eq!(writes[0], b"OM 1\r\n");
        assert_eq!(writes[5], b"GX\r\n");
        assert_eq!(writes[6], b"GX\r\n");
    }

    #[test]
    fn unknown_serial_in_ini() {
        let e = LisstCalibration::parse("42, c, 0, 1\n", &ini(), &vec!["1"; 32].join(" "), &zsc());
        assert!(matches!(e, Err(InlininoError::CalibrationFile(_))));
    }
}
