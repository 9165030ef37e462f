//! Sequoia HyperBB hyperspectral backscattering meter.
//!
//! The instrument scans its LED across wavelengths and sends one
//! whitespace separated line of 30 fields per step. Each line is
//! calibrated on its own: signal over reference, dark offset removed,
//! PMT and front end gains applied, LED temperature corrected, then the
//! highest non saturated gain channel is scaled to `beta_u` and `bb`.
//!
//! The plaque and temperature calibrations are read from JSON exports of
//! the manufacturer's MATLAB structures (`{"cal": {...}}` and
//! `{"cal_temp": {"wl": [...], "coeff": [[...]]}}`), field names kept.

use super::acs::interp;
use super::{
    nearest_index, ActiveChannels, ControlCommand, FeatureFlags, InstrumentConfig,
    InstrumentStrategy, UiDescriptor,
};
use crate::bus::InstrumentEvent;
use crate::error::{AppResult, InlininoError, ParseError, ParseErrorKind};
use crate::framer::{Frame, FramingStrategy};
use crate::logger::ProductStream;
use crate::record::{Record, Schema, Value};
use crate::transport::SerialParams;
use serde::Deserialize;
use serde_json::Value as Json;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

/// Field names of a frame.
pub const FRAME_VARIABLES: [&str; 30] = [
    "ScanIdx", "DataIdx", "Date", "Time", "StepPos", "wl", "LedPwr", "PmtGain", "NetSig1",
    "SigOn1", "SigOn1Std", "RefOn", "RefOnStd", "SigOff1", "SigOff1Std", "RefOff", "RefOffStd",
    "SigOn2", "SigOn2Std", "SigOn3", "SigOn3Std", "SigOff2", "SigOff2Std", "SigOff3",
    "SigOff3Std", "LedTemp", "WaterTemp", "Depth", "Debug1", "zDistance",
];

const TEXT_FIELDS: [usize; 2] = [2, 3];
const FLOAT_FIELDS: std::ops::Range<usize> = 9..28;

const WL: usize = 5;
const PMT_GAIN: usize = 7;
const NET_SIG1: usize = 8;
const REF_ON: usize = 11;
const REF_OFF: usize = 15;
const SIG_ON2: usize = 17;
const SIG_ON3: usize = 19;
const SIG_OFF2: usize = 21;
const SIG_OFF3: usize = 23;
const LED_TEMP: usize = 25;
const WATER_TEMP: usize = 26;
const DEPTH: usize = 27;

/// Counts above which a signal channel is saturated.
pub const SATURATION_LEVEL: f64 = 4000.0;

/// Conversion factor from beta at 135 degrees to bb (Sullivan et al. 2013).
pub const XP_135: f64 = 1.164_412;

const DEFAULT_TIMESERIES_WAVELENGTHS: [f64; 5] = [450.0, 500.0, 550.0, 600.0, 650.0];

/// Gain channel a value was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gain {
    /// Raw PMT signal.
    None,
    /// Low gain.
    Low,
    /// High gain.
    High,
}

impl Gain {
    fn label(self) -> &'static str {
        match self {
            Gain::None => "None",
            Gain::Low => "Low",
            Gain::High => "High",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaqueCal {
    pmt_ref_gain: f64,
    pmt_gamma: f64,
    gain12: f64,
    gain23: f64,
    dark_cal_wavelength: Vec<f64>,
    dark_cal_pmt_gain: Vec<f64>,
    dark_cal_scat1: Vec<Vec<f64>>,
    dark_cal_scat2: Vec<Vec<f64>>,
    dark_cal_scat3: Vec<Vec<f64>>,
    mu_wavelengths: Vec<f64>,
    mu_factors: Vec<f64>,
    mu_led_temp: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct TemperatureCal {
    wl: Vec<f64>,
    coeff: Vec<Vec<f64>>,
}

/// Result of calibrating one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scattering {
    /// Volume scattering at 135 degrees (1/m/sr).
    pub beta_u: f64,
    /// Particulate backscattering (1/m).
    pub bb: f64,
    /// Wavelength of the frame (nm).
    pub wavelength: f64,
    /// Channel used.
    pub gain: Gain,
    /// The reference had no net signal.
    pub net_ref_zero: bool,
}

/// Plaque and temperature calibration of one instrument.
#[derive(Debug, Clone)]
pub struct Calibration {
    wavelengths: Vec<f64>,
    t_coeff: Vec<Vec<f64>>,
    pmt_ref_gain: f64,
    pmt_gamma: f64,
    gain12: f64,
    gain23: f64,
    dark_gain: Vec<f64>,
    dark: [Vec<Vec<f64>>; 3],
    mu: Vec<f64>,
}

fn cal_error(msg: impl Into<String>) -> InlininoError {
    InlininoError::CalibrationFile(msg.into())
}

fn read_json(path: &Path) -> AppResult<Json> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| cal_error(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| cal_error(format!("{}: {e}", path.display())))
}

/// Horner evaluation, highest power first.
fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().fold(0.0, |acc, c| acc * x + c)
}

impl Calibration {
    /// Read both calibration files.
    pub fn load(plaque: &Path, temperature: &Path) -> AppResult<Self> {
        Self::from_json(&read_json(plaque)?, &read_json(temperature)?)
    }

    /// Build from the decoded calibration documents.
    pub fn from_json(plaque: &Json, temperature: &Json) -> AppResult<Self> {
        let p: PlaqueCal = serde_json::from_value(plaque["cal"].clone())
            .map_err(|e| cal_error(format!("plaque calibration: {e}")))?;
        let t: TemperatureCal = serde_json::from_value(temperature["cal_temp"].clone())
            .map_err(|e| cal_error(format!("temperature calibration: {e}")))?;
        if p.dark_cal_wavelength != p.mu_wavelengths || p.dark_cal_wavelength != t.wl {
            return Err(cal_error("Wavelength from calibration files don't match."));
        }
        if t.coeff.len() != t.wl.len() || p.mu_factors.len() != t.wl.len() {
            return Err(cal_error("Calibration tables don't cover every wavelength."));
        }
        let mut cal = Self {
            wavelengths: t.wl,
            t_coeff: t.coeff,
            pmt_ref_gain: p.pmt_ref_gain,
            pmt_gamma: p.pmt_gamma,
            gain12: p.gain12,
            gain23: p.gain23,
            dark_gain: p.dark_cal_pmt_gain,
            dark: [p.dark_cal_scat1, p.dark_cal_scat2, p.dark_cal_scat3],
            mu: Vec::new(),
        };
        cal.mu = p
            .mu_factors
            .iter()
            .zip(&p.mu_wavelengths)
            .zip(&p.mu_led_temp)
            .map(|((mu, wl), t)| mu * cal.temperature_correction(*wl, *t))
            .collect();
        Ok(cal)
    }

    /// Calibrated wavelengths.
    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    /// LED temperature correction at a wavelength.
    pub fn temperature_correction(&self, wavelength: f64, led_temp: f64) -> f64 {
        let per_wavelength: Vec<f64> = self
            .t_coeff
            .iter()
            .map(|c| polyval(c, led_temp))
            .collect();
        interp(&self.wavelengths, &per_wavelength, wavelength)
    }

    /// Dark offset of scattering channel `channel` (0 based), linear in
    /// PMT gain and wavelength, clamped at the table edges.
    fn dark_offset(&self, channel: usize, pmt_gain: f64, wavelength: f64) -> f64 {
        let at_gain: Vec<f64> = self.dark[channel]
            .iter()
            .map(|row| interp(&self.dark_gain, row, pmt_gain))
            .collect();
        interp(&self.wavelengths, &at_gain, wavelength)
    }

    /// Calibrate the numeric view of one frame.
    pub fn calibrate(&self, raw: &[f64]) -> Scattering {
        let at = |i: usize| raw.get(i).copied().unwrap_or(f64::NAN);
        let unsaturated = |i: usize| match at(i) {
            v if v > SATURATION_LEVEL => f64::NAN,
            v => v,
        };
        let wl = at(WL);
        let pmt_gain = at(PMT_GAIN);
        let (sig_on2, sig_on3) = (unsaturated(SIG_ON2), unsaturated(SIG_ON3));

        let net_ref = at(REF_ON) - at(REF_OFF);
        let net_ref_zero = net_ref == 0.0;
        let net_ref = if net_ref_zero { f64::NAN } else { net_ref };
        let scat = [
            at(NET_SIG1) / net_ref,
            (sig_on2 - unsaturated(SIG_OFF2)) / net_ref,
            (sig_on3 - unsaturated(SIG_OFF3)) / net_ref,
        ];

        let g_pmt = (pmt_gain / self.pmt_ref_gain).powf(self.pmt_gamma);
        let front_end = [self.gain12 * self.gain23, self.gain23, 1.0];
        let t_correction = self.temperature_correction(wl, at(LED_TEMP));
        let corrected: Vec<f64> = (0..3)
            .map(|k| {
                (scat[k] - self.dark_offset(k, pmt_gain, wl)) * front_end[k] * g_pmt * t_correction
            })
            .collect();
        let scat_x = [corrected[2], corrected[1], corrected[0]]
            .into_iter()
            .find(|v| !v.is_nan())
            .unwrap_or(f64::NAN);

        let gain = if sig_on2.is_nan() {
            Gain::None
        } else if sig_on3.is_nan() {
            Gain::Low
        } else {
            Gain::High
        };
        let mu = self
            .wavelengths
            .iter()
            .position(|w| *w == wl)
            .map_or(f64::NAN, |i| self.mu[i]);
        let beta_u = scat_x * mu;
        Scattering {
            beta_u,
            bb: 2.0 * PI * XP_135 * beta_u,
            wavelength: wl,
            gain,
            net_ref_zero,
        }
    }
}

/// HyperBB strategy.
#[derive(Debug, Clone)]
pub struct HyperBb {
    cal: Calibration,
    channels: ActiveChannels,
    reconstructed: Vec<f64>,
    last: Option<Scattering>,
}

impl HyperBb {
    /// Build from a checked configuration, reading `plaque_file` and
    /// `temperature_file`.
    pub fn new(config: &InstrumentConfig) -> AppResult<Self> {
        let plaque: PathBuf = config.require("plaque_file")?;
        let temperature: PathBuf = config.require("temperature_file")?;
        Ok(Self::with_calibration(Calibration::load(&plaque, &temperature)?))
    }

    /// Build from a loaded calibration.
    pub fn with_calibration(cal: Calibration) -> Self {
        let names = cal
            .wavelengths()
            .iter()
            .map(|wl| format!("beta({wl:.0})"))
            .collect();
        let mut channels = ActiveChannels::new(names);
        for wl in DEFAULT_TIMESERIES_WAVELENGTHS {
            if let Some(i) = nearest_index(cal.wavelengths(), wl) {
                channels.set_index(i, true);
            }
        }
        Self {
            reconstructed: vec![f64::NAN; cal.wavelengths().len()],
            cal,
            channels,
            last: None,
        }
    }

    /// Latest backscattering of every wavelength.
    pub fn reconstructed(&self) -> &[f64] {
        &self.reconstructed
    }
}

impl InstrumentStrategy for HyperBb {
    fn module(&self) -> &'static str {
        "hyperbb"
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        let mut names: Vec<&str> = FRAME_VARIABLES.to_vec();
        names.extend(["beta_u", "bb"]);
        let mut units = vec![""; FRAME_VARIABLES.len()];
        units.extend(["m-1 sr-1", "m-1"]);
        let mut precisions = vec!["%s"; FRAME_VARIABLES.len()];
        precisions.extend(["%.5e", "%.5e"]);
        vec![ProductStream::single(Schema::new(&names, &units, &precisions))]
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::Terminator(b"\n".to_vec())
    }

    fn default_serial(&self, port: &str) -> SerialParams {
        SerialParams::new(port).with_baudrate(9600).with_timeout(1.0)
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        let line = std::str::from_utf8(&frame.body)
            .map_err(|_| ParseError::bad_field("frame is not ASCII"))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != FRAME_VARIABLES.len() {
            return Err(ParseError::new(
                ParseErrorKind::WrongFieldCount,
                format!("expected {} fields, found {}", FRAME_VARIABLES.len(), fields.len()),
            ));
        }
        let values = fields
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                let bad = || ParseError::bad_field(format!("invalid {} {raw:?}", FRAME_VARIABLES[i]));
                if TEXT_FIELDS.contains(&i) {
                    Ok(Value::Text(raw.to_string()))
                } else if FLOAT_FIELDS.contains(&i) {
                    raw.parse().map(Value::Float).map_err(|_| bad())
                } else {
                    raw.parse().map(Value::Int).map_err(|_| bad())
                }
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Record::new(values))
    }

    fn calibrate(&mut self, mut record: Record) -> Result<Record, ParseError> {
        let scattering = self.cal.calibrate(&record.numeric());
        record.values.push(Value::Float(scattering.beta_u));
        record.values.push(Value::Float(scattering.bb));
        self.last = Some(scattering);
        Ok(record)
    }

    fn events(&mut self, record: &Record, t: f64, out: &mut Vec<InstrumentEvent>) {
        let Some(s) = self.last.take() else {
            return;
        };
        let mut signal = vec![f64::NAN; self.reconstructed.len()];
        if let Some(i) = self.cal.wavelengths().iter().position(|w| *w == s.wavelength) {
            signal[i] = s.bb;
            self.reconstructed[i] = s.bb;
        }
        out.push(InstrumentEvent::NewTimeseries {
            values: self.channels.select(&signal),
            timestamp: t,
        });
        let raw = |i: usize| record.values.get(i).map_or(f64::NAN, Value::as_f64);
        out.push(InstrumentEvent::NewAux(vec![
            format!("{:.0}", s.wavelength),
            s.gain.label().to_string(),
            format!("{:.2}", raw(LED_TEMP)),
            format!("{:.2}", raw(WATER_TEMP)),
            format!("{:.2}", raw(DEPTH)),
            if s.net_ref_zero { "True" } else { "False" }.to_string(),
        ]));
        out.push(InstrumentEvent::NewSpectrum(vec![Some(self.reconstructed.clone())]));
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
                "Scan WL. (nm)".into(),
                "Gain".into(),
                "LED Temp. (ºC)".into(),
                "Water Temp. (ºC)".into(),
                "Pressure (dBar)".into(),
                "Ref Zero Flag".into(),
            ],
            spectrum_traces: vec!["bb".into()],
            spectrum_x: vec![self.cal.wavelengths().to_vec()],
            ..Default::default()
        }
    }

    fn command(&mut self, command: &ControlCommand) -> AppResult<()> {
        match command {
            ControlCommand::SelectTimeseries { name, enabled } => self.channels.set(name, *enabled),
            other => Err(InlininoError::Config(format!(
                "hyperbb does not support {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plaque() -> Json {
        json!({"cal": {
            "pmtRefGain": 2000.0,
            "pmtGamma": 1.0,
            "gain12": 4.0,
            "gain23": 2.0,
            "darkCalWavelength": [450.0, 500.0, 550.0],
            "darkCalPmtGain": [1000.0, 3000.0],
            "darkCalScat1": [[0.0, 0.0], [0.0, 0.0], [0.0, 0.0]],
            "darkCalScat2": [[0.25, 0.25], [0.25, 0.25], [0.25, 0.25]],
            "darkCalScat3": [[0.4, 0.6], [0.4, 0.6], [0.4, 0.6]],
            "muWavelengths": [450.0, 500.0, 550.0],
            "muFactors": [1e-3, 1e-3, 1e-3],
            "muLedTemp": [20.0, 20.0, 20.0]
        }})
    }

    fn temperature() -> Json {
        // Correction of 1 at every temperature
        json!({"cal_temp": {
            "wl": [450.0, 500.0, 550.0],
            "coeff": [[0.0, 1.0], [0.0, 1.0], [0.0, 1.0]]
        }})
    }

    fn strategy() -> HyperBb {
        HyperBb::with_calibration(Calibration::from_json(&plaque(), &temperature()).unwrap())
    }

    fn line(wl: u32, sig_on2: f64, sig_on3: f64, ref_on: f64) -> Frame {
        let mut fields: Vec<String> = vec!["0".into(); FRAME_VARIABLES.len()];
        fields[2] = "2024-05-01".into();
        fields[3] = "12:00:00".into();
        fields[WL] = wl.to_string();
        fields[PMT_GAIN] = "2000".into();
        fields[NET_SIG1] = "100".into();
        fields[REF_ON] = ref_on.to_string();
        fields[REF_OFF] = "100".into();
        fields[SIG_ON2] = sig_on2.to_string();
        fields[SIG_OFF2] = "100".into();
        fields[SIG_ON3] = sig_on3.to_string();
        fields[SIG_OFF3] = "100".into();
        fields[LED_TEMP] = "21.5".into();
        fields[WATER_TEMP] = "14.25".into();
        fields[DEPTH] = "3.5".into();
        Frame::from_body(fields.join(" ").into_bytes())
    }

    fn run(s: &mut HyperBb, frame: &Frame) -> (Record, Vec<InstrumentEvent>) {
        let record = s.parse(frame).and_then(|r| s.calibrate(r)).unwrap();
        let mut events = Vec::new();
        s.events(&record, 1.0, &mut events);
        (record, events)
    }

    #[test]
    fn high_gain_channel_is_preferred() {
        let mut s = strategy();
        let (record, events) = run(&mut s, &line(500, 600.0, 2100.0, 1100.0));
        assert_eq!(record.values.len(), 32);
        assert_eq!(record.values[2], Value::Text("2024-05-01".into()));
        // (2000 / 1000 - 0.5) * 1e-3
        let beta_u = record.values[30].as_f64();
        assert!((beta_u - 1.5e-3).abs() < 1e-12);
        assert!((record.values[31].as_f64() - 2.0 * PI * XP_135 * 1.5e-3).abs() < 1e-12);
        assert_eq!(
            events[1],
            InstrumentEvent::NewAux(vec![
                "500".into(),
                "High".into(),
                "21.50".into(),
                "14.25".into(),
                "3.50".into(),
                "False".into()
            ])
        );
    }

    #[test]
    fn saturated_high_gain_falls_back_to_low_gain() {
        let cal = Calibration::from_json(&plaque(), &temperature()).unwrap();
        let mut raw = strategy()
            .parse(&line(450, 600.0, 4500.0, 1100.0))
            .unwrap()
            .numeric();
        let s = cal.calibrate(&raw);
        assert_eq!(s.gain, Gain::Low);
        // (500 / 1000 - 0.25) * gain23
        assert!((s.beta_u - 0.5e-3).abs() < 1e-12);

        raw[SIG_ON2] = 5000.0;
        let s = cal.calibrate(&raw);
        assert_eq!(s.gain, Gain::None);
        // 100 / 1000 * gain12 * gain23
        assert!((s.beta_u - 0.8e-3).abs() < 1e-12);
    }

    #[test]
    fn zero_reference_is_flagged() {
        let mut s = strategy();
        let (record, events) = run(&mut s, &line(500, 600.0, 2100.0, 100.0));
        assert!(record.values[30].as_f64().is_nan());
        match &events[1] {
            InstrumentEvent::NewAux(aux) => assert_eq!(aux[5], "True"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn spectrum_is_rebuilt_across_a_scan() {
        let mut s = strategy();
        run(&mut s, &line(450, 600.0, 2100.0, 1100.0));
        assert!(s.reconstructed()[1].is_nan());
        let (_, events) = run(&mut s, &line(550, 600.0, 2100.0, 1100.0));
        assert!(!s.reconstructed()[0].is_nan());
        assert!(s.reconstructed()[1].is_nan());
        assert!(!s.reconstructed()[2].is_nan());
        match &events[0] {
            // All three wavelengths are active by default
            InstrumentEvent::NewTimeseries { values, .. } => {
                assert_eq!(values.len(), 3);
                assert!(values[0].is_nan());
                assert!(!values[2].is_nan());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wavelength_outside_calibration_is_nan() {
        let mut s = strategy();
        let (record, _) = run(&mut s, &line(475, 600.0, 2100.0, 1100.0));
        assert!(record.values[31].as_f64().is_nan());
        assert!(s.reconstructed().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn mismatched_calibration_wavelengths_are_rejected() {
        let mut t = temperature();
        t["cal_temp"]["wl"] = json!([450.0, 500.0, 560.0]);
        assert!(matches!(
            Calibration::from_json(&plaque(), &t),
            Err(InlininoError::CalibrationFile(_))
        ));
    }

    #[test]
    fn field_count_is_checked() {
        let e = strategy()
            .parse(&Frame::from_body(b"1 2 3".to_vec()))
            .unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::WrongFieldCount);
    }

    #[test]
    fn loads_calibration_files_named_by_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let plaque_path = dir.path().join("HBB8005_CalPlaque.json");
        let temperature_path = dir.path().join("HBB8005_CalTemp.json");
        std::fs::write(&plaque_path, plaque().to_string()).unwrap();
        std::fs::write(&temperature_path, temperature().to_string()).unwrap();
        let config = InstrumentConfig::from_record(&json!({
            "module": "hyperbb",
            "model": "HBB",
            "serial_number": "8005",
            "log_path": "/tmp",
            "log_raw": true,
            "log_products": true,
            "plaque_file": plaque_path,
            "temperature_file": temperature_path
        }))
        .unwrap();
        let s = HyperBb::new(&config).unwrap();
        assert_eq!(s.ui().timeseries, vec!["beta(450)", "beta(500)", "beta(550)"]);
        assert_eq!(s.default_serial("COM3").timeout, 1.0);
    }
}
