//! Ontrak ADU100/200/208 USB data acquisition boxes.
//!
//! The box is polled twice a second: the relay is driven by its schedule,
//! event counters (flow meters) are read and cleared, and analog channels
//! are sampled. One poll becomes one textual frame
//! `relay, t0, v0, ..., a0, ...` written to the raw log.
//!
//! Flow rates are computed from the counts between two polls. A low-flow
//! alarm is raised once when flow stays below 2 L/min for more than 120
//! consecutive polls, after flow was seen at least once.

use super::{
    AcquisitionMode, ControlCommand, FeatureFlags, InstrumentConfig, InstrumentStrategy,
    UiDescriptor,
};
use crate::bus::InstrumentEvent;
use crate::error::{AppResult, InlininoError, ParseError};
use crate::framer::{Frame, FramingStrategy};
use crate::logger::ProductStream;
use crate::record::{Record, Schema, Value};
use crate::transport::{HidParams, InterfaceParams, Transport};
use chrono::{Local, TimeZone, Timelike};
use std::time::Duration;
use tracing::debug;

/// USB vendor id of Ontrak.
pub const VENDOR_ID: u16 = 0x0a07;

/// Supported models.
pub const MODELS: &[&str] = &["ADU100", "ADU200", "ADU208"];

/// Relay wiring modes.
pub const RELAY_MODES: &[&str] = &["Switch", "Switch (one-wire)", "Switch (two-wire)", "Pump"];

const GALLONS_TO_LITERS: f64 = 3.78541;
const ADC_RESOLUTION: f64 = 65535.0;
const ANALOG_CALIBRATION_INTERVAL: f64 = 3600.0;
const REFRESH_RATE_HZ: f64 = 2.0;
const LOW_FLOW_THRESHOLD: f64 = 2.0;
const CRITICAL_FLOW_THRESHOLD: f64 = 1.0;
const FLOW_DETECTED_THRESHOLD: f64 = 0.1;
const LOW_FLOW_COUNT: u32 = 120;
const COUPLED_HOLD_ON_SECS: f64 = 25.0;

/// Full scale of a unipolar analog reading on the ADU100.
pub fn unipolar_max_voltage(channel: u8, gain: u8) -> Option<f64> {
    match (channel, gain) {
        (0 | 1, 0..=7) => Some(2.5 / f64::from(1u32 << gain)),
        (2, 1) => Some(10.0),
        (2, 2) => Some(5.0),
        _ => None,
    }
}

// =============================================================================
// Relay
// =============================================================================

/// How the relay position is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Always off.
    Off,
    /// Always on.
    On,
    /// On for `on_duration` minutes every hour, from `hourly_start_at`.
    Hourly,
    /// Alternate `on_duration` and `off_duration` minutes.
    Interval,
}

/// Relay schedule set from the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySchedule {
    /// Mode.
    pub mode: RelayMode,
    /// Minute of the hour the relay switches on (hourly mode).
    pub hourly_start_at: u32,
    /// Minutes on.
    pub on_duration: u32,
    /// Minutes off (interval mode).
    pub off_duration: u32,
}

impl Default for RelaySchedule {
    fn default() -> Self {
        Self {
            mode: RelayMode::Hourly,
            hourly_start_at: 0,
            on_duration: 10,
            off_duration: 30,
        }
    }
}

impl RelaySchedule {
    /// Position at time `t`, `minute` being the local minute of the hour.
    pub fn position(&self, t: f64, minute: u32, interval_start: f64, skip_before: f64) -> bool {
        match self.mode {
            RelayMode::On => true,
            RelayMode::Off => false,
            RelayMode::Hourly => {
                let start = self.hourly_start_at;
                let stop = start + self.on_duration;
                let in_window = (start <= minute && minute < stop && stop < 60)
                    || (stop >= 60 && (start <= minute || minute < stop % 60));
                in_window && skip_before < t
            }
            RelayMode::Interval => {
                let period = f64::from(self.on_duration + self.off_duration);
                if period == 0.0 {
                    return false;
                }
                ((t - interval_start) / 60.0).rem_euclid(period) < f64::from(self.on_duration)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CoupledState {
    id_b: u8,
    cached_b: Option<bool>,
    trigger: Option<bool>,
    hold_on_start: Option<f64>,
}

/// Relay of the box, optionally coupled with a second relay wired in
/// opposition (two-wire valves). Coupled relays fall back to off once the
/// hold-on period expires.
#[derive(Debug, Clone)]
pub struct Relay {
    /// Relay number.
    pub id: u8,
    /// Active schedule.
    pub schedule: RelaySchedule,
    /// Reference of the interval mode.
    pub interval_start: Option<f64>,
    /// Hourly mode stays off before this time.
    pub hourly_skip_before: f64,
    cached: Option<bool>,
    coupled: Option<CoupledState>,
}

fn local_minute(t: f64) -> u32 {
    Local
        .timestamp_opt(t as i64, 0)
        .single()
        .map(|d| d.minute())
        .unwrap_or_default()
}

impl Relay {
    /// Single relay.
    pub fn new(id: u8) -> Self {
        Self {
            id,
            schedule: RelaySchedule::default(),
            interval_start: None,
            hourly_skip_before: 0.0,
            cached: None,
            coupled: None,
        }
    }

    /// Pair of relays in opposite positions.
    pub fn coupled(id_a: u8, id_b: u8) -> Self {
        Self {
            coupled: Some(CoupledState {
                id_b,
                cached_b: None,
                trigger: None,
                hold_on_start: None,
            }),
            ..Self::new(id_a)
        }
    }

    /// Read the current position from the device.
    pub fn read(&mut self, io: &mut dyn Transport) -> AppResult<()> {
        io.write(format!("RPK{}", self.id).as_bytes())?;
        self.cached = read_int(io)?.map(|v| v != 0);
        Ok(())
    }

    /// Apply the schedule at time `t` and return the position.
    pub fn set(&mut self, io: &mut dyn Transport, t: f64) -> AppResult<bool> {
        let interval_start = *self.interval_start.get_or_insert(t);
        let position =
            self.schedule
                .position(t, local_minute(t), interval_start, self.hourly_skip_before);
        self.write(io, position, t)?;
        Ok(position)
    }

    fn write(&mut self, io: &mut dyn Transport, position: bool, t: f64) -> AppResult<()> {
        let id = self.id;
        let Some(coupled) = self.coupled.as_mut() else {
            if self.cached != Some(position) {
                let command = if position { "SK" } else { "RK" };
                io.write(format!("{command}{id}").as_bytes())?;
                self.cached = Some(position);
            }
            return Ok(());
        };
        if coupled.trigger != Some(position) {
            let (off, on) = if position {
                (coupled.id_b, id)
            } else {
                (id, coupled.id_b)
            };
            io.write(format!("RK{off}").as_bytes())?;
            std::thread::sleep(Duration::from_millis(10));
            io.write(format!("SK{on}").as_bytes())?;
            self.cached = Some(position);
            coupled.cached_b = Some(!position);
            coupled.trigger = Some(position);
            coupled.hold_on_start = Some(t);
        }
        if coupled
            .hold_on_start
            .is_some_and(|start| t - start > COUPLED_HOLD_ON_SECS)
        {
            if self.cached == Some(true) {
                io.write(format!("RK{id}").as_bytes())?;
                self.cached = Some(false);
            }
            if coupled.cached_b == Some(true) {
                io.write(format!("RK{}", coupled.id_b).as_bytes())?;
                coupled.cached_b = Some(false);
            }
        }
        Ok(())
    }
}

fn read_int(io: &mut dyn Transport) -> AppResult<Option<i64>> {
    let bytes = io.read()?;
    Ok(std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok()))
}

fn read_value(io: &mut dyn Transport) -> AppResult<f64> {
    Ok(read_int(io)?.map_or(f64::NAN, |v| v as f64))
}

// =============================================================================
// Strategy
// =============================================================================

/// Ontrak strategy.
#[derive(Debug, Clone)]
pub struct Ontrak {
    model: String,
    relay_enabled: bool,
    relay_mode: String,
    relay: Relay,
    counter_channels: Vec<u8>,
    k_factors: Vec<f64>,
    analog_channels: Vec<u8>,
    analog_gains: Vec<u8>,
    previous_timestamps: Vec<f64>,
    analog_calibrated_at: Option<f64>,
    low_flow_alarm_enabled: bool,
    low_flow_started: bool,
    low_flow_on: bool,
    low_flow_counter: u32,
}

impl Ontrak {
    /// Build from a checked configuration.
    pub fn new(config: &InstrumentConfig) -> AppResult<Self> {
        if !MODELS.contains(&config.model.as_str()) {
            return Err(InlininoError::Config(
                "Model not supported. Supported models are: ADU100, ADU200, and ADU208".into(),
            ));
        }
        let relay_mode: String = config.require("relay0_mode")?;
        if !RELAY_MODES.contains(&relay_mode.as_str()) {
            return Err(InlininoError::Config(
                "relay0_mode not supported. Supported modes are: Switch and Pump".into(),
            ));
        }
        let counter_channels: Vec<u8> = config.require("event_counter_channels_enabled")?;
        let k_factors: Vec<f64> = config.require("event_counter_k_factors")?;
        if k_factors.len() != counter_channels.len() {
            return Err(InlininoError::Validation(
                "event_counter_k_factors invalid length".into(),
            ));
        }
        let (analog_channels, analog_gains): (Vec<u8>, Vec<u8>) = if config.model == "ADU100" {
            (
                config.require("analog_channels_enabled")?,
                config.require("analog_channels_gains")?,
            )
        } else {
            // Only the ADU100 has analog inputs
            (Vec::new(), Vec::new())
        };
        if analog_gains.len() != analog_channels.len() {
            return Err(InlininoError::Validation(
                "analog_channels_gains invalid length".into(),
            ));
        }
        for (c, g) in analog_channels.iter().zip(&analog_gains) {
            if unipolar_max_voltage(*c, *g).is_none() {
                return Err(InlininoError::Config(format!(
                    "Invalid gain {g} for analog channel {c}"
                )));
            }
        }
        let relay = if relay_mode.contains("two-wire") {
            Relay::coupled(0, 1)
        } else {
            Relay::new(0)
        };
        Ok(Self {
            model: config.model.clone(),
            relay_enabled: config.require("relay0_enabled")?,
            relay_mode,
            relay,
            previous_timestamps: vec![f64::NAN; counter_channels.len()],
            counter_channels,
            k_factors,
            analog_channels,
            analog_gains,
            analog_calibrated_at: None,
            low_flow_alarm_enabled: config.get("low_flow_alarm_enabled")?.unwrap_or(true),
            low_flow_started: false,
            low_flow_on: false,
            low_flow_counter: 0,
        })
    }

    fn is_switch(&self) -> bool {
        self.relay_mode.starts_with("Switch")
    }

    fn is_pump(&self) -> bool {
        self.relay_mode == "Pump"
    }

    fn product_id(&self) -> u16 {
        self.model
            .trim_start_matches("ADU")
            .parse()
            .unwrap_or_default()
    }

    /// Relay in use.
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    fn relay_label(&self) -> (&'static str, &'static str) {
        if self.is_switch() {
            ("Switch", "0=TOTAL|1=FILTERED")
        } else if self.is_pump() {
            ("Pump", "0=OFF|1=ON")
        } else {
            ("Relay", "0=OFF|1=ON")
        }
    }

    fn schema(&self) -> Schema {
        let mut names = Vec::new();
        let mut units = Vec::new();
        let mut precisions = Vec::new();
        if self.relay_enabled {
            let (label, unit) = self.relay_label();
            names.push(label.to_string());
            units.push(unit.to_string());
            precisions.push("%s".to_string());
        }
        for c in &self.counter_channels {
            names.push(format!("Flow({c})"));
            units.push("L/min".to_string());
            precisions.push("%.3f".to_string());
        }
        for c in &self.analog_channels {
            names.push(format!("Analog({c})"));
            units.push("V".to_string());
            precisions.push("%.6f".to_string());
        }
        Schema::new(&names, &units, &precisions)
    }

    fn update_low_flow_alarm(&mut self, flows: &[f64], out: &mut Vec<InstrumentEvent>) {
        if !self.low_flow_alarm_enabled {
            return;
        }
        let mut low_flow = false;
        for flow in flows {
            if self.low_flow_started {
                if *flow < LOW_FLOW_THRESHOLD {
                    low_flow = true;
                    break;
                }
            } else if *flow > FLOW_DETECTED_THRESHOLD {
                self.low_flow_started = true;
                break;
            }
        }
        if !self.low_flow_started {
            return;
        }
        self.low_flow_counter = if low_flow { self.low_flow_counter + 1 } else { 0 };
        if !self.low_flow_on && self.low_flow_counter > LOW_FLOW_COUNT {
            self.low_flow_on = true;
            out.push(InstrumentEvent::AlarmCustom {
                text: "Low flow (<2 L/min).".into(),
                info: "Possible issues:\n    - filter is full, replace filter\n    - pump is too slow, adjust back pressure\n".into(),
            });
        }
    }
}

impl InstrumentStrategy for Ontrak {
    fn module(&self) -> &'static str {
        "ontrak"
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        vec![ProductStream::single(self.schema())]
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::External
    }

    fn acquisition(&self) -> AcquisitionMode {
        AcquisitionMode::Polled {
            refresh_rate: REFRESH_RATE_HZ,
        }
    }

    fn adapt_interface(&self, params: InterfaceParams) -> AppResult<InterfaceParams> {
        Ok(match params {
            InterfaceParams::UsbHid(p) => InterfaceParams::UsbHid(HidParams {
                vendor_id: VENDOR_ID,
                product_id: Some(self.product_id()),
                ..p
            }),
            other => other,
        })
    }

    fn init_sequence(&mut self, io: &mut dyn Transport, t: f64) -> AppResult<()> {
        // Digital ports PA0..PA3 as event counter inputs
        io.write(b"CPA1111")?;
        for channel in &self.counter_channels {
            io.write(format!("RC{channel}").as_bytes())?;
            io.read()?;
        }
        self.relay.read(io)?;
        // A pump waits an hour before its first hourly run
        self.relay.hourly_skip_before = if self.is_pump() { t + 3600.0 } else { 0.0 };
        self.relay.interval_start = Some(t);
        self.previous_timestamps = vec![f64::NAN; self.counter_channels.len()];
        self.low_flow_started = false;
        self.low_flow_on = false;
        self.low_flow_counter = 0;
        Ok(())
    }

    fn poll(&mut self, io: &mut dyn Transport, t: f64) -> AppResult<Option<Frame>> {
        let mut fields = Vec::new();
        if self.relay_enabled {
            let position = self.relay.set(io, t)?;
            fields.push(if position { "True" } else { "False" }.to_string());
        }
        for channel in &self.counter_channels {
            // Read and clear
            io.write(format!("RC{channel}").as_bytes())?;
            let stamp = crate::record::now();
            let value = read_value(io)?;
            fields.push(stamp.to_string());
            fields.push(value.to_string());
        }
        if !self.analog_channels.is_empty() {
            let calibrate = self
                .analog_calibrated_at
                .map_or(true, |c| t - c > ANALOG_CALIBRATION_INTERVAL);
            let mode = if calibrate {
                self.analog_calibrated_at = Some(t);
                debug!("Self-calibrating analog channel(s).");
                'C'
            } else {
                'N'
            };
            for (channel, gain) in self.analog_channels.iter().zip(&self.analog_gains) {
                io.write(format!("RU{mode}{channel}{gain}").as_bytes())?;
                fields.push(read_value(io)?.to_string());
            }
        }
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Frame::from_body(fields.join(", ").into_bytes())))
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        let text = std::str::from_utf8(&frame.body)
            .map_err(|_| ParseError::bad_field("packet is not ASCII"))?;
        let fields: Vec<&str> = text.split(',').map(str::trim).collect();
        let expected = usize::from(self.relay_enabled)
            + 2 * self.counter_channels.len()
            + self.analog_channels.len();
        if fields.len() != expected {
            return Err(ParseError::wrong_field_count(expected, fields.len()));
        }
        let mut values = Vec::with_capacity(expected);
        let mut rest = &fields[..];
        if self.relay_enabled {
            values.push(match rest[0] {
                "True" => Value::Bool(true),
                "False" => Value::Bool(false),
                other => return Err(ParseError::bad_field(format!("invalid relay {other:?}"))),
            });
            rest = &rest[1..];
        }
        for field in rest {
            values.push(Value::Float(field.parse::<f64>().map_err(|_| {
                ParseError::bad_field(format!("invalid number {field:?}"))
            })?));
        }
        Ok(Record::new(values))
    }

    fn calibrate(&mut self, record: Record) -> Result<Record, ParseError> {
        let mut values = Vec::with_capacity(record.values.len());
        let mut raw = record.values.into_iter();
        if self.relay_enabled {
            values.push(raw.next().unwrap_or(Value::Missing));
        }
        for (i, k) in self.k_factors.iter().enumerate() {
            let t = raw.next().map_or(f64::NAN, |v| v.as_f64());
            let v = raw.next().map_or(f64::NAN, |v| v.as_f64());
            let previous = std::mem::replace(&mut self.previous_timestamps[i], t);
            // liters per minute
            values.push(Value::Float(if previous.is_nan() {
                f64::NAN
            } else {
                v / k * GALLONS_TO_LITERS / ((t - previous) / 60.0)
            }));
        }
        for (channel, gain) in self.analog_channels.iter().zip(&self.analog_gains) {
            let v = raw.next().map_or(f64::NAN, |v| v.as_f64());
            let max = unipolar_max_voltage(*channel, *gain).unwrap_or(f64::NAN);
            values.push(Value::Float(v / ADC_RESOLUTION * max));
        }
        Ok(Record::new(values))
    }

    fn events(&mut self, record: &Record, t: f64, out: &mut Vec<InstrumentEvent>) {
        out.push(InstrumentEvent::NewTimeseries {
            values: record.numeric(),
            timestamp: t,
        });
        let offset = usize::from(self.relay_enabled);
        let data = record.numeric();
        let flows: Vec<f64> = data
            .iter()
            .skip(offset)
            .take(self.counter_channels.len())
            .copied()
            .collect();

        let mut aux = Vec::new();
        if self.relay_enabled {
            let on = matches!(record.values.first(), Some(Value::Bool(true)));
            aux.push(
                match (self.is_switch(), on) {
                    (true, true) => "Filter",
                    (true, false) => "Total",
                    (false, true) => "On",
                    (false, false) => "Off",
                }
                .to_string(),
            );
        }
        for flow in &flows {
            aux.push(format!("{flow:.2}"));
            aux.push(
                if *flow < CRITICAL_FLOW_THRESHOLD || self.low_flow_on {
                    "CRITICAL"
                } else if *flow < LOW_FLOW_THRESHOLD {
                    "WARNING"
                } else {
                    "OK"
                }
                .to_string(),
            );
        }
        for v in data.iter().skip(offset + flows.len()) {
            aux.push(format!("{v:.4}"));
        }
        out.push(InstrumentEvent::NewAux(aux));

        self.update_low_flow_alarm(&flows, out);
    }

    fn shutdown(&mut self, io: &mut dyn Transport) -> AppResult<()> {
        if self.is_pump() {
            self.relay.schedule.mode = RelayMode::Off;
            if self.relay_enabled {
                self.relay.set(io, crate::record::now())?;
            }
        }
        Ok(())
    }

    fn features(&self) -> FeatureFlags {
        FeatureFlags {
            aux_data: true,
            flow_control: self.relay_enabled && self.is_switch(),
            pump_control: self.relay_enabled && self.is_pump(),
            ..Default::default()
        }
    }

    fn ui(&self) -> UiDescriptor {
        let names = self.schema().names;
        let mut aux = Vec::new();
        if self.relay_enabled {
            aux.push(self.relay_label().0.to_string());
        }
        for c in &self.counter_channels {
            aux.push(format!("Flow #{c} (L/min)"));
            aux.push(format!("Flow Status #{c}"));
        }
        for c in &self.analog_channels {
            aux.push(format!("Analog C{c} (V)"));
        }
        UiDescriptor {
            timeseries: names.clone(),
            active_timeseries: names,
            aux,
            ..Default::default()
        }
    }

    fn command(&mut self, command: &ControlCommand) -> AppResult<()> {
        match command {
            ControlCommand::Relay(schedule) => {
                if schedule.mode == RelayMode::Interval && self.relay.schedule.mode != RelayMode::Interval {
                    self.relay.interval_start = None;
                }
                self.relay.schedule = schedule.clone();
                Ok(())
            }
            other => Err(InlininoError::Config(format!(
                "ontrak does not support {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use serde_json::json;
    use std::sync::Arc;

    fn config(model: &str, mode: &str) -> InstrumentConfig {
        InstrumentConfig::from_record(&json!({
            "module": "ontrak",
            "model": model,
            "serial_number": "1",
            "log_path": "/tmp",
            "log_raw": true,
            "log_products": true,
            "interface": "usb-hid",
            "relay0_enabled": true,
            "relay0_mode": mode,
            "event_counter_channels_enabled": [0],
            "event_counter_k_factors": [1381],
            "analog_channels_enabled": [2],
            "analog_channels_gains": [2]
        }))
        .unwrap()
    }

    fn written(io: &MockTransport) -> Vec<String> {
        io.writes()
            .lock()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    #[test]
    fn schema_follows_channels() {
        let o = Ontrak::new(&config("ADU100", "Switch")).unwrap();
        let s = o.schema();
        assert_eq!(s.names, vec!["Switch", "Flow(0)", "Analog(2)"]);
        assert_eq!(s.units[0], "0=TOTAL|1=FILTERED");
        assert!(o.features().flow_control);
        let adu200 = Ontrak::new(&config("ADU200", "Pump")).unwrap();
        assert_eq!(adu200.schema().names, vec!["Pump", "Flow(0)"]);
        assert!(adu200.features().pump_control);
        assert!(Ontrak::new(&config("ADU300", "Pump")).is_err());
        assert!(Ontrak::new(&config("ADU100", "Valve")).is_err());
    }

    #[test]
    fn usb_ids_come_from_model() {
        let o = Ontrak::new(&config("ADU208", "Switch")).unwrap();
        let params = o
            .adapt_interface(InterfaceParams::UsbHid(HidParams::new(0, 0)))
            .unwrap();
        match params {
            InterfaceParams::UsbHid(p) => {
                assert_eq!(p.vendor_id, VENDOR_ID);
                assert_eq!(p.product_id, Some(208));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hourly_window_wraps_past_the_hour() {
        let s = RelaySchedule {
            mode: RelayMode::Hourly,
            hourly_start_at: 55,
            on_duration: 10,
            off_duration: 30,
        };
        assert!(s.position(100.0, 58, 0.0, 0.0));
        assert!(s.position(100.0, 3, 0.0, 0.0));
        assert!(!s.position(100.0, 5, 0.0, 0.0));
        assert!(!s.position(100.0, 30, 0.0, 0.0));
        // Skipped before the first hour
        assert!(!s.position(100.0, 58, 0.0, 200.0));
        let plain = RelaySchedule::default();
        assert!(plain.position(1.0, 0, 0.0, 0.0));
        assert!(!plain.position(1.0, 10, 0.0, 0.0));
    }

    #[test]
    fn interval_alternates() {
        let s = RelaySchedule {
            mode: RelayMode::Interval,
            hourly_start_at: 0,
            on_duration: 1,
            off_duration: 2,
        };
        assert!(s.position(30.0, 0, 0.0, 0.0));
        assert!(!s.position(90.0, 0, 0.0, 0.0));
        assert!(s.position(185.0, 0, 0.0, 0.0));
    }

    #[test]
    fn relay_writes_only_on_change() {
        let mut io = MockTransport::new();
        let mut relay = Relay::new(0);
        relay.schedule.mode = RelayMode::On;
        relay.set(&mut io, 0.0).unwrap();
        relay.set(&mut io, 1.0).unwrap();
        relay.schedule.mode = RelayMode::Off;
        relay.set(&mut io, 2.0).unwrap();
        assert_eq!(written(&io), vec!["SK0", "RK0"]);
    }

    #[test]
    fn coupled_relay_expires() {
        let mut io = MockTransport::new();
        let mut relay = Relay::coupled(0, 1);
        relay.schedule.mode = RelayMode::On;
        relay.set(&mut io, 0.0).unwrap();
        relay.set(&mut io, 10.0).unwrap();
        relay.set(&mut io, 30.0).unwrap();
        assert_eq!(written(&io), vec!["RK1", "SK0", "RK0"]);
    }

    #[test]
    fn poll_and_calibrate() {
        let mut io = MockTransport::new().with_responder(Arc::new(|w: &[u8]| match w {
            b"RC0" => Some(b"1381".to_vec()),
            b"RPK0" => Some(b"0".to_vec()),
            w if w.starts_with(b"RU") => Some(b"65535".to_vec()),
            _ => None,
        }));
        let mut o = Ontrak::new(&config("ADU100", "Switch")).unwrap();
        o.relay.schedule.mode = RelayMode::On;
        o.init_sequence(&mut io, 0.0).unwrap();
        let frame = o.poll(&mut io, 0.0).unwrap().unwrap();
        let text = String::from_utf8(frame.body.clone()).unwrap();
        assert!(text.starts_with("True, "));
        assert!(text.ends_with(", 65535"));
        let writes = written(&io);
        assert_eq!(&writes[..4], &["CPA1111", "RC0", "RPK0", "SK0"]);
        assert!(writes.contains(&"RUC22".to_string()));

        let first = o.calibrate(o.parse(&frame).unwrap()).unwrap();
        assert!(first.values[1].as_f64().is_nan());
        assert!((first.values[2].as_f64() - 5.0).abs() < 1e-12);

        // One gallon (k counts) in one minute
        let t0 = o.previous_timestamps[0];
        let second = Frame::from_body(format!("True, {}, 1381, 0", t0 + 60.0).into_bytes());
        let r = o.calibrate(o.parse(&second).unwrap()).unwrap();
        assert!((r.values[1].as_f64() - GALLONS_TO_LITERS).abs() < 1e-9);
    }

    #[test]
    fn low_flow_alarm_after_flow_was_seen() {
        let mut o = Ontrak::new(&config("ADU200", "Switch")).unwrap();
        let mut events = Vec::new();
        let record = |flow: f64| Record::new(vec![Value::Bool(true), Value::Float(flow)]);
        // Never flowed: no alarm
        for _ in 0..200 {
            o.events(&record(0.0), 0.0, &mut events);
        }
        assert!(!events.iter().any(|e| matches!(e, InstrumentEvent::AlarmCustom { .. })));
        o.events(&record(3.0), 0.0, &mut events);
        events.clear();
        for _ in 0..=LOW_FLOW_COUNT {
            o.events(&record(1.5), 0.0, &mut events);
        }
        let alarms = events
            .iter()
            .filter(|e| matches!(e, InstrumentEvent::AlarmCustom { .. }))
            .count();
        assert_eq!(alarms, 1);
        assert_eq!(
            events.last(),
            Some(&InstrumentEvent::AlarmCustom {
                text: "Low flow (<2 L/min).".into(),
                info: "Possible issues:\n    - filter is full, replace filter\n    - pump is too slow, adjust back pressure\n".into(),
            })
        );
        match &events[events.len() - 2] {
            InstrumentEvent::NewAux(aux) => assert_eq!(aux, &vec!["Filter", "1.50", "WARNING"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn max_voltage_table() {
        assert_eq!(unipolar_max_voltage(0, 0), Some(2.5));
        assert_eq!(unipolar_max_voltage(1, 7), Some(0.01953125));
        assert_eq!(unipolar_max_voltage(2, 1), Some(10.0));
        assert_eq!(unipolar_max_voltage(2, 0), None);
    }
}
