//! Thermosalinograph of the Tara schooner.
//!
//! One `\r\n` terminated line per sample with five comma separated fields,
//! each either a bare number or `key=number`: `t1, c1, s, sv, t2`. Fields
//! missing at the end of a short line are written `nan`.

use super::{FeatureFlags, InstrumentConfig, InstrumentStrategy, UiDescriptor};
use crate::bus::InstrumentEvent;
use crate::error::{AppResult, ParseError};
use crate::framer::{Frame, FramingStrategy};
use crate::logger::ProductStream;
use crate::record::{Record, Schema, Value};
use crate::transport::SerialParams;

/// Product variables.
pub const VARIABLES: [&str; 5] = ["t1", "c1", "s", "sv", "t2"];
const UNITS: [&str; 5] = ["degC", "S/m", "psu", "m/s", "degC"];
const PRECISIONS: [&str; 5] = ["%.4f", "%.5f", "%.4f", "%.3f", "%.4f"];

/// Tara TSG strategy.
#[derive(Debug, Clone, Default)]
pub struct TaraTsg;

impl TaraTsg {
    /// Build from a checked configuration. The product schema is fixed.
    pub fn new(_config: &InstrumentConfig) -> AppResult<Self> {
        Ok(Self)
    }
}

fn field(raw: &str) -> Result<f64, ParseError> {
    let number = raw.split_once('=').map_or(raw, |(_, v)| v).trim();
    number
        .parse()
        .map_err(|_| ParseError::bad_field(format!("invalid number {raw:?}")))
}

impl InstrumentStrategy for TaraTsg {
    fn module(&self) -> &'static str {
        "taratsg"
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        vec![ProductStream::single(Schema::new(&VARIABLES, &UNITS, &PRECISIONS))]
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::Terminator(b"\r\n".to_vec())
    }

    fn default_serial(&self, port: &str) -> SerialParams {
        SerialParams::new(port).with_baudrate(9600).with_timeout(3.0)
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        let line = std::str::from_utf8(&frame.body)
            .map_err(|_| ParseError::bad_field("line is not ASCII"))?;
        let mut values = vec![Value::Missing; VARIABLES.len()];
        for (slot, raw) in values.iter_mut().zip(line.split(',')) {
            *slot = Value::Float(field(raw)?);
        }
        Ok(Record::new(values))
    }

    fn events(&mut self, record: &Record, t: f64, out: &mut Vec<InstrumentEvent>) {
        let v = record.numeric();
        out.push(InstrumentEvent::NewTimeseries {
            values: v.clone(),
            timestamp: t,
        });
        out.push(InstrumentEvent::NewAux(
            [0, 4, 1, 2].iter().map(|i| format!("{:.4}", v[*i])).collect(),
        ));
    }

    fn features(&self) -> FeatureFlags {
        FeatureFlags {
            aux_data: true,
            ..Default::default()
        }
    }

    fn ui(&self) -> UiDescriptor {
        let names: Vec<String> = VARIABLES.iter().map(|n| n.to_string()).collect();
        UiDescriptor {
            timeseries: names.clone(),
            active_timeseries: names,
            aux: vec![
                "Temp. 1 (ºC)".into(),
                "Temp. 2 (ºC)".into(),
                "Cond. 1 (S/m)".into(),
                "Salinity (psu)".into(),
            ],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseErrorKind;

    fn parse(line: &str) -> Result<Record, ParseError> {
        TaraTsg.parse(&Frame::from_body(line.as_bytes().to_vec()))
    }

    #[test]
    fn keyed_and_bare_fields() {
        let r = parse("t1= 18.5432, c1= 4.61234,s=37.1234,1521.456, t2=18.6001").unwrap();
        assert_eq!(
            r.values,
            vec![
                Value::Float(18.5432),
                Value::Float(4.61234),
                Value::Float(37.1234),
                Value::Float(1521.456),
                Value::Float(18.6001),
            ]
        );
    }

    #[test]
    fn short_line_is_padded_with_nan() {
        let r = parse("18.5,4.6").unwrap();
        assert_eq!(r.values[1], Value::Float(4.6));
        assert_eq!(r.values[2..], [Value::Missing, Value::Missing, Value::Missing]);
    }

    #[test]
    fn extra_fields_are_ignored() {
        assert_eq!(parse("1,2,3,4,5,6,7").unwrap().values.len(), 5);
    }

    #[test]
    fn garbage_is_corrupted() {
        assert_eq!(parse("t1=abc,1,2,3,4").unwrap_err().kind, ParseErrorKind::BadField);
    }

    #[test]
    fn aux_shows_both_temperatures_then_conductivity_and_salinity() {
        let mut s = TaraTsg;
        let r = parse("10,4,35,1500,11").unwrap();
        let mut events = Vec::new();
        s.events(&r, 1.0, &mut events);
        assert_eq!(
            events[1],
            InstrumentEvent::NewAux(vec![
                "10.0000".into(),
                "11.0000".into(),
                "4.0000".into(),
                "35.0000".into()
            ])
        );
        assert_eq!(s.default_serial("/dev/ttyS0").baudrate, 9600);
    }
}
