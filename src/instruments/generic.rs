//! Delimited ASCII instrument.
//!
//! Frames end with the configured terminator; fields are split on the
//! separator and picked by column with their declared type (`int` or
//! `float`).

use super::{InstrumentConfig, InstrumentStrategy, UiDescriptor};
use crate::error::{AppResult, InlininoError, ParseError};
use crate::framer::{Frame, FramingStrategy};
use crate::logger::ProductStream;
use crate::record::{Record, Schema, Value};

/// Type of a generic variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableType {
    /// Integer.
    Int,
    /// Floating point.
    Float,
}

impl VariableType {
    fn parse(s: &str) -> AppResult<Self> {
        match s {
            "int" => Ok(VariableType::Int),
            "float" => Ok(VariableType::Float),
            other => Err(InlininoError::Config(format!(
                "Variable type {other} not supported."
            ))),
        }
    }
}

/// Delimited ASCII strategy.
#[derive(Debug, Clone)]
pub struct Generic {
    schema: Schema,
    terminator: Vec<u8>,
    separator: Vec<u8>,
    columns: Vec<(usize, VariableType)>,
}

impl Generic {
    /// Build from a checked configuration.
    pub fn new(config: &InstrumentConfig) -> AppResult<Self> {
        let terminator = config
            .terminator
            .as_ref()
            .map(|t| t.as_bytes().to_vec())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| InlininoError::Config("terminator must not be empty".into()))?;
        let separator = config
            .separator
            .as_ref()
            .map(|s| s.as_bytes().to_vec())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| InlininoError::Config("separator must not be empty".into()))?;
        let columns = config
            .variable_columns
            .iter()
            .zip(&config.variable_types)
            .map(|(c, t)| Ok((*c, VariableType::parse(t)?)))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            schema: Schema::new(
                &config.variable_names,
                &config.variable_units,
                &config.variable_precision,
            ),
            terminator,
            separator,
            columns,
        })
    }
}

/// Split `data` on every occurrence of `sep`.
pub(crate) fn split_bytes<'a>(data: &'a [u8], sep: &[u8]) -> Vec<&'a [u8]> {
    let mut fields = Vec::new();
    let mut rest = data;
    while let Some(i) = crate::framer::find(rest, sep) {
        fields.push(&rest[..i]);
        rest = &rest[i + sep.len()..];
    }
    fields.push(rest);
    fields
}

/// Decode one ASCII field.
pub(crate) fn decode_number(field: &[u8], kind: VariableType) -> Result<Value, ParseError> {
    let text = std::str::from_utf8(field)
        .map_err(|_| ParseError::bad_field(format!("non ASCII field {:?}", field.escape_ascii().to_string())))?
        .trim();
    match kind {
        VariableType::Int => text
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| ParseError::bad_field(format!("invalid int {text:?}"))),
        VariableType::Float => text
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| ParseError::bad_field(format!("invalid float {text:?}"))),
    }
}

impl InstrumentStrategy for Generic {
    fn module(&self) -> &'static str {
        "generic"
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        vec![ProductStream::single(self.schema.clone())]
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::Terminator(self.terminator.clone())
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        let fields = split_bytes(&frame.body, &self.separator);
        let values = self
            .columns
            .iter()
            .map(|(column, kind)| {
                let field = fields
                    .get(*column)
                    .ok_or_else(|| ParseError::wrong_field_count(column + 1, fields.len()))?;
                decode_number(field, *kind)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Record::new(values))
    }

    fn ui(&self) -> UiDescriptor {
        UiDescriptor {
            timeseries: self.schema.names.clone(),
            active_timeseries: self.schema.names.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseErrorKind;
    use crate::instruments::tests::generic_record;
    use serde_json::json;

    fn strategy() -> Generic {
        Generic::new(&InstrumentConfig::from_record(&generic_record()).unwrap()).unwrap()
    }

    #[test]
    fn picks_typed_columns() {
        let mut record = generic_record();
        record["variable_columns"] = json!([2, 0]);
        record["variable_types"] = json!(["float", "int"]);
        let g = Generic::new(&InstrumentConfig::from_record(&record).unwrap()).unwrap();
        let r = g.parse(&Frame::from_body(b"7, x,2.5".to_vec())).unwrap();
        assert_eq!(r.values, vec![Value::Float(2.5), Value::Int(7)]);
    }

    #[test]
    fn short_rows_and_bad_numbers() {
        let g = strategy();
        let e = g.parse(&Frame::from_body(b"1".to_vec())).unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::WrongFieldCount);
        let e = g.parse(&Frame::from_body(b"1,x".to_vec())).unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::BadField);
    }

    #[test]
    fn unsupported_type_is_rejected_at_setup() {
        let mut record = generic_record();
        record["variable_types"] = json!(["int", "str"]);
        let config = InstrumentConfig::from_record(&record).unwrap();
        assert!(matches!(Generic::new(&config), Err(InlininoError::Config(_))));
    }

    #[test]
    fn splits_on_multibyte_separator() {
        assert_eq!(split_bytes(b"a::b::", b"::"), vec![&b"a"[..], b"b", b""]);
    }
}
