//! Records, values and the variable schema.
//!
//! A [`Record`] is the typed tuple a strategy produces from one frame. Its
//! shape matches the [`Schema`] of the product stream it belongs to. Values
//! are formatted for the CSV product log with printf-style precisions
//! (`%d`, `%.3f`, `%s`, ...) as stored in the instrument catalog.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock seconds since the Unix epoch.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Convert an epoch timestamp to a UTC date time.
pub fn to_utc(timestamp: f64) -> DateTime<Utc> {
    let millis = (timestamp * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::from(UNIX_EPOCH))
}

/// UTC day number used by log rotation.
pub fn utc_day(timestamp: f64) -> i32 {
    to_utc(timestamp).num_days_from_ce()
}

/// `yyyy/mm/dd HH:MM:SS.fff` in UTC.
pub fn format_log_time(timestamp: f64) -> String {
    to_utc(timestamp).format("%Y/%m/%d %H:%M:%S%.3f").to_string()
}

/// A single decoded field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Boolean, written `True`/`False`.
    Bool(bool),
    /// Free text.
    Text(String),
    /// Vector of values (spectrum, raw counts).
    Array(Vec<f64>),
    /// Field not available; written `nan`.
    Missing,
}

impl Value {
    /// Numeric view used by plots; non numeric values are NaN.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Int(v) => *v as f64,
            Value::Float(v) => *v,
            Value::Bool(v) => f64::from(u8::from(*v)),
            _ => f64::NAN,
        }
    }

    /// Array view, if any.
    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(v)
    }
}

/// Parsed (and possibly calibrated) frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    /// Product stream the record belongs to, `None` for the default stream.
    pub stream: Option<String>,
    /// Values in schema order.
    pub values: Vec<Value>,
}

impl Record {
    /// Record on the default stream.
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            stream: None,
            values,
        }
    }

    /// Record on a named stream.
    pub fn on_stream(stream: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            stream: Some(stream.into()),
            values,
        }
    }

    /// Numeric view of all scalar values.
    pub fn numeric(&self) -> Vec<f64> {
        self.values.iter().map(Value::as_f64).collect()
    }
}

/// Printf-style format of one CSV column.
#[derive(Debug, Clone, PartialEq)]
pub enum Precision {
    /// `%d` / `%i`
    Integer,
    /// `%.Nf`, `%f` (6 digits)
    Fixed(usize),
    /// `%.Ne`, `%e` (6 digits)
    Exponent(usize),
    /// `%s` or anything unrecognized
    Display,
}

impl Precision {
    /// Parse a printf-style spec. Unknown specs fall back to `Display`.
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        let Some(body) = spec.strip_prefix('%') else {
            return Precision::Display;
        };
        let (digits, conv) = body.split_at(body.len().saturating_sub(1));
        let digits = digits.strip_prefix('.').unwrap_or(digits);
        let n = digits.parse::<usize>().ok();
        match conv {
            "d" | "i" | "u" => Precision::Integer,
            "f" | "F" => Precision::Fixed(n.unwrap_or(6)),
            "e" | "E" => Precision::Exponent(n.unwrap_or(6)),
            _ => Precision::Display,
        }
    }

    /// Format a value with this precision.
    pub fn format(&self, value: &Value) -> String {
        match value {
            Value::Missing => "nan".to_string(),
            Value::Text(s) => s.clone(),
            Value::Bool(b) => match self {
                Precision::Integer => u8::from(*b).to_string(),
                _ => if *b { "True" } else { "False" }.to_string(),
            },
            Value::Array(values) => {
                let mut out = String::from("[");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.push_str(&self.format_float(*v));
                }
                out.push(']');
                out
            }
            Value::Int(v) => match self {
                Precision::Fixed(_) | Precision::Exponent(_) => self.format_float(*v as f64),
                _ => v.to_string(),
            },
            Value::Float(v) => self.format_float(*v),
        }
    }

    fn format_float(&self, v: f64) -> String {
        if v.is_nan() {
            return "nan".to_string();
        }
        if v.is_infinite() {
            return if v > 0.0 { "inf" } else { "-inf" }.to_string();
        }
        let mut out = String::new();
        let _ = match self {
            Precision::Integer => write!(out, "{}", v.trunc() as i64),
            Precision::Fixed(n) => write!(out, "{:.*}", *n, v),
            Precision::Exponent(n) => write!(out, "{}", format_exponent(v, *n)),
            Precision::Display => write!(out, "{v}"),
        };
        out
    }
}

/// C-style exponent formatting (`1.50e+01`).
fn format_exponent(v: f64, digits: usize) -> String {
    let s = format!("{v:.digits$e}");
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, exp) = match exp.strip_prefix('-') {
                Some(e) => ('-', e),
                None => ('+', exp),
            };
            format!("{mantissa}e{sign}{exp:0>2}")
        }
        None => s,
    }
}

/// Ordered variable names, units and precisions of one product stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    /// Column names.
    pub names: Vec<String>,
    /// Column units.
    pub units: Vec<String>,
    /// Column formats.
    pub precisions: Vec<Precision>,
}

impl Schema {
    /// Build a schema from the catalog lists.
    pub fn new<S: AsRef<str>>(names: &[S], units: &[S], precisions: &[S]) -> Self {
        Self {
            names: names.iter().map(|s| s.as_ref().to_string()).collect(),
            units: units.iter().map(|s| s.as_ref().to_string()).collect(),
            precisions: precisions.iter().map(|s| Precision::parse(s.as_ref())).collect(),
        }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Format the values of a record, one string per schema column.
    ///
    /// Columns the record does not provide are written `nan`.
    pub fn format_row(&self, values: &[Value]) -> Vec<String> {
        let columns = self.names.len().max(values.len());
        (0..columns)
            .map(|i| {
                let precision = self.precisions.get(i).unwrap_or(&Precision::Display);
                values
                    .get(i)
                    .map(|v| precision.format(v))
                    .unwrap_or_else(|| "nan".to_string())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_parsing() {
        assert_eq!(Precision::parse("%d"), Precision::Integer);
        assert_eq!(Precision::parse("%.3f"), Precision::Fixed(3));
        assert_eq!(Precision::parse("%f"), Precision::Fixed(6));
        assert_eq!(Precision::parse("%.2e"), Precision::Exponent(2));
        assert_eq!(Precision::parse("%s"), Precision::Display);
        assert_eq!(Precision::parse("garbage"), Precision::Display);
    }

    #[test]
    fn values_follow_precision() {
        assert_eq!(Precision::Fixed(3).format(&Value::Float(1.23456)), "1.235");
        assert_eq!(Precision::Integer.format(&Value::Int(42)), "42");
        assert_eq!(Precision::Fixed(1).format(&Value::Int(2)), "2.0");
        assert_eq!(Precision::Exponent(2).format(&Value::Float(15.0)), "1.50e+01");
        assert_eq!(Precision::Exponent(1).format(&Value::Float(0.05)), "5.0e-02");
        assert_eq!(Precision::Display.format(&Value::Bool(true)), "True");
        assert_eq!(Precision::Fixed(2).format(&Value::Float(f64::NAN)), "nan");
        assert_eq!(
            Precision::Fixed(1).format(&Value::Array(vec![1.0, 2.26])),
            "[1.0 2.3]"
        );
    }

    #[test]
    fn missing_columns_are_nan() {
        let schema = Schema::new(&["a", "b", "c"], &["", "", ""], &["%d", "%.1f", "%s"]);
        let row = schema.format_row(&[Value::Int(1), Value::Missing]);
        assert_eq!(row, vec!["1", "nan", "nan"]);
    }

    #[test]
    fn log_time_has_milliseconds() {
        // 2025-03-31T23:59:58.5Z
        let t = 1_743_465_598.5;
        assert_eq!(format_log_time(t), "2025/03/31 23:59:58.500");
        assert_ne!(utc_day(t), utc_day(t + 2.0));
    }
}
