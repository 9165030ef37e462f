//! Error types for the acquisition engine.
//!
//! `InlininoError` is the crate-wide error returned by setup, transport,
//! logging and configuration code. It is built with `thiserror` and converts
//! from the underlying library errors with `#[from]`, so `?` works across the
//! crate.
//!
//! Frame-level failures use a separate type, [`ParseError`]. They are
//! recoverable: the worker counts them as corrupted packets and moves on to
//! the next frame, so they never become an `InlininoError`.
//!
//! ## Severity
//!
//! - **`Io` / `Transport`**: fatal to the current acquisition session.
//! - **`Config` / `MissingField`**: raised to the caller of setup or load; no
//!   worker is started.
//! - **`Validation`**: inconsistent schema (e.g. variable lists of different
//!   lengths); prevents activation.
//! - **`Logger`**: a log file could not be opened; logging is stopped but
//!   acquisition continues.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, InlininoError>;

/// Application error.
#[derive(Error, Debug)]
pub enum InlininoError {
    /// Transport or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure without an I/O error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Read or write on a closed transport.
    #[error("Transport not open")]
    NotOpen,

    /// Invalid instrument record or catalog.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required record field absent.
    #[error("Missing field {0}")]
    MissingField(String),

    /// Record fields inconsistent with each other.
    #[error("Configuration validation error: {0}")]
    Validation(String),

    /// Catalog JSON could not be decoded or encoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Application settings could not be loaded.
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// Device or calibration file unreadable or malformed.
    #[error("Calibration file error: {0}")]
    CalibrationFile(String),

    /// Log file could not be opened.
    #[error("Logger error: {0}")]
    Logger(String),

    /// Transport compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Session abandoned after the join timeout.
    #[error("Worker did not stop within {0:?}")]
    Shutdown(std::time::Duration),
}

impl InlininoError {
    /// Whether the error ends an acquisition session.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            InlininoError::Io(_) | InlininoError::Transport(_) | InlininoError::NotOpen
        )
    }
}

impl From<figment::Error> for InlininoError {
    fn from(err: figment::Error) -> Self {
        InlininoError::Settings(Box::new(err))
    }
}

impl From<config::ConfigError> for InlininoError {
    fn from(err: config::ConfigError) -> Self {
        InlininoError::CalibrationFile(err.to_string())
    }
}

#[cfg(feature = "instrument_serial")]
impl From<serialport::Error> for InlininoError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => {
                InlininoError::Io(std::io::Error::new(kind, err.description))
            }
            _ => InlininoError::Transport(err.description),
        }
    }
}

/// Reason a frame could not be turned into a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The frame is shorter than its dialect requires.
    Incomplete,
    /// A field could not be decoded (bad number, bad encoding).
    BadField,
    /// The frame has fewer or more fields than the schema.
    WrongFieldCount,
    /// The frame header is not declared by any telemetry definition.
    UnknownHeader,
    /// Checksum or CRC mismatch.
    Checksum,
    /// The record parsed but calibration failed.
    Calibration,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::Incomplete => "incomplete",
            ParseErrorKind::BadField => "bad-field",
            ParseErrorKind::WrongFieldCount => "wrong-field-count",
            ParseErrorKind::UnknownHeader => "unknown-header",
            ParseErrorKind::Checksum => "checksum",
            ParseErrorKind::Calibration => "calibration",
        };
        write!(f, "{s}")
    }
}

/// Recoverable, per-frame parse or calibration failure.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct ParseError {
    /// Failure category.
    pub kind: ParseErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl ParseError {
    /// Build an error of the given kind.
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Frame shorter than required.
    pub fn incomplete(message: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::Incomplete, message)
    }

    /// Field that could not be decoded.
    pub fn bad_field(message: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::BadField, message)
    }

    /// Field count mismatch.
    pub fn wrong_field_count(expected: usize, found: usize) -> Self {
        Self::new(
            ParseErrorKind::WrongFieldCount,
            format!("expected at least {expected} fields, found {found}"),
        )
    }

    /// Header not recognized.
    pub fn unknown_header(message: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::UnknownHeader, message)
    }

    /// Integrity check failed.
    pub fn checksum(message: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::Checksum, message)
    }

    /// Calibration failed.
    pub fn calibration(message: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::Calibration, message)
    }
}
