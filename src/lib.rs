//! # Inlinino Core Library
//!
//! Acquisition engine for oceanographic inline sensors. Each instrument gets
//! a worker that reads bytes from its transport, cuts them into frames,
//! parses and calibrates them, logs raw frames and products to rotating
//! files, and publishes live values on a signal bus.
//!
//! ## Crate Structure
//!
//! - **`error`**: `InlininoError`, the crate error, and `ParseError`, the
//!   recoverable per-frame failure.
//! - **`settings`**: process settings merged from defaults, `inlinino.toml`
//!   and `INLININO_*` environment variables.
//! - **`tracing_setup`**: console and per-run application log.
//! - **`record`**: values, records, schemas and the time helpers shared by
//!   parsers and loggers.
//! - **`transport`**: the blocking `Transport` trait with serial, UDP,
//!   USB-HID and mock implementations.
//! - **`framer`**: byte buffer and frame extraction strategies.
//! - **`logger`**: raw and CSV product sinks with time and day rotation.
//! - **`watchdog`**: data-timeout alarm.
//! - **`bus`**: broadcast signal bus consumed by UI layers.
//! - **`instruments`**: the `InstrumentStrategy` trait, one strategy per
//!   supported instrument family, and the module registry.
//! - **`worker`**: instrument lifecycle and acquisition loop.
//! - **`store`**: JSON instrument catalog.
//! - **`manager`**: catalog operations and opened workers.

pub mod bus;
pub mod error;
pub mod framer;
pub mod instruments;
pub mod logger;
pub mod manager;
pub mod record;
pub mod settings;
pub mod store;
pub mod tracing_setup;
pub mod transport;
pub mod watchdog;
pub mod worker;

pub use error::{AppResult, InlininoError, ParseError, ParseErrorKind};
