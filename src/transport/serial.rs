//! Serial port transport.
//!
//! Built on the `serialport` crate (feature `instrument_serial`). A read
//! returns every byte the OS has buffered; when nothing is buffered it waits
//! up to the port timeout for a single byte, then returns whatever arrived.

use super::Transport;
use crate::error::{AppResult, InlininoError};
use serde::{Deserialize, Serialize};
#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

/// Serial parity, persisted as `N`, `E`, `O`, `M` or `S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Parity {
    /// No parity bit.
    #[default]
    #[serde(rename = "N")]
    None,
    /// Even parity.
    #[serde(rename = "E")]
    Even,
    /// Odd parity.
    #[serde(rename = "O")]
    Odd,
    /// Mark parity (not supported by every driver).
    #[serde(rename = "M")]
    Mark,
    /// Space parity (not supported by every driver).
    #[serde(rename = "S")]
    Space,
}

/// Serial port parameters as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Port name (`/dev/ttyUSB0`, `COM3`).
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Data bits (5 to 8).
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    /// Parity.
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1, 1.5 or 2).
    #[serde(default = "default_stopbits")]
    pub stopbits: f32,
    /// Read timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

fn default_baudrate() -> u32 {
    19200
}

fn default_bytesize() -> u8 {
    8
}

fn default_stopbits() -> f32 {
    1.0
}

fn default_timeout() -> f64 {
    2.0
}

impl SerialParams {
    /// Parameters with the generic defaults (19200 8N1, 2 s).
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baudrate: default_baudrate(),
            bytesize: default_bytesize(),
            parity: Parity::None,
            stopbits: default_stopbits(),
            timeout: default_timeout(),
        }
    }

    /// Set the baud rate.
    pub fn with_baudrate(mut self, baudrate: u32) -> Self {
        self.baudrate = baudrate;
        self
    }

    /// Set the parity.
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the read timeout in seconds.
    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read timeout as a duration.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.0))
    }
}

/// Serial port transport.
pub struct SerialTransport {
    name: String,
    timeout: Duration,
    #[cfg(feature = "instrument_serial")]
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(feature = "instrument_serial")]
impl SerialTransport {
    /// Open the port described by `params`.
    pub fn open(params: &SerialParams) -> AppResult<Self> {
        use serialport::{DataBits, StopBits};

        let data_bits = match params.bytesize {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(InlininoError::Config(format!("Invalid bytesize {other}")));
            }
        };
        let parity = match params.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Mark | Parity::Space => {
                return Err(InlininoError::Config(format!(
                    "Parity {:?} not supported by this serial driver",
                    params.parity
                )));
            }
        };
        let stop_bits = if params.stopbits >= 1.5 {
            if params.stopbits < 2.0 {
                warn!("1.5 stop bits not supported, using 2");
            }
            StopBits::Two
        } else {
            StopBits::One
        };
        let timeout = params.timeout_duration();
        let port = serialport::new(&params.port, params.baudrate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(timeout)
            .open()
            .map_err(|e| {
                InlininoError::Transport(format!("Unable to connect port {}. {}", params.port, e))
            })?;
        debug!(port = %params.port, baudrate = params.baudrate, "Serial port opened");
        Ok(Self {
            name: format!("com:{}", params.port),
            timeout,
            port: Some(port),
        })
    }

    fn port(&mut self) -> AppResult<&mut Box<dyn serialport::SerialPort>> {
        self.port.as_mut().ok_or(InlininoError::NotOpen)
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl SerialTransport {
    /// Serial support is compiled out.
    pub fn open(_params: &SerialParams) -> AppResult<Self> {
        Err(InlininoError::FeatureNotEnabled("instrument_serial".into()))
    }
}

#[cfg(feature = "instrument_serial")]
impl Transport for SerialTransport {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn init(&mut self) -> AppResult<()> {
        let port = self.port()?;
        port.clear(serialport::ClearBuffer::All)?;
        // Drain anything that slipped in after the clear
        let pending = port.bytes_to_read()? as usize;
        if pending > 0 {
            let mut discard = vec![0u8; pending];
            let _ = port.read(&mut discard)?;
            debug!(bytes = pending, "Drained stale serial input");
        }
        Ok(())
    }

    fn read(&mut self) -> AppResult<Vec<u8>> {
        let port = self.port()?;
        let pending = port.bytes_to_read()? as usize;
        let mut buf = vec![0u8; pending.max(1)];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> AppResult<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.name, "Serial port closed");
        }
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl Transport for SerialTransport {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_open(&self) -> bool {
        false
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn read(&mut self) -> AppResult<Vec<u8>> {
        Err(InlininoError::FeatureNotEnabled("instrument_serial".into()))
    }

    fn write(&mut self, _data: &[u8]) -> AppResult<()> {
        Err(InlininoError::FeatureNotEnabled("instrument_serial".into()))
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let params = SerialParams::new("COM3")
            .with_baudrate(4800)
            .with_parity(Parity::Even)
            .with_timeout(0.1);
        assert_eq!(params.baudrate, 4800);
        assert_eq!(params.parity, Parity::Even);
        assert_eq!(params.timeout_duration(), Duration::from_millis(100));
    }

    #[cfg(feature = "instrument_serial")]
    #[test]
    fn missing_port_is_a_transport_error() {
        let err = SerialTransport::open(&SerialParams::new("/dev/does-not-exist-inlinino"))
            .unwrap_err();
        assert!(err.is_fatal_to_session());
    }
}
