//! Byte-stream transports.
//!
//! Every instrument talks to the worker through the blocking [`Transport`]
//! trait: `read` returns whatever bytes are available (possibly none) after
//! waiting at most the transport timeout, `write` sends bytes. The worker
//! runs on a blocking thread (`tokio::task::spawn_blocking`) so these calls
//! never stall the async runtime.
//!
//! Variants:
//! - [`serial::SerialTransport`]: RS-232 / USB-serial via `serialport`
//! - [`udp::UdpTransport`]: one datagram per read
//! - [`usb_hid::HidTransport`]: 8-byte HID reports (feature `usb_hid`)
//! - [`mock::MockTransport`]: scripted reads for tests and simulation
//!
//! All of them fail with [`InlininoError::Io`] or
//! [`InlininoError::Transport`]; the worker treats either as fatal to the
//! session.

pub mod mock;
pub mod serial;
pub mod udp;
pub mod usb_hid;

use crate::error::{AppResult, InlininoError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use serial::{Parity, SerialParams};
pub use udp::UdpParams;
pub use usb_hid::HidParams;

/// Blocking byte-stream transport.
pub trait Transport: Send {
    /// Display name, e.g. `com:/dev/ttyUSB0`.
    fn name(&self) -> String;

    /// Whether the transport is open.
    fn is_open(&self) -> bool;

    /// Upper bound of a blocking read.
    fn timeout(&self) -> Duration;

    /// Best-effort flush of stale input/output.
    fn init(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Bytes available now, or after waiting up to `timeout`. May be empty.
    fn read(&mut self) -> AppResult<Vec<u8>>;

    /// Send bytes.
    fn write(&mut self, data: &[u8]) -> AppResult<()>;

    /// Handle able to cancel an in-flight `read` from another thread.
    fn stop_handle(&self) -> StopHandle {
        StopHandle::noop()
    }

    /// Release the device. Idempotent.
    fn close(&mut self);
}

/// Cancels a blocking read from another thread.
#[derive(Clone, Default)]
pub struct StopHandle {
    stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl StopHandle {
    /// Handle that does nothing (reads are short enough on their own).
    pub fn noop() -> Self {
        Self { stop: None }
    }

    /// Handle running `f` on stop.
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            stop: Some(Arc::new(f)),
        }
    }

    /// Unblock the pending read, if any.
    pub fn stop(&self) {
        if let Some(stop) = &self.stop {
            stop();
        }
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("active", &self.stop.is_some())
            .finish()
    }
}

/// Transport family selected by the instrument record's `interface` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InterfaceKind {
    /// Serial port.
    #[default]
    #[serde(rename = "serial")]
    Serial,
    /// UDP socket.
    #[serde(rename = "socket")]
    Socket,
    /// USB-HID device.
    #[serde(rename = "usb-hid")]
    UsbHid,
}

impl InterfaceKind {
    /// Parse the catalog spelling.
    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "serial" => Ok(InterfaceKind::Serial),
            "socket" | "udp" => Ok(InterfaceKind::Socket),
            "usb-hid" | "usb" | "usb-aduhid" => Ok(InterfaceKind::UsbHid),
            other => Err(InlininoError::Config(format!(
                "Invalid communication interface {other}"
            ))),
        }
    }
}

/// Parameters needed to open a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum InterfaceParams {
    /// Serial port settings.
    Serial(SerialParams),
    /// UDP bind address.
    Udp(UdpParams),
    /// USB-HID device selector.
    UsbHid(HidParams),
}

impl InterfaceParams {
    /// Family of these parameters.
    pub fn kind(&self) -> InterfaceKind {
        match self {
            InterfaceParams::Serial(_) => InterfaceKind::Serial,
            InterfaceParams::Udp(_) => InterfaceKind::Socket,
            InterfaceParams::UsbHid(_) => InterfaceKind::UsbHid,
        }
    }

    /// Decode a persisted interface record.
    pub fn from_record(kind: InterfaceKind, record: &serde_json::Value) -> AppResult<Self> {
        let params = match kind {
            InterfaceKind::Serial => {
                InterfaceParams::Serial(serde_json::from_value(record.clone())?)
            }
            InterfaceKind::Socket => InterfaceParams::Udp(serde_json::from_value(record.clone())?),
            InterfaceKind::UsbHid => {
                InterfaceParams::UsbHid(serde_json::from_value(record.clone())?)
            }
        };
        Ok(params)
    }

    /// Encode for the configuration store.
    pub fn to_record(&self) -> AppResult<serde_json::Value> {
        let value = match self {
            InterfaceParams::Serial(p) => serde_json::to_value(p)?,
            InterfaceParams::Udp(p) => serde_json::to_value(p)?,
            InterfaceParams::UsbHid(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }
}

/// Opens transports; swapped for a mock in tests.
pub trait TransportFactory: Send + Sync {
    /// Open a transport for `params`.
    fn open(&self, params: &InterfaceParams) -> AppResult<Box<dyn Transport>>;
}

/// Factory opening real devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTransportFactory;

impl TransportFactory for SystemTransportFactory {
    fn open(&self, params: &InterfaceParams) -> AppResult<Box<dyn Transport>> {
        match params {
            InterfaceParams::Serial(p) => Ok(Box::new(serial::SerialTransport::open(p)?)),
            InterfaceParams::Udp(p) => Ok(Box::new(udp::UdpTransport::open(p)?)),
            InterfaceParams::UsbHid(p) => Ok(Box::new(usb_hid::HidTransport::open(p)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interface_kind_spellings() {
        assert_eq!(InterfaceKind::parse("serial").unwrap(), InterfaceKind::Serial);
        assert_eq!(InterfaceKind::parse("socket").unwrap(), InterfaceKind::Socket);
        assert_eq!(InterfaceKind::parse("usb-hid").unwrap(), InterfaceKind::UsbHid);
        assert_eq!(InterfaceKind::parse("usb").unwrap(), InterfaceKind::UsbHid);
        assert!(InterfaceKind::parse("bluetooth").is_err());
    }

    #[test]
    fn serial_record_round_trip() {
        let record = json!({"port": "/dev/ttyUSB0", "baudrate": 115200, "timeout": 1.0});
        let params = InterfaceParams::from_record(InterfaceKind::Serial, &record).unwrap();
        match &params {
            InterfaceParams::Serial(p) => {
                assert_eq!(p.port, "/dev/ttyUSB0");
                assert_eq!(p.baudrate, 115200);
                assert_eq!(p.bytesize, 8);
                assert_eq!(p.parity, Parity::None);
            }
            other => panic!("unexpected params {other:?}"),
        }
        let back = params.to_record().unwrap();
        assert_eq!(back["parity"], "N");
        assert_eq!(back["stopbits"], 1.0);
    }

    #[test]
    fn udp_record_decodes() {
        let record = json!({"ip": "0.0.0.0", "port": 10110});
        let params = InterfaceParams::from_record(InterfaceKind::Socket, &record).unwrap();
        assert_eq!(
            params,
            InterfaceParams::Udp(UdpParams {
                ip: "0.0.0.0".into(),
                port: 10110,
                timeout: 1.0,
            })
        );
    }
}
