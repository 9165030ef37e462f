//! USB-HID transport for ADU-style digital I/O boxes.
//!
//! The device speaks ASCII commands packed in 8-byte reports. Writes prepend
//! the report id `0x01` and pad with NUL; reads strip the report id and cut
//! the payload at the first NUL. An empty payload reads as no data.
//!
//! The device handle comes from `hidapi` behind the `usb_hid` feature; the
//! report codec is always available.

use super::Transport;
use crate::error::{AppResult, InlininoError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Size of one HID report.
pub const REPORT_SIZE: usize = 8;

const REPORT_ID: u8 = 0x01;

/// USB-HID device selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HidParams {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    #[serde(default)]
    pub product_id: Option<u16>,
    /// Device serial number.
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Read timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

fn default_timeout() -> f64 {
    0.2
}

impl HidParams {
    /// Select by vendor and product id.
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: Some(product_id),
            serial_number: None,
            timeout: default_timeout(),
        }
    }
}

/// Pack an ASCII command into a report.
pub fn encode_report(command: &[u8]) -> AppResult<Vec<u8>> {
    if command.len() > REPORT_SIZE - 1 {
        return Err(InlininoError::Transport(format!(
            "HID command too long ({} bytes): {}",
            command.len(),
            String::from_utf8_lossy(command)
        )));
    }
    let mut report = Vec::with_capacity(REPORT_SIZE);
    report.push(REPORT_ID);
    report.extend_from_slice(command);
    report.resize(REPORT_SIZE, 0);
    Ok(report)
}

/// Extract the ASCII payload of a report; `None` when empty.
pub fn decode_report(report: &[u8]) -> Option<String> {
    let payload = report.get(1..)?;
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    if end == 0 {
        return None;
    }
    Some(payload[..end].iter().map(|&b| char::from(b)).collect())
}

/// USB-HID transport.
pub struct HidTransport {
    name: String,
    timeout: Duration,
    #[cfg(feature = "usb_hid")]
    device: Option<hidapi::HidDevice>,
}

impl std::fmt::Debug for HidTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidTransport")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(feature = "usb_hid")]
fn hid_error(e: hidapi::HidError) -> InlininoError {
    InlininoError::Transport(e.to_string())
}

#[cfg(feature = "usb_hid")]
impl HidTransport {
    /// Open the first device matching `params`.
    pub fn open(params: &HidParams) -> AppResult<Self> {
        let api = hidapi::HidApi::new().map_err(hid_error)?;
        let device = match (&params.product_id, &params.serial_number) {
            (Some(pid), Some(sn)) => api.open_serial(params.vendor_id, *pid, sn),
            (Some(pid), None) => api.open(params.vendor_id, *pid),
            (None, Some(sn)) => {
                let info = api
                    .device_list()
                    .find(|d| {
                        d.vendor_id() == params.vendor_id && d.serial_number() == Some(sn.as_str())
                    })
                    .ok_or_else(|| {
                        InlininoError::Transport(format!("USB-HID device {sn} not found"))
                    })?;
                info.open_device(&api)
            }
            (None, None) => {
                return Err(InlininoError::Config(
                    "USB-HID requires a product id or a serial number".into(),
                ));
            }
        }
        .map_err(|e| {
            InlininoError::Transport(format!(
                "Unable to open USB-HID device {:04x}. {}",
                params.vendor_id, e
            ))
        })?;
        let serial = device
            .get_serial_number_string()
            .ok()
            .flatten()
            .unwrap_or_default();
        tracing::debug!(vendor_id = params.vendor_id, serial = %serial, "USB-HID device opened");
        Ok(Self {
            name: format!("usb-hid:{serial}"),
            timeout: Duration::from_secs_f64(params.timeout.max(0.001)),
            device: Some(device),
        })
    }
}

#[cfg(not(feature = "usb_hid"))]
impl HidTransport {
    /// USB-HID support is compiled out.
    pub fn open(_params: &HidParams) -> AppResult<Self> {
        Err(InlininoError::FeatureNotEnabled("usb_hid".into()))
    }
}

impl Transport for HidTransport {
    fn name(&self) -> String {
        self.name.clone()
    }

    #[cfg(feature = "usb_hid")]
    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    #[cfg(not(feature = "usb_hid"))]
    fn is_open(&self) -> bool {
        false
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    #[cfg(feature = "usb_hid")]
    fn read(&mut self) -> AppResult<Vec<u8>> {
        let device = self.device.as_ref().ok_or(InlininoError::NotOpen)?;
        let mut report = [0u8; REPORT_SIZE];
        let timeout_ms = i32::try_from(self.timeout.as_millis()).unwrap_or(i32::MAX);
        let n = device.read_timeout(&mut report, timeout_ms).map_err(hid_error)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        Ok(decode_report(&report[..n]).map(String::into_bytes).unwrap_or_default())
    }

    #[cfg(not(feature = "usb_hid"))]
    fn read(&mut self) -> AppResult<Vec<u8>> {
        Err(InlininoError::FeatureNotEnabled("usb_hid".into()))
    }

    #[cfg(feature = "usb_hid")]
    fn write(&mut self, data: &[u8]) -> AppResult<()> {
        let device = self.device.as_ref().ok_or(InlininoError::NotOpen)?;
        device.write(&encode_report(data)?).map_err(hid_error)?;
        Ok(())
    }

    #[cfg(not(feature = "usb_hid"))]
    fn write(&mut self, _data: &[u8]) -> AppResult<()> {
        Err(InlininoError::FeatureNotEnabled("usb_hid".into()))
    }

    fn close(&mut self) {
        #[cfg(feature = "usb_hid")]
        {
            self.device = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_padded_reports() {
        assert_eq!(
            encode_report(b"RC0").unwrap(),
            vec![0x01, b'R', b'C', b'0', 0, 0, 0, 0]
        );
        assert_eq!(encode_report(b"CPA1111").unwrap().len(), REPORT_SIZE);
        assert!(encode_report(b"TOOLONG1").is_err());
    }

    #[test]
    fn reports_decode_to_ascii_or_none() {
        assert_eq!(
            decode_report(&[0x01, b'4', b'2', 0, 0, 0, 0, 0]),
            Some("42".to_string())
        );
        assert_eq!(decode_report(&[0x01, 0, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(decode_report(&[]), None);
    }

    #[cfg(not(feature = "usb_hid"))]
    #[test]
    fn open_without_feature_reports_it() {
        let err = HidTransport::open(&HidParams::new(0x0a07, 100)).unwrap_err();
        assert!(matches!(err, InlininoError::FeatureNotEnabled(_)));
    }
}
