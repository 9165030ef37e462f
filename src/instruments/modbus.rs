//! Modbus RTU and the Apogee quantum sensor.
//!
//! The sensor answers a "read holding registers" request with the calibrated
//! PAR as a big-endian `f32` spread over two registers. There is no frame
//! terminator: the worker writes a request whenever its buffer is empty and
//! treats the first silent read after some bytes as the end of the response.

use super::{AcquisitionMode, InstrumentConfig, InstrumentStrategy, UiDescriptor};
use crate::bus::InstrumentEvent;
use crate::error::{AppResult, ParseError};
use crate::framer::{Frame, FramingStrategy};
use crate::logger::ProductStream;
use crate::record::{Record, Schema, Value};
use crate::transport::{Parity, SerialParams, Transport};
use crc::{Crc, CRC_16_MODBUS};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Function code of "read holding registers".
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Register of the calibrated measurement (float).
pub const REG_FLOAT_CALIBRATED_MEASUREMENT: u16 = 0;

/// CRC-16/MODBUS of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Modbus RTU client side of one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusProtocol {
    /// Slave address.
    pub address: u8,
}

impl ModbusProtocol {
    /// Client of the slave at `address`.
    pub fn new(address: u8) -> Self {
        Self { address }
    }

    /// Read request for `quantity` registers starting at `register`.
    pub fn request(&self, register: u16, quantity: u16) -> Vec<u8> {
        let mut frame = Vec::with_capacity(8);
        frame.push(self.address);
        frame.push(READ_HOLDING_REGISTERS);
        frame.extend_from_slice(&register.to_be_bytes());
        frame.extend_from_slice(&quantity.to_be_bytes());
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Validate a response and return its register bytes.
    pub fn handle_response<'a>(&self, response: &'a [u8]) -> Result<&'a [u8], ParseError> {
        if response.len() < 5 {
            return Err(ParseError::incomplete(format!(
                "response of {} bytes",
                response.len()
            )));
        }
        let (payload, crc) = response.split_at(response.len() - 2);
        if crc16(payload).to_le_bytes() != crc {
            return Err(ParseError::checksum("Invalid CRC."));
        }
        if payload[0] != self.address {
            return Err(ParseError::bad_field("Invalid address."));
        }
        let code = payload[1];
        if code == READ_HOLDING_REGISTERS | 0x80 {
            let message = match payload[2] {
                0x01 => "Function code not supported.",
                0x02 => "Invalid starting address or quantity of registers.",
                0x03 => "Invalid quantity of registers.",
                0x04 => "Unable to read multiple registers.",
                _ => "Error occurred.",
            };
            return Err(ParseError::bad_field(message));
        }
        if code != READ_HOLDING_REGISTERS {
            return Err(ParseError::bad_field(format!(
                "Function code {code:#04x} not implemented."
            )));
        }
        let count = usize::from(payload[2]);
        payload
            .get(3..3 + count)
            .ok_or_else(|| ParseError::incomplete(format!("expected {count} register bytes")))
    }
}

/// Apogee quantum (PAR) sensor.
#[derive(Debug, Clone)]
pub struct Apogee {
    protocol: ModbusProtocol,
}

impl Apogee {
    /// Build from a checked configuration.
    pub fn new(config: &InstrumentConfig) -> AppResult<Self> {
        let address = config.get::<u8>("modbus_address")?.unwrap_or(0x01);
        Ok(Self {
            protocol: ModbusProtocol::new(address),
        })
    }
}

impl InstrumentStrategy for Apogee {
    fn module(&self) -> &'static str {
        "apogee"
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        vec![ProductStream::single(Schema::new(
            &["PAR"],
            &["umol/m2/s"],
            &["%.5f"],
        ))]
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::IdleGap
    }

    fn acquisition(&self) -> AcquisitionMode {
        AcquisitionMode::RequestResponse
    }

    fn default_serial(&self, port: &str) -> SerialParams {
        SerialParams::new(port)
            .with_baudrate(19200)
            .with_parity(Parity::Even)
            .with_timeout(0.1)
    }

    fn request(&mut self, io: &mut dyn Transport) -> AppResult<()> {
        // A float spans two registers
        io.write(&self.protocol.request(REG_FLOAT_CALIBRATED_MEASUREMENT, 2))
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        let registers = self.protocol.handle_response(&frame.body)?;
        let bytes: [u8; 4] = registers
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ParseError::incomplete("expected 4 register bytes"))?;
        Ok(Record::new(vec![Value::Float(f64::from(f32::from_be_bytes(
            bytes,
        )))]))
    }

    fn events(&mut self, record: &Record, t: f64, out: &mut Vec<InstrumentEvent>) {
        let par = record.numeric();
        out.push(InstrumentEvent::NewAux(vec![format!(
            "{:.3}",
            par.first().copied().unwrap_or(f64::NAN)
        )]));
        out.push(InstrumentEvent::NewTimeseries {
            values: par,
            timestamp: t,
        });
    }

    fn features(&self) -> super::FeatureFlags {
        super::FeatureFlags {
            aux_data: true,
            ..Default::default()
        }
    }

    fn ui(&self) -> UiDescriptor {
        UiDescriptor {
            timeseries: vec!["PAR".into()],
            active_timeseries: vec!["PAR".into()],
            aux: vec!["PAR (umol/m2/s)".into()],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseErrorKind;

    fn response(payload: &[u8]) -> Vec<u8> {
        let mut frame = payload.to_vec();
        frame.extend_from_slice(&crc16(payload).to_le_bytes());
        frame
    }

    #[test]
    fn request_matches_reference_frame() {
        // 01 03 00 00 00 02 C4 0B is the textbook read of two registers at 0
        assert_eq!(
            ModbusProtocol::new(1).request(0, 2),
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]
        );
    }

    #[test]
    fn decodes_float_register() {
        let mut payload = vec![0x01, 0x03, 0x04];
        payload.extend_from_slice(&1234.5f32.to_be_bytes());
        let apogee = Apogee {
            protocol: ModbusProtocol::new(1),
        };
        let r = apogee.parse(&Frame::from_body(response(&payload))).unwrap();
        assert_eq!(r.values, vec![Value::Float(1234.5)]);
    }

    #[test]
    fn exception_and_crc_errors() {
        let protocol = ModbusProtocol::new(1);
        let e = protocol
            .handle_response(&response(&[0x01, 0x83, 0x02]))
            .unwrap_err();
        assert_eq!(
            e.message,
            "Invalid starting address or quantity of registers."
        );
        let mut corrupted = response(&[0x01, 0x03, 0x02, 0x00, 0x01]);
        corrupted[3] ^= 0xff;
        assert_eq!(
            protocol.handle_response(&corrupted).unwrap_err().kind,
            ParseErrorKind::Checksum
        );
        let e = protocol
            .handle_response(&response(&[0x02, 0x03, 0x02, 0x00, 0x01]))
            .unwrap_err();
        assert_eq!(e.message, "Invalid address.");
    }
}
