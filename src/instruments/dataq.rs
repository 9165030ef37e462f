//! DATAQ DI-1100 four channel voltage logger.
//!
//! The logger is configured over its serial (USB CDC) port on open: ASCII
//! encoding with `\r` line endings, one scan list entry per enabled
//! channel (±10 V range), averaging filters and a 1 Hz sample rate. It then
//! streams one comma separated line of voltages per sample. `stop` is sent
//! before closing.

use super::{InstrumentConfig, InstrumentStrategy, UiDescriptor};
use crate::error::{AppResult, InlininoError, ParseError};
use crate::framer::{Frame, FramingStrategy};
use crate::logger::ProductStream;
use crate::record::{Record, Schema, Value};
use crate::transport::{SerialParams, Transport};
use std::time::Duration;
use tracing::{debug, info};

/// Scan list codes of the analog channels, ±10 V range.
pub const SLIST: [u16; 4] = [0x0000, 0x0001, 0x0002, 0x0003];

const COMMAND_DELAY: Duration = Duration::from_millis(100);

/// DATAQ strategy.
#[derive(Debug, Clone)]
pub struct Dataq {
    channels: Vec<usize>,
    schema: Schema,
}

impl Dataq {
    /// Build from a checked configuration.
    pub fn new(config: &InstrumentConfig) -> AppResult<Self> {
        let channels: Vec<usize> = config.require("channels_enabled")?;
        if channels.is_empty() {
            return Err(InlininoError::Config("No channel enabled".into()));
        }
        if let Some(c) = channels.iter().find(|c| **c >= SLIST.len()) {
            return Err(InlininoError::Config(format!("Invalid channel {c}")));
        }
        let names: Vec<String> = match config.get::<Vec<String>>("channels_names")? {
            Some(names) if names.len() == channels.len() => names,
            Some(_) => {
                return Err(InlininoError::Validation(
                    "channels_names invalid length".into(),
                ))
            }
            // Channels are labelled from 1 on the device
            None => channels.iter().map(|c| format!("C{}", c + 1)).collect(),
        };
        let units = vec!["V".to_string(); channels.len()];
        let precisions = vec!["%.3f".to_string(); channels.len()];
        Ok(Self {
            schema: Schema::new(&names, &units, &precisions),
            channels,
        })
    }

    /// Configuration commands written on open, `start` last.
    pub fn setup_commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = ["eol 0", "stop", "encode 1", "ps 0"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        for (position, channel) in self.channels.iter().enumerate() {
            commands.push(format!("slist {position} {}", SLIST[*channel]));
        }
        for position in 0..self.channels.len() {
            commands.push(format!("filter {position} 1"));
        }
        // 60 MHz / (6000 x 500) = 1 Hz, averaging 500 points per sample
        commands.extend(["srate 6000", "deca 500", "start"].map(String::from));
        commands
    }

    fn send(io: &mut dyn Transport, command: &str) -> AppResult<()> {
        debug!("send_cmd: {command}");
        io.write(format!("{command}\r").as_bytes())?;
        std::thread::sleep(COMMAND_DELAY);
        Ok(())
    }
}

impl InstrumentStrategy for Dataq {
    fn module(&self) -> &'static str {
        "dataq"
    }

    fn product_streams(&self) -> Vec<ProductStream> {
        vec![ProductStream::single(self.schema.clone())]
    }

    fn framing(&self) -> FramingStrategy {
        FramingStrategy::Terminator(b"\r".to_vec())
    }

    fn default_serial(&self, port: &str) -> SerialParams {
        SerialParams::new(port).with_baudrate(115_200).with_timeout(1.0)
    }

    fn init_sequence(&mut self, io: &mut dyn Transport, _t: f64) -> AppResult<()> {
        for command in self.setup_commands() {
            Self::send(io, &command)?;
            // `start` has no echo; every other command answers
            if command != "start" {
                let echo = io.read()?;
                if !echo.is_empty() {
                    let echo = String::from_utf8_lossy(&echo);
                    info!("{}", echo.trim_matches(|c: char| c == '\0' || c.is_whitespace()));
                }
            }
        }
        Ok(())
    }

    fn parse(&self, frame: &Frame) -> Result<Record, ParseError> {
        let line = std::str::from_utf8(&frame.body)
            .map_err(|_| ParseError::bad_field("line is not ASCII"))?;
        let fields: Vec<&str> = line
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .split(',')
            .collect();
        if fields.len() < self.channels.len() {
            return Err(ParseError::wrong_field_count(self.channels.len(), fields.len()));
        }
        let values = fields[..self.channels.len()]
            .iter()
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map(Value::Float)
                    .map_err(|_| ParseError::bad_field(format!("invalid voltage {raw:?}")))
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Record::new(values))
    }

    fn shutdown(&mut self, io: &mut dyn Transport) -> AppResult<()> {
        Self::send(io, "stop")
    }

    fn ui(&self) -> UiDescriptor {
        UiDescriptor {
            timeseries: self.schema.names.clone(),
            active_timeseries: self.schema.names.clone(),
            ..Default::default()
        }
    }
}
