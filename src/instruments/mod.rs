//! Instrument strategies, configuration and registry.
//!
//! A strategy bundles everything that differs between instruments: product
//! schema, framing rule, raw log layout, parser, calibrator, init commands
//! and periodic control. The [`crate::worker::Worker`] is generic and drives
//! any `Box<dyn InstrumentStrategy>`.
//!
//! Strategies are created by name from an [`InstrumentConfig`] through the
//! [`StrategyRegistry`]:
//!
//! | module      | instrument                                   |
//! |-------------|----------------------------------------------|
//! | `generic`   | delimited ASCII with a terminator            |
//! | `acs`       | WET Labs ACS spectrophotometer (binary)      |
//! | `satlantic` | Satlantic radiometers (telemetry definition) |
//! | `nmea`      | GPS NMEA 0183                                |
//! | `apogee`    | Apogee quantum sensor over Modbus RTU        |
//! | `ontrak`    | Ontrak ADU USB-HID relay/counter box         |
//! | `lisst`     | Sequoia LISST angular scattering             |
//! | `sunav1`    | Satlantic SUNA V1 nitrate sensor             |
//! | `sunav2`    | Satlantic SUNA V2 nitrate sensor             |
//! | `hyperbb`   | Sequoia HyperBB backscattering meter         |
//! | `taratsg`   | Tara thermosalinograph                       |
//! | `dataq`     | DATAQ DI-1100 voltage logger                 |

pub mod acs;
pub mod dataq;
pub mod features;
pub mod generic;
pub mod hyperbb;
pub mod lisst;
pub mod modbus;
pub mod nmea;
pub mod ontrak;
pub mod satlantic;
pub mod suna;
pub mod taratsg;

pub use features::{enabled_widgets, FeatureFlags, WidgetSpec, WIDGETS};

use crate::bus::InstrumentEvent;
use crate::error::{AppResult, InlininoError, ParseError};
use crate::framer::{Frame, FramingStrategy, DEFAULT_CEILING};
use crate::logger::{ProductStream, RawFormat, DEFAULT_ROTATION_SECS};
use crate::record::Record;
use crate::store::bytes::ByteString;
use crate::transport::{InterfaceKind, InterfaceParams, SerialParams, Transport};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// =============================================================================
// Strategy contract
// =============================================================================

/// How the worker drives the transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquisitionMode {
    /// The instrument streams; frames come out of the framer.
    Streaming,
    /// The worker writes a request whenever its buffer is empty. A silent
    /// read after some bytes completes the response.
    RequestResponse,
    /// The strategy assembles a frame itself at a fixed rate.
    Polled {
        /// Polls per second.
        refresh_rate: f64,
    },
}

/// State of one loop iteration handed to [`InstrumentStrategy::control_step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopTick {
    /// Time of the read.
    pub t: f64,
    /// Frames handled during this iteration.
    pub frames: usize,
    /// The read returned nothing.
    pub idle: bool,
}

/// Command sent from the UI to a running strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Show or hide a timeseries channel.
    SelectTimeseries {
        /// Channel name as listed in [`UiDescriptor::timeseries`].
        name: String,
        /// New state.
        enabled: bool,
    },
    /// New relay schedule.
    Relay(ontrak::RelaySchedule),
}

/// What a UI needs to build the widgets of an instrument.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiDescriptor {
    /// Names of every selectable timeseries channel.
    pub timeseries: Vec<String>,
    /// Channels plotted at start.
    pub active_timeseries: Vec<String>,
    /// Labels of the auxiliary values.
    pub aux: Vec<String>,
    /// Names of the spectrum traces.
    pub spectrum_traces: Vec<String>,
    /// X axis of each spectrum trace.
    pub spectrum_x: Vec<Vec<f64>>,
    /// Metadata keys of each frame type.
    pub metadata: Vec<(String, Vec<String>)>,
}

/// Instrument specific behavior plugged into a worker.
///
/// Everything except [`parse`](Self::parse), [`framing`](Self::framing),
/// [`product_streams`](Self::product_streams) and [`ui`](Self::ui) has a
/// default matching a streaming ASCII instrument.
pub trait InstrumentStrategy: Send {
    /// Module tag (`generic`, `acs`, ...).
    fn module(&self) -> &'static str;

    /// Product streams written by the product logger.
    fn product_streams(&self) -> Vec<ProductStream>;

    /// Frame delimitation rule.
    fn framing(&self) -> FramingStrategy;

    /// Framer buffer ceiling.
    fn buffer_ceiling(&self) -> usize {
        DEFAULT_CEILING
    }

    /// Raw log layout.
    fn raw_format(&self) -> RawFormat {
        RawFormat::text()
    }

    /// Log rotation period in seconds.
    fn rotation_period(&self) -> f64 {
        DEFAULT_ROTATION_SECS
    }

    /// How the worker drives the transport.
    fn acquisition(&self) -> AcquisitionMode {
        AcquisitionMode::Streaming
    }

    /// Serial settings proposed when no interface was saved.
    fn default_serial(&self, port: &str) -> SerialParams {
        SerialParams::new(port)
    }

    /// Adjust interface parameters before opening (e.g. USB ids).
    fn adapt_interface(&self, params: InterfaceParams) -> AppResult<InterfaceParams> {
        Ok(params)
    }

    /// Commands written once the transport is open.
    fn init_sequence(&mut self, _io: &mut dyn Transport, _t: f64) -> AppResult<()> {
        Ok(())
    }

    /// Request written by request/response instruments.
    fn request(&mut self, _io: &mut dyn Transport) -> AppResult<()> {
        Ok(())
    }

    /// Assemble one frame for polled instruments.
    fn poll(&mut self, _io: &mut dyn Transport, _t: f64) -> AppResult<Option<Frame>> {
        Ok(None)
    }

    /// Called after every iteration of a streaming loop.
    fn control_step(&mut self, _io: &mut dyn Transport, _tick: LoopTick) -> AppResult<()> {
        Ok(())
    }

    /// Decode a frame.
    fn parse(&self, frame: &Frame) -> Result<Record, ParseError>;

    /// Turn a parsed record into the record written to the product log.
    fn calibrate(&mut self, record: Record) -> Result<Record, ParseError> {
        Ok(record)
    }

    /// Events published for a record that made it through calibration.
    fn events(&mut self, record: &Record, t: f64, out: &mut Vec<InstrumentEvent>) {
        out.push(InstrumentEvent::NewTimeseries {
            values: record.numeric(),
            timestamp: t,
        });
    }

    /// Commands written before the transport closes.
    fn shutdown(&mut self, _io: &mut dyn Transport) -> AppResult<()> {
        Ok(())
    }

    /// Widgets the instrument supports.
    fn features(&self) -> FeatureFlags {
        FeatureFlags::default()
    }

    /// Widget content.
    fn ui(&self) -> UiDescriptor;

    /// Write bytes that belong to no frame to the raw log.
    fn log_unknown_bytes(&self) -> bool {
        true
    }

    /// Apply a UI command.
    fn command(&mut self, command: &ControlCommand) -> AppResult<()> {
        Err(InlininoError::Config(format!(
            "{} does not support {:?}",
            self.module(),
            command
        )))
    }
}

// =============================================================================
// Active timeseries channels
// =============================================================================

/// Subset of channels plotted on the timeseries widget.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveChannels {
    names: Vec<String>,
    active: Vec<bool>,
}

impl ActiveChannels {
    /// All channels, none active.
    pub fn new(names: Vec<String>) -> Self {
        let active = vec![false; names.len()];
        Self { names, active }
    }

    /// Toggle a channel by name.
    pub fn set(&mut self, name: &str, enabled: bool) -> AppResult<()> {
        let index = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| InlininoError::Config(format!("Unknown channel {name}")))?;
        self.active[index] = enabled;
        Ok(())
    }

    /// Toggle a channel by index.
    pub fn set_index(&mut self, index: usize, enabled: bool) {
        if let Some(a) = self.active.get_mut(index) {
            *a = enabled;
        }
    }

    /// Values of the active channels, in channel order.
    pub fn select(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .zip(&self.active)
            .filter(|(_, a)| **a)
            .map(|(v, _)| *v)
            .collect()
    }

    /// Every channel name.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Names of the active channels.
    pub fn active_names(&self) -> Vec<String> {
        self.names
            .iter()
            .zip(&self.active)
            .filter(|(_, a)| **a)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

/// Index of the value of `xs` closest to `x`.
pub fn nearest_index(xs: &[f64], x: f64) -> Option<usize> {
    xs.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - x).abs().total_cmp(&(*b - x).abs()))
        .map(|(i, _)| i)
}

// =============================================================================
// Instrument configuration
// =============================================================================

/// Fields every instrument record must carry.
pub const BASE_REQUIRED_FIELDS: &[&str] = &[
    "model",
    "serial_number",
    "module",
    "log_path",
    "log_raw",
    "log_products",
];

/// Module specific required fields.
pub fn module_required_fields(module: &str) -> &'static [&'static str] {
    match module {
        "generic" => &[
            "separator",
            "terminator",
            "variable_names",
            "variable_units",
            "variable_precision",
            "variable_columns",
            "variable_types",
        ],
        "nmea" => &[
            "variable_names",
            "variable_units",
            "variable_types",
            "variable_precision",
        ],
        "acs" => &["device_file"],
        "satlantic" => &["tdf_files", "immersed"],
        "ontrak" => &[
            "relay0_enabled",
            "relay0_mode",
            "event_counter_channels_enabled",
            "event_counter_k_factors",
        ],
        "lisst" => &["ini_file", "device_file", "dcal_file", "zsc_file"],
        "sunav1" | "sunav2" => &["calibration_file"],
        "hyperbb" => &["plaque_file", "temperature_file"],
        "dataq" => &["channels_enabled"],
        _ => &[],
    }
}

/// Instrument record of the catalog, checked for the fields of its module.
///
/// Module specific options stay in the record and are read by the strategy
/// with [`get`](Self::get) / [`require`](Self::require). Unknown keys are
/// preserved by [`to_record`](Self::to_record).
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentConfig {
    /// Module tag.
    pub module: String,
    /// Instrument model.
    pub model: String,
    /// Serial number.
    pub serial_number: String,
    /// Log directory.
    pub log_path: PathBuf,
    /// Write the raw sink.
    pub log_raw: bool,
    /// Write the product sink.
    pub log_products: bool,
    /// Prefix of log file names.
    pub log_prefix: String,
    /// Transport family.
    pub interface: InterfaceKind,
    /// Variable names.
    pub variable_names: Vec<String>,
    /// Variable units.
    pub variable_units: Vec<String>,
    /// Variable precisions.
    pub variable_precision: Vec<String>,
    /// Column of each variable in the frame.
    pub variable_columns: Vec<usize>,
    /// Type of each variable.
    pub variable_types: Vec<String>,
    /// Field separator.
    pub separator: Option<ByteString>,
    /// Frame terminator.
    pub terminator: Option<ByteString>,
    record: Map<String, Json>,
}

fn decode_field<T: DeserializeOwned>(key: &str, value: &Json) -> AppResult<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| InlininoError::Config(format!("Invalid field {key}: {e}")))
}

impl InstrumentConfig {
    /// Check and decode a catalog record.
    pub fn from_record(record: &Json) -> AppResult<Self> {
        let map = record
            .as_object()
            .ok_or_else(|| InlininoError::Config("Instrument record must be an object".into()))?;
        let module: String = match map.get("module") {
            Some(v) => decode_field("module", v)?,
            None => return Err(InlininoError::MissingField("module".into())),
        };
        for key in BASE_REQUIRED_FIELDS
            .iter()
            .chain(module_required_fields(&module))
        {
            if !map.contains_key(*key) {
                return Err(InlininoError::MissingField((*key).to_string()));
            }
        }
        Self::check_lengths(map)?;

        let mut config = Self {
            module,
            model: String::new(),
            serial_number: String::new(),
            log_path: PathBuf::new(),
            log_raw: false,
            log_products: false,
            log_prefix: String::new(),
            interface: InterfaceKind::Serial,
            variable_names: Vec::new(),
            variable_units: Vec::new(),
            variable_precision: Vec::new(),
            variable_columns: Vec::new(),
            variable_types: Vec::new(),
            separator: None,
            terminator: None,
            record: map.clone(),
        };
        config.model = config.require("model")?;
        config.serial_number = match map.get("serial_number") {
            // Some catalogs store numeric serial numbers.
            Some(Json::Number(n)) => n.to_string(),
            _ => config.require("serial_number")?,
        };
        config.log_path = config.require("log_path")?;
        config.log_raw = config.require("log_raw")?;
        config.log_products = config.require("log_products")?;
        config.log_prefix = config.get("log_prefix")?.unwrap_or_default();
        config.interface = match config.get::<String>("interface")? {
            Some(kind) => InterfaceKind::parse(&kind)?,
            None => InterfaceKind::Serial,
        };
        config.variable_names = config.get("variable_names")?.unwrap_or_default();
        config.variable_units = config.get("variable_units")?.unwrap_or_default();
        config.variable_precision = config.get("variable_precision")?.unwrap_or_default();
        config.variable_columns = config.get("variable_columns")?.unwrap_or_default();
        config.variable_types = config.get("variable_types")?.unwrap_or_default();
        config.separator = config.get("separator")?;
        config.terminator = config.get("terminator")?;
        Ok(config)
    }

    fn check_lengths(map: &Map<String, Json>) -> AppResult<()> {
        let Some(Json::Array(names)) = map.get("variable_names") else {
            return Ok(());
        };
        for (key, value) in map {
            if !key.contains("variable_") {
                continue;
            }
            if let Json::Array(list) = value {
                if list.len() != names.len() {
                    return Err(InlininoError::Validation(format!("{key} invalid length")));
                }
            }
        }
        Ok(())
    }

    /// Decode an optional field.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        match self.record.get(key) {
            None | Some(Json::Null) => Ok(None),
            Some(v) => decode_field(key, v).map(Some),
        }
    }

    /// Decode a required field.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> AppResult<T> {
        self.get(key)?
            .ok_or_else(|| InlininoError::MissingField(key.to_string()))
    }

    /// `<prefix><model><serial>`, the stem of every log file.
    pub fn basename(&self) -> String {
        format!("{}{}{}", self.log_prefix, self.model, self.serial_number)
    }

    /// Human readable name.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.model, self.serial_number)
    }

    /// Log directory.
    pub fn log_dir(&self) -> &Path {
        &self.log_path
    }

    /// The record as stored in the catalog, unknown keys included.
    pub fn to_record(&self) -> Json {
        Json::Object(self.record.clone())
    }

    /// Set a field of the underlying record and decode the config again.
    pub fn with_field(&self, key: &str, value: Json) -> AppResult<Self> {
        let mut record = self.record.clone();
        record.insert(key.to_string(), value);
        Self::from_record(&Json::Object(record))
    }
}

// =============================================================================
// Registry
// =============================================================================

type StrategyFactory =
    Box<dyn Fn(&InstrumentConfig) -> AppResult<Box<dyn InstrumentStrategy>> + Send + Sync>;

/// Registry of strategy constructors keyed by module tag.
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in module.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("generic", |c| Ok(Box::new(generic::Generic::new(c)?)));
        registry.register("acs", |c| Ok(Box::new(acs::Acs::new(c)?)));
        registry.register("satlantic", |c| Ok(Box::new(satlantic::Satlantic::new(c)?)));
        registry.register("nmea", |c| Ok(Box::new(nmea::Nmea::new(c)?)));
        registry.register("apogee", |c| Ok(Box::new(modbus::Apogee::new(c)?)));
        registry.register("ontrak", |c| Ok(Box::new(ontrak::Ontrak::new(c)?)));
        registry.register("lisst", |c| Ok(Box::new(lisst::Lisst::new(c)?)));
        registry.register("hyperbb", |c| Ok(Box::new(hyperbb::HyperBb::new(c)?)));
        registry.register("taratsg", |c| Ok(Box::new(taratsg::TaraTsg::new(c)?)));
        registry.register("dataq", |c| Ok(Box::new(dataq::Dataq::new(c)?)));
        for module in ["sunav1", "sunav2"] {
            registry.register(module, |c| {
                let model = suna::SunaModel::try_from(c.module.as_str())?;
                Ok(Box::new(suna::Suna::new(model, c)?))
            });
        }
        registry
    }

    /// Register a constructor.
    pub fn register<F>(&mut self, module: &str, factory: F)
    where
        F: Fn(&InstrumentConfig) -> AppResult<Box<dyn InstrumentStrategy>> + Send + Sync + 'static,
    {
        self.factories.insert(module.to_string(), Box::new(factory));
    }

    /// Build the strategy of a configuration.
    pub fn create(&self, config: &InstrumentConfig) -> AppResult<Box<dyn InstrumentStrategy>> {
        let factory = self.factories.get(&config.module).ok_or_else(|| {
            InlininoError::Config(format!("Unknown instrument module {}", config.module))
        })?;
        factory(config)
    }

    /// Registered module tags, sorted.
    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.factories.keys().cloned().collect();
        modules.sort();
        modules
    }
}

static BUILTIN: Lazy<StrategyRegistry> = Lazy::new(StrategyRegistry::with_builtin);

/// Build a strategy with the built-in registry.
pub fn build_strategy(config: &InstrumentConfig) -> AppResult<Box<dyn InstrumentStrategy>> {
    BUILTIN.create(config)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn generic_record() -> Json {
        json!({
            "module": "generic",
            "model": "GEN",
            "serial_number": "001",
            "log_path": "/tmp/inlinino",
            "log_raw": true,
            "log_products": true,
            "separator": {"__bytes__": "ascii", "content": ","},
            "terminator": {"__bytes__": "ascii", "content": "\n"},
            "variable_names": ["a", "b"],
            "variable_units": ["1", "1"],
            "variable_precision": ["%d", "%d"],
            "variable_columns": [0, 1],
            "variable_types": ["int", "int"],
            "notes": "kept"
        })
    }

    #[test]
    fn decodes_generic_record() {
        let config = InstrumentConfig::from_record(&generic_record()).unwrap();
        assert_eq!(config.module, "generic");
        assert_eq!(config.basename(), "GEN001");
        assert_eq!(config.terminator.as_ref().unwrap().as_bytes(), b"\n");
        assert_eq!(config.variable_columns, vec![0, 1]);
        assert_eq!(config.interface, InterfaceKind::Serial);
        assert_eq!(config.to_record()["notes"], "kept");
    }

    #[test]
    fn missing_field_is_named() {
        let mut record = generic_record();
        record.as_object_mut().unwrap().remove("separator");
        match InstrumentConfig::from_record(&record) {
            Err(InlininoError::MissingField(f)) => assert_eq!(f, "separator"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn variable_lists_must_match() {
        let mut record = generic_record();
        record["variable_units"] = json!(["1"]);
        match InstrumentConfig::from_record(&record) {
            Err(InlininoError::Validation(msg)) => assert!(msg.contains("variable_units")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mistyped_field_is_config_error() {
        let mut record = generic_record();
        record["log_raw"] = json!("yes");
        assert!(matches!(
            InstrumentConfig::from_record(&record),
            Err(InlininoError::Config(_))
        ));
    }

    #[test]
    fn registry_knows_every_module() {
        let registry = StrategyRegistry::with_builtin();
        assert_eq!(
            registry.modules(),
            vec![
                "acs",
                "apogee",
                "dataq",
                "generic",
                "hyperbb",
                "lisst",
                "nmea",
                "ontrak",
                "satlantic",
                "sunav1",
                "sunav2",
                "taratsg"
            ]
        );
        let mut record = generic_record();
        record["module"] = json!("bogus");
        let config = InstrumentConfig::from_record(&record).unwrap();
        assert!(registry.create(&config).is_err());
    }

    #[test]
    fn active_channels_select_in_order() {
        let mut channels = ActiveChannels::new(vec!["a".into(), "b".into(), "c".into()]);
        channels.set("c", true).unwrap();
        channels.set_index(0, true);
        assert_eq!(channels.select(&[1.0, 2.0, 3.0]), vec![1.0, 3.0]);
        assert_eq!(channels.active_names(), vec!["a", "c"]);
        assert!(channels.set("z", true).is_err());
        assert_eq!(nearest_index(&[1.0, 2.0, 4.0], 3.2), Some(2));
    }
}
