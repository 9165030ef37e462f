//! Instrument manager.
//!
//! Composes the [`ConfigStore`] with one [`Worker`] per opened instrument.
//! Catalog entries are addressed by their position in the sorted listing
//! (model then serial number), the way the startup dialog presents them.

use crate::bus::SignalBus;
use crate::error::{AppResult, InlininoError};
use crate::instruments::InstrumentConfig;
use crate::store::ConfigStore;
use crate::transport::{
    HidParams, InterfaceKind, InterfaceParams, TransportFactory, UdpParams,
};
use crate::watchdog::DATA_TIMEOUT;
use crate::worker::Worker;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// One line of the catalog listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedInstrument {
    /// Catalog identifier.
    pub uuid: String,
    /// Module tag.
    pub module: String,
    /// Instrument model.
    pub model: String,
    /// Serial number.
    pub serial_number: String,
}

impl ListedInstrument {
    fn from_record(uuid: &str, record: &Json) -> Self {
        let text = |key: &str| match record.get(key) {
            Some(Json::String(s)) => s.clone(),
            Some(Json::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Self {
            uuid: uuid.to_string(),
            module: text("module"),
            model: text("model"),
            serial_number: text("serial_number"),
        }
    }
}

/// Interface settings given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceOverrides {
    /// Serial port.
    pub port: Option<String>,
    /// Serial baud rate.
    pub baudrate: Option<u32>,
    /// UDP bind address, `ip:port`.
    pub udp: Option<String>,
}

/// Catalog and running workers.
pub struct InstrumentManager {
    store: ConfigStore,
    bus: SignalBus,
    factory: Arc<dyn TransportFactory>,
    data_timeout: Duration,
    workers: HashMap<String, Worker>,
}

impl InstrumentManager {
    /// Manager over `store`, publishing on `bus`.
    pub fn new(store: ConfigStore, bus: SignalBus, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            store,
            bus,
            factory,
            data_timeout: DATA_TIMEOUT,
            workers: HashMap::new(),
        }
    }

    /// Watchdog timeout given to new workers.
    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    /// Signal bus of every worker.
    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    /// Catalog entries sorted by model and serial number.
    pub fn list(&self) -> AppResult<Vec<ListedInstrument>> {
        let catalog = self.store.read()?;
        let mut listed: Vec<ListedInstrument> = catalog
            .instruments
            .iter()
            .map(|(uuid, record)| ListedInstrument::from_record(uuid, record))
            .collect();
        listed.sort_by(|a, b| {
            (a.model.as_str(), a.serial_number.as_str())
                .cmp(&(b.model.as_str(), b.serial_number.as_str()))
        });
        Ok(listed)
    }

    /// UUID and record of the entry at `index` of the listing.
    pub fn get(&self, index: usize) -> AppResult<(String, Json)> {
        let listed = self.list()?;
        let entry = listed.get(index).ok_or_else(|| {
            InlininoError::Config(format!(
                "Instrument index {index} out of range ({} instruments)",
                listed.len()
            ))
        })?;
        let catalog = self.store.read()?;
        let record = catalog
            .instruments
            .get(&entry.uuid)
            .cloned()
            .ok_or_else(|| InlininoError::Config(format!("Unknown instrument {}", entry.uuid)))?;
        Ok((entry.uuid.clone(), record))
    }

    /// Validate and store a new instrument. Returns its UUID.
    pub fn add(&self, record: Json) -> AppResult<String> {
        let config = InstrumentConfig::from_record(&record)?;
        let uuid = Uuid::new_v4().to_string();
        self.store.update(|catalog| {
            catalog.instruments.insert(uuid.clone(), record);
            Ok(())
        })?;
        info!(instrument = %config.display_name(), %uuid, "Instrument added");
        Ok(uuid)
    }

    /// Validate and replace the record of `uuid`.
    pub fn update(&self, uuid: &str, record: Json) -> AppResult<()> {
        InstrumentConfig::from_record(&record)?;
        self.store.update(|catalog| match catalog.instruments.get_mut(uuid) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(InlininoError::Config(format!("Unknown instrument {uuid}"))),
        })
    }

    /// Remove the entry at `index` and its interface. Returns its UUID.
    pub async fn delete(&mut self, index: usize) -> AppResult<String> {
        let (uuid, _) = self.get(index)?;
        if let Some(mut worker) = self.workers.remove(&uuid) {
            worker.close().await?;
        }
        self.store.update(|catalog| {
            catalog.instruments.remove(&uuid);
            catalog.interfaces.remove(&uuid);
            Ok(())
        })?;
        info!(%uuid, "Instrument removed");
        Ok(uuid)
    }

    /// Remember the interface of `uuid`.
    pub fn save_interface(&self, uuid: &str, params: &InterfaceParams) -> AppResult<()> {
        let record = params.to_record()?;
        self.store.update(|catalog| {
            catalog.interfaces.insert(uuid.to_string(), record);
            Ok(())
        })
    }

    /// Interface last used by `uuid`, if it matches `kind`.
    pub fn saved_interface(
        &self,
        uuid: &str,
        kind: InterfaceKind,
    ) -> AppResult<Option<InterfaceParams>> {
        let catalog = self.store.read()?;
        let Some(record) = catalog.interfaces.get(uuid) else {
            return Ok(None);
        };
        match InterfaceParams::from_record(kind, record) {
            Ok(params) => Ok(Some(params)),
            Err(e) => {
                warn!(%uuid, "Ignoring saved interface: {}", e);
                Ok(None)
            }
        }
    }

    fn resolve_interface(
        &self,
        uuid: &str,
        config: &InstrumentConfig,
        worker: &Worker,
        overrides: &InterfaceOverrides,
    ) -> AppResult<InterfaceParams> {
        if let Some(address) = &overrides.udp {
            let (ip, port) = address.rsplit_once(':').ok_or_else(|| {
                InlininoError::Config(format!("Invalid UDP address {address}, expected ip:port"))
            })?;
            let port = port
                .parse()
                .map_err(|_| InlininoError::Config(format!("Invalid UDP port {port}")))?;
            return Ok(InterfaceParams::Udp(UdpParams {
                ip: ip.to_string(),
                port,
                timeout: 1.0,
            }));
        }
        let saved = self.saved_interface(uuid, config.interface)?;
        match config.interface {
            InterfaceKind::Serial => {
                let mut params = match (saved, &overrides.port) {
                    (Some(InterfaceParams::Serial(p)), None) => p,
                    (Some(InterfaceParams::Serial(p)), Some(port)) if &p.port == port => p,
                    (_, Some(port)) => worker.default_serial(port),
                    (_, None) => {
                        return Err(InlininoError::Config(format!(
                            "No serial port known for {}",
                            config.display_name()
                        )))
                    }
                };
                if let Some(baudrate) = overrides.baudrate {
                    params.baudrate = baudrate;
                }
                Ok(InterfaceParams::Serial(params))
            }
            InterfaceKind::Socket => saved.ok_or_else(|| {
                InlininoError::Config(format!(
                    "No UDP address known for {}",
                    config.display_name()
                ))
            }),
            // Vendor and product ids are filled in by the strategy
            InterfaceKind::UsbHid => Ok(saved.unwrap_or(InterfaceParams::UsbHid(HidParams::new(0, 0)))),
        }
    }

    /// Set up the entry at `index`, open its interface and return its worker.
    pub async fn open_instrument(
        &mut self,
        index: usize,
        overrides: InterfaceOverrides,
    ) -> AppResult<&mut Worker> {
        let (uuid, record) = self.get(index)?;
        let config = InstrumentConfig::from_record(&record)?;
        if let Some(mut previous) = self.workers.remove(&uuid) {
            previous.close().await?;
        }
        let mut worker = Worker::new(uuid.as_str(), &self.bus, self.factory.clone())
            .with_data_timeout(self.data_timeout);
        worker.setup(config.clone()).await?;
        let params = self.resolve_interface(&uuid, &config, &worker, &overrides)?;
        worker.open(params.clone()).await?;
        self.save_interface(&uuid, &params)?;
        Ok(self.workers.entry(uuid).or_insert(worker))
    }

    /// Running worker of `uuid`.
    pub fn worker(&mut self, uuid: &str) -> Option<&mut Worker> {
        self.workers.get_mut(uuid)
    }

    /// Close every worker.
    pub async fn close_all(&mut self) {
        for (uuid, mut worker) in self.workers.drain() {
            if let Err(e) = worker.close().await {
                warn!(%uuid, "{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::tests::generic_record;
    use crate::transport::mock::{MockTransport, MockTransportFactory};
    use serde_json::json;

    fn manager(dir: &std::path::Path) -> (InstrumentManager, Arc<MockTransportFactory>) {
        let factory = Arc::new(MockTransportFactory::new(MockTransport::new));
        let store = ConfigStore::new(dir.join("inlinino_cfg.json"));
        (
            InstrumentManager::new(store, SignalBus::new(64), factory.clone()),
            factory,
        )
    }

    fn record(model: &str, serial: &str) -> Json {
        let mut record = generic_record();
        record["model"] = json!(model);
        record["serial_number"] = json!(serial);
        record
    }

    #[test]
    fn listing_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        manager.add(record("ZZ", "1")).unwrap();
        manager.add(record("AA", "2")).unwrap();
        manager.add(record("AA", "1")).unwrap();
        let names: Vec<String> = manager
            .list()
            .unwrap()
            .into_iter()
            .map(|l| format!("{}{}", l.model, l.serial_number))
            .collect();
        assert_eq!(names, vec!["AA1", "AA2", "ZZ1"]);
    }

    #[test]
    fn invalid_record_is_not_added() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let mut bad = generic_record();
        bad.as_object_mut().unwrap().remove("terminator");
        assert!(matches!(
            manager.add(bad),
            Err(InlininoError::MissingField(f)) if f == "terminator"
        ));
        assert!(manager.list().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_saves_interface_and_delete_forgets_it() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, factory) = manager(dir.path());
        let uuid = manager.add(record("GEN", "001")).unwrap();
        let overrides = InterfaceOverrides {
            port: Some("/dev/ttyUSB0".into()),
            ..Default::default()
        };
        assert!(manager.open_instrument(0, overrides).await.unwrap().is_running());
        match factory.last_params() {
            Some(InterfaceParams::Serial(p)) => {
                assert_eq!(p.port, "/dev/ttyUSB0");
                assert_eq!(p.baudrate, 19200);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(manager
            .saved_interface(&uuid, InterfaceKind::Serial)
            .unwrap()
            .is_some());

        assert_eq!(manager.delete(0).await.unwrap(), uuid);
        assert_eq!(factory.open_handles(), 0);
        assert!(manager
            .saved_interface(&uuid, InterfaceKind::Serial)
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serial_instrument_needs_a_port() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _) = manager(dir.path());
        manager.add(record("GEN", "001")).unwrap();
        assert!(manager
            .open_instrument(0, InterfaceOverrides::default())
            .await
            .is_err());
    }
}
