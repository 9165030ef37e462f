//! Configuration Store.
//!
//! Durable JSON catalog of instrument setups and last-used interface
//! parameters:
//!
//! ```json
//! {
//!   "instruments": { "<uuid>": { "module": "generic", ... } },
//!   "interfaces": { "<uuid>": { "port": "/dev/ttyUSB0", "baudrate": 19200 } }
//! }
//! ```
//!
//! Records are kept as JSON values so keys unknown to this version survive a
//! rewrite; each instrument validates its own record on setup (see
//! [`crate::instruments::InstrumentConfig`]). Byte-valued fields use the
//! envelope of [`bytes::ByteString`].
//!
//! Writes go to a temporary file renamed over the catalog. Read-modify-write
//! sequences ([`ConfigStore::update`]) hold a process mutex and a
//! `<catalog>.lock` file, so two application instances never interleave.

pub mod bytes;

use crate::error::{AppResult, InlininoError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

static STORE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// How long to wait for another process holding the lock file.
const LOCK_WAIT: Duration = Duration::from_secs(5);
/// Lock files older than this are left over by a crashed process.
const STALE_LOCK: Duration = Duration::from_secs(60);

/// In-memory catalog.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Catalog {
    /// Instrument records by UUID.
    pub instruments: BTreeMap<String, Json>,
    /// Interface parameters by instrument UUID.
    pub interfaces: BTreeMap<String, Json>,
    extra: Map<String, Json>,
}

impl Catalog {
    /// Decode a catalog, normalizing legacy forms.
    pub fn from_json(value: Json) -> AppResult<Self> {
        let Json::Object(mut root) = value else {
            return Err(InlininoError::Config(
                "Configuration file must contain an object".into(),
            ));
        };
        let instruments = match root.remove("instruments") {
            Some(Json::Object(map)) => map.into_iter().collect(),
            Some(Json::Array(list)) => {
                info!("Assigning identifiers to {} legacy instrument records", list.len());
                list.into_iter()
                    .map(|record| (Uuid::new_v4().to_string(), record))
                    .collect()
            }
            Some(other) => {
                return Err(InlininoError::Config(format!(
                    "Invalid instruments entry: {other}"
                )))
            }
            None => {
                return Err(InlininoError::Config(
                    "Configuration file has no instruments".into(),
                ))
            }
        };
        let interfaces = match root.remove("interfaces") {
            Some(Json::Object(map)) => map
                .into_iter()
                .map(|(uuid, params)| (uuid, normalize_interface(params)))
                .collect(),
            _ => BTreeMap::new(),
        };
        Ok(Self {
            instruments,
            interfaces,
            extra: root,
        })
    }

    /// Encode the catalog, unknown top-level keys included.
    pub fn to_json(&self) -> Json {
        let mut root = self.extra.clone();
        root.insert(
            "instruments".into(),
            Json::Object(self.instruments.clone().into_iter().collect()),
        );
        root.insert(
            "interfaces".into(),
            Json::Object(self.interfaces.clone().into_iter().collect()),
        );
        Json::Object(root)
    }
}

fn normalize_interface(params: Json) -> Json {
    match params {
        // Older catalogs only kept the port name
        Json::String(port) => serde_json::json!({ "port": port }),
        Json::Object(mut map) => {
            if let Some(ip) = map.remove("socket_ip") {
                map.insert("ip".into(), ip);
            }
            if let Some(port) = map.remove("socket_port") {
                map.insert("port".into(), port);
            }
            Json::Object(map)
        }
        other => other,
    }
}

/// Held while a read-modify-write sequence runs.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(catalog: &Path) -> AppResult<Self> {
        let mut name = catalog.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path) {
                        warn!(path = %path.display(), "Removing stale lock file");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if start.elapsed() > LOCK_WAIT {
                        return Err(InlininoError::Config(format!(
                            "Configuration is locked by another process ({})",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn is_stale(path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .is_some_and(|age| age > STALE_LOCK)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Unable to remove lock file: {}", e);
        }
    }
}

/// Catalog file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Catalog path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the catalog. A missing file is an empty catalog.
    pub fn read(&self) -> AppResult<Catalog> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No configuration file, starting empty");
                return Ok(Catalog::default());
            }
            Err(e) => return Err(e.into()),
        };
        Catalog::from_json(serde_json::from_str(&text)?)
    }

    /// Replace the catalog atomically.
    pub fn write(&self, catalog: &Catalog) -> AppResult<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &catalog.to_json())?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| InlininoError::Io(e.error))?;
        debug!(path = %self.path.display(), "Configuration saved");
        Ok(())
    }

    /// Read, modify and write under the store lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut Catalog) -> AppResult<T>) -> AppResult<T> {
        let _guard = STORE_LOCK.lock();
        let _lock = LockFile::acquire(&self.path)?;
        let mut catalog = self.read()?;
        let out = f(&mut catalog)?;
        self.write(&catalog)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_list_gets_identifiers() {
        let catalog = Catalog::from_json(json!({
            "instruments": [{"model": "A"}, {"model": "B"}],
        }))
        .unwrap();
        assert_eq!(catalog.instruments.len(), 2);
        assert!(catalog
            .instruments
            .keys()
            .all(|k| Uuid::parse_str(k).is_ok()));
        assert!(catalog.interfaces.is_empty());
    }

    #[test]
    fn missing_instruments_is_fatal() {
        assert!(matches!(
            Catalog::from_json(json!({"interfaces": {}})),
            Err(InlininoError::Config(_))
        ));
    }

    #[test]
    fn legacy_interfaces_are_normalized() {
        let catalog = Catalog::from_json(json!({
            "instruments": {},
            "interfaces": {
                "a": "/dev/ttyUSB0",
                "b": {"socket_ip": "0.0.0.0", "socket_port": 10110}
            },
        }))
        .unwrap();
        assert_eq!(catalog.interfaces["a"], json!({"port": "/dev/ttyUSB0"}));
        assert_eq!(catalog.interfaces["b"], json!({"ip": "0.0.0.0", "port": 10110}));
    }

    #[test]
    fn update_keeps_unknown_keys_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inlinino_cfg.json");
        fs::write(&path, r#"{"instruments": {"x": {"notes": 1}}, "version": 3}"#).unwrap();
        let store = ConfigStore::new(&path);
        store
            .update(|c| {
                c.interfaces.insert("x".into(), json!({"port": "COM1"}));
                Ok(())
            })
            .unwrap();
        let raw: Json = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 3);
        assert_eq!(raw["instruments"]["x"]["notes"], 1);
        assert_eq!(raw["interfaces"]["x"]["port"], "COM1");
        assert!(!dir.path().join("inlinino_cfg.json.lock").exists());
    }

    #[test]
    fn failed_update_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("cfg.json"));
        let result: AppResult<()> = store.update(|c| {
            c.instruments.insert("x".into(), json!({}));
            Err(InlininoError::Config("nope".into()))
        });
        assert!(result.is_err());
        assert!(store.read().unwrap().instruments.is_empty());
    }
}
