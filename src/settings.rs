//! Application settings using Figment.
//!
//! These are process-level knobs (where the instrument catalog lives, log
//! verbosity, watchdog timeout, plot refresh gate). Instrument setups live in
//! the JSON catalog handled by [`crate::store`].
//!
//! Settings are merged from:
//! 1. built-in defaults
//! 2. an optional `inlinino.toml` file
//! 3. environment variables prefixed with `INLININO_`
//!
//! # Example
//! ```no_run
//! use inlinino::settings::AppSettings;
//!
//! let settings = AppSettings::load_from("inlinino.toml")?;
//! println!("catalog: {}", settings.catalog_path.display());
//! # Ok::<(), inlinino::error::InlininoError>(())
//! ```

use crate::error::{AppResult, InlininoError};
use crate::tracing_setup::OutputFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file name, looked up next to the catalog.
pub const SETTINGS_FILE: &str = "inlinino.toml";

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppSettings {
    /// Path of the JSON instrument catalog.
    pub catalog_path: PathBuf,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Console log format.
    pub log_format: OutputFormat,
    /// Number of application log files kept in `logs/`.
    pub log_files_kept: usize,
    /// Seconds without bytes before the watchdog raises an alarm.
    pub data_timeout_s: f64,
    /// Maximum redraw rate applied by plot subscribers.
    pub max_refresh_rate_hz: f64,
    /// Capacity of the signal bus ring buffer.
    pub bus_capacity: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("inlinino_cfg.json"),
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
            log_files_kept: 10,
            data_timeout_s: 60.0,
            max_refresh_rate_hz: 4.0,
            bus_capacity: 1024,
        }
    }
}

impl AppSettings {
    /// Load settings from a TOML file (optional) and the environment.
    ///
    /// Environment variables override the file, e.g.
    /// `INLININO_DATA_TIMEOUT_S=30`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: AppSettings = Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("INLININO_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(InlininoError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        if !(self.data_timeout_s > 0.0) {
            return Err(InlininoError::Config(format!(
                "Invalid data_timeout_s {}. Must be positive",
                self.data_timeout_s
            )));
        }
        if !(self.max_refresh_rate_hz > 0.0) {
            return Err(InlininoError::Config(format!(
                "Invalid max_refresh_rate_hz {}. Must be positive",
                self.max_refresh_rate_hz
            )));
        }
        if self.bus_capacity == 0 {
            return Err(InlininoError::Config("bus_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Watchdog timeout as a duration.
    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.data_timeout_s)
    }

    /// Directory receiving the application log, next to the catalog.
    pub fn log_dir(&self) -> PathBuf {
        self.catalog_path
            .parent()
            .map(|p| p.join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = AppSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.data_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "data_timeout_s = 30.0\nlog_level = \"debug\"").unwrap();

        let settings = AppSettings::load_from(&path).unwrap();
        assert_eq!(settings.data_timeout_s, 30.0);
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.bus_capacity, 1024);
    }

    #[test]
    fn rejects_non_positive_timeout() {
        let settings = AppSettings {
            data_timeout_s: 0.0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(InlininoError::Config(_))));
    }

    #[test]
    fn log_dir_sits_next_to_catalog() {
        let settings = AppSettings {
            catalog_path: PathBuf::from("/data/cfg/inlinino_cfg.json"),
            ..Default::default()
        };
        assert_eq!(settings.log_dir(), PathBuf::from("/data/cfg/logs"));
    }
}
