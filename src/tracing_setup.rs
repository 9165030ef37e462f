//! Tracing infrastructure.
//!
//! Diagnostics go through `tracing` and `tracing-subscriber`:
//! - console output in one of three formats (pretty, compact, JSON)
//! - `RUST_LOG` environment filtering, falling back to the configured level
//! - an application log file per run under `<catalog dir>/logs/`, with the
//!   oldest run logs pruned at startup
//!
//! # Example
//! ```no_run
//! use inlinino::tracing_setup::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TracingConfig::new(Level::DEBUG)
//!     .with_format(OutputFormat::Json)
//!     .with_log_dir("logs", 10);
//! tracing_setup::init(config)?;
//! tracing::info!(component = "worker", "Application started");
//! # Ok(())
//! # }
//! ```

use crate::settings::AppSettings;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "inlinino_";
const LOG_FILE_EXT: &str = "log";

/// Names written by [`open_log_path`] (compiled once).
static RUN_LOG_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^inlinino_\d{8}_\d{6}(_\d+)?\.log$").expect("Invalid run log regex")
});

/// Output format for console tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact format without colors
    Compact,
    /// JSON format for structured logging
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Console output format
    pub format: OutputFormat,
    /// Whether to include thread names (worker threads are named after instruments)
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
    /// Directory of the application log file, if any
    pub log_dir: Option<PathBuf>,
    /// Number of run logs kept in `log_dir`
    pub log_files_kept: usize,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_thread_names: true,
            with_ansi: true,
            log_dir: None,
            log_files_kept: 10,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from application settings
    pub fn from_settings(settings: &AppSettings) -> Result<Self, String> {
        let level = parse_log_level(&settings.log_level)?;
        Ok(Self {
            level,
            format: settings.log_format,
            log_dir: Some(settings.log_dir()),
            log_files_kept: settings.log_files_kept,
            ..Default::default()
        })
    }

    /// Create tracing config with custom settings
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Write an application log file in `dir`, keeping `kept` run logs
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>, kept: usize) -> Self {
        self.log_dir = Some(dir.into());
        self.log_files_kept = kept;
        self
    }
}

/// Initialize tracing from application settings.
///
/// Returns the path of the application log file when one was created.
pub fn init_from_settings(settings: &AppSettings) -> Result<Option<PathBuf>, String> {
    init(TracingConfig::from_settings(settings)?)
}

/// Initialize tracing with custom configuration.
///
/// Idempotent: if a global subscriber is already installed this returns
/// `Ok` without replacing it, which keeps tests and embedding callers happy.
pub fn init(config: TracingConfig) -> Result<Option<PathBuf>, String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let console = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };

    let (file_layer, log_path) = match &config.log_dir {
        Some(dir) => {
            let path = open_log_path(dir, config.log_files_kept)
                .map_err(|e| format!("Failed to prepare log directory {}: {e}", dir.display()))?;
            let file = fs::File::create(&path)
                .map_err(|e| format!("Failed to create log file {}: {e}", path.display()))?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(Mutex::new(file))
                .boxed();
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console.and_then(file_layer).with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            // Expected in tests and when several components try to init tracing
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })?;

    Ok(log_path)
}

/// Create `dir`, prune old run logs and return the path for this run.
fn open_log_path(dir: &Path, kept: usize) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let mut existing: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_run_log(p))
        .collect();
    existing.sort();
    // Make room for the file about to be created
    let keep_old = kept.saturating_sub(1);
    if existing.len() > keep_old {
        let excess = existing.len() - keep_old;
        for path in existing.iter().take(excess) {
            if let Err(e) = fs::remove_file(path) {
                eprintln!("Unable to remove old log {}: {e}", path.display());
            }
        }
    }
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let mut path = dir.join(format!("{LOG_FILE_PREFIX}{stamp}.{LOG_FILE_EXT}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{LOG_FILE_PREFIX}{stamp}_{n}.{LOG_FILE_EXT}"));
        n += 1;
    }
    Ok(path)
}

fn is_run_log(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    RUN_LOG_NAME.is_match(name)
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

/// Convert Level to env filter string
fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_tracing_config_from_settings() {
        let settings = AppSettings {
            log_level: "debug".into(),
            catalog_path: PathBuf::from("/tmp/station/inlinino_cfg.json"),
            ..Default::default()
        };
        let config = TracingConfig::from_settings(&settings).unwrap();
        assert!(matches!(config.level, Level::DEBUG));
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/station/logs")));
    }

    #[test]
    fn old_run_logs_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=5 {
            let name = format!("inlinino_2024010{day}_120000.log");
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        fs::write(dir.path().join("inlinino_backup.log"), b"").unwrap();

        let path = open_log_path(dir.path(), 3).unwrap();
        assert!(!path.exists());

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                "inlinino_20240104_120000.log",
                "inlinino_20240105_120000.log",
                "inlinino_backup.log",
                "notes.txt",
            ]
        );
    }
}
