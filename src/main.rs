//! CLI entry point for Inlinino.
//!
//! Without an index the instrument catalog is listed. With an index the
//! instrument is opened and its live values are printed until Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! inlinino --config inlinino_cfg.json
//! inlinino 0 --port /dev/ttyUSB0 --log
//! inlinino 2 --udp 0.0.0.0:10110
//! inlinino 0 --simulate capture.raw
//! inlinino --remove 3
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use inlinino::bus::{InstrumentEvent, RefreshGate, SignalBus};
use inlinino::manager::{InstrumentManager, InterfaceOverrides};
use inlinino::settings::{AppSettings, SETTINGS_FILE};
use inlinino::store::ConfigStore;
use inlinino::tracing_setup;
use inlinino::transport::mock::{MockTransport, MockTransportFactory};
use inlinino::transport::{SystemTransportFactory, TransportFactory};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Bytes handed over per simulated read.
const SIMULATED_READ: usize = 256;

#[derive(Parser)]
#[command(name = "inlinino")]
#[command(about = "Data acquisition for oceanographic inline instruments", long_about = None)]
struct Cli {
    /// Index of the instrument to open, as listed without arguments
    index: Option<usize>,

    /// Instrument catalog
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port
    #[arg(long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baudrate: Option<u32>,

    /// UDP bind address (ip:port)
    #[arg(long)]
    udp: Option<String>,

    /// Start logging as soon as the instrument is open
    #[arg(long)]
    log: bool,

    /// Remove the instrument at this index from the catalog
    #[arg(long, value_name = "INDEX")]
    remove: Option<usize>,

    /// Replay a capture file instead of opening a device
    #[arg(long, value_name = "FILE")]
    simulate: Option<PathBuf>,
}

fn load_settings(cli: &Cli) -> Result<AppSettings> {
    let dir = cli
        .config
        .as_ref()
        .and_then(|p| p.parent())
        .map(PathBuf::from)
        .unwrap_or_default();
    let mut settings = AppSettings::load_from(dir.join(SETTINGS_FILE))?;
    if let Some(catalog) = &cli.config {
        settings.catalog_path = catalog.clone();
    }
    Ok(settings)
}

fn transport_factory(simulate: Option<&PathBuf>) -> Result<Arc<dyn TransportFactory>> {
    let Some(path) = simulate else {
        return Ok(Arc::new(SystemTransportFactory));
    };
    let capture = std::fs::read(path)
        .with_context(|| format!("Unable to read capture {}", path.display()))?;
    info!(path = %path.display(), bytes = capture.len(), "Replaying capture");
    Ok(Arc::new(MockTransportFactory::new(move || {
        MockTransport::new()
            .with_chunks(capture.chunks(SIMULATED_READ).map(<[u8]>::to_vec))
            .with_idle(Duration::from_millis(100))
    })))
}

fn print_events(bus: &SignalBus, max_refresh_rate_hz: f64) {
    let mut rx = bus.subscribe();
    let mut gate = RefreshGate::new(max_refresh_rate_hz);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg.event {
                InstrumentEvent::NewTimeseries { values, .. } => {
                    if gate.ready(Instant::now()) {
                        println!("{values:?}");
                    }
                }
                InstrumentEvent::NewAux(values) => println!("aux: {}", values.join(" | ")),
                InstrumentEvent::StatusUpdate(status) => info!(
                    state = ?status.state,
                    logging = status.log_active,
                    received = status.counters.received,
                    logged = status.counters.logged,
                    corrupted = status.counters.corrupted,
                    "Status"
                ),
                InstrumentEvent::Alarm(true) => warn!("Data alarm raised"),
                InstrumentEvent::Alarm(false) => info!("Data alarm cleared"),
                InstrumentEvent::AlarmCustom { text, info } => warn!("{}: {}", text, info),
                _ => {}
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    if let Some(path) = tracing_setup::init_from_settings(&settings).map_err(anyhow::Error::msg)? {
        info!(path = %path.display(), "Application log");
    }

    let bus = SignalBus::new(settings.bus_capacity);
    let factory = transport_factory(cli.simulate.as_ref())?;
    let mut manager = InstrumentManager::new(
        ConfigStore::new(&settings.catalog_path),
        bus.clone(),
        factory,
    )
    .with_data_timeout(settings.data_timeout());

    if let Some(index) = cli.remove {
        let uuid = manager.delete(index).await?;
        println!("Removed instrument {uuid}");
        return Ok(());
    }

    let Some(index) = cli.index else {
        let listed = manager.list()?;
        if listed.is_empty() {
            println!("No instrument in {}", settings.catalog_path.display());
        }
        for (i, entry) in listed.iter().enumerate() {
            println!("{i:>3}  {} {}  ({})", entry.model, entry.serial_number, entry.module);
        }
        return Ok(());
    };

    print_events(&bus, settings.max_refresh_rate_hz);
    let overrides = InterfaceOverrides {
        port: cli
            .port
            .or_else(|| cli.simulate.as_ref().map(|p| p.display().to_string())),
        baudrate: cli.baudrate,
        udp: cli.udp,
    };
    let worker = manager.open_instrument(index, overrides).await?;
    if cli.log {
        worker.log_start();
    }

    tokio::signal::ctrl_c().await?;
    info!("Closing");
    manager.close_all().await;
    Ok(())
}
