//! Instrument Worker.
//!
//! A [`Worker`] owns one instrument for the lifetime of the application: its
//! configuration, its strategy and, while open, an acquisition session
//! running on a dedicated blocking thread. The session ties the transport,
//! framer, strategy, loggers and watchdog into one loop (see [`session`]).
//!
//! Lifecycle:
//!
//! ```text
//! idle -> opening -> running <-> degraded -> closing -> idle
//! ```
//!
//! `degraded` means the watchdog alarm is raised; the session keeps reading.
//! A fatal transport error ends the session and returns the worker to `idle`
//! after publishing `alarm(true)`.
//!
//! # Example
//! ```no_run
//! use inlinino::bus::SignalBus;
//! use inlinino::instruments::InstrumentConfig;
//! use inlinino::transport::{InterfaceParams, SerialParams, SystemTransportFactory};
//! use inlinino::worker::Worker;
//! use std::sync::Arc;
//!
//! # async fn demo(config: InstrumentConfig) -> inlinino::error::AppResult<()> {
//! let bus = SignalBus::default();
//! let mut worker = Worker::new("3f2a", &bus, Arc::new(SystemTransportFactory));
//! worker.setup(config).await?;
//! worker
//!     .open(InterfaceParams::Serial(SerialParams::new("/dev/ttyUSB0")))
//!     .await?;
//! worker.log_start();
//! # Ok(())
//! # }
//! ```

mod session;

use crate::bus::{InstrumentEvent, Publisher, SignalBus, StatusSnapshot};
use crate::error::{AppResult, InlininoError};
use crate::framer::Framer;
use crate::instruments::{
    build_strategy, ControlCommand, FeatureFlags, InstrumentConfig, InstrumentStrategy,
    UiDescriptor,
};
use crate::logger::{ProductLogger, RawLogger};
use crate::transport::{InterfaceParams, SerialParams, StopHandle, TransportFactory};
use crate::watchdog::{Watchdog, DATA_TIMEOUT};
use parking_lot::Mutex;
use session::Session;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shortest wait for a session to stop.
const MIN_JOIN_WAIT: Duration = Duration::from_secs(1);

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// No session.
    #[default]
    Idle,
    /// Transport being opened.
    Opening,
    /// Session running.
    Running,
    /// Session running with the data-timeout alarm raised.
    Degraded,
    /// Session being stopped.
    Closing,
}

/// Runtime counters, reset on each open.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CounterSnapshot {
    /// Frames handed over by the framer.
    pub received: u64,
    /// Frames written to at least one sink.
    pub logged: u64,
    /// Frames rejected by the parser or calibrator.
    pub corrupted: u64,
    /// Time of the last corrupted frame.
    pub last_corrupted: Option<f64>,
    /// Time of the last byte received.
    pub last_data: Option<f64>,
    /// Whether the data-timeout alarm is raised.
    pub watchdog_active: bool,
}

/// State shared between a worker and its session.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) alive: AtomicBool,
    pub(crate) log_active: AtomicBool,
    pub(crate) state: Mutex<WorkerState>,
    pub(crate) counters: Mutex<CounterSnapshot>,
    pub(crate) interface: Mutex<String>,
}

impl Shared {
    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: *self.state.lock(),
            log_active: self.log_active.load(Ordering::Acquire),
            interface: self.interface.lock().clone(),
            counters: self.counters.lock().clone(),
        }
    }

    pub(crate) fn set_state(&self, state: WorkerState, publisher: &Publisher) {
        *self.state.lock() = state;
        publisher.publish(InstrumentEvent::StatusUpdate(self.snapshot()));
    }
}

struct SessionHandle {
    task: JoinHandle<Box<dyn InstrumentStrategy>>,
    stop: StopHandle,
    commands: mpsc::UnboundedSender<ControlCommand>,
    timeout: Duration,
}

/// Lifecycle manager of one instrument.
pub struct Worker {
    uuid: Arc<str>,
    factory: Arc<dyn TransportFactory>,
    publisher: Publisher,
    data_timeout: Duration,
    config: Option<InstrumentConfig>,
    strategy: Option<Box<dyn InstrumentStrategy>>,
    ui: UiDescriptor,
    features: FeatureFlags,
    shared: Arc<Shared>,
    session: Option<SessionHandle>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .field("running", &self.session.is_some())
            .finish()
    }
}

impl Worker {
    /// Worker publishing on `bus` under `uuid`, opening transports with `factory`.
    pub fn new(
        uuid: impl Into<Arc<str>>,
        bus: &SignalBus,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let uuid = uuid.into();
        Self {
            publisher: bus.publisher(uuid.clone()),
            uuid,
            factory,
            data_timeout: DATA_TIMEOUT,
            config: None,
            strategy: None,
            ui: UiDescriptor::default(),
            features: FeatureFlags::default(),
            shared: Arc::new(Shared::default()),
            session: None,
        }
    }

    /// Override the watchdog timeout.
    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    /// Instrument UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Current configuration.
    pub fn config(&self) -> Option<&InstrumentConfig> {
        self.config.as_ref()
    }

    /// Lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Counters of the current (or last) session.
    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.lock().clone()
    }

    /// Full status, as published on `status_update`.
    pub fn status(&self) -> StatusSnapshot {
        self.shared.snapshot()
    }

    /// Whether a session was started and not closed yet.
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Whether logging is on.
    pub fn is_logging(&self) -> bool {
        self.shared.log_active.load(Ordering::Acquire)
    }

    /// Widget content of the instrument.
    pub fn ui(&self) -> UiDescriptor {
        self.strategy
            .as_ref()
            .map(|s| s.ui())
            .unwrap_or_else(|| self.ui.clone())
    }

    /// Widgets supported by the instrument.
    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    /// Serial settings the instrument usually runs with.
    pub fn default_serial(&self, port: &str) -> SerialParams {
        self.strategy
            .as_ref()
            .map(|s| s.default_serial(port))
            .unwrap_or_else(|| SerialParams::new(port))
    }

    /// Validate `config` and build its strategy. Closes a running session first.
    pub async fn setup(&mut self, config: InstrumentConfig) -> AppResult<()> {
        if self.session.is_some() {
            self.close_logged().await;
        }
        let strategy = build_strategy(&config)?;
        for stream in strategy.product_streams() {
            let schema = stream.schema;
            if schema.units.len() != schema.len() || schema.precisions.len() != schema.len() {
                return Err(InlininoError::Validation(format!(
                    "{} schema lists differ in length",
                    config.display_name()
                )));
            }
        }
        self.ui = strategy.ui();
        self.features = strategy.features();
        info!(instrument = %config.display_name(), module = %config.module, "Instrument set up");
        self.strategy = Some(strategy);
        self.config = Some(config);
        self.shared.set_state(WorkerState::Idle, &self.publisher);
        Ok(())
    }

    /// Open the transport and start a session. Logging starts off.
    pub async fn open(&mut self, params: InterfaceParams) -> AppResult<()> {
        if self.session.is_some() {
            self.close_logged().await;
        }
        let config = self
            .config
            .clone()
            .ok_or_else(|| InlininoError::Config("Instrument is not set up".into()))?;
        let strategy = match self.strategy.take() {
            Some(strategy) => strategy,
            None => build_strategy(&config)?,
        };

        let shared = Arc::new(Shared::default());
        self.shared = shared.clone();
        shared.set_state(WorkerState::Opening, &self.publisher);

        let opened = strategy
            .adapt_interface(params)
            .and_then(|params| self.factory.open(&params));
        let io = match opened {
            Ok(io) => io,
            Err(e) => {
                warn!(instrument = %config.display_name(), "Unable to open interface: {}", e);
                self.strategy = Some(strategy);
                shared.set_state(WorkerState::Idle, &self.publisher);
                return Err(e);
            }
        };
        *shared.interface.lock() = io.name();
        let timeout = io.timeout();
        let stop = io.stop_handle();

        let basename = config.basename();
        let period = strategy.rotation_period();
        let raw = config.log_raw.then(|| {
            RawLogger::new(config.log_dir(), &basename, period, strategy.raw_format())
        });
        let product = config.log_products.then(|| {
            ProductLogger::new(
                config.log_dir(),
                &basename,
                period,
                strategy.product_streams(),
            )
        });
        let framer = Framer::new(strategy.framing(), strategy.buffer_ceiling());
        let watchdog = Watchdog::new(self.data_timeout);
        let (commands, command_rx) = mpsc::unbounded_channel();

        shared.alive.store(true, Ordering::Release);
        let session = Session {
            name: config.display_name(),
            strategy,
            io,
            framer,
            raw,
            product,
            watchdog,
            shared: shared.clone(),
            publisher: self.publisher.clone(),
            commands: command_rx,
        };
        let task = tokio::task::spawn_blocking(move || session.run());
        info!(instrument = %config.display_name(), interface = %shared.interface.lock(), "Interface opened");
        self.session = Some(SessionHandle {
            task,
            stop,
            commands,
            timeout,
        });
        Ok(())
    }

    /// Stop the session, close the transport and both loggers.
    ///
    /// Waits for the session thread up to twice the transport timeout. A
    /// session that does not stop in time is abandoned; it still releases its
    /// resources once its current read returns.
    pub async fn close(&mut self) -> AppResult<()> {
        let Some(mut handle) = self.session.take() else {
            return Ok(());
        };
        self.shared.set_state(WorkerState::Closing, &self.publisher);
        self.shared.alive.store(false, Ordering::Release);
        handle.stop.stop();
        let wait = (handle.timeout * 2).max(MIN_JOIN_WAIT);
        let joined = tokio::time::timeout(wait, &mut handle.task).await;
        self.shared.log_active.store(false, Ordering::Release);
        let result = match joined {
            Ok(Ok(strategy)) => {
                self.strategy = Some(strategy);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(instrument = %self.uuid, "Acquisition session failed: {}", e);
                Ok(())
            }
            Err(_) => {
                warn!(instrument = %self.uuid, "Acquisition session did not join within {:?}", wait);
                Err(InlininoError::Shutdown(wait))
            }
        };
        if self.strategy.is_none() {
            if let Some(config) = &self.config {
                self.strategy = build_strategy(config).ok();
            }
        }
        self.shared.set_state(WorkerState::Idle, &self.publisher);
        result
    }

    async fn close_logged(&mut self) {
        if let Err(e) = self.close().await {
            warn!(instrument = %self.uuid, "{}", e);
        }
    }

    /// Start writing the enabled sinks.
    pub fn log_start(&self) {
        self.shared.log_active.store(true, Ordering::Release);
        self.publisher
            .publish(InstrumentEvent::StatusUpdate(self.shared.snapshot()));
    }

    /// Stop writing. Acquisition and parsing continue.
    pub fn log_stop(&self) {
        self.shared.log_active.store(false, Ordering::Release);
        self.publisher
            .publish(InstrumentEvent::StatusUpdate(self.shared.snapshot()));
    }

    /// Close, set up with `config`, and open again when `params` is given.
    pub async fn reconfigure(
        &mut self,
        config: InstrumentConfig,
        params: Option<InterfaceParams>,
    ) -> AppResult<()> {
        self.close_logged().await;
        self.setup(config).await?;
        if let Some(params) = params {
            self.open(params).await?;
        }
        Ok(())
    }

    /// Forward a UI command to the strategy.
    pub fn send_command(&mut self, command: ControlCommand) -> AppResult<()> {
        if let Some(handle) = &self.session {
            if !handle.task.is_finished() {
                return handle
                    .commands
                    .send(command)
                    .map_err(|_| InlininoError::Config("Acquisition session stopped".into()));
            }
        }
        match self.strategy.as_mut() {
            Some(strategy) => strategy.command(&command),
            None => Err(InlininoError::Config("Instrument is not set up".into())),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(handle) = &self.session {
            self.shared.alive.store(false, Ordering::Release);
            handle.stop.stop();
        }
    }
}
