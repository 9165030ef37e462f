//! Signal bus.
//!
//! Workers publish [`InstrumentEvent`]s on a `tokio::sync::broadcast`
//! channel; UI widgets, aux/metadata displays and alarm handlers subscribe.
//! Publishing never blocks: a subscriber that falls behind loses the oldest
//! events (`Lagged`) and carries on. Plot subscribers additionally coalesce
//! redraws with a [`RefreshGate`].
//!
//! Loggers are not subscribers. They are called synchronously by the worker
//! so file writes stay ordered with parse results.
//!
//! # Example
//! ```no_run
//! use inlinino::bus::{InstrumentEvent, SignalBus};
//!
//! # async fn demo() {
//! let bus = SignalBus::new(256);
//! let mut rx = bus.subscribe();
//! bus.publisher("3f2a").publish(InstrumentEvent::Alarm(true));
//! while let Some(msg) = rx.recv().await {
//!     println!("{} -> {:?}", msg.instrument, msg.event);
//! }
//! # }
//! ```

use crate::worker::{CounterSnapshot, WorkerState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::warn;

/// Default plot redraw limit.
pub const MAX_REFRESH_RATE_HZ: f64 = 4.0;

/// Worker status carried by `status_update`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    /// Lifecycle state.
    pub state: WorkerState,
    /// Whether logging is on.
    pub log_active: bool,
    /// Transport name (`com:/dev/ttyUSB0`, `udp:0.0.0.0:10110`, ...).
    pub interface: String,
    /// Runtime counters.
    pub counters: CounterSnapshot,
}

/// Metadata of one frame type: (frame counter, values) or nothing.
pub type MetadataEntry = Option<(u64, Vec<String>)>;

/// Event published by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentEvent {
    /// Lifecycle or logging state changed.
    StatusUpdate(StatusSnapshot),
    /// A frame was accepted from the framer.
    PacketReceived {
        /// Frames received since open.
        received: u64,
    },
    /// A frame failed to parse or calibrate.
    PacketCorrupted {
        /// Frames corrupted since open.
        corrupted: u64,
    },
    /// A frame was written to at least one sink.
    PacketLogged {
        /// Frames logged since open.
        logged: u64,
    },
    /// Values for the timeseries plot.
    NewTimeseries {
        /// One value per active timeseries variable.
        values: Vec<f64>,
        /// Frame timestamp.
        timestamp: f64,
    },
    /// One spectrum per trace; `None` for traces not updated by this frame.
    NewSpectrum(Vec<Option<Vec<f64>>>),
    /// Formatted auxiliary values.
    NewAux(Vec<String>),
    /// Metadata per frame type.
    NewMetadata(Vec<MetadataEntry>),
    /// Data-timeout or fatal transport alarm.
    Alarm(bool),
    /// Instrument specific alarm with a title and details.
    AlarmCustom {
        /// Short description.
        text: String,
        /// Details.
        info: String,
    },
}

impl InstrumentEvent {
    /// Channel name of the event.
    pub fn channel(&self) -> &'static str {
        match self {
            InstrumentEvent::StatusUpdate(_) => "status_update",
            InstrumentEvent::PacketReceived { .. } => "packet_received",
            InstrumentEvent::PacketCorrupted { .. } => "packet_corrupted",
            InstrumentEvent::PacketLogged { .. } => "packet_logged",
            InstrumentEvent::NewTimeseries { .. } => "new_ts_data",
            InstrumentEvent::NewSpectrum(_) => "new_spectrum_data",
            InstrumentEvent::NewAux(_) => "new_aux_data",
            InstrumentEvent::NewMetadata(_) => "new_meta_data",
            InstrumentEvent::Alarm(_) => "alarm",
            InstrumentEvent::AlarmCustom { .. } => "alarm_custom",
        }
    }

    /// Whether subscribers may coalesce this event under a refresh gate.
    pub fn is_plot_event(&self) -> bool {
        matches!(
            self,
            InstrumentEvent::NewTimeseries { .. } | InstrumentEvent::NewSpectrum(_)
        )
    }
}

/// Event tagged with its source instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Instrument UUID.
    pub instrument: Arc<str>,
    /// Event payload.
    pub event: InstrumentEvent,
}

/// Process-wide broadcast channel.
#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl SignalBus {
    /// Create a bus keeping at most `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New subscription receiving events published from now on.
    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Publishing handle for one instrument.
    pub fn publisher(&self, instrument: impl Into<Arc<str>>) -> Publisher {
        Publisher {
            tx: self.tx.clone(),
            instrument: instrument.into(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Publishing side bound to an instrument.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: broadcast::Sender<BusMessage>,
    instrument: Arc<str>,
}

impl Publisher {
    /// Publish without blocking. Events are dropped when nobody listens.
    pub fn publish(&self, event: InstrumentEvent) {
        let _ = self.tx.send(BusMessage {
            instrument: self.instrument.clone(),
            event,
        });
    }

    /// Instrument this publisher speaks for.
    pub fn instrument(&self) -> &str {
        &self.instrument
    }
}

/// Subscription that skips over lagged events.
#[derive(Debug)]
pub struct BusReceiver {
    rx: broadcast::Receiver<BusMessage>,
}

impl BusReceiver {
    /// Next event; `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Signal bus subscriber lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Signal bus subscriber lagged by {} events", n);
                }
                Err(_) => return None,
            }
        }
    }

    /// Every event queued right now.
    pub fn drain(&mut self) -> Vec<BusMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Time gate limiting how often a subscriber redraws.
#[derive(Debug, Clone)]
pub struct RefreshGate {
    period: Duration,
    last: Option<Instant>,
}

impl RefreshGate {
    /// Allow at most `max_rate_hz` redraws per second.
    pub fn new(max_rate_hz: f64) -> Self {
        let rate = if max_rate_hz > 0.0 {
            max_rate_hz
        } else {
            MAX_REFRESH_RATE_HZ
        };
        Self {
            period: Duration::from_secs_f64(1.0 / rate),
            last: None,
        }
    }

    /// Whether a redraw may happen at `now`; records it if so.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.period => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

impl Default for RefreshGate {
    fn default() -> Self {
        Self::new(MAX_REFRESH_RATE_HZ)
    }
}
