//! Acquisition loop of one open instrument.
//!
//! Runs on a blocking thread until the worker clears `alive`, the transport
//! closes, or a read fails. Everything a frame goes through happens here, in
//! order: `packet_received`, raw write, parse, calibrate, plot events,
//! product write, `packet_logged`.

use super::{Shared, WorkerState};
use crate::bus::{InstrumentEvent, Publisher};
use crate::error::{AppResult, InlininoError};
use crate::framer::{Chunk, Frame, Framer};
use crate::instruments::{AcquisitionMode, ControlCommand, InstrumentStrategy, LoopTick};
use crate::logger::{ProductLogger, RawLogger};
use crate::record::now;
use crate::transport::Transport;
use crate::watchdog::Watchdog;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

// Sleep slice of polled instruments, so a close is noticed quickly
const POLL_SLICE: Duration = Duration::from_millis(50);

pub(crate) struct Session {
    pub(crate) name: String,
    pub(crate) strategy: Box<dyn InstrumentStrategy>,
    pub(crate) io: Box<dyn Transport>,
    pub(crate) framer: Framer,
    pub(crate) raw: Option<RawLogger>,
    pub(crate) product: Option<ProductLogger>,
    pub(crate) watchdog: Watchdog,
    pub(crate) shared: Arc<Shared>,
    pub(crate) publisher: Publisher,
    pub(crate) commands: mpsc::UnboundedReceiver<ControlCommand>,
}

impl Session {
    fn alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    fn publish(&self, event: InstrumentEvent) {
        self.publisher.publish(event);
    }

    /// Run until stopped and hand the strategy back.
    pub(crate) fn run(mut self) -> Box<dyn InstrumentStrategy> {
        let t0 = now();
        self.watchdog.reset();
        if let Err(e) = self.io.init() {
            warn!(instrument = %self.name, "Unable to flush interface: {}", e);
        }
        let started = self.strategy.init_sequence(self.io.as_mut(), t0);
        match started {
            Err(e) if e.is_fatal_to_session() => self.fail(&e),
            Err(e) => warn!(instrument = %self.name, "Initialization sequence failed: {}", e),
            Ok(()) => {}
        }

        if self.alive() {
            self.shared.set_state(WorkerState::Running, &self.publisher);
            self.acquire();
        }

        if let Err(e) = self.strategy.shutdown(self.io.as_mut()) {
            warn!(instrument = %self.name, "Shutdown sequence failed: {}", e);
        }
        self.io.close();
        if let Some(raw) = self.raw.as_mut() {
            raw.close();
        }
        if let Some(product) = self.product.as_mut() {
            product.close();
        }
        self.shared.alive.store(false, Ordering::Release);
        self.shared.set_state(WorkerState::Idle, &self.publisher);
        info!(instrument = %self.name, "Acquisition stopped");
        self.strategy
    }

    fn acquire(&mut self) {
        let mode = self.strategy.acquisition();
        let mut awaiting = false;
        while self.alive() && self.io.is_open() {
            self.apply_commands();
            let step = match mode {
                AcquisitionMode::Streaming => self.step_streaming(),
                AcquisitionMode::RequestResponse => self.step_request(&mut awaiting),
                AcquisitionMode::Polled { refresh_rate } => self.step_polled(refresh_rate),
            };
            match step {
                Err(e) if e.is_fatal_to_session() => {
                    self.fail(&e);
                    break;
                }
                Err(e) => warn!(instrument = %self.name, "{}", e),
                Ok(()) => {}
            }
        }
    }

    fn fail(&mut self, e: &InlininoError) {
        error!(instrument = %self.name, "Interface failed: {}", e);
        self.publish(InstrumentEvent::Alarm(true));
        self.shared.alive.store(false, Ordering::Release);
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if let Err(e) = self.strategy.command(&command) {
                warn!(instrument = %self.name, "{}", e);
            }
        }
    }

    // =========================================================================
    // Loop steps
    // =========================================================================

    fn step_streaming(&mut self) -> AppResult<()> {
        let bytes = self.io.read()?;
        let t = now();
        let mut frames = 0;
        if bytes.is_empty() {
            self.on_silence(t);
        } else {
            self.framer.extend(&bytes);
            for chunk in self.framer.extract() {
                match chunk {
                    Chunk::Frame(frame) => {
                        self.handle_frame(&frame, t);
                        frames += 1;
                    }
                    Chunk::Unknown(unknown) => self.handle_unknown(&unknown, t),
                }
            }
            self.on_data(t);
            if self.framer.enforce_ceiling() {
                warn!(instrument = %self.name, "Buffer exceeded maximum length. Buffer emptied to resynchronize");
            }
        }
        let tick = LoopTick {
            t,
            frames,
            idle: bytes.is_empty(),
        };
        self.strategy.control_step(self.io.as_mut(), tick)
    }

    fn step_request(&mut self, awaiting: &mut bool) -> AppResult<()> {
        if !*awaiting {
            self.strategy.request(self.io.as_mut())?;
            *awaiting = true;
        }
        let bytes = self.io.read()?;
        let t = now();
        if !bytes.is_empty() {
            self.framer.extend(&bytes);
            self.on_data(t);
            if self.framer.enforce_ceiling() {
                warn!(instrument = %self.name, "Buffer exceeded maximum length. Buffer emptied to resynchronize");
            }
            return Ok(());
        }
        // A silent line ends the response
        match self.framer.take_all() {
            Some(frame) => self.handle_frame(&frame, t),
            None => self.on_silence(t),
        }
        *awaiting = false;
        Ok(())
    }

    fn step_polled(&mut self, refresh_rate: f64) -> AppResult<()> {
        let period = if refresh_rate > 0.0 { 1.0 / refresh_rate } else { 1.0 };
        let t = now();
        match self.strategy.poll(self.io.as_mut(), t)? {
            Some(frame) => {
                self.handle_frame(&frame, t);
                self.on_data(t);
            }
            None => self.on_silence(t),
        }
        let next = t + period;
        while self.alive() {
            let left = next - now();
            if left <= 0.0 {
                break;
            }
            std::thread::sleep(POLL_SLICE.min(Duration::from_secs_f64(left)));
        }
        Ok(())
    }

    // =========================================================================
    // Frames
    // =========================================================================

    fn handle_frame(&mut self, frame: &Frame, t: f64) {
        let received = {
            let mut counters = self.shared.counters.lock();
            counters.received += 1;
            counters.received
        };
        self.publish(InstrumentEvent::PacketReceived { received });

        let log_active = self.shared.log_active.load(Ordering::Acquire);
        let mut written = false;
        if log_active {
            if let Some(raw) = self.raw.as_mut() {
                match raw.write(&frame.wire(), t) {
                    Ok(w) => written |= w,
                    Err(e) => self.logger_failed(&e),
                }
            }
        }

        let record = self
            .strategy
            .parse(frame)
            .and_then(|record| self.strategy.calibrate(record));
        match record {
            Err(e) => {
                let corrupted = {
                    let mut counters = self.shared.counters.lock();
                    counters.corrupted += 1;
                    counters.last_corrupted = Some(t);
                    counters.corrupted
                };
                self.publish(InstrumentEvent::PacketCorrupted { corrupted });
                warn!(instrument = %self.name, kind = %e.kind, "Unable to parse frame: {}", e.message);
            }
            Ok(record) => {
                let mut events = Vec::new();
                self.strategy.events(&record, t, &mut events);
                for event in events {
                    self.publish(event);
                }
                // Logging may have been stopped by an open failure above
                if self.shared.log_active.load(Ordering::Acquire) {
                    let stamp = self.raw.as_ref().and_then(RawLogger::open_timestamp);
                    if let Some(product) = self.product.as_mut() {
                        match product.write(&record, t, stamp) {
                            Ok(w) => written |= w,
                            Err(e) => self.logger_failed(&e),
                        }
                    }
                }
            }
        }

        if written {
            let logged = {
                let mut counters = self.shared.counters.lock();
                counters.logged += 1;
                // Logging may start between a receive and its write
                if counters.received < counters.logged {
                    counters.received = counters.logged;
                }
                counters.logged
            };
            self.publish(InstrumentEvent::PacketLogged { logged });
        }
    }

    fn handle_unknown(&mut self, bytes: &[u8], t: f64) {
        debug!(instrument = %self.name, "{} bytes outside of any frame", bytes.len());
        if !self.strategy.log_unknown_bytes() || !self.shared.log_active.load(Ordering::Acquire) {
            return;
        }
        if let Some(raw) = self.raw.as_mut() {
            if let Err(e) = raw.write(bytes, t) {
                self.logger_failed(&e);
            }
        }
    }

    fn logger_failed(&mut self, e: &InlininoError) {
        error!(instrument = %self.name, "{}", e);
        self.shared.log_active.store(false, Ordering::Release);
        if let Some(raw) = self.raw.as_mut() {
            raw.close();
        }
        if let Some(product) = self.product.as_mut() {
            product.close();
        }
        self.publish(InstrumentEvent::AlarmCustom {
            text: "Unable to open log file. Logging stopped.".into(),
            info: e.to_string(),
        });
        let state = *self.shared.state.lock();
        self.shared.set_state(state, &self.publisher);
    }

    // =========================================================================
    // Watchdog
    // =========================================================================

    fn on_data(&mut self, t: f64) {
        self.shared.counters.lock().last_data = Some(t);
        if let Some(false) = self.watchdog.observe(t) {
            self.shared.counters.lock().watchdog_active = false;
            self.publish(InstrumentEvent::Alarm(false));
            self.shared.set_state(WorkerState::Running, &self.publisher);
        }
    }

    fn on_silence(&mut self, t: f64) {
        if let Some(true) = self.watchdog.tick(t) {
            warn!(
                instrument = %self.name,
                "No data received during the past {:.2} seconds",
                t - self.watchdog.last_data().unwrap_or(t)
            );
            self.shared.counters.lock().watchdog_active = true;
            self.publish(InstrumentEvent::Alarm(true));
            self.shared.set_state(WorkerState::Degraded, &self.publisher);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SignalBus;
    use crate::instruments::{build_strategy, tests::generic_record, InstrumentConfig};
    use crate::transport::mock::MockTransport;
    use std::time::Duration as StdDuration;
    use tracing_test::traced_test;

    fn session(io: MockTransport, bus: &SignalBus, timeout: StdDuration) -> Session {
        let config = InstrumentConfig::from_record(&generic_record()).unwrap();
        let strategy = build_strategy(&config).unwrap();
        let shared = Arc::new(Shared::default());
        shared.alive.store(true, Ordering::Release);
        let (_tx, commands) = mpsc::unbounded_channel();
        Session {
            name: "GEN 001".into(),
            framer: Framer::new(strategy.framing(), 8),
            strategy,
            io: Box::new(io),
            raw: None,
            product: None,
            watchdog: Watchdog::new(timeout),
            shared,
            publisher: bus.publisher("a"),
            commands,
        }
    }

    #[test]
    #[traced_test]
    fn overflow_empties_buffer() {
        let bus = SignalBus::new(16);
        let io = MockTransport::new().with_chunks([b"0123456789".to_vec()]);
        let mut s = session(io, &bus, StdDuration::from_secs(60));
        s.step_streaming().unwrap();
        assert!(s.framer.is_empty());
        assert!(logs_contain("Buffer exceeded maximum length"));
    }

    #[test]
    fn silence_raises_one_alarm() {
        let bus = SignalBus::new(16);
        let mut rx = bus.subscribe();
        let io = MockTransport::new().with_chunks([b"1,2\n".to_vec()]);
        let mut s = session(io, &bus, StdDuration::from_millis(1));
        s.step_streaming().unwrap();
        std::thread::sleep(StdDuration::from_millis(5));
        s.step_streaming().unwrap();
        s.step_streaming().unwrap();
        let alarms: Vec<_> = rx
            .drain()
            .into_iter()
            .filter(|m| matches!(m.event, InstrumentEvent::Alarm(_)))
            .collect();
        assert_eq!(alarms.len(), 1);
        assert_eq!(*s.shared.state.lock(), WorkerState::Degraded);
        assert!(s.shared.counters.lock().watchdog_active);
    }

    #[test]
    fn corrupted_frame_is_counted() {
        let bus = SignalBus::new(16);
        let io = MockTransport::new().with_chunks([b"1,x\n".to_vec()]);
        let mut s = session(io, &bus, StdDuration::from_secs(60));
        s.framer = Framer::new(s.strategy.framing(), 1024);
        s.step_streaming().unwrap();
        let counters = s.shared.counters.lock().clone();
        assert_eq!((counters.received, counters.corrupted), (1, 1));
        assert!(counters.last_corrupted.is_some());
    }
}
