//! Data-timeout watchdog.
//!
//! The worker feeds the watchdog with the timestamp of every read: `observe`
//! when bytes arrived, `tick` when the read came back empty. The watchdog
//! answers with the alarm transition to publish, if any, so each silence
//! produces exactly one `alarm(true)` and the next byte exactly one
//! `alarm(false)`.

use std::time::Duration;

/// Default silence tolerated before raising the alarm.
pub const DATA_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-worker data-timeout detector.
///
/// The silence clock only runs once a first byte has been observed, so an
/// instrument that never sent anything since open raises no alarm.
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: f64,
    last_data: Option<f64>,
    active: bool,
}

impl Watchdog {
    /// Create a watchdog waiting for its first byte.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: timeout.as_secs_f64(),
            last_data: None,
            active: false,
        }
    }

    /// Forget the last byte and clear the alarm (open / reconfigure).
    pub fn reset(&mut self) {
        self.last_data = None;
        self.active = false;
    }

    /// Whether the alarm is currently raised.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Timestamp of the last byte received, if any.
    pub fn last_data(&self) -> Option<f64> {
        self.last_data
    }

    /// Configured timeout in seconds.
    pub fn timeout_secs(&self) -> f64 {
        self.timeout
    }

    /// Bytes arrived at `t`. Returns `Some(false)` when this clears the alarm.
    pub fn observe(&mut self, t: f64) -> Option<bool> {
        self.last_data = Some(t);
        if self.active {
            self.active = false;
            return Some(false);
        }
        None
    }

    /// Nothing arrived at `t`. Returns `Some(true)` when the alarm is raised.
    pub fn tick(&mut self, t: f64) -> Option<bool> {
        let last = self.last_data?;
        if !self.active && t - last >= self.timeout {
            self.active = true;
            return Some(true);
        }
        None
    }
}
