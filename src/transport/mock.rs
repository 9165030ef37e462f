//! Scripted transport for tests and offline simulation.
//!
//! A [`MockTransport`] replays a queue of reads, records every write, and can
//! answer writes through a responder closure (request/response dialects).
//! Open handles are tracked by a shared counter so tests can verify that a
//! reconfigure never leaks a transport.

use super::{InterfaceParams, StopHandle, Transport, TransportFactory};
use crate::error::{AppResult, InlininoError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    /// Return these bytes.
    Bytes(Vec<u8>),
    /// Return nothing, after waiting the idle delay.
    Empty,
    /// Fail with an I/O error.
    Fail(std::io::ErrorKind),
}

/// Answers a write with bytes queued for the next reads.
pub type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Scripted transport.
pub struct MockTransport {
    name: String,
    reads: VecDeque<MockRead>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    responder: Option<Responder>,
    idle: Duration,
    timeout: Duration,
    open: bool,
    stopped: Arc<AtomicBool>,
    open_handles: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("name", &self.name)
            .field("pending_reads", &self.reads.len())
            .field("open", &self.open)
            .finish()
    }
}

impl MockTransport {
    /// Open mock with an empty script.
    pub fn new() -> Self {
        let open_handles = Arc::new(AtomicUsize::new(1));
        Self {
            name: "mock".to_string(),
            reads: VecDeque::new(),
            writes: Arc::new(Mutex::new(Vec::new())),
            responder: None,
            idle: Duration::from_millis(5),
            timeout: Duration::from_millis(50),
            open: true,
            stopped: Arc::new(AtomicBool::new(false)),
            open_handles,
        }
    }

    /// Queue reads returning each chunk in turn.
    pub fn with_chunks<I, B>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        self.reads
            .extend(chunks.into_iter().map(|c| MockRead::Bytes(c.into())));
        self
    }

    /// Queue arbitrary scripted reads.
    pub fn with_reads(mut self, reads: impl IntoIterator<Item = MockRead>) -> Self {
        self.reads.extend(reads);
        self
    }

    /// Answer writes with the responder output.
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Delay of an empty read once the script is exhausted.
    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Reported read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Share an open-handle counter (incremented now, decremented on close).
    pub fn with_handle_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
        self.open_handles = counter;
        self
    }

    /// Handle on the recorded writes.
    pub fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.writes.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn read(&mut self) -> AppResult<Vec<u8>> {
        if !self.open {
            return Err(InlininoError::NotOpen);
        }
        if self.stopped.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }
        match self.reads.pop_front() {
            Some(MockRead::Bytes(bytes)) => Ok(bytes),
            Some(MockRead::Fail(kind)) => Err(std::io::Error::new(kind, "mock failure").into()),
            Some(MockRead::Empty) | None => {
                std::thread::sleep(self.idle);
                Ok(Vec::new())
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> AppResult<()> {
        if !self.open {
            return Err(InlininoError::NotOpen);
        }
        self.writes.lock().push(data.to_vec());
        if let Some(responder) = &self.responder {
            if let Some(answer) = responder(data) {
                self.reads.push_back(MockRead::Bytes(answer));
            }
        }
        Ok(())
    }

    fn stop_handle(&self) -> StopHandle {
        let stopped = self.stopped.clone();
        StopHandle::new(move || stopped.store(true, Ordering::Release))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory handing out mock transports built from a template.
pub struct MockTransportFactory {
    build: Box<dyn Fn() -> MockTransport + Send + Sync>,
    open_handles: Arc<AtomicUsize>,
    opened: AtomicUsize,
    last_params: Mutex<Option<InterfaceParams>>,
}

impl MockTransportFactory {
    /// Each `open` calls `build` for a fresh transport.
    pub fn new(build: impl Fn() -> MockTransport + Send + Sync + 'static) -> Self {
        Self {
            build: Box::new(build),
            open_handles: Arc::new(AtomicUsize::new(0)),
            opened: AtomicUsize::new(0),
            last_params: Mutex::new(None),
        }
    }

    /// Transports currently open.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Total number of `open` calls.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Parameters of the last `open`.
    pub fn last_params(&self) -> Option<InterfaceParams> {
        self.last_params.lock().clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn open(&self, params: &InterfaceParams) -> AppResult<Box<dyn Transport>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock() = Some(params.clone());
        let transport = (self.build)().with_handle_counter(self.open_handles.clone());
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SerialParams;

    #[test]
    fn replays_script_then_idles() {
        let mut mock = MockTransport::new()
            .with_chunks([b"ab".to_vec(), b"c".to_vec()])
            .with_idle(Duration::from_millis(1));
        assert_eq!(mock.read().unwrap(), b"ab");
        assert_eq!(mock.read().unwrap(), b"c");
        assert!(mock.read().unwrap().is_empty());
    }

    #[test]
    fn responder_queues_answers() {
        let responder: Responder = Arc::new(|cmd: &[u8]| {
            (cmd == b"RC0").then(|| b"12".to_vec())
        });
        let mut mock = MockTransport::new().with_responder(responder);
        mock.write(b"RC0").unwrap();
        mock.write(b"SK0").unwrap();
        assert_eq!(mock.read().unwrap(), b"12");
        assert_eq!(mock.writes().lock().len(), 2);
    }

    #[test]
    fn factory_counts_open_handles() {
        let factory = MockTransportFactory::new(MockTransport::new);
        let params = InterfaceParams::Serial(SerialParams::new("A"));
        let mut a = factory.open(&params).unwrap();
        let b = factory.open(&params).unwrap();
        assert_eq!(factory.open_handles(), 2);
        a.close();
        a.close();
        assert_eq!(factory.open_handles(), 1);
        drop(b);
        assert_eq!(factory.open_handles(), 0);
        assert_eq!(factory.opened(), 2);
    }

    #[test]
    fn stop_short_circuits_reads() {
        let mut mock = MockTransport::new().with_chunks([b"x".to_vec()]);
        mock.stop_handle().stop();
        assert!(mock.read().unwrap().is_empty());
    }
}
