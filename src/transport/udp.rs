//! UDP socket transport.
//!
//! Binds a local address and returns one datagram per read. Writes go back
//! to the peer the last datagram came from.

use super::{StopHandle, Transport};
use crate::error::{AppResult, InlininoError};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MAX_DATAGRAM: usize = 64 * 1024;

/// UDP bind parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpParams {
    /// Local IP to bind (`0.0.0.0` for every interface).
    pub ip: String,
    /// Local port.
    pub port: u16,
    /// Read timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

fn default_timeout() -> f64 {
    1.0
}

impl UdpParams {
    /// Bind `ip:port` with the default 1 s timeout.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            timeout: default_timeout(),
        }
    }
}

/// UDP transport.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    local: SocketAddr,
    peer: Option<SocketAddr>,
    timeout: Duration,
    stopped: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Bind the socket described by `params`.
    pub fn open(params: &UdpParams) -> AppResult<Self> {
        let socket = UdpSocket::bind((params.ip.as_str(), params.port)).map_err(|e| {
            InlininoError::Transport(format!(
                "Unable to bind socket {}:{}. {}",
                params.ip, params.port, e
            ))
        })?;
        let timeout = Duration::from_secs_f64(params.timeout.max(0.001));
        socket.set_read_timeout(Some(timeout))?;
        let local = socket.local_addr()?;
        debug!(%local, "UDP socket bound");
        Ok(Self {
            socket: Some(socket),
            local,
            peer: None,
            timeout,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Transport for UdpTransport {
    fn name(&self) -> String {
        format!("socket:{}", self.local.port())
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn read(&mut self) -> AppResult<Vec<u8>> {
        let socket = self.socket.as_ref().ok_or(InlininoError::NotOpen)?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if self.stopped.load(Ordering::Acquire) {
                    return Ok(Vec::new());
                }
                self.peer = Some(from);
                buf.truncate(n);
                Ok(buf)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> AppResult<()> {
        let socket = self.socket.as_ref().ok_or(InlininoError::NotOpen)?;
        let peer = self
            .peer
            .ok_or_else(|| InlininoError::Transport("No peer to write to yet".into()))?;
        socket.send_to(data, peer)?;
        Ok(())
    }

    fn stop_handle(&self) -> StopHandle {
        let stopped = self.stopped.clone();
        let mut wake = self.local;
        if wake.ip().is_unspecified() {
            wake.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        StopHandle::new(move || {
            stopped.store(true, Ordering::Release);
            // An empty datagram wakes the blocked recv
            if let Ok(s) = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)) {
                let _ = s.send_to(&[], wake);
            }
        })
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!(local = %self.local, "UDP socket closed");
        }
    }
}
