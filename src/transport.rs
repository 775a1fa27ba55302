//! Byte transports a channel link can run over.
//!
//! A [`Connector`] opens a [`Transport`] for a port name and baud rate. The real
//! implementation wraps `serialport`; [`MemoryConnector`] is an in-process
//! stand-in for driving links without hardware.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::errors::{LinkError, Result};
use crate::lock_unpoisoned as lock;

/// Trait for Read + Write + Send, allowing different transport backends.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Opens transports. Called for the initial connect and for every reconnect attempt.
pub trait Connector: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn Transport>>;
}

/// Opens OS serial ports (8N1, no flow control).
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub read_timeout: Duration,
}

impl SerialConnector {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl Connector for SerialConnector {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn Transport>> {
        let handle = serialport::new(port, baud)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| LinkError::Connection {
                port: port.to_string(),
                reason: e.to_string(),
            })?;
        debug!("opened serial port {} at {} baud", port, baud);
        Ok(Box::new(handle))
    }
}

/// Paths of the serial ports the OS reports.
pub fn available_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Debug, Default)]
struct PortState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    broken: bool,
}

#[derive(Debug, Default)]
struct ConnectorState {
    open_attempts: u32,
    fail_next: u32,
    unavailable: bool,
    failure_delay: Duration,
    current: Option<Arc<Mutex<PortState>>>,
}

/// Scriptable connector backed by memory buffers.
///
/// Bytes fed with [`MemoryConnector::feed`] are read by the link; bytes the link
/// writes are collected and returned by [`MemoryConnector::written`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    read_delay: Duration,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            read_delay: Duration::from_millis(2),
        }
    }

    /// Make the next `n` open attempts fail.
    pub fn fail_next_opens(&self, n: u32) {
        lock(&self.state).fail_next = n;
    }

    /// Make every open attempt fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Hold every failing open for `delay` before it returns, like a driver
    /// stuck on a vanished device.
    pub fn set_failure_delay(&self, delay: Duration) {
        lock(&self.state).failure_delay = delay;
    }

    pub fn open_attempts(&self) -> u32 {
        lock(&self.state).open_attempts
    }

    /// Queue bytes for the currently open transport to read.
    pub fn feed(&self, bytes: &[u8]) {
        if let Some(port) = lock(&self.state).current.clone() {
            lock(&port).inbound.extend(bytes.iter().copied());
        }
    }

    /// Bytes written to the currently open transport so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state)
            .current
            .clone()
            .map(|port| lock(&port).written.clone())
            .unwrap_or_default()
    }

    /// Make the open transport fail every read and write from now on.
    pub fn break_link(&self) {
        if let Some(port) = lock(&self.state).current.clone() {
            lock(&port).broken = true;
        }
    }
}

impl Connector for MemoryConnector {
    fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn Transport>> {
        let mut state = lock(&self.state);
        state.open_attempts += 1;
        if state.unavailable || state.fail_next > 0 {
            state.fail_next = state.fail_next.saturating_sub(1);
            let delay = state.failure_delay;
            drop(state);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            return Err(LinkError::Connection {
                port: port.to_string(),
                reason: "memory port unavailable".into(),
            });
        }
        let shared = Arc::new(Mutex::new(PortState::default()));
        state.current = Some(shared.clone());
        Ok(Box::new(MemoryTransport {
            shared,
            read_delay: self.read_delay,
        }))
    }
}

struct MemoryTransport {
    shared: Arc<Mutex<PortState>>,
    read_delay: Duration,
}

impl Read for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut port = lock(&self.shared);
            if port.broken {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "memory port broken"));
            }
            if !port.inbound.is_empty() {
                let n = buf.len().min(port.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(port.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        // Behave like a serial port with a short read timeout.
        thread::sleep(self.read_delay);
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Write for MemoryTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut port = lock(&self.shared);
        if port.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "memory port broken"));
        }
        port.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
