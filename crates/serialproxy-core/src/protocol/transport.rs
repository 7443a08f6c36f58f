//! Transport abstraction
//!
//! The narrow capability the engine needs from a line: write a line or raw
//! bytes, read a line or a single byte with a timeout, and close.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::stream::{CommunicationChannel, SerialChannel, TcpChannel};
use super::{serial, ConnectionOptions, ProtocolError};

/// A blocking line to an instrument
///
/// Reads and writes may be called from different threads at the same time;
/// the engine only ever has one reader and one writer.
pub trait Transport: Send + Sync {
    /// Write one line, appending the newline marker
    fn write_line(&self, line: &str) -> Result<(), ProtocolError>;

    /// Block for the next complete line; `Ok(None)` when `timeout` elapses first
    fn read_line(&self, timeout: Duration) -> Result<Option<String>, ProtocolError>;

    /// Write bytes unchanged
    fn write_raw(&self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Block for the next byte; `Ok(None)` when `timeout` elapses first
    fn read_raw_byte(&self, timeout: Duration) -> Result<Option<u8>, ProtocolError>;

    /// Release the underlying resources; later calls fail
    fn close(&self) -> Result<(), ProtocolError>;
}

struct ReadHalf {
    channel: Option<Box<dyn CommunicationChannel>>,
    buffer: Vec<u8>,
    timeout: Option<Duration>,
}

impl ReadHalf {
    /// Pull the next complete line out of the buffer, if there is one
    fn take_line(&mut self, newline: &[u8]) -> Option<String> {
        loop {
            let pos = find(&self.buffer, newline)?;
            let raw: Vec<u8> = self.buffer.drain(..pos + newline.len()).collect();
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim_matches(|c| c == '\r' || c == '\n');
            // "\r\n" devices leave a bare "\n" behind when the marker is "\r"
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
    }

    /// Read whatever arrives before `deadline`
    fn fill(&mut self, deadline: Instant) -> Result<(), ProtocolError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or(ProtocolError::ConnectionClosed)?;
        if self.timeout != Some(remaining) {
            channel.set_read_timeout(remaining)?;
            self.timeout = Some(remaining);
        }

        let mut chunk = [0u8; 256];
        match channel.read(&mut chunk) {
            Ok(0) => Err(ProtocolError::TransportFailure(
                "end of stream".to_string(),
            )),
            Ok(n) => {
                trace!(bytes = n, data = ?&chunk[..n], "received");
                self.buffer.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Transport over any [`CommunicationChannel`]
pub struct StreamTransport {
    reader: Mutex<ReadHalf>,
    writer: Mutex<Option<Box<dyn CommunicationChannel>>>,
    newline: Vec<u8>,
    closed: AtomicBool,
}

impl StreamTransport {
    /// Wrap a channel; a second handle is cloned for writing
    pub fn new(
        channel: Box<dyn CommunicationChannel>,
        options: &ConnectionOptions,
    ) -> Result<Self, ProtocolError> {
        options.validate()?;
        let mut writer = channel.try_clone()?;
        writer.set_write_timeout(options.write_timeout())?;
        Ok(Self {
            reader: Mutex::new(ReadHalf {
                channel: Some(channel),
                buffer: Vec::new(),
                timeout: None,
            }),
            writer: Mutex::new(Some(writer)),
            newline: options.newline.as_bytes().to_vec(),
            closed: AtomicBool::new(false),
        })
    }

    /// Open a physical serial port
    pub fn open_serial(path: &str, options: &ConnectionOptions) -> Result<Self, ProtocolError> {
        let mut port = serial::open_port(path, options)?;
        serial::configure_port(port.as_mut(), options)?;
        serial::clear_buffers(port.as_mut())?;
        debug!(path, baud = options.baud_rate, "opened serial port");
        Self::new(Box::new(SerialChannel::new(port)), options)
    }

    /// Connect to a serial-over-TCP bridge at `addr` ("host:port")
    pub fn open_tcp(addr: &str, options: &ConnectionOptions) -> Result<Self, ProtocolError> {
        let channel = TcpChannel::connect(addr, options.write_timeout())
            .map_err(|e| ProtocolError::TransportFailure(format!("{}: {}", addr, e)))?;
        debug!(addr, "connected to serial bridge");
        Self::new(Box::new(channel), options)
    }

    fn ensure_open(&self) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ProtocolError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn reader(&self) -> MutexGuard<'_, ReadHalf> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_all(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let channel = writer.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        channel.write_all(bytes)?;
        channel.flush()?;
        trace!(bytes = bytes.len(), data = ?bytes, "sent");
        Ok(())
    }
}

impl Transport for StreamTransport {
    fn write_line(&self, line: &str) -> Result<(), ProtocolError> {
        let mut bytes = Vec::with_capacity(line.len() + self.newline.len());
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(&self.newline);
        self.write_all(&bytes)
    }

    fn read_line(&self, timeout: Duration) -> Result<Option<String>, ProtocolError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let mut half = self.reader();
        loop {
            if let Some(line) = half.take_line(&self.newline) {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            half.fill(deadline)?;
        }
    }

    fn write_raw(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.write_all(bytes)
    }

    fn read_raw_byte(&self, timeout: Duration) -> Result<Option<u8>, ProtocolError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let mut half = self.reader();
        loop {
            if !half.buffer.is_empty() {
                return Ok(Some(half.buffer.remove(0)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            half.fill(deadline)?;
        }
    }

    fn close(&self) -> Result<(), ProtocolError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Drop both handles to release the port
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let shutdown = match writer {
            Some(mut channel) => channel.shutdown(),
            None => Ok(()),
        };
        let mut half = self.reader();
        half.channel = None;
        half.buffer.clear();
        drop(half);
        debug!("transport released");
        shutdown.map_err(ProtocolError::from)
    }
}
