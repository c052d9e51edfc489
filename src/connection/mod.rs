//! Non-blocking connection handling.
//!
//! A [`Connection`] owns one socket and knows nothing about the protocol
//! spoken over it. It tracks the connect state, writes without blocking and
//! keeps whatever the socket refused in an [`OutputBuffer`] until the owner
//! reports writable readiness.
//!
//! # Write Path
//!
//! ```text
//! send(bytes) ──> output empty? ──yes──> try_write ──> remainder queued
//!                      │
//!                      no
//!                      v
//!                 append to output (returns 0)
//!
//! writable ──> flush: drain output head-first until empty or WouldBlock
//! ```
//!
//! The socket itself sits behind the [`Socket`] trait so the same connection
//! logic runs over Tokio sockets ([`TcpSocket`]) and over the in-memory
//! [`MemorySocket`] used by tests.

mod buffer;
mod memory;
mod tcp;

pub use buffer::OutputBuffer;
pub use memory::{MemoryHandle, MemorySocket};
pub use tcp::TcpSocket;

use std::fmt;
use std::io;
use std::net::SocketAddr;

use serde::Serialize;

use crate::error::{EngineError, Result};

/// Opaque identifier for one connection, unique for the life of a Session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Connect state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectState {
    /// No socket
    Disconnected,
    /// Connect in flight
    Connecting,
    /// Socket attached and usable
    Connected,
}

/// Write side of a non-blocking socket.
pub trait Socket: Send {
    /// Write as much of `buf` as the socket accepts right now.
    ///
    /// Returns `ErrorKind::WouldBlock` when nothing can be written.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Remote address, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Release the socket.
    fn shutdown(&mut self) {}
}

/// One logical stream: the control channel or a single peer connection.
pub struct Connection {
    id: ConnectionId,
    state: ConnectState,
    socket: Option<Box<dyn Socket>>,
    output: OutputBuffer,
    write_watch_armed: bool,
    bytes_written: u64,
    target: Option<(String, u16)>,
}

impl Connection {
    /// Create a disconnected connection.
    pub fn new(id: ConnectionId, max_buffered: usize) -> Self {
        Self {
            id,
            state: ConnectState::Disconnected,
            socket: None,
            output: OutputBuffer::new(max_buffered),
            write_watch_armed: false,
            bytes_written: 0,
            target: None,
        }
    }

    /// Wrap a socket that was accepted rather than dialed.
    pub fn accepted(id: ConnectionId, socket: Box<dyn Socket>, max_buffered: usize) -> Self {
        let mut conn = Self::new(id, max_buffered);
        conn.socket = Some(socket);
        conn.state = ConnectState::Connected;
        conn
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current connect state
    pub fn state(&self) -> ConnectState {
        self.state
    }

    /// Whether a socket is attached
    pub fn is_connected(&self) -> bool {
        self.state == ConnectState::Connected
    }

    /// Host and port of the last connect attempt
    pub fn target(&self) -> Option<(&str, u16)> {
        self.target.as_ref().map(|(h, p)| (h.as_str(), *p))
    }

    /// Remote address of the attached socket
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.peer_addr())
    }

    /// Total bytes the socket has accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes waiting for writable readiness
    pub fn buffered(&self) -> usize {
        self.output.len()
    }

    /// Mark a connect as in flight. The caller performs the actual connect.
    pub fn begin_connect(&mut self, host: &str, port: u16) -> Result<()> {
        if self.state != ConnectState::Disconnected {
            return Err(EngineError::InvalidState(format!(
                "{} cannot connect while {:?}",
                self.id, self.state
            )));
        }
        self.state = ConnectState::Connecting;
        self.target = Some((host.to_string(), port));
        Ok(())
    }

    /// Attach the socket produced by a successful connect.
    pub fn connected(&mut self, socket: Box<dyn Socket>) -> Result<()> {
        if self.state != ConnectState::Connecting {
            return Err(EngineError::InvalidState(format!(
                "{} got a socket while {:?}",
                self.id, self.state
            )));
        }
        self.socket = Some(socket);
        self.state = ConnectState::Connected;
        Ok(())
    }

    /// Record a failed connect.
    pub fn connect_failed(&mut self) {
        self.state = ConnectState::Disconnected;
        self.socket = None;
    }

    /// Write without blocking.
    ///
    /// Returns the number of bytes the socket accepted directly. Anything not
    /// accepted is queued; if bytes are already queued the new data is
    /// appended behind them and nothing is written directly.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        let socket = match (self.state, self.socket.as_mut()) {
            (ConnectState::Connected, Some(socket)) => socket,
            _ => {
                return Err(EngineError::InvalidState(format!(
                    "{} is not connected",
                    self.id
                )))
            }
        };

        if !self.output.is_empty() {
            self.output.push(data)?;
            return Ok(0);
        }

        let written = match socket.try_write(data) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(EngineError::Write(e.to_string())),
        };
        self.bytes_written += written as u64;
        if written < data.len() {
            self.output.push(&data[written..])?;
        }
        Ok(written)
    }

    /// Drain queued bytes head-first. Returns how many were written.
    pub fn flush(&mut self) -> Result<usize> {
        self.write_watch_armed = false;
        let Some(socket) = self.socket.as_mut() else {
            return Ok(0);
        };

        let mut total = 0;
        while !self.output.is_empty() {
            match socket.try_write(self.output.chunk()) {
                Ok(0) => break,
                Ok(n) => {
                    self.output.consume(n);
                    self.bytes_written += n as u64;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EngineError::Write(e.to_string())),
            }
        }
        Ok(total)
    }

    /// Whether bytes are waiting for writable readiness
    pub fn wants_write(&self) -> bool {
        !self.output.is_empty()
    }

    /// Arm the writable watch once per backlog.
    ///
    /// Returns `true` if the owner must start watching for writability.
    pub fn arm_write_watch(&mut self) -> bool {
        if self.wants_write() && !self.write_watch_armed {
            self.write_watch_armed = true;
            return true;
        }
        false
    }

    /// Release the socket and forget queued output.
    pub fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.shutdown();
        }
        self.output.clear();
        self.write_watch_armed = false;
        self.state = ConnectState::Disconnected;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("buffered", &self.output.len())
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}
