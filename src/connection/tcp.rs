//! Tokio TCP socket for the connection layer.
//!
//! The write half is shared with the runtime driver so it can await
//! writable readiness while the [`Connection`](super::Connection) keeps
//! writing through `try_write`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;

use super::Socket;

/// Write half of a split Tokio `TcpStream`.
#[derive(Debug, Clone)]
pub struct TcpSocket {
    writer: Arc<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl TcpSocket {
    /// Wrap a write half.
    pub fn new(writer: Arc<OwnedWriteHalf>, peer: SocketAddr) -> Self {
        Self { writer, peer }
    }

    /// Shared write half, for readiness watches.
    pub fn writer(&self) -> Arc<OwnedWriteHalf> {
        self.writer.clone()
    }
}

impl Socket for TcpSocket {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.try_write(buf)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}
