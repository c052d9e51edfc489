//! In-memory socket with scriptable write capacity.
//!
//! Used by tests to reproduce partial writes and `WouldBlock` without a
//! network. The [`MemoryHandle`] stays with the test and observes what the
//! engine wrote.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::Socket;

#[derive(Debug, Default)]
struct MemoryState {
    written: Vec<u8>,
    /// Bytes the socket accepts before reporting `WouldBlock`; `None` is unlimited.
    capacity: Option<usize>,
    fail: bool,
    shut_down: bool,
}

/// Socket half given to a `Connection`.
#[derive(Debug)]
pub struct MemorySocket {
    state: Arc<Mutex<MemoryState>>,
    peer: Option<SocketAddr>,
}

/// Test-side view of a [`MemorySocket`].
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySocket {
    /// Create a socket with unlimited capacity and its observing handle.
    pub fn pair() -> (Self, MemoryHandle) {
        let state = Arc::new(Mutex::new(MemoryState::default()));
        (
            Self {
                state: state.clone(),
                peer: None,
            },
            MemoryHandle { state },
        )
    }

    /// Create a socket that reports `peer` as its remote address.
    pub fn with_peer(peer: SocketAddr) -> (Self, MemoryHandle) {
        let (mut socket, handle) = Self::pair();
        socket.peer = Some(peer);
        (socket, handle)
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Socket for MemorySocket {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.fail {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        let n = match state.capacity {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(cap) => {
                let n = cap.min(buf.len());
                state.capacity = Some(cap - n);
                n
            }
            None => buf.len(),
        };
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn shutdown(&mut self) {
        lock(&self.state).shut_down = true;
    }
}

impl MemoryHandle {
    /// Everything written so far
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// Everything written so far, as lossy UTF-8
    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&lock(&self.state).written).into_owned()
    }

    /// Take and clear the written bytes
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.state).written)
    }

    /// Limit how many more bytes the socket accepts (`None` = unlimited)
    pub fn set_capacity(&self, capacity: Option<usize>) {
        lock(&self.state).capacity = capacity;
    }

    /// Make every later write fail
    pub fn fail_writes(&self) {
        lock(&self.state).fail = true;
    }

    /// Whether the owning connection released the socket
    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).shut_down
    }
}
