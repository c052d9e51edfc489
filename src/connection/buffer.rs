//! Output buffer for bytes a socket could not accept synchronously.

use bytes::{Buf, BytesMut};

use crate::error::{EngineError, Result};

/// FIFO byte queue with a hard size limit.
///
/// Bytes are appended at the tail and consumed from the head as the socket
/// accepts them, so the first byte queued is always the first byte written.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: BytesMut,
    limit: usize,
}

impl OutputBuffer {
    /// Create an empty buffer holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Append bytes at the tail.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if self.buf.len() + data.len() > self.limit {
            return Err(EngineError::BufferFull {
                buffered: self.buf.len() + data.len(),
                limit: self.limit,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Bytes waiting at the head.
    pub fn chunk(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `n` bytes from the head after the socket accepted them.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    /// Number of queued bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut out = OutputBuffer::new(64);
        out.push(b"abc").unwrap();
        out.push(b"def").unwrap();
        out.consume(2);
        assert_eq!(out.chunk(), b"cdef");
        out.consume(10);
        assert!(out.is_empty());
    }

    #[test]
    fn test_limit() {
        let mut out = OutputBuffer::new(4);
        out.push(b"abcd").unwrap();
        let err = out.push(b"e").unwrap_err();
        assert!(matches!(err, EngineError::BufferFull { limit: 4, .. }));
        assert_eq!(out.len(), 4);
    }
}
