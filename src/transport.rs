//! Transport abstraction over any byte-oriented channel.
//!
//! Concrete implementations:
//! - modem UART (raw AT stream, later carrying mux frames)
//! - SSH channel payload stream (provided by the integrator's SSH library)
//!
//! Both protocol engines are generic over `Transport`, so swapping the
//! underlying port requires zero changes to the protocol logic.  All calls
//! are non-blocking: `WouldBlock` means "try again after the next readable
//! or drained notification", never a failure.

use core::fmt;

/// Transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No progress possible right now; retry after the next I/O event.
    WouldBlock,
    /// The peer closed the channel.
    Closed,
    /// The device below the channel failed.
    Device,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "would block"),
            Self::Closed => write!(f, "closed"),
            Self::Device => write!(f, "device failure"),
        }
    }
}

/// Byte-oriented transport channel.
pub trait Transport {
    /// Read up to `buf.len()` bytes into `buf`.
    /// Returns the number of bytes actually read (never 0 on success).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write `data` to the transport.
    /// Returns the number of bytes actually accepted, which may be short.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Flush any buffered output.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Check if data is available for reading.
    fn available(&self) -> bool;
}

/// A null transport that discards all writes and never reads.
/// Useful as a default when nothing is connected yet.
pub struct NullTransport;

impl Transport for NullTransport {
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Err(TransportError::WouldBlock)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn available(&self) -> bool {
        false
    }
}

/// In-memory transport double: canned reads, captured writes, optional
/// per-call write ceiling to exercise partial-send paths.
pub struct ScriptedTransport {
    incoming: std::collections::VecDeque<u8>,
    pub outgoing: Vec<u8>,
    /// Max bytes a single `write` accepts; `None` means unlimited.
    pub write_limit: Option<usize>,
    /// When true, `write` returns `WouldBlock` instead of accepting bytes.
    pub write_blocked: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            incoming: std::collections::VecDeque::new(),
            outgoing: Vec::new(),
            write_limit: None,
            write_blocked: false,
        }
    }

    /// Queue bytes the engine will see on subsequent reads.
    pub fn feed(&mut self, data: &[u8]) {
        self.incoming.extend(data.iter().copied());
    }

    /// Take everything the engine has written so far.
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.outgoing)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.incoming.is_empty() {
            return Err(TransportError::WouldBlock);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.incoming.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.write_blocked {
            return Err(TransportError::WouldBlock);
        }
        let n = match self.write_limit {
            Some(limit) => data.len().min(limit),
            None => data.len(),
        };
        if n == 0 {
            return Err(TransportError::WouldBlock);
        }
        self.outgoing.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn available(&self) -> bool {
        !self.incoming.is_empty()
    }
}
