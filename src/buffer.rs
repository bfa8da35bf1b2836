//! Fixed-capacity ring buffer with line extraction.
//!
//! Shared by the modem UART receive path and the per-channel mux buffers.
//! The buffer accumulates incoming bytes; consumers either pop raw byte
//! runs (payload streaming) or extract whole `\n`-terminated lines with
//! the terminators stripped (AT response parsing).

use log::warn;

/// Byte ring buffer of fixed capacity chosen at construction.
pub struct ByteBuffer {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl ByteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn used(&self) -> usize {
        self.len
    }

    pub fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a single byte.  Returns `false` when full (byte dropped).
    pub fn push(&mut self, byte: u8) -> bool {
        if self.len == self.buf.len() {
            return false;
        }
        let tail = (self.head + self.len) % self.buf.len();
        self.buf[tail] = byte;
        self.len += 1;
        true
    }

    /// Append a slice.  Returns the number of bytes accepted; a short
    /// count means the buffer overflowed and the remainder was dropped.
    pub fn push_slice(&mut self, data: &[u8]) -> usize {
        let mut accepted = 0;
        for &b in data {
            if !self.push(b) {
                warn!("buffer overflow, dropped {} bytes", data.len() - accepted);
                break;
            }
            accepted += 1;
        }
        accepted
    }

    /// Pop up to `out.len()` bytes into `out`, returning the count.
    pub fn pop_slice(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        for slot in out.iter_mut().take(n) {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % self.buf.len();
            self.len -= 1;
        }
        n
    }

    /// Peek the byte at `offset` from the read position without consuming.
    pub fn peek(&self, offset: usize) -> Option<u8> {
        if offset >= self.len {
            return None;
        }
        Some(self.buf[(self.head + offset) % self.buf.len()])
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Offset of the first `\n`, if any complete line is buffered.
    pub fn find_newline(&self) -> Option<usize> {
        (0..self.len).find(|&i| self.peek(i) == Some(b'\n'))
    }

    /// Whether at least one complete line is buffered.
    pub fn has_line(&self) -> bool {
        self.find_newline().is_some()
    }

    /// Extract the next complete line, stripping `\r` and `\n`.
    ///
    /// Bytes that are not valid UTF-8 are replaced, matching what modems
    /// emit when a frame is corrupted mid-line.
    pub fn read_line(&mut self) -> Option<String> {
        let nl = self.find_newline()?;
        let mut raw = vec![0u8; nl + 1];
        let popped = self.pop_slice(&mut raw);
        debug_assert_eq!(popped, nl + 1);
        while raw.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
            raw.pop();
        }
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}
