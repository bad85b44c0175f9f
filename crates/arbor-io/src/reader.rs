//! Chunk-buffered reader over a byte source.

use crate::source::ByteSource;
use arbor_common::{ArborError, Key, ReaderConfig, Result};
use bytes::Bytes;
use std::sync::Arc;

/// Saved reader position, restored with [`BlockReader::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(pub u64);

/// Buffered random-access reader.
///
/// Reads are fetched from the source in `chunk_size` blocks and served from
/// the buffer until the position leaves it. Reading past the logical end of
/// the source fails with `Eof`.
pub struct BlockReader {
    source: Arc<ByteSource>,
    chunk_size: usize,
    buf: Bytes,
    buf_start: u64,
    pos: u64,
}

impl BlockReader {
    /// Creates a reader at position 0.
    pub fn new(source: Arc<ByteSource>, config: &ReaderConfig) -> Self {
        Self {
            source,
            chunk_size: config.chunk_size.max(64),
            buf: Bytes::new(),
            buf_start: 0,
            pos: 0,
        }
    }

    /// Returns the underlying source.
    pub fn source(&self) -> &Arc<ByteSource> {
        &self.source
    }

    /// Current absolute position in the source.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Saves the current position.
    pub fn save_position(&self) -> Cursor {
        Cursor(self.pos)
    }

    /// Moves to an absolute position.
    pub fn seek(&mut self, position: u64) {
        self.pos = position;
    }

    /// Restores a saved position.
    pub fn restore(&mut self, cursor: Cursor) {
        self.pos = cursor.0;
    }

    /// Advances the position by `n` bytes.
    pub fn skip(&mut self, n: u64) {
        self.pos += n;
    }

    /// Reads `n` bytes at the current position, advancing past them.
    pub fn get(&mut self, n: usize) -> Result<Bytes> {
        let bytes = self.peek(n)?;
        self.pos += n as u64;
        Ok(bytes)
    }

    /// Reads `n` bytes at the current position without advancing.
    pub fn peek(&mut self, n: usize) -> Result<Bytes> {
        // Serve from the buffer when the whole range is inside it.
        let buf_end = self.buf_start + self.buf.len() as u64;
        if self.pos >= self.buf_start && self.pos + n as u64 <= buf_end {
            let start = (self.pos - self.buf_start) as usize;
            return Ok(self.buf.slice(start..start + n));
        }

        if n >= self.chunk_size {
            // Oversized request: bypass the buffer.
            return self.source.read_exact_at(self.pos, n);
        }

        self.buf = self.source.read_at(self.pos, self.chunk_size)?;
        self.buf_start = self.pos;
        if self.buf.len() < n {
            return Err(ArborError::Eof {
                offset: self.pos + self.buf.len() as u64,
            });
        }
        Ok(self.buf.slice(0..n))
    }

    /// Reads one byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get(1)?[0])
    }

    /// Reads a big-endian u16.
    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.get(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a big-endian u32.
    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.get(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian i32.
    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.get(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a typed key (tag + length + payload).
    pub fn get_value(&mut self) -> Result<Key> {
        let head = self.peek(2)?;
        let len = head[1] as usize;
        let raw = self.get(2 + len)?;
        let (key, consumed) = Key::deserialize(&raw)?;
        debug_assert_eq!(consumed, raw.len());
        Ok(key)
    }

    /// Creates an independent reader over the same source. The clone starts
    /// at this reader's position with an empty buffer.
    pub fn fork(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            chunk_size: self.chunk_size,
            buf: Bytes::new(),
            buf_start: 0,
            pos: self.pos,
        }
    }
}
