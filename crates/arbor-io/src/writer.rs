//! Buffered writer over a byte source.

use crate::source::ByteSource;
use arbor_common::Result;
use bytes::BytesMut;
use std::sync::Arc;

/// Default number of buffered append bytes before a drain to the source.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Sequential-append plus positioned-overwrite writer.
///
/// Appends accumulate in memory and drain to the source when the buffer
/// crosses the flush threshold; `write_at` targets already-drained regions
/// and forces a drain first so positions always refer to source bytes.
pub struct BlockWriter {
    source: Arc<ByteSource>,
    pending: BytesMut,
    drained: u64,
    flush_threshold: usize,
}

impl BlockWriter {
    /// Creates a writer positioned at the end of the source.
    pub fn new(source: Arc<ByteSource>) -> Self {
        let drained = source.len();
        Self {
            source,
            pending: BytesMut::new(),
            drained,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    /// Creates a writer with a custom flush threshold.
    pub fn with_flush_threshold(source: Arc<ByteSource>, threshold: usize) -> Self {
        let drained = source.len();
        Self {
            source,
            pending: BytesMut::new(),
            drained,
            flush_threshold: threshold.max(1),
        }
    }

    /// Returns the underlying source.
    pub fn source(&self) -> &Arc<ByteSource> {
        &self.source
    }

    /// Logical length written so far (drained plus pending).
    pub fn position(&self) -> u64 {
        self.drained + self.pending.len() as u64
    }

    /// Appends bytes at the logical end. Drains to the source when the
    /// pending buffer crosses the flush threshold.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(data);
        if self.pending.len() >= self.flush_threshold {
            self.drain()?;
        }
        Ok(())
    }

    /// Writes bytes at an absolute position. Pending appends drain first so
    /// the target region is guaranteed to exist in the source.
    pub fn write_at(&mut self, data: &[u8], position: u64) -> Result<()> {
        self.drain()?;
        self.source.write_at(position, data)
    }

    /// Drains buffered appends to the source.
    pub fn drain(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split();
        self.source.append(&chunk)?;
        self.drained += chunk.len() as u64;
        Ok(())
    }

    /// Drains, syncs file-backed sources, and returns the final length.
    pub fn end(&mut self) -> Result<u64> {
        self.drain()?;
        self.source.sync()?;
        Ok(self.drained)
    }
}
