//! I/O layer for Arbor.
//!
//! This crate provides:
//! - Memory- and file-backed random-access byte sources
//! - A chunk-buffered reader with typed getters
//! - A buffered sequential/positioned writer
//! - A process-wide named-lock registry with timeouts

pub mod lock;
pub mod reader;
pub mod source;
pub mod writer;

pub use lock::{lock, lock_default, NamedLock, DEFAULT_LOCK_TIMEOUT};
pub use reader::{BlockReader, Cursor};
pub use source::ByteSource;
pub use writer::BlockWriter;
