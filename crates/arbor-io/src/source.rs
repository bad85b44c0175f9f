//! Random-access byte sources backing a tree.
//!
//! A tree lives in one contiguous byte region. The region is either an
//! in-memory buffer or a file; both support positioned reads, positioned
//! writes, appends, and zero-extension. The is-a-file question is a tagged
//! variant, not a trait object, so callers match on it where behavior
//! differs.

use arbor_common::{ArborError, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A random-access byte region, memory- or file-backed.
pub enum ByteSource {
    /// Growable in-memory buffer.
    Memory(RwLock<Vec<u8>>),
    /// File-backed region with a tracked length.
    File(Mutex<FileInner>),
}

/// Handle for an open backing file.
pub struct FileInner {
    file: File,
    len: u64,
    #[allow(dead_code)]
    path: PathBuf,
}

impl ByteSource {
    /// Creates an empty in-memory source.
    pub fn memory() -> Self {
        ByteSource::Memory(RwLock::new(Vec::new()))
    }

    /// Creates an in-memory source over existing bytes.
    pub fn memory_from(data: Vec<u8>) -> Self {
        ByteSource::Memory(RwLock::new(data))
    }

    /// Creates (truncating) a file-backed source.
    pub fn create_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(ByteSource::File(Mutex::new(FileInner { file, len: 0, path })))
    }

    /// Opens an existing file-backed source.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(ByteSource::File(Mutex::new(FileInner { file, len, path })))
    }

    /// Current logical length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            ByteSource::Memory(buf) => buf.read().len() as u64,
            ByteSource::File(inner) => inner.lock().len,
        }
    }

    /// Returns true when no bytes have been written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `len` bytes starting at `offset`. The returned buffer is
    /// shorter than `len` when the region ends first; reading at or past
    /// the end yields an empty buffer.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        match self {
            ByteSource::Memory(buf) => {
                let buf = buf.read();
                let start = (offset as usize).min(buf.len());
                let end = (start + len).min(buf.len());
                Ok(Bytes::copy_from_slice(&buf[start..end]))
            }
            ByteSource::File(inner) => {
                let mut inner = inner.lock();
                if offset >= inner.len {
                    return Ok(Bytes::new());
                }
                let available = (inner.len - offset) as usize;
                let to_read = len.min(available);
                inner.file.seek(SeekFrom::Start(offset))?;
                let mut out = vec![0u8; to_read];
                inner.file.read_exact(&mut out)?;
                Ok(Bytes::from(out))
            }
        }
    }

    /// Reads exactly `len` bytes or fails with `Eof`.
    pub fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let bytes = self.read_at(offset, len)?;
        if bytes.len() < len {
            return Err(ArborError::Eof {
                offset: offset + bytes.len() as u64,
            });
        }
        Ok(bytes)
    }

    /// Writes `data` at `offset`, zero-extending the region first when the
    /// write begins past the current end.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            ByteSource::Memory(buf) => {
                let mut buf = buf.write();
                let end = offset as usize + data.len();
                if end > buf.len() {
                    buf.resize(end, 0);
                }
                buf[offset as usize..end].copy_from_slice(data);
                Ok(())
            }
            ByteSource::File(inner) => {
                let mut inner = inner.lock();
                inner.file.seek(SeekFrom::Start(offset))?;
                inner.file.write_all(data)?;
                let end = offset + data.len() as u64;
                if end > inner.len {
                    inner.len = end;
                }
                Ok(())
            }
        }
    }

    /// Appends `data` at the end, returning the offset it was written at.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        match self {
            ByteSource::Memory(buf) => {
                let mut buf = buf.write();
                let offset = buf.len() as u64;
                buf.extend_from_slice(data);
                Ok(offset)
            }
            ByteSource::File(inner) => {
                let mut inner = inner.lock();
                let offset = inner.len;
                inner.file.seek(SeekFrom::Start(offset))?;
                inner.file.write_all(data)?;
                inner.len = offset + data.len() as u64;
                Ok(offset)
            }
        }
    }

    /// Zero-extends the region by `additional` bytes.
    pub fn extend(&self, additional: u64) -> Result<()> {
        match self {
            ByteSource::Memory(buf) => {
                let mut buf = buf.write();
                let new_len = buf.len() + additional as usize;
                buf.resize(new_len, 0);
                Ok(())
            }
            ByteSource::File(inner) => {
                let mut inner = inner.lock();
                let new_len = inner.len + additional;
                inner.file.set_len(new_len)?;
                inner.len = new_len;
                Ok(())
            }
        }
    }

    /// Flushes file-backed sources to stable storage. No-op for memory.
    pub fn sync(&self) -> Result<()> {
        if let ByteSource::File(inner) = self {
            inner.lock().file.sync_all()?;
        }
        Ok(())
    }

    /// Consumes an in-memory source, returning its bytes. Panics on file
    /// sources; only used by builders and tests that know the variant.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ByteSource::Memory(buf) => buf.into_inner(),
            ByteSource::File(_) => panic!("into_bytes on file-backed source"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_append_read() {
        let source = ByteSource::memory();
        assert!(source.is_empty());

        let at = source.append(b"hello").unwrap();
        assert_eq!(at, 0);
        let at = source.append(b" world").unwrap();
        assert_eq!(at, 5);
        assert_eq!(source.len(), 11);

        let bytes = source.read_at(0, 11).unwrap();
        assert_eq!(bytes.as_ref(), b"hello world");
    }

    #[test]
    fn test_memory_positioned_write() {
        let source = ByteSource::memory_from(b"aaaaaa".to_vec());
        source.write_at(2, b"XY").unwrap();
        assert_eq!(source.read_at(0, 6).unwrap().as_ref(), b"aaXYaa");
    }

    #[test]
    fn test_memory_write_past_end_extends() {
        let source = ByteSource::memory();
        source.write_at(4, b"zz").unwrap();
        assert_eq!(source.len(), 6);
        assert_eq!(source.read_at(0, 6).unwrap().as_ref(), b"\0\0\0\0zz");
    }

    #[test]
    fn test_short_read_at_end() {
        let source = ByteSource::memory_from(b"abc".to_vec());
        let bytes = source.read_at(1, 100).unwrap();
        assert_eq!(bytes.as_ref(), b"bc");
        assert!(source.read_at(3, 10).unwrap().is_empty());
        assert!(source.read_at(99, 10).unwrap().is_empty());
    }

    #[test]
    fn test_read_exact_eof() {
        let source = ByteSource::memory_from(b"abc".to_vec());
        let err = source.read_exact_at(1, 5).unwrap_err();
        assert!(matches!(err, ArborError::Eof { offset: 3 }));
    }

    #[test]
    fn test_extend_zero_fills() {
        let source = ByteSource::memory_from(b"ab".to_vec());
        source.extend(3).unwrap();
        assert_eq!(source.len(), 5);
        assert_eq!(source.read_at(0, 5).unwrap().as_ref(), b"ab\0\0\0");
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.idx");

        let source = ByteSource::create_file(&path).unwrap();
        source.append(b"header").unwrap();
        source.write_at(0, b"H").unwrap();
        source.sync().unwrap();
        assert_eq!(source.len(), 6);
        drop(source);

        let reopened = ByteSource::open_file(&path).unwrap();
        assert_eq!(reopened.len(), 6);
        assert_eq!(reopened.read_at(0, 6).unwrap().as_ref(), b"Header");
    }

    #[test]
    fn test_file_extend() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.idx");

        let source = ByteSource::create_file(&path).unwrap();
        source.append(b"x").unwrap();
        source.extend(9).unwrap();
        assert_eq!(source.len(), 10);

        let tail = source.read_at(1, 9).unwrap();
        assert_eq!(tail.as_ref(), &[0u8; 9]);
    }

    #[test]
    fn test_into_bytes() {
        let source = ByteSource::memory_from(vec![1, 2, 3]);
        assert_eq!(source.into_bytes(), vec![1, 2, 3]);
    }
}
