//! The file I/O seam consumed by the loader.
//!
//! The core never does I/O on the interactive thread, and tests never do
//! I/O at all: everything goes through [`SourceFile`].

use std::{fs::File, io, path::Path, sync::Arc};

/// A positionally-readable byte stream of known length.
pub trait SourceFile: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read at `offset` into `buf`, returning the number of bytes read.
    /// A short read is not an error; zero means end of stream.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// An on-disk file.
pub struct DiskFile {
    file: File,
    len: u64,
}

impl DiskFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl SourceFile for DiskFile {
    fn len(&self) -> u64 {
        self.len
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
    }
}

/// An in-memory stream for tests and scratch buffers.
#[derive(Clone)]
pub struct MemoryFile {
    bytes: Arc<[u8]>,
}

impl MemoryFile {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl SourceFile for MemoryFile {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.bytes.len() as u64 {
            return Ok(0);
        }
        let avail = &self.bytes[offset as usize..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memory_file_short_reads() {
        let f = MemoryFile::new(&b"hello"[..]);
        let mut buf = [0u8; 8];
        assert_eq!(f.read_at(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(f.read_at(5, &mut buf).unwrap(), 0);
    }

    #[test]
    fn disk_file_reads_at_offset() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let f = DiskFile::open(tmp.path()).unwrap();
        assert_eq!(f.len(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(f.read_at(6, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"6789");
    }
}
