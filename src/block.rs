//! Block-level byte sources
//!
//! This module defines the BlockRead and BlockWrite traits and the file
//! and memory backends that anchor every reader stack.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::extent::Extent;

/// A shared, clonable handle to a random-access byte source.
pub type SharedReader = Arc<dyn BlockRead>;

/// A shared, clonable handle to a random-access byte sink.
pub type SharedWriter = Arc<dyn BlockWrite>;

/// Random-access read over a logical address range `[0, size)`.
///
/// Implementations must be safe under concurrent `read_at` calls; the NBD
/// server reads from multiple connection threads. Reads may be short.
/// A return of `Ok(0)` means the offset is at or past the end of the
/// stream.
pub trait BlockRead: Send + Sync {
    /// Logical size of the stream in bytes.
    fn size(&self) -> u64;

    /// Read into `buf` at `off`, returning the number of bytes read.
    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize>;

    /// Fill `buf` completely from `off`, failing on a premature end.
    fn read_exact_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read_at(&mut buf[total..], off + total as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("unexpected end of image at offset {}", off + total as u64),
                ));
            }
            total += n;
        }
        Ok(())
    }

    /// Extent backing of this reader, if it is an extent-mapped view.
    ///
    /// Returns the base reader and the extent list so that a new extent
    /// view built on top can compose against the base instead of stacking
    /// another dispatch layer.
    fn extent_parts(&self) -> Option<(SharedReader, Vec<Extent>)> {
        None
    }
}

/// Random-access write counterpart of [`BlockRead`].
///
/// Only constructed when the user explicitly asks for a read-write NBD
/// export; the filesystem layer never writes.
pub trait BlockWrite: Send + Sync {
    /// Write `buf` at `off`, returning the number of bytes written.
    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<usize>;

    /// Write all of `buf` at `off`.
    fn write_all_at(&self, buf: &[u8], off: u64) -> io::Result<()> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.write_at(&buf[total..], off + total as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            total += n;
        }
        Ok(())
    }
}

/// File-backed block source.
pub struct FileBackend {
    file: File,
    size: u64,
    writable: bool,
}

impl FileBackend {
    /// Open an image file read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            writable: false,
        })
    }

    /// Open an image file read-write, for building a write path.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            writable: true,
        })
    }
}

impl BlockRead for FileBackend {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        if off >= self.size {
            return Ok(0);
        }
        let want = buf.len().min((self.size - off) as usize);
        self.file.read_at(&mut buf[..want], off)
    }
}

impl BlockWrite for FileBackend {
    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "image opened read-only",
            ));
        }
        if off + buf.len() as u64 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write past end of image at offset {off}"),
            ));
        }
        self.file.write_at(buf, off)
    }
}

/// In-memory block source, used for buffered file contents and tests.
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl BlockRead for MemBackend {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        if off >= self.data.len() as u64 {
            return Ok(0);
        }
        let off = off as usize;
        let n = buf.len().min(self.data.len() - off);
        buf[..n].copy_from_slice(&self.data[off..off + n]);
        Ok(n)
    }
}
