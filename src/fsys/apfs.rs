//! APFS container detection and info
//!
//! Parses the container superblock far enough to report geometry and the
//! container UUID. Navigation is not implemented; every child lookup
//! fails, which keeps the facade uniform for tools that only detect and
//! describe.

use byteorder::{ByteOrder, LittleEndian};

use crate::block::{BlockRead, SharedReader};
use crate::fsys::{clean_path, FileInfo, FsError, FsResult, Filesystem};

const NXSB_MAGIC: u32 = 0x4253584E;

/// An APFS container (info only).
pub struct ApfsFs {
    block_size: u32,
    block_count: u64,
    uuid: [u8; 16],
}

impl ApfsFs {
    pub fn open(r: SharedReader) -> FsResult<Self> {
        let mut header = [0u8; 128];
        r.read_exact_at(&mut header, 0)?;

        // The magic sits after the 32-byte object header.
        if LittleEndian::read_u32(&header[32..36]) != NXSB_MAGIC {
            return Err(FsError::Corrupt("bad APFS container magic".to_string()));
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&header[72..88]);

        Ok(Self {
            block_size: LittleEndian::read_u32(&header[36..40]),
            block_count: LittleEndian::read_u64(&header[40..48]),
            uuid,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    fn unsupported(&self, path: &str) -> FsError {
        FsError::Unsupported(format!("APFS: {path}: navigation not implemented"))
    }
}

impl Filesystem for ApfsFs {
    fn type_name(&self) -> &'static str {
        "APFS"
    }

    fn open(&self, path: &str) -> FsResult<SharedReader> {
        Err(self.unsupported(clean_path(path)))
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let path = clean_path(path);
        if path == "." {
            return Ok(FileInfo::dir("."));
        }
        Err(self.unsupported(path))
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        Err(self.unsupported(clean_path(path)))
    }

    fn info(&self) -> Option<String> {
        let total = self.block_size as u64 * self.block_count;
        let uuid = &self.uuid;
        Some(format!(
            "APFS Container\n  Block size: {} bytes\n  Block count: {}\n  Container size: {} bytes\n  UUID: {:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.block_size,
            self.block_count,
            total,
            uuid[0], uuid[1], uuid[2], uuid[3],
            uuid[4], uuid[5],
            uuid[6], uuid[7],
            uuid[8], uuid[9],
            uuid[10], uuid[11], uuid[12], uuid[13], uuid[14], uuid[15]
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBackend;
    use std::sync::Arc;

    fn mk_apfs() -> Vec<u8> {
        let mut img = vec![0u8; 4096];
        LittleEndian::write_u32(&mut img[32..36], NXSB_MAGIC);
        LittleEndian::write_u32(&mut img[36..40], 4096);
        LittleEndian::write_u64(&mut img[40..48], 1000);
        img[72..88].copy_from_slice(&[0xAB; 16]);
        img
    }

    #[test]
    fn test_open_and_info() {
        let fs = ApfsFs::open(Arc::new(MemBackend::new(mk_apfs()))).unwrap();
        assert_eq!(fs.type_name(), "APFS");
        assert_eq!(fs.block_size(), 4096);
        assert_eq!(fs.block_count(), 1000);

        let info = fs.info().unwrap();
        assert!(info.contains("Block size: 4096"));
        assert!(info.contains("ABABABAB"));
    }

    #[test]
    fn test_children_unsupported() {
        let fs = ApfsFs::open(Arc::new(MemBackend::new(mk_apfs()))).unwrap();
        assert!(fs.stat(".").is_ok());
        assert!(matches!(fs.stat("x"), Err(FsError::Unsupported(_))));
        assert!(matches!(fs.open("x"), Err(FsError::Unsupported(_))));
        assert!(matches!(fs.read_dir("."), Err(FsError::Unsupported(_))));
    }
}
