//! HFS+ volume detection and info
//!
//! Parses the volume header (big-endian, unlike everything else around
//! here) for the info listing. Navigation is not implemented.

use byteorder::{BigEndian, ByteOrder};
use time::OffsetDateTime;

use crate::block::{BlockRead, SharedReader};
use crate::fsys::{clean_path, FileInfo, FsError, FsResult, Filesystem};

const HFSPLUS_SIG: u16 = 0x482B; // 'H+'
const HFSX_SIG: u16 = 0x4858; // 'HX', case-sensitive
const VOLUME_HEADER_OFFSET: u64 = 1024;

/// Seconds between the HFS epoch (1904-01-01) and the Unix epoch.
const HFS_EPOCH_DIFF: i64 = 2_082_844_800;

/// An HFS+ volume (info only).
pub struct HfsPlusFs {
    signature: u16,
    version: u16,
    block_size: u32,
    total_blocks: u32,
    free_blocks: u32,
    create_date: u32,
    modify_date: u32,
    file_count: u32,
    folder_count: u32,
}

impl HfsPlusFs {
    pub fn open(r: SharedReader) -> FsResult<Self> {
        let mut header = [0u8; 512];
        r.read_exact_at(&mut header, VOLUME_HEADER_OFFSET)?;

        let signature = BigEndian::read_u16(&header[0..2]);
        if signature != HFSPLUS_SIG && signature != HFSX_SIG {
            return Err(FsError::Corrupt("bad HFS+ volume signature".to_string()));
        }

        Ok(Self {
            signature,
            version: BigEndian::read_u16(&header[2..4]),
            create_date: BigEndian::read_u32(&header[16..20]),
            modify_date: BigEndian::read_u32(&header[20..24]),
            file_count: BigEndian::read_u32(&header[32..36]),
            folder_count: BigEndian::read_u32(&header[36..40]),
            block_size: BigEndian::read_u32(&header[40..44]),
            total_blocks: BigEndian::read_u32(&header[44..48]),
            free_blocks: BigEndian::read_u32(&header[48..52]),
        })
    }

    fn unsupported(&self, path: &str) -> FsError {
        FsError::Unsupported(format!(
            "{}: {path}: navigation not implemented",
            self.type_name()
        ))
    }
}

fn hfs_time(t: u32) -> Option<OffsetDateTime> {
    if t == 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(t as i64 - HFS_EPOCH_DIFF).ok()
}

impl Filesystem for HfsPlusFs {
    fn type_name(&self) -> &'static str {
        if self.signature == HFSX_SIG {
            "HFSX"
        } else {
            "HFS+"
        }
    }

    fn open(&self, path: &str) -> FsResult<SharedReader> {
        Err(self.unsupported(clean_path(path)))
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let path = clean_path(path);
        if path == "." {
            let mut info = FileInfo::dir(".");
            info.mtime = hfs_time(self.modify_date);
            return Ok(info);
        }
        Err(self.unsupported(path))
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        Err(self.unsupported(clean_path(path)))
    }

    fn info(&self) -> Option<String> {
        use std::fmt::Write;
        let total = self.block_size as u64 * self.total_blocks as u64;
        let free = self.block_size as u64 * self.free_blocks as u64;

        let mut out = String::new();
        let _ = writeln!(out, "{} Volume", self.type_name());
        let _ = writeln!(out, "  Version: {}", self.version);
        let _ = writeln!(out, "  Block size: {} bytes", self.block_size);
        let _ = writeln!(out, "  Total blocks: {}", self.total_blocks);
        let _ = writeln!(out, "  Free blocks: {}", self.free_blocks);
        let _ = writeln!(out, "  Total size: {total} bytes");
        let _ = writeln!(out, "  Used: {} bytes", total - free);
        let _ = writeln!(out, "  Files: {}", self.file_count);
        let _ = write!(out, "  Folders: {}", self.folder_count);
        if let Some(t) = hfs_time(self.create_date) {
            let _ = write!(out, "\n  Created: {t}");
        }
        if let Some(t) = hfs_time(self.modify_date) {
            let _ = write!(out, "\n  Modified: {t}");
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBackend;
    use std::sync::Arc;

    fn mk_hfsplus(sig: u16) -> Vec<u8> {
        let mut img = vec![0u8; 4096];
        let h = 1024;
        BigEndian::write_u16(&mut img[h..h + 2], sig);
        BigEndian::write_u16(&mut img[h + 2..h + 4], 4);
        BigEndian::write_u32(&mut img[h + 16..h + 20], 3_700_000_000); // create
        BigEndian::write_u32(&mut img[h + 20..h + 24], 3_700_000_100); // modify
        BigEndian::write_u32(&mut img[h + 32..h + 36], 42); // files
        BigEndian::write_u32(&mut img[h + 36..h + 40], 7); // folders
        BigEndian::write_u32(&mut img[h + 40..h + 44], 4096);
        BigEndian::write_u32(&mut img[h + 44..h + 48], 2560);
        BigEndian::write_u32(&mut img[h + 48..h + 52], 1000);
        img
    }

    #[test]
    fn test_open_and_info() {
        let fs = HfsPlusFs::open(Arc::new(MemBackend::new(mk_hfsplus(HFSPLUS_SIG)))).unwrap();
        assert_eq!(fs.type_name(), "HFS+");
        let info = fs.info().unwrap();
        assert!(info.contains("Block size: 4096"));
        assert!(info.contains("Files: 42"));

        let fsx = HfsPlusFs::open(Arc::new(MemBackend::new(mk_hfsplus(HFSX_SIG)))).unwrap();
        assert_eq!(fsx.type_name(), "HFSX");
    }

    #[test]
    fn test_dates_are_hfs_epoch() {
        let fs = HfsPlusFs::open(Arc::new(MemBackend::new(mk_hfsplus(HFSPLUS_SIG)))).unwrap();
        let mtime = fs.stat(".").unwrap().mtime.unwrap();
        // 3_700_000_100 seconds after 1904 lands in 2021.
        assert_eq!(mtime.year(), 2021);
        assert!(hfs_time(0).is_none());
    }

    #[test]
    fn test_children_unsupported() {
        let fs = HfsPlusFs::open(Arc::new(MemBackend::new(mk_hfsplus(HFSPLUS_SIG)))).unwrap();
        assert!(matches!(fs.read_dir("."), Err(FsError::Unsupported(_))));
        assert!(matches!(fs.open("a/b"), Err(FsError::Unsupported(_))));
    }
}
