//! Partition tables (MBR, GPT) as a quasi-filesystem
//!
//! Partitions appear as entries `p0`, `p1`, … of a flat root directory.
//! Opening `p<i>` yields the partition's bytes; descending into
//! `p<i>/…` detects the filesystem inside the partition and delegates.
//! The LBA unit is fixed at 512 bytes throughout this layer.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::block::{BlockRead, SharedReader};
use crate::detect::{detect, FsKind};
use crate::extent::{Extent, ExtentReader, Range};
use crate::fsys::{clean_path, open_filesystem, FileInfo, FsError, FsResult, Filesystem};

const SECTOR: u64 = 512;

/// Reserved sectors at the head of a GPT disk: protective MBR, header,
/// and the 32-sector entry array.
const GPT_HEADER_SECTORS: u64 = 34;
/// The backup entry array and header at the tail of a GPT disk.
const GPT_TRAILER_SECTORS: u64 = 33;

/// A single partition-table entry.
#[derive(Debug, Clone)]
pub struct Partition {
    pub index: usize,
    /// Display name: "p0", "p1", …
    pub name: String,
    /// MBR type byte; 0 for GPT entries.
    pub mbr_type: u8,
    /// GPT type GUID; zero for MBR entries.
    pub type_guid: [u8; 16],
    pub start_lba: u64,
    pub size_lba: u64,
    pub bootable: bool,
    /// GPT partition label (UTF-16LE on disk).
    pub label: String,
}

impl Partition {
    pub fn start_offset(&self) -> u64 {
        self.start_lba * SECTOR
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_lba * SECTOR
    }

    /// Human-readable partition type.
    pub fn type_string(&self) -> String {
        if self.mbr_type != 0 {
            return match self.mbr_type {
                0x01 => "FAT12".to_string(),
                0x04 | 0x06 | 0x0E => "FAT16".to_string(),
                0x0B | 0x0C => "FAT32".to_string(),
                0x07 => "NTFS/exFAT".to_string(),
                0x05 | 0x0F => "Extended".to_string(),
                0x82 => "Linux swap".to_string(),
                0x83 => "Linux".to_string(),
                0x8E => "Linux LVM".to_string(),
                0xEE => "GPT Protective".to_string(),
                0xEF => "EFI System".to_string(),
                t => format!("{t:#04X}"),
            };
        }

        let guid = format_guid(&self.type_guid);
        match guid.as_str() {
            "C12A7328-F81F-11D2-BA4B-00A0C93EC93B" => "EFI System".to_string(),
            "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7" => "Basic Data".to_string(),
            "0FC63DAF-8483-4772-8E79-3D69D8477DE4" => "Linux Filesystem".to_string(),
            "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F" => "Linux Swap".to_string(),
            "E6D6D379-F507-44C2-A23C-238F2A3DF928" => "Linux LVM".to_string(),
            "A19D880F-05FC-4D3B-A006-743F0F84911E" => "Linux RAID".to_string(),
            _ => guid,
        }
    }
}

/// GUIDs mix little-endian and big-endian groups.
fn format_guid(guid: &[u8; 16]) -> String {
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        LittleEndian::read_u32(&guid[0..4]),
        LittleEndian::read_u16(&guid[4..6]),
        LittleEndian::read_u16(&guid[6..8]),
        guid[8],
        guid[9],
        guid[10],
        guid[11],
        guid[12],
        guid[13],
        guid[14],
        guid[15]
    )
}

/// A partition table viewed as a filesystem.
pub struct PartFs {
    r: SharedReader,
    size: u64,
    kind: FsKind,
    partitions: Vec<Partition>,
}

impl PartFs {
    pub fn open(r: SharedReader, kind: FsKind) -> FsResult<Self> {
        let size = r.size();
        let mut fs = Self {
            r,
            size,
            kind,
            partitions: Vec::new(),
        };

        match kind {
            FsKind::Mbr => fs.parse_mbr()?,
            FsKind::Gpt => fs.parse_gpt()?,
            other => {
                return Err(FsError::Unsupported(format!(
                    "partition table type {other}"
                )))
            }
        }

        Ok(fs)
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    fn parse_mbr(&mut self) -> FsResult<()> {
        let mut header = [0u8; 512];
        self.r.read_exact_at(&mut header, 0)?;

        if header[510] != 0x55 || header[511] != 0xAA {
            return Err(FsError::Corrupt("invalid MBR signature".to_string()));
        }

        for i in 0..4 {
            let entry = &header[446 + i * 16..446 + (i + 1) * 16];
            let boot_flag = entry[0];
            let part_type = entry[4];
            let lba_start = LittleEndian::read_u32(&entry[8..12]) as u64;
            let lba_size = LittleEndian::read_u32(&entry[12..16]) as u64;

            if part_type == 0 || lba_size == 0 {
                continue;
            }

            self.partitions.push(Partition {
                index: i,
                name: format!("p{i}"),
                mbr_type: part_type,
                type_guid: [0; 16],
                start_lba: lba_start,
                size_lba: lba_size,
                bootable: boot_flag == 0x80,
                label: String::new(),
            });
        }

        Ok(())
    }

    fn parse_gpt(&mut self) -> FsResult<()> {
        let mut header = [0u8; 512];
        self.r.read_exact_at(&mut header, SECTOR)?;

        if &header[0..8] != b"EFI PART" {
            return Err(FsError::Corrupt("invalid GPT signature".to_string()));
        }

        let entry_lba = LittleEndian::read_u64(&header[72..80]);
        let mut num_entries = LittleEndian::read_u32(&header[80..84]);
        let mut entry_size = LittleEndian::read_u32(&header[84..88]);

        if entry_size < 128 {
            entry_size = 128;
        }
        if num_entries > 128 {
            num_entries = 128;
        }

        let mut entry = vec![0u8; entry_size as usize];
        for i in 0..num_entries {
            let offset = entry_lba * SECTOR + i as u64 * entry_size as u64;
            if self.r.read_exact_at(&mut entry, offset).is_err() {
                break;
            }

            let mut type_guid = [0u8; 16];
            type_guid.copy_from_slice(&entry[0..16]);
            if type_guid.iter().all(|&b| b == 0) {
                continue;
            }

            let start_lba = LittleEndian::read_u64(&entry[32..40]);
            let end_lba = LittleEndian::read_u64(&entry[40..48]);
            let label = utf16le_label(&entry[56..128]);

            self.partitions.push(Partition {
                index: i as usize,
                name: format!("p{i}"),
                mbr_type: 0,
                type_guid,
                start_lba,
                size_lba: end_lba - start_lba + 1,
                bootable: false,
                label,
            });
        }

        Ok(())
    }

    fn find_partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    fn partition_reader(&self, p: &Partition) -> SharedReader {
        Arc::new(ExtentReader::new(
            self.r.clone(),
            vec![Extent {
                logical: 0,
                physical: p.start_offset(),
                length: p.size_bytes(),
            }],
            p.size_bytes(),
        ))
    }

    /// Detect and open the filesystem inside a partition.
    fn open_partition_fs(&self, p: &Partition) -> FsResult<Box<dyn Filesystem>> {
        let sub = self.partition_reader(p);
        let kind = detect(sub.as_ref())?;

        if kind == FsKind::Unknown {
            return Err(FsError::Unsupported(format!(
                "unknown filesystem in partition {}",
                p.name
            )));
        }
        if kind.is_partition_table() {
            return Err(FsError::Unsupported(
                "nested partition tables".to_string(),
            ));
        }

        open_filesystem(sub, kind)
    }

    /// Detected filesystem type of a partition, for the info listing.
    pub fn detect_partition_fs(&self, p: &Partition) -> FsKind {
        detect(self.partition_reader(p).as_ref()).unwrap_or(FsKind::Unknown)
    }

    fn partition_info(&self, p: &Partition) -> FileInfo {
        FileInfo {
            name: p.name.clone(),
            size: p.size_bytes(),
            is_dir: true,
            mode: 0o755,
            mtime: None,
            inode: Some(p.index as u64),
        }
    }

    fn split<'a>(&self, path: &'a str) -> (&'a str, Option<&'a str>) {
        match path.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        }
    }
}

impl Filesystem for PartFs {
    fn type_name(&self) -> &'static str {
        match self.kind {
            FsKind::Gpt => "GPT",
            _ => "MBR",
        }
    }

    fn open(&self, path: &str) -> FsResult<SharedReader> {
        let path = clean_path(path);
        if path == "." {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let (name, rest) = self.split(path);
        let p = self
            .find_partition(name)
            .ok_or_else(|| FsError::not_found(path))?;

        match rest {
            None => Ok(self.partition_reader(p)),
            Some(sub) => self.open_partition_fs(p)?.open(sub),
        }
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let path = clean_path(path);
        if path == "." {
            return Ok(FileInfo::dir("."));
        }
        let (name, rest) = self.split(path);
        let p = self
            .find_partition(name)
            .ok_or_else(|| FsError::not_found(path))?;

        match rest {
            None => Ok(self.partition_info(p)),
            Some(sub) => self.open_partition_fs(p)?.stat(sub),
        }
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let path = clean_path(path);
        if path == "." {
            return Ok(self.partitions.iter().map(|p| self.partition_info(p)).collect());
        }
        let (name, rest) = self.split(path);
        let p = self
            .find_partition(name)
            .ok_or_else(|| FsError::not_found(path))?;

        self.open_partition_fs(p)?.read_dir(rest.unwrap_or("."))
    }

    fn free_ranges(&self) -> FsResult<Vec<Range>> {
        let reserved = match self.kind {
            FsKind::Gpt => GPT_HEADER_SECTORS * SECTOR,
            _ => SECTOR,
        };
        let limit = match self.kind {
            FsKind::Gpt => self.size.saturating_sub(GPT_TRAILER_SECTORS * SECTOR),
            _ => self.size,
        };

        let mut parts: Vec<&Partition> = self.partitions.iter().collect();
        parts.sort_by_key(|p| p.start_lba);

        let mut ranges = Vec::new();
        let mut cursor = reserved;
        for p in parts {
            let start = p.start_offset();
            if start > cursor {
                ranges.push(Range { start: cursor, end: start });
            }
            cursor = cursor.max(start + p.size_bytes());
        }
        if cursor < limit {
            ranges.push(Range {
                start: cursor,
                end: limit,
            });
        }

        Ok(ranges)
    }

    fn file_extents(&self, path: &str) -> FsResult<Vec<Extent>> {
        let path = clean_path(path);
        if path == "." {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let (name, rest) = self.split(path);
        let p = self
            .find_partition(name)
            .ok_or_else(|| FsError::not_found(path))?;

        match rest {
            None => Ok(vec![Extent {
                logical: 0,
                physical: p.start_offset(),
                length: p.size_bytes(),
            }]),
            Some(sub) => {
                // Inner extents are relative to the partition; shift them
                // into image coordinates.
                let inner = self.open_partition_fs(p)?;
                let mut extents = inner.file_extents(sub)?;
                for e in &mut extents {
                    e.physical += p.start_offset();
                }
                Ok(extents)
            }
        }
    }

    fn base_reader(&self) -> Option<SharedReader> {
        Some(self.r.clone())
    }

    fn info(&self) -> Option<String> {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "Partitions: {}", self.partitions.len());
        let _ = writeln!(
            out,
            "{:<6} {:<16} {:>12} {:>12} {:<10} {}",
            "NAME", "TYPE", "START", "SIZE", "FSTYPE", "LABEL"
        );
        for p in &self.partitions {
            let label = if p.label.is_empty() && p.bootable {
                "(bootable)".to_string()
            } else {
                p.label.clone()
            };
            let _ = writeln!(
                out,
                "{:<6} {:<16} {:>12} {:>12} {:<10} {}",
                p.name,
                p.type_string(),
                p.start_lba,
                p.size_bytes(),
                self.detect_partition_fs(p).to_string(),
                label
            );
        }
        Some(out)
    }
}

fn utf16le_label(data: &[u8]) -> String {
    let mut units = Vec::new();
    for chunk in data.chunks_exact(2) {
        let u = LittleEndian::read_u16(chunk);
        if u == 0 {
            break;
        }
        units.push(u);
    }
    String::from_utf16_lossy(&units)
}
