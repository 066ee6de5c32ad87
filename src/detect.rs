//! Filesystem and partition-table type detection
//!
//! Classification looks only at the first 4 KiB of a stream. Rule order
//! matters: GPT before the protective MBR it hides behind, Apple formats
//! before NTFS/FAT whose magic lives at ambiguous offsets, and the
//! 0x55AA boot signature last because MBR and FAT share it.

use std::fmt;
use std::io;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::block::BlockRead;

const EXT_FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
const EXT_FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
const EXT_FEATURE_INCOMPAT_FLEX_BG: u32 = 0x0200;
const EXT_FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;

/// Identified on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Unknown,
    Fat12,
    Fat16,
    Fat32,
    Ntfs,
    Ext2,
    Ext3,
    Ext4,
    Mbr,
    Gpt,
    Apfs,
    HfsPlus,
}

impl FsKind {
    pub fn is_fat(self) -> bool {
        matches!(self, FsKind::Fat12 | FsKind::Fat16 | FsKind::Fat32)
    }

    pub fn is_ext(self) -> bool {
        matches!(self, FsKind::Ext2 | FsKind::Ext3 | FsKind::Ext4)
    }

    pub fn is_partition_table(self) -> bool {
        matches!(self, FsKind::Mbr | FsKind::Gpt)
    }

    pub fn is_apple(self) -> bool {
        matches!(self, FsKind::Apfs | FsKind::HfsPlus)
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsKind::Unknown => "unknown",
            FsKind::Fat12 => "FAT12",
            FsKind::Fat16 => "FAT16",
            FsKind::Fat32 => "FAT32",
            FsKind::Ntfs => "NTFS",
            FsKind::Ext2 => "ext2",
            FsKind::Ext3 => "ext3",
            FsKind::Ext4 => "ext4",
            FsKind::Mbr => "MBR",
            FsKind::Gpt => "GPT",
            FsKind::Apfs => "APFS",
            FsKind::HfsPlus => "HFS+",
        };
        f.write_str(name)
    }
}

/// Identify the format of a stream from its leading bytes.
///
/// Returns [`FsKind::Unknown`] when no rule matches; only I/O failures
/// and images shorter than one sector are errors.
pub fn detect(r: &dyn BlockRead) -> io::Result<FsKind> {
    let mut header = vec![0u8; 4096];
    let mut n = 0;
    while n < header.len() {
        let got = r.read_at(&mut header[n..], n as u64)?;
        if got == 0 {
            break;
        }
        n += got;
    }
    if n < 512 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("image too small: {n} bytes"),
        ));
    }
    let header = &header[..n];

    // GPT: "EFI PART" at LBA 1.
    if n >= 520 && &header[512..520] == b"EFI PART" {
        return Ok(FsKind::Gpt);
    }

    // APFS container superblock: "NXSB" after the 32-byte object header.
    if n >= 36 && LittleEndian::read_u32(&header[32..36]) == 0x4253584E {
        return Ok(FsKind::Apfs);
    }

    // HFS+ volume header: 'H+' or 'HX' at offset 1024, big-endian.
    if n >= 1026 {
        let sig = BigEndian::read_u16(&header[1024..1026]);
        if sig == 0x482B || sig == 0x4858 {
            return Ok(FsKind::HfsPlus);
        }
    }

    if n >= 11 && &header[3..11] == b"NTFS    " {
        return Ok(FsKind::Ntfs);
    }

    // ext superblock magic at byte 0x438 (superblock offset 1024 + 0x38).
    if n >= 1082 && LittleEndian::read_u16(&header[0x438..0x43A]) == 0xEF53 {
        return Ok(detect_ext_version(&header[1024..]));
    }

    // Boot-sector signature: either an MBR partition table or a FAT BPB.
    if header[510] == 0x55 && header[511] == 0xAA {
        if is_mbr_partition_table(header) {
            return Ok(FsKind::Mbr);
        }
        return Ok(detect_fat_version(header));
    }

    Ok(FsKind::Unknown)
}

/// Decide whether a 0x55AA boot sector holds an MBR partition table.
///
/// Requires at least one plausible partition entry, then explicitly rules
/// out FAT boot sectors, whose BPB fields can masquerade as entries.
fn is_mbr_partition_table(header: &[u8]) -> bool {
    let mut valid_partitions = 0;
    for i in 0..4 {
        let entry = &header[446 + i * 16..446 + (i + 1) * 16];

        let boot_flag = entry[0];
        if boot_flag != 0x00 && boot_flag != 0x80 {
            continue;
        }

        let part_type = entry[4];
        if part_type == 0 {
            continue;
        }

        if is_known_partition_type(part_type) {
            let lba_start = LittleEndian::read_u32(&entry[8..12]);
            let lba_size = LittleEndian::read_u32(&entry[12..16]);
            if lba_start > 0 && lba_size > 0 {
                valid_partitions += 1;
            }
        }
    }

    if valid_partitions == 0 {
        return false;
    }

    // Rule out FAT: bytes-per-sector plus either an explicit type string
    // or a power-of-two sectors-per-cluster marks a BPB, not an MBR.
    let bps = LittleEndian::read_u16(&header[11..13]);
    if matches!(bps, 512 | 1024 | 2048 | 4096) {
        if &header[54..59] == b"FAT12"
            || &header[54..59] == b"FAT16"
            || &header[82..87] == b"FAT32"
        {
            return false;
        }
        let spc = header[13];
        if matches!(spc, 1 | 2 | 4 | 8 | 16 | 32 | 64 | 128) {
            return false;
        }
    }

    true
}

fn is_known_partition_type(t: u8) -> bool {
    match t {
        0x01 | 0x04 | 0x06 | 0x0B | 0x0C | 0x0E => true, // FAT variants
        0x07 => true,                                    // NTFS/exFAT/HPFS
        0x05 | 0x0F => true,                             // extended
        0x82 => true,                                    // Linux swap
        0x83 => true,                                    // Linux native
        0x8E => true,                                    // Linux LVM
        0xEE => true,                                    // GPT protective
        0xEF => true,                                    // EFI system
        0xFD => true,                                    // Linux RAID
        _ => t >= 0x80,
    }
}

/// Distinguish FAT12/16/32, first by the explicit BPB type string, then
/// by the cluster-count thresholds from the FAT specification.
fn detect_fat_version(header: &[u8]) -> FsKind {
    if header.len() >= 90 && &header[82..90] == b"FAT32   " {
        return FsKind::Fat32;
    }
    if header.len() >= 62 {
        if &header[54..62] == b"FAT12   " {
            return FsKind::Fat12;
        }
        if &header[54..62] == b"FAT16   " {
            return FsKind::Fat16;
        }
    }

    if header.len() < 36 {
        return FsKind::Unknown;
    }

    let bytes_per_sector = LittleEndian::read_u16(&header[11..13]) as u32;
    let sectors_per_cluster = header[13] as u32;
    let reserved_sectors = LittleEndian::read_u16(&header[14..16]) as u32;
    let num_fats = header[16] as u32;
    let root_entry_count = LittleEndian::read_u16(&header[17..19]) as u32;
    let total_sectors16 = LittleEndian::read_u16(&header[19..21]) as u32;
    let fat_size16 = LittleEndian::read_u16(&header[22..24]) as u32;
    let total_sectors32 = LittleEndian::read_u32(&header[32..36]);

    if bytes_per_sector == 0 || sectors_per_cluster == 0 {
        return FsKind::Unknown;
    }

    let total_sectors = if total_sectors16 != 0 {
        total_sectors16
    } else {
        total_sectors32
    };

    let fat_size = if fat_size16 != 0 {
        fat_size16
    } else if header.len() >= 40 {
        LittleEndian::read_u32(&header[36..40])
    } else {
        0
    };

    let root_dir_sectors = (root_entry_count * 32 + bytes_per_sector - 1) / bytes_per_sector;
    let data_sectors =
        total_sectors.saturating_sub(reserved_sectors + num_fats * fat_size + root_dir_sectors);
    let count_of_clusters = data_sectors / sectors_per_cluster;

    if count_of_clusters < 4085 {
        FsKind::Fat12
    } else if count_of_clusters < 65525 {
        FsKind::Fat16
    } else {
        FsKind::Fat32
    }
}

/// Distinguish ext2/3/4 by superblock feature flags.
/// `superblock` starts at byte 1024 of the image.
fn detect_ext_version(superblock: &[u8]) -> FsKind {
    if superblock.len() < 100 {
        return FsKind::Ext2;
    }

    let feature_compat = LittleEndian::read_u32(&superblock[0x5C..0x60]);
    let feature_incompat = LittleEndian::read_u32(&superblock[0x60..0x64]);

    let ext4_features =
        EXT_FEATURE_INCOMPAT_64BIT | EXT_FEATURE_INCOMPAT_EXTENTS | EXT_FEATURE_INCOMPAT_FLEX_BG;
    if feature_incompat & ext4_features != 0 {
        return FsKind::Ext4;
    }
    if feature_compat & EXT_FEATURE_COMPAT_HAS_JOURNAL != 0 {
        return FsKind::Ext3;
    }
    FsKind::Ext2
}
