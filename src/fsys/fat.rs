//! Read-only FAT12/16/32 support
//!
//! Parses the BIOS Parameter Block, follows cluster chains through the
//! FAT, and assembles long filenames from their multi-entry UTF-16
//! records. The variant is taken from the explicit BPB type string when
//! present and from the cluster-count thresholds otherwise.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::block::{BlockRead, MemBackend, SharedReader};
use crate::extent::{Extent, Range};
use crate::fsys::{clean_path, FileInfo, FsError, FsResult, Filesystem};

const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LFN: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Fat12,
    Fat16,
    Fat32,
}

#[derive(Debug, Clone, Copy)]
struct Bpb {
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    num_fats: u8,
    root_entry_count: u16,
    total_sectors: u32,
    fat_size: u32,
    root_cluster: u32,
    first_data_sector: u32,
    count_of_clusters: u32,
}

#[derive(Debug, Clone)]
struct RawEntry {
    name: String,
    attr: u8,
    cluster: u32,
    size: u32,
    mtime: Option<OffsetDateTime>,
}

/// A read-only FAT filesystem.
pub struct FatFs {
    r: SharedReader,
    bpb: Bpb,
    variant: Variant,
}

impl FatFs {
    pub fn open(r: SharedReader) -> FsResult<Self> {
        let mut header = [0u8; 512];
        r.read_exact_at(&mut header, 0)?;

        if header[510] != 0x55 || header[511] != 0xAA {
            return Err(FsError::Corrupt("missing FAT boot signature".to_string()));
        }

        let mut bpb = Bpb {
            bytes_per_sector: LittleEndian::read_u16(&header[11..13]),
            sectors_per_cluster: header[13],
            reserved_sectors: LittleEndian::read_u16(&header[14..16]),
            num_fats: header[16],
            root_entry_count: LittleEndian::read_u16(&header[17..19]),
            total_sectors: 0,
            fat_size: 0,
            root_cluster: 0,
            first_data_sector: 0,
            count_of_clusters: 0,
        };

        if bpb.bytes_per_sector == 0 || bpb.sectors_per_cluster == 0 {
            return Err(FsError::Corrupt("invalid FAT geometry".to_string()));
        }

        let total_sectors16 = LittleEndian::read_u16(&header[19..21]);
        let fat_size16 = LittleEndian::read_u16(&header[22..24]);
        let total_sectors32 = LittleEndian::read_u32(&header[32..36]);

        bpb.total_sectors = if total_sectors16 != 0 {
            total_sectors16 as u32
        } else {
            total_sectors32
        };

        let is_fat32 = fat_size16 == 0;
        if is_fat32 {
            bpb.fat_size = LittleEndian::read_u32(&header[36..40]);
            bpb.root_cluster = LittleEndian::read_u32(&header[44..48]);
        } else {
            bpb.fat_size = fat_size16 as u32;
        }

        let root_dir_sectors = (bpb.root_entry_count as u32 * 32 + bpb.bytes_per_sector as u32 - 1)
            / bpb.bytes_per_sector as u32;
        bpb.first_data_sector =
            bpb.reserved_sectors as u32 + bpb.num_fats as u32 * bpb.fat_size + root_dir_sectors;
        let data_sectors = bpb.total_sectors.saturating_sub(bpb.first_data_sector);
        bpb.count_of_clusters = data_sectors / bpb.sectors_per_cluster as u32;

        // Structurally FAT32 boot sectors report FAT32; the cluster-count
        // thresholds only split FAT12 from FAT16.
        let variant = if is_fat32 {
            Variant::Fat32
        } else if bpb.count_of_clusters < 4085 {
            Variant::Fat12
        } else {
            Variant::Fat16
        };

        Ok(Self { r, bpb, variant })
    }

    fn cluster_size(&self) -> u64 {
        self.bpb.sectors_per_cluster as u64 * self.bpb.bytes_per_sector as u64
    }

    fn cluster_to_offset(&self, cluster: u32) -> u64 {
        self.bpb.first_data_sector as u64 * self.bpb.bytes_per_sector as u64
            + (cluster as u64 - 2) * self.cluster_size()
    }

    fn fat_offset(&self) -> u64 {
        self.bpb.reserved_sectors as u64 * self.bpb.bytes_per_sector as u64
    }

    /// The FAT entry for a cluster; also the next link of its chain.
    fn next_cluster(&self, cluster: u32) -> FsResult<u32> {
        match self.variant {
            Variant::Fat12 => {
                let mut buf = [0u8; 2];
                self.r
                    .read_exact_at(&mut buf, self.fat_offset() + cluster as u64 * 3 / 2)?;
                let val = LittleEndian::read_u16(&buf);
                if cluster % 2 == 0 {
                    Ok((val & 0x0FFF) as u32)
                } else {
                    Ok((val >> 4) as u32)
                }
            }
            Variant::Fat16 => {
                let mut buf = [0u8; 2];
                self.r
                    .read_exact_at(&mut buf, self.fat_offset() + cluster as u64 * 2)?;
                Ok(LittleEndian::read_u16(&buf) as u32)
            }
            Variant::Fat32 => {
                let mut buf = [0u8; 4];
                self.r
                    .read_exact_at(&mut buf, self.fat_offset() + cluster as u64 * 4)?;
                Ok(LittleEndian::read_u32(&buf) & 0x0FFF_FFFF)
            }
        }
    }

    fn is_eoc(&self, cluster: u32) -> bool {
        match self.variant {
            Variant::Fat12 => cluster >= 0x0FF8,
            Variant::Fat16 => cluster >= 0xFFF8,
            Variant::Fat32 => cluster >= 0x0FFF_FFF8,
        }
    }

    fn read_cluster_chain(&self, start: u32, max_size: u64) -> FsResult<Vec<u8>> {
        if start < 2 {
            return Ok(Vec::new());
        }
        let cluster_size = self.cluster_size() as usize;
        let mut data = Vec::new();
        let mut cluster = start;

        loop {
            let mut buf = vec![0u8; cluster_size];
            self.r
                .read_exact_at(&mut buf, self.cluster_to_offset(cluster))?;
            data.extend_from_slice(&buf);

            if max_size > 0 && data.len() as u64 >= max_size {
                break;
            }
            if data.len() > 1 << 30 {
                return Err(FsError::Corrupt("cluster chain too long".to_string()));
            }

            let next = self.next_cluster(cluster)?;
            if self.is_eoc(next) || next < 2 || next >= self.bpb.count_of_clusters + 2 {
                break;
            }
            cluster = next;
        }

        if max_size > 0 && data.len() as u64 > max_size {
            data.truncate(max_size as usize);
        }
        Ok(data)
    }

    fn read_root_dir(&self) -> FsResult<Vec<RawEntry>> {
        if self.variant == Variant::Fat32 {
            return self.read_dir_cluster(self.bpb.root_cluster);
        }

        // FAT12/16 keep the root directory at a fixed location between
        // the FATs and the data area.
        let root_start = (self.bpb.reserved_sectors as u64
            + self.bpb.num_fats as u64 * self.bpb.fat_size as u64)
            * self.bpb.bytes_per_sector as u64;
        let mut data = vec![0u8; self.bpb.root_entry_count as usize * 32];
        self.r.read_exact_at(&mut data, root_start)?;
        Ok(parse_dir_entries(&data))
    }

    fn read_dir_cluster(&self, cluster: u32) -> FsResult<Vec<RawEntry>> {
        let data = self.read_cluster_chain(cluster, 0)?;
        Ok(parse_dir_entries(&data))
    }

    fn lookup(&self, path: &str) -> FsResult<RawEntry> {
        let parts: Vec<&str> = path.split('/').collect();
        let mut entries = self.read_root_dir()?;

        for (i, part) in parts.iter().enumerate() {
            let want = part.to_lowercase();
            let entry = entries
                .iter()
                .find(|e| e.name.to_lowercase() == want)
                .cloned()
                .ok_or_else(|| FsError::not_found(path))?;

            if i == parts.len() - 1 {
                return Ok(entry);
            }
            if entry.attr & ATTR_DIRECTORY == 0 {
                return Err(FsError::NotADirectory {
                    path: path.to_string(),
                });
            }
            entries = self.read_dir_cluster(entry.cluster)?;
        }

        Err(FsError::not_found(path))
    }

    fn chain_extents(&self, start: u32, file_size: u64) -> FsResult<Vec<Extent>> {
        if start < 2 {
            return Ok(Vec::new());
        }

        let cluster_size = self.cluster_size();
        let mut extents: Vec<Extent> = Vec::new();
        let mut cluster = start;
        let mut logical = 0u64;
        let mut remaining = file_size;

        while remaining > 0 {
            let physical = self.cluster_to_offset(cluster);
            let length = cluster_size.min(remaining);

            // Contiguous clusters coalesce into one extent.
            let extend = extents
                .last()
                .is_some_and(|last| last.physical + last.length == physical);
            if extend {
                if let Some(last) = extents.last_mut() {
                    last.length += length;
                }
            } else {
                extents.push(Extent {
                    logical,
                    physical,
                    length,
                });
            }

            logical += length;
            remaining -= length;
            if remaining == 0 {
                break;
            }

            let next = self.next_cluster(cluster)?;
            if self.is_eoc(next) || next < 2 || next >= self.bpb.count_of_clusters + 2 {
                break;
            }
            cluster = next;
        }

        Ok(extents)
    }
}

impl Filesystem for FatFs {
    fn type_name(&self) -> &'static str {
        match self.variant {
            Variant::Fat12 => "FAT12",
            Variant::Fat16 => "FAT16",
            Variant::Fat32 => "FAT32",
        }
    }

    fn open(&self, path: &str) -> FsResult<SharedReader> {
        let path = clean_path(path);
        if path == "." {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let entry = self.lookup(path)?;
        if entry.attr & ATTR_DIRECTORY != 0 {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let data = self.read_cluster_chain(entry.cluster, entry.size as u64)?;
        Ok(Arc::new(MemBackend::new(data)))
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let path = clean_path(path);
        if path == "." {
            return Ok(FileInfo::dir("."));
        }
        let entry = self.lookup(path)?;
        Ok(entry_info(&entry))
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let path = clean_path(path);
        let entries = if path == "." {
            self.read_root_dir()?
        } else {
            let entry = self.lookup(path)?;
            if entry.attr & ATTR_DIRECTORY == 0 {
                return Err(FsError::NotADirectory {
                    path: path.to_string(),
                });
            }
            self.read_dir_cluster(entry.cluster)?
        };

        Ok(entries
            .iter()
            .filter(|e| e.name != "." && e.name != "..")
            .map(entry_info)
            .collect())
    }

    fn free_ranges(&self) -> FsResult<Vec<Range>> {
        let mut ranges = Vec::new();
        let cluster_size = self.cluster_size();
        let mut run_start: Option<u64> = None;

        for cluster in 2..self.bpb.count_of_clusters + 2 {
            let free = self.next_cluster(cluster)? == 0;
            let offset = self.cluster_to_offset(cluster);

            match (free, run_start) {
                (true, None) => run_start = Some(offset),
                (false, Some(start)) => {
                    ranges.push(Range { start, end: offset });
                    run_start = None;
                }
                _ => {}
            }
        }

        if let Some(start) = run_start {
            let last = self.bpb.count_of_clusters + 2 - 1;
            ranges.push(Range {
                start,
                end: self.cluster_to_offset(last) + cluster_size,
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
        let entry = self.lookup(path)?;
        if entry.attr & ATTR_DIRECTORY != 0 {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        self.chain_extents(entry.cluster, entry.size as u64)
    }

    fn base_reader(&self) -> Option<SharedReader> {
        Some(self.r.clone())
    }
}

fn entry_info(e: &RawEntry) -> FileInfo {
    let is_dir = e.attr & ATTR_DIRECTORY != 0;
    let mut mode = 0o444;
    if is_dir {
        mode |= 0o111;
    }
    FileInfo {
        name: e.name.clone(),
        size: e.size as u64,
        is_dir,
        mode,
        mtime: e.mtime,
        inode: None,
    }
}

fn parse_dir_entries(data: &[u8]) -> Vec<RawEntry> {
    let mut entries = Vec::new();
    let mut lfn_parts: Vec<String> = Vec::new();

    for chunk in data.chunks_exact(32) {
        // First byte 0x00 ends the directory; 0xE5 marks a deleted entry.
        if chunk[0] == 0x00 {
            break;
        }
        if chunk[0] == 0xE5 {
            lfn_parts.clear();
            continue;
        }

        let attr = chunk[11];

        if attr == ATTR_LFN {
            if chunk[0] & 0x40 != 0 {
                lfn_parts.clear();
            }
            lfn_parts.insert(0, parse_lfn_entry(chunk));
            continue;
        }

        if attr & ATTR_VOLUME_ID != 0 {
            lfn_parts.clear();
            continue;
        }

        let mut cluster = LittleEndian::read_u16(&chunk[26..28]) as u32;
        // The high half of the start cluster only exists on FAT32, where
        // it is zero-filled on the other variants anyway.
        cluster |= (LittleEndian::read_u16(&chunk[20..22]) as u32) << 16;

        let mtime = dos_datetime(
            LittleEndian::read_u16(&chunk[24..26]),
            LittleEndian::read_u16(&chunk[22..24]),
        );

        let name = if lfn_parts.is_empty() {
            // 0x05 in the first byte stands in for a real 0xE5.
            let mut base: Vec<u8> = chunk[0..8].to_vec();
            if base[0] == 0x05 {
                base[0] = 0xE5;
            }
            let base = String::from_utf8_lossy(&base).trim_end().to_string();
            let ext = String::from_utf8_lossy(&chunk[8..11]).trim_end().to_string();
            let joined = if ext.is_empty() {
                base
            } else {
                format!("{base}.{ext}")
            };
            joined.to_lowercase()
        } else {
            lfn_parts.concat()
        };

        entries.push(RawEntry {
            name,
            attr,
            cluster,
            size: LittleEndian::read_u32(&chunk[28..32]),
            mtime,
        });
        lfn_parts.clear();
    }

    entries
}

/// A long-filename entry carries 13 UTF-16 code units at fixed offsets.
fn parse_lfn_entry(entry: &[u8]) -> String {
    let offsets = [
        1usize, 3, 5, 7, 9, // 5 units
        14, 16, 18, 20, 22, 24, // 6 units
        28, 30, // 2 units
    ];
    let mut units = Vec::with_capacity(13);
    for &o in &offsets {
        let c = LittleEndian::read_u16(&entry[o..o + 2]);
        if c == 0 || c == 0xFFFF {
            break;
        }
        units.push(c);
    }
    String::from_utf16_lossy(&units)
}

fn dos_datetime(date: u16, tim: u16) -> Option<OffsetDateTime> {
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let month = Month::try_from(((date >> 5) & 0x0F) as u8).ok()?;
    let day = (date & 0x1F) as u8;
    let hour = ((tim >> 11) & 0x1F) as u8;
    let minute = ((tim >> 5) & 0x3F) as u8;
    let second = ((tim & 0x1F) * 2) as u8;

    let date = Date::from_calendar_date(year, month, day).ok()?;
    let t = Time::from_hms(hour, minute, second).ok()?;
    Some(PrimitiveDateTime::new(date, t).assume_utc())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detect::{detect, FsKind};

    /// Build a small FAT32 volume with one file, HELLO.TXT, in the root.
    /// Layout mirrors the test images the project tooling generates.
    pub(crate) fn mkfat32(size: u64) -> Vec<u8> {
        const SECTOR: u32 = 512;
        const SPC: u32 = 8;
        const RESERVED: u32 = 32;
        const NUM_FATS: u32 = 2;

        let total_sectors = (size / SECTOR as u64) as u32;
        let data_sectors = total_sectors - RESERVED;
        let num_clusters = data_sectors / SPC;
        let fat_sectors = (num_clusters * 4 + SECTOR - 1) / SECTOR;

        let mut img = vec![0u8; size as usize];

        // BPB
        img[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        img[3..11].copy_from_slice(b"MSDOS5.0");
        LittleEndian::write_u16(&mut img[11..13], SECTOR as u16);
        img[13] = SPC as u8;
        LittleEndian::write_u16(&mut img[14..16], RESERVED as u16);
        img[16] = NUM_FATS as u8;
        img[21] = 0xF8;
        LittleEndian::write_u32(&mut img[32..36], total_sectors);
        LittleEndian::write_u32(&mut img[36..40], fat_sectors);
        LittleEndian::write_u32(&mut img[44..48], 2); // root cluster
        img[64] = 0x80;
        img[66] = 0x29;
        img[71..82].copy_from_slice(b"PARTITION1 ");
        img[82..90].copy_from_slice(b"FAT32   ");
        img[510] = 0x55;
        img[511] = 0xAA;

        // FAT: media, end-of-chain, root dir (cluster 2), file (cluster 3).
        let fat_off = (RESERVED * SECTOR) as usize;
        let mut fat = vec![0u8; (fat_sectors * SECTOR) as usize];
        LittleEndian::write_u32(&mut fat[0..4], 0x0FFF_FFF8);
        LittleEndian::write_u32(&mut fat[4..8], 0x0FFF_FFFF);
        LittleEndian::write_u32(&mut fat[8..12], 0x0FFF_FFFF);
        LittleEndian::write_u32(&mut fat[12..16], 0x0FFF_FFFF);
        img[fat_off..fat_off + fat.len()].copy_from_slice(&fat);
        let fat2_off = fat_off + fat.len();
        img[fat2_off..fat2_off + fat.len()].copy_from_slice(&fat);

        // Root directory at cluster 2.
        let root_sector = RESERVED + fat_sectors * NUM_FATS;
        let root_off = (root_sector * SECTOR) as usize;
        img[root_off..root_off + 11].copy_from_slice(b"PARTITION1 ");
        img[root_off + 11] = 0x08;
        let e = root_off + 32;
        img[e..e + 11].copy_from_slice(b"HELLO   TXT");
        img[e + 11] = 0x20;
        LittleEndian::write_u16(&mut img[e + 26..e + 28], 3);
        LittleEndian::write_u32(&mut img[e + 28..e + 32], 13);

        // File content at cluster 3.
        let file_off = root_off + (SPC * SECTOR) as usize;
        img[file_off..file_off + 13].copy_from_slice(b"Hello, MBR!\n\x00");

        img
    }

    fn open_fat32() -> FatFs {
        let img = mkfat32(32 * 1024 * 1024);
        FatFs::open(Arc::new(MemBackend::new(img))).unwrap()
    }

    #[test]
    fn test_detect_and_type() {
        let img = mkfat32(32 * 1024 * 1024);
        assert_eq!(detect(&MemBackend::new(img)).unwrap(), FsKind::Fat32);
        assert_eq!(open_fat32().type_name(), "FAT32");
    }

    #[test]
    fn test_read_dir_root() {
        let fs = open_fat32();
        let entries = fs.read_dir(".").unwrap();
        assert_eq!(entries.len(), 1);
        // 8.3 names without an LFN are reported lowercased.
        assert_eq!(entries[0].name, "hello.txt");
        assert!(!entries[0].is_dir);
        assert_eq!(entries[0].size, 13);
    }

    #[test]
    fn test_open_reads_contents() {
        let fs = open_fat32();
        let file = fs.open("hello.txt").unwrap();
        let mut buf = vec![0u8; 13];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"Hello, MBR!\n\x00");
    }

    #[test]
    fn test_file_extents_single() {
        let fs = open_fat32();
        let extents = fs.file_extents("hello.txt").unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].logical, 0);
        assert_eq!(extents[0].length, 13);

        // Streaming via extents equals streaming via open().
        let base = fs.base_reader().unwrap();
        let mut via_extents = vec![0u8; 13];
        base.read_exact_at(&mut via_extents, extents[0].physical)
            .unwrap();
        let mut via_open = vec![0u8; 13];
        fs.open("hello.txt")
            .unwrap()
            .read_exact_at(&mut via_open, 0)
            .unwrap();
        assert_eq!(via_extents, via_open);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let fs = open_fat32();
        assert_eq!(fs.stat("HELLO.TXT").unwrap().size, 13);
        assert_eq!(fs.stat("Hello.Txt").unwrap().size, 13);
    }

    #[test]
    fn test_not_found() {
        let fs = open_fat32();
        assert!(matches!(
            fs.stat("missing.txt"),
            Err(FsError::NotFound { .. })
        ));
        assert!(matches!(fs.open("."), Err(FsError::IsADirectory { .. })));
    }

    #[test]
    fn test_free_ranges_ordered() {
        let fs = open_fat32();
        let ranges = fs.free_ranges().unwrap();
        assert!(!ranges.is_empty());
        for w in ranges.windows(2) {
            assert!(w[0].end <= w[1].start);
        }
        for r in &ranges {
            assert!(r.end > r.start);
        }
        // Clusters 2 and 3 are allocated; free space starts at cluster 4.
        let first_free = fs.cluster_to_offset(4);
        assert_eq!(ranges[0].start, first_free);
    }

    #[test]
    fn test_lfn_parsing() {
        // One LFN entry (sequence 0x41 = last | first) followed by the 8.3
        // entry it names.
        let mut dir = vec![0u8; 64];
        dir[0] = 0x41;
        dir[11] = ATTR_LFN;
        let name: Vec<u16> = "Longname.dat".encode_utf16().collect();
        let offsets = [1usize, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
        for (i, &o) in offsets.iter().enumerate() {
            let c = if i < name.len() {
                name[i]
            } else if i == name.len() {
                0
            } else {
                0xFFFF
            };
            LittleEndian::write_u16(&mut dir[o..o + 2], c);
        }
        dir[32..43].copy_from_slice(b"LONGNA~1DAT");
        dir[43] = 0x20;
        LittleEndian::write_u32(&mut dir[60..64], 99);

        let entries = parse_dir_entries(&dir);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Longname.dat");
        assert_eq!(entries[0].size, 99);
    }

    #[test]
    fn test_dos_datetime() {
        // 2024-06-15 12:30:10
        let date = ((2024 - 1980) << 9) | (6 << 5) | 15;
        let tim = (12 << 11) | (30 << 5) | 5;
        let dt = dos_datetime(date, tim).unwrap();
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.month(), Month::June);
        assert_eq!(dt.day(), 15);
        assert_eq!(dt.hour(), 12);
        assert_eq!(dt.minute(), 30);
        assert_eq!(dt.second(), 10);

        // Zeroed fields are not a valid date.
        assert!(dos_datetime(0, 0).is_none());
    }
}
