//! Read-only ext2/ext3/ext4 support
//!
//! Parses the superblock and block-group descriptors, resolves inodes,
//! and maps file data through either the classic block-pointer tree or
//! the ext4 extent tree. File reads go through the extent map, so sparse
//! regions come back zero-filled without special casing.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use time::OffsetDateTime;

use crate::block::{BlockRead, SharedReader};
use crate::extent::{Extent, ExtentReader, Range};
use crate::fsys::{clean_path, FileInfo, FsError, FsResult, Filesystem};

const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_SIZE: usize = 1024;
const EXT_MAGIC: u16 = 0xEF53;
const EXTENT_MAGIC: u16 = 0xF30A;

const ROOT_INODE: u32 = 2;

const INODE_FLAG_EXTENTS: u32 = 0x0008_0000;
const FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
const FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
const FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const S_IFREG: u16 = 0x8000;

#[derive(Debug, Clone)]
struct Superblock {
    blocks_count: u64,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: u16,
    feature_compat: u32,
    feature_incompat: u32,
    desc_size: u16,
    group_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct GroupDescriptor {
    block_bitmap: u64,
    inode_table: u64,
}

#[derive(Debug, Clone)]
struct Inode {
    mode: u16,
    size: u64,
    mtime: u32,
    flags: u32,
    block: [u8; 60],
}

impl Inode {
    fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

#[derive(Debug, Clone)]
struct ExtDirEntry {
    inode: u32,
    file_type: u8,
    name: String,
}

/// A read-only ext2/3/4 filesystem.
pub struct ExtFs {
    r: SharedReader,
    sb: Superblock,
    block_size: u64,
    kind: &'static str,
}

impl ExtFs {
    pub fn open(r: SharedReader) -> FsResult<Self> {
        let mut data = vec![0u8; SUPERBLOCK_SIZE];
        r.read_exact_at(&mut data, SUPERBLOCK_OFFSET)?;

        if LittleEndian::read_u16(&data[0x38..0x3A]) != EXT_MAGIC {
            return Err(FsError::Corrupt("bad ext superblock magic".to_string()));
        }

        let mut sb = Superblock {
            blocks_count: LittleEndian::read_u32(&data[0x04..0x08]) as u64,
            first_data_block: LittleEndian::read_u32(&data[0x14..0x18]),
            blocks_per_group: LittleEndian::read_u32(&data[0x20..0x24]),
            inodes_per_group: LittleEndian::read_u32(&data[0x28..0x2C]),
            inode_size: LittleEndian::read_u16(&data[0x58..0x5A]),
            feature_compat: LittleEndian::read_u32(&data[0x5C..0x60]),
            feature_incompat: LittleEndian::read_u32(&data[0x60..0x64]),
            desc_size: 32,
            group_count: 0,
        };

        let rev_level = LittleEndian::read_u32(&data[0x4C..0x50]);
        if rev_level == 0 {
            sb.inode_size = 128;
        }

        let log_block_size = LittleEndian::read_u32(&data[0x18..0x1C]);
        let block_size = 1024u64 << log_block_size;

        if sb.feature_incompat & FEATURE_INCOMPAT_64BIT != 0 {
            sb.desc_size = LittleEndian::read_u16(&data[0xFE..0x100]);
            if sb.desc_size == 0 {
                sb.desc_size = 64;
            }
            let high = LittleEndian::read_u32(&data[0x150..0x154]);
            sb.blocks_count |= (high as u64) << 32;
        }

        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
            return Err(FsError::Corrupt("invalid ext group geometry".to_string()));
        }

        sb.group_count = ((sb.blocks_count - sb.first_data_block as u64
            + sb.blocks_per_group as u64
            - 1)
            / sb.blocks_per_group as u64) as u32;

        let kind = if sb.feature_incompat & (FEATURE_INCOMPAT_EXTENTS | FEATURE_INCOMPAT_64BIT) != 0
        {
            "ext4"
        } else if sb.feature_compat & FEATURE_COMPAT_HAS_JOURNAL != 0 {
            "ext3"
        } else {
            "ext2"
        };

        Ok(Self {
            r,
            sb,
            block_size,
            kind,
        })
    }

    fn block_offset(&self, block: u64) -> u64 {
        block * self.block_size
    }

    fn read_block(&self, block: u64) -> FsResult<Vec<u8>> {
        let mut data = vec![0u8; self.block_size as usize];
        self.r.read_exact_at(&mut data, self.block_offset(block))?;
        Ok(data)
    }

    fn read_group_descriptor(&self, group: u32) -> FsResult<GroupDescriptor> {
        // The descriptor table starts in the block after the superblock.
        let desc_block = self.sb.first_data_block as u64 + 1;
        let offset = self.block_offset(desc_block) + group as u64 * self.sb.desc_size as u64;

        let mut data = vec![0u8; self.sb.desc_size as usize];
        self.r.read_exact_at(&mut data, offset)?;

        let mut bgd = GroupDescriptor {
            block_bitmap: LittleEndian::read_u32(&data[0x00..0x04]) as u64,
            inode_table: LittleEndian::read_u32(&data[0x08..0x0C]) as u64,
        };

        if self.sb.feature_incompat & FEATURE_INCOMPAT_64BIT != 0 && self.sb.desc_size >= 64 {
            bgd.block_bitmap |= (LittleEndian::read_u32(&data[0x20..0x24]) as u64) << 32;
            bgd.inode_table |= (LittleEndian::read_u32(&data[0x28..0x2C]) as u64) << 32;
        }

        Ok(bgd)
    }

    fn read_inode(&self, inode_num: u32) -> FsResult<Inode> {
        if inode_num == 0 {
            return Err(FsError::Corrupt("inode number 0".to_string()));
        }

        let group = (inode_num - 1) / self.sb.inodes_per_group;
        let index = (inode_num - 1) % self.sb.inodes_per_group;
        let bgd = self.read_group_descriptor(group)?;

        let offset =
            self.block_offset(bgd.inode_table) + index as u64 * self.sb.inode_size as u64;
        let mut data = vec![0u8; self.sb.inode_size as usize];
        self.r.read_exact_at(&mut data, offset)?;

        let mode = LittleEndian::read_u16(&data[0x00..0x02]);
        let mut size = LittleEndian::read_u32(&data[0x04..0x08]) as u64;
        let mut block = [0u8; 60];
        block.copy_from_slice(&data[0x28..0x64]);

        // The high size word is valid for regular files and directories.
        if mode & S_IFMT == S_IFREG || mode & S_IFMT == S_IFDIR {
            size |= (LittleEndian::read_u32(&data[0x6C..0x70]) as u64) << 32;
        }

        Ok(Inode {
            mode,
            size,
            mtime: LittleEndian::read_u32(&data[0x10..0x14]),
            flags: LittleEndian::read_u32(&data[0x20..0x24]),
            block,
        })
    }

    /// Map an inode's data to image extents, coalescing contiguous blocks
    /// and truncating the tail to the file size.
    fn inode_extents(&self, ino: &Inode) -> FsResult<Vec<Extent>> {
        if ino.flags & INODE_FLAG_EXTENTS != 0 {
            self.extent_tree_extents(ino)
        } else {
            self.block_pointer_extents(ino)
        }
    }

    fn extent_tree_extents(&self, ino: &Inode) -> FsResult<Vec<Extent>> {
        let mut leaves = Vec::new();
        self.walk_extent_tree(&ino.block, &mut leaves)?;

        let mut extents = Vec::new();
        for (logical_block, start_block, len_blocks) in leaves {
            let logical = logical_block * self.block_size;
            if logical >= ino.size {
                continue;
            }
            let length = (len_blocks as u64 * self.block_size).min(ino.size - logical);
            extents.push(Extent {
                logical,
                physical: start_block * self.block_size,
                length,
            });
        }
        extents.sort_by_key(|e| e.logical);
        Ok(extents)
    }

    fn walk_extent_tree(
        &self,
        node: &[u8],
        out: &mut Vec<(u64, u64, u16)>,
    ) -> FsResult<()> {
        if node.len() < 12 {
            return Err(FsError::Corrupt("extent node too small".to_string()));
        }
        let magic = LittleEndian::read_u16(&node[0..2]);
        if magic != EXTENT_MAGIC {
            return Err(FsError::Corrupt(format!(
                "invalid extent magic: {magic:#06x}"
            )));
        }
        let entries = LittleEndian::read_u16(&node[2..4]) as usize;
        let depth = LittleEndian::read_u16(&node[6..8]);

        for i in 0..entries {
            let off = 12 + i * 12;
            if off + 12 > node.len() {
                return Err(FsError::Corrupt("extent node truncated".to_string()));
            }
            let rec = &node[off..off + 12];

            if depth == 0 {
                let logical_block = LittleEndian::read_u32(&rec[0..4]) as u64;
                let mut len = LittleEndian::read_u16(&rec[4..6]);
                // Lengths above 0x8000 mark uninitialized extents.
                if len > 0x8000 {
                    len -= 0x8000;
                }
                let start_hi = LittleEndian::read_u16(&rec[6..8]) as u64;
                let start_lo = LittleEndian::read_u32(&rec[8..12]) as u64;
                out.push((logical_block, start_lo | (start_hi << 32), len));
            } else {
                let leaf_lo = LittleEndian::read_u32(&rec[4..8]) as u64;
                let leaf_hi = LittleEndian::read_u16(&rec[8..10]) as u64;
                let child = self.read_block(leaf_lo | (leaf_hi << 32))?;
                self.walk_extent_tree(&child, out)?;
            }
        }

        Ok(())
    }

    fn block_pointer_extents(&self, ino: &Inode) -> FsResult<Vec<Extent>> {
        let mut extents: Vec<Extent> = Vec::new();
        let mut logical = 0u64;
        let mut remaining = ino.size;
        let block_size = self.block_size;

        let mut add_block = |block_num: u64, extents: &mut Vec<Extent>| {
            if remaining == 0 {
                return;
            }
            let length = block_size.min(remaining);
            if block_num != 0 {
                let physical = block_num * block_size;
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
            }
            // A zero pointer is a hole: the logical cursor still advances.
            logical += length;
            remaining -= length;
        };

        for i in 0..12 {
            let ptr = LittleEndian::read_u32(&ino.block[i * 4..(i + 1) * 4]) as u64;
            add_block(ptr, &mut extents);
        }

        for (slot, level) in [(12usize, 1u32), (13, 2), (14, 3)] {
            let ptr = LittleEndian::read_u32(&ino.block[slot * 4..(slot + 1) * 4]) as u64;
            if ptr != 0 {
                self.walk_indirect(ptr, level, &mut add_block, &mut extents)?;
            }
        }

        Ok(extents)
    }

    fn walk_indirect(
        &self,
        block: u64,
        level: u32,
        add_block: &mut dyn FnMut(u64, &mut Vec<Extent>),
        extents: &mut Vec<Extent>,
    ) -> FsResult<()> {
        let data = self.read_block(block)?;
        for chunk in data.chunks_exact(4) {
            let ptr = LittleEndian::read_u32(chunk) as u64;
            if level == 1 {
                add_block(ptr, extents);
            } else if ptr != 0 {
                self.walk_indirect(ptr, level - 1, add_block, extents)?;
            }
        }
        Ok(())
    }

    /// A reader over an inode's data; holes read as zeros.
    fn inode_reader(&self, ino: &Inode) -> FsResult<SharedReader> {
        let extents = self.inode_extents(ino)?;
        Ok(Arc::new(ExtentReader::new(
            self.r.clone(),
            extents,
            ino.size,
        )))
    }

    fn read_directory(&self, ino: &Inode) -> FsResult<Vec<ExtDirEntry>> {
        let reader = self.inode_reader(ino)?;
        let mut data = vec![0u8; ino.size as usize];
        reader.read_exact_at(&mut data, 0)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;

        while offset + 8 <= data.len() {
            let inode = LittleEndian::read_u32(&data[offset..offset + 4]);
            let rec_len = LittleEndian::read_u16(&data[offset + 4..offset + 6]) as usize;
            let name_len = data[offset + 6] as usize;
            let file_type = data[offset + 7];

            if rec_len < 8 {
                break;
            }

            if inode != 0 && name_len > 0 {
                let end = (offset + 8 + name_len).min(data.len());
                let name = String::from_utf8_lossy(&data[offset + 8..end]).to_string();
                entries.push(ExtDirEntry {
                    inode,
                    file_type,
                    name,
                });
            }

            offset += rec_len;
        }

        Ok(entries)
    }

    fn lookup(&self, path: &str) -> FsResult<(u32, Inode)> {
        let mut current = ROOT_INODE;

        for part in path.split('/') {
            let ino = self.read_inode(current)?;
            if !ino.is_dir() {
                return Err(FsError::NotADirectory {
                    path: path.to_string(),
                });
            }
            let entries = self.read_directory(&ino)?;
            current = entries
                .iter()
                .find(|e| e.name == part)
                .map(|e| e.inode)
                .ok_or_else(|| FsError::not_found(path))?;
        }

        let ino = self.read_inode(current)?;
        Ok((current, ino))
    }

    fn info_for(&self, name: &str, inode_num: u32, ino: &Inode) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size: ino.size,
            is_dir: ino.is_dir(),
            mode: ino.mode as u32 & 0o7777,
            mtime: OffsetDateTime::from_unix_timestamp(ino.mtime as i64).ok(),
            inode: Some(inode_num as u64),
        }
    }
}

impl Filesystem for ExtFs {
    fn type_name(&self) -> &'static str {
        self.kind
    }

    fn open(&self, path: &str) -> FsResult<SharedReader> {
        let path = clean_path(path);
        if path == "." {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let (_, ino) = self.lookup(path)?;
        if ino.is_dir() {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        self.inode_reader(&ino)
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let path = clean_path(path);
        if path == "." {
            let ino = self.read_inode(ROOT_INODE)?;
            return Ok(self.info_for(".", ROOT_INODE, &ino));
        }
        let (num, ino) = self.lookup(path)?;
        let name = path.rsplit('/').next().unwrap_or(path);
        Ok(self.info_for(name, num, &ino))
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let path = clean_path(path);
        let (_, ino) = if path == "." {
            (ROOT_INODE, self.read_inode(ROOT_INODE)?)
        } else {
            self.lookup(path)?
        };
        if !ino.is_dir() {
            return Err(FsError::NotADirectory {
                path: path.to_string(),
            });
        }

        let mut out = Vec::new();
        for e in self.read_directory(&ino)? {
            if e.name == "." || e.name == ".." {
                continue;
            }
            let child = self.read_inode(e.inode)?;
            let mut info = self.info_for(&e.name, e.inode, &child);
            // The directory record carries its own type tag; trust it for
            // the directory bit when the inode disagrees.
            info.is_dir = info.is_dir || e.file_type == 2;
            out.push(info);
        }
        Ok(out)
    }

    fn free_ranges(&self) -> FsResult<Vec<Range>> {
        let mut ranges: Vec<Range> = Vec::new();

        for group in 0..self.sb.group_count {
            let bgd = self.read_group_descriptor(group)?;
            let bitmap = self.read_block(bgd.block_bitmap)?;

            let first_block = self.sb.first_data_block as u64
                + group as u64 * self.sb.blocks_per_group as u64;
            let blocks_in_group = (self.sb.blocks_per_group as u64)
                .min(self.sb.blocks_count.saturating_sub(first_block));

            let mut run_start: Option<u64> = None;
            for i in 0..blocks_in_group {
                let byte = (i / 8) as usize;
                if byte >= bitmap.len() {
                    break;
                }
                // Bit clear means the block is free.
                let free = bitmap[byte] & (1 << (i % 8)) == 0;
                let offset = (first_block + i) * self.block_size;

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
                ranges.push(Range {
                    start,
                    end: (first_block + blocks_in_group) * self.block_size,
                });
            }
        }

        Ok(merge_ranges(ranges))
    }

    fn file_extents(&self, path: &str) -> FsResult<Vec<Extent>> {
        let path = clean_path(path);
        if path == "." {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let (_, ino) = self.lookup(path)?;
        if ino.is_dir() {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        self.inode_extents(&ino)
    }

    fn base_reader(&self) -> Option<SharedReader> {
        Some(self.r.clone())
    }
}

/// Merge ranges that touch across block-group boundaries.
fn merge_ranges(ranges: Vec<Range>) -> Vec<Range> {
    if ranges.len() <= 1 {
        return ranges;
    }
    let mut merged = Vec::with_capacity(ranges.len());
    let mut current = ranges[0];
    for r in &ranges[1..] {
        if r.start == current.end {
            current.end = r.end;
        } else {
            merged.push(current);
            current = *r;
        }
    }
    merged.push(current);
    merged
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::block::MemBackend;
    use crate::detect::{detect, FsKind};

    const BS: usize = 1024;

    fn put_inode(img: &mut [u8], num: u32, mode: u16, size: u32, blocks: &[u32]) {
        let off = 5 * BS + (num as usize - 1) * 128;
        LittleEndian::write_u16(&mut img[off..off + 2], mode);
        LittleEndian::write_u32(&mut img[off + 4..off + 8], size);
        LittleEndian::write_u32(&mut img[off + 0x10..off + 0x14], 1_700_000_000); // mtime
        for (i, b) in blocks.iter().enumerate() {
            let p = off + 0x28 + i * 4;
            LittleEndian::write_u32(&mut img[p..p + 4], *b);
        }
    }

    fn put_dirent(block: &mut [u8], off: usize, inode: u32, rec_len: u16, ftype: u8, name: &str) {
        LittleEndian::write_u32(&mut block[off..off + 4], inode);
        LittleEndian::write_u16(&mut block[off + 4..off + 6], rec_len);
        block[off + 6] = name.len() as u8;
        block[off + 7] = ftype;
        block[off + 8..off + 8 + name.len()].copy_from_slice(name.as_bytes());
    }

    /// A 64-block ext2 image with a small file ("hello.txt", direct
    /// blocks) and a 13-block file ("big.bin") that spills into a
    /// single-indirect block.
    pub(crate) fn mk_ext2() -> Vec<u8> {
        let mut img = vec![0u8; 64 * BS];

        // Superblock at byte 1024.
        let sb = 1024;
        LittleEndian::write_u32(&mut img[sb..sb + 4], 16); // inodes
        LittleEndian::write_u32(&mut img[sb + 0x04..sb + 0x08], 64); // blocks
        LittleEndian::write_u32(&mut img[sb + 0x14..sb + 0x18], 1); // first data block
        LittleEndian::write_u32(&mut img[sb + 0x18..sb + 0x1C], 0); // log block size
        LittleEndian::write_u32(&mut img[sb + 0x20..sb + 0x24], 64); // blocks/group
        LittleEndian::write_u32(&mut img[sb + 0x28..sb + 0x2C], 16); // inodes/group
        LittleEndian::write_u16(&mut img[sb + 0x38..sb + 0x3A], EXT_MAGIC);

        // Group descriptor at block 2: bitmap 3, inode bitmap 4, table 5.
        let gd = 2 * BS;
        LittleEndian::write_u32(&mut img[gd..gd + 4], 3);
        LittleEndian::write_u32(&mut img[gd + 4..gd + 8], 4);
        LittleEndian::write_u32(&mut img[gd + 8..gd + 12], 5);

        // Block bitmap: blocks 1-8 and 10-23 in use (bit i = block 1+i).
        for block in (1..=8).chain(10..=23) {
            let bit = block - 1;
            img[3 * BS + bit / 8] |= 1 << (bit % 8);
        }

        // Root inode (#2): directory, one block at 7.
        put_inode(&mut img, 2, 0x41ED, BS as u32, &[7]);
        // hello.txt (#12): 13 bytes in block 8.
        put_inode(&mut img, 12, 0x81A4, 13, &[8]);
        // big.bin (#13): 13 blocks, 12 direct (10..=21) + indirect at 22.
        let mut big_blocks: Vec<u32> = (10..=21).collect();
        big_blocks.push(22);
        put_inode(&mut img, 13, 0x81A4, (13 * BS) as u32, &big_blocks);
        // Indirect block 22 points at block 23.
        LittleEndian::write_u32(&mut img[22 * BS..22 * BS + 4], 23);

        // Root directory entries in block 7.
        let root = 7 * BS;
        put_dirent(&mut img[root..root + BS], 0, 2, 12, 2, ".");
        put_dirent(&mut img[root..root + BS], 12, 2, 12, 2, "..");
        put_dirent(&mut img[root..root + BS], 24, 12, 24, 1, "hello.txt");
        put_dirent(&mut img[root..root + BS], 48, 13, (BS - 48) as u16, 1, "big.bin");

        // File contents.
        img[8 * BS..8 * BS + 13].copy_from_slice(b"Hello, ext2!\n");
        for (i, block) in (10..=21).chain([23]).enumerate() {
            let val = (i + 1) as u8;
            img[block * BS..(block + 1) * BS].fill(val);
        }

        img
    }

    fn open_ext2() -> ExtFs {
        ExtFs::open(Arc::new(MemBackend::new(mk_ext2()))).unwrap()
    }

    #[test]
    fn test_detect_and_type() {
        assert_eq!(detect(&MemBackend::new(mk_ext2())).unwrap(), FsKind::Ext2);
        assert_eq!(open_ext2().type_name(), "ext2");
    }

    #[test]
    fn test_read_dir_root() {
        let fs = open_ext2();
        let entries = fs.read_dir(".").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["hello.txt", "big.bin"]);
        assert_eq!(entries[0].size, 13);
        assert_eq!(entries[0].inode, Some(12));
    }

    #[test]
    fn test_open_small_file() {
        let fs = open_ext2();
        let f = fs.open("hello.txt").unwrap();
        let mut buf = vec![0u8; 13];
        f.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"Hello, ext2!\n");
    }

    #[test]
    fn test_file_extents_small() {
        let fs = open_ext2();
        let extents = fs.file_extents("hello.txt").unwrap();
        assert_eq!(
            extents,
            vec![Extent {
                logical: 0,
                physical: 8 * BS as u64,
                length: 13
            }]
        );
    }

    #[test]
    fn test_file_extents_indirect_coalesced() {
        let fs = open_ext2();
        let extents = fs.file_extents("big.bin").unwrap();
        // Direct blocks 10..=21 coalesce; the 13th block sits at 23,
        // separated by the indirect pointer block.
        assert_eq!(
            extents,
            vec![
                Extent {
                    logical: 0,
                    physical: 10 * BS as u64,
                    length: 12 * BS as u64
                },
                Extent {
                    logical: 12 * BS as u64,
                    physical: 23 * BS as u64,
                    length: BS as u64
                },
            ]
        );
    }

    #[test]
    fn test_open_matches_extent_streaming() {
        let fs = open_ext2();
        let size = fs.stat("big.bin").unwrap().size;
        let mut via_open = vec![0u8; size as usize];
        fs.open("big.bin")
            .unwrap()
            .read_exact_at(&mut via_open, 0)
            .unwrap();

        let base = fs.base_reader().unwrap();
        let reader = ExtentReader::new(base, fs.file_extents("big.bin").unwrap(), size);
        let mut via_extents = vec![0u8; size as usize];
        reader.read_exact_at(&mut via_extents, 0).unwrap();

        assert_eq!(via_open, via_extents);
        assert_eq!(via_open[0], 1);
        assert_eq!(via_open[12 * BS], 13);
    }

    #[test]
    fn test_free_ranges() {
        let fs = open_ext2();
        let ranges = fs.free_ranges().unwrap();
        // Block 9 is free between the two allocated runs; 24..63 trail.
        assert_eq!(
            ranges,
            vec![
                Range {
                    start: 9 * BS as u64,
                    end: 10 * BS as u64
                },
                Range {
                    start: 24 * BS as u64,
                    end: 64 * BS as u64
                },
            ]
        );
    }

    #[test]
    fn test_extent_tree_mapping() {
        let fs = open_ext2();

        // Handmade ext4-style inode: one uninitialized leaf of 2 blocks.
        let mut block = [0u8; 60];
        LittleEndian::write_u16(&mut block[0..2], EXTENT_MAGIC);
        LittleEndian::write_u16(&mut block[2..4], 1); // entries
        LittleEndian::write_u16(&mut block[6..8], 0); // depth
        LittleEndian::write_u32(&mut block[12..16], 0); // logical block
        LittleEndian::write_u16(&mut block[16..18], 0x8000 + 2); // len, uninitialized
        LittleEndian::write_u16(&mut block[18..20], 0); // start hi
        LittleEndian::write_u32(&mut block[20..24], 40); // start lo
        let ino = Inode {
            mode: 0x81A4,
            size: 2000,
            mtime: 0,
            flags: INODE_FLAG_EXTENTS,
            block,
        };

        let extents = fs.inode_extents(&ino).unwrap();
        assert_eq!(
            extents,
            vec![Extent {
                logical: 0,
                physical: 40 * BS as u64,
                length: 2000
            }]
        );

        // A wrong magic is corruption, not a silent empty map.
        let mut bad = ino.clone();
        LittleEndian::write_u16(&mut bad.block[0..2], 0x1234);
        assert!(matches!(fs.inode_extents(&bad), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn test_not_found() {
        let fs = open_ext2();
        assert!(matches!(
            fs.stat("nope"),
            Err(FsError::NotFound { .. })
        ));
        assert!(matches!(
            fs.open("hello.txt/x"),
            Err(FsError::NotADirectory { .. })
        ));
    }
}
