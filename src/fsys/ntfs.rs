//! Read-only NTFS support
//!
//! Bootstraps by reading MFT record 0 straight from the boot sector's
//! MFT cluster, materializing the whole MFT through that record's own
//! runlist, and serving every later record from the cached copy. Every
//! MFT and INDX block goes through update-sequence fixup before any
//! field is trusted; a fixup mismatch is treated as corruption.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use time::OffsetDateTime;

use crate::block::{BlockRead, MemBackend, SharedReader};
use crate::extent::{compose, Extent};
use crate::fsys::{clean_path, FileInfo, FsError, FsResult, Filesystem};

const NTFS_MAGIC: &[u8; 8] = b"NTFS    ";

const MFT_RECORD_ROOT: u64 = 5;

const MFT_FLAG_DIRECTORY: u16 = 0x02;

const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_INDEX_ROOT: u32 = 0x90;
const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
const ATTR_END: u32 = 0xFFFF_FFFF;

const FILE_NAME_DOS: u8 = 2;

const FILE_ATTR_DIRECTORY: u32 = 0x1000_0000;

const MFT_REF_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// 100 ns intervals between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_DIFF: u64 = 116_444_736_000_000_000;

#[derive(Debug)]
struct MftRecord {
    attr_offset: u16,
    flags: u16,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Attr {
    attr_type: u32,
    non_resident: bool,
    name: String,
    /// Resident value bytes.
    value: Vec<u8>,
    /// Offset of the resident value within its MFT record.
    value_record_offset: usize,
    start_vcn: u64,
    runs: Vec<DataRun>,
    real_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataRun {
    /// Run length in clusters.
    length: u64,
    /// Starting LCN; meaningless when sparse.
    lcn: u64,
    sparse: bool,
}

#[derive(Debug, Clone)]
struct FileNameAttr {
    real_size: u64,
    flags: u32,
    name_type: u8,
    name: String,
    mtime: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    mft_ref: u64,
    file_name: Option<FileNameAttr>,
}

struct MftCache {
    data: Arc<Vec<u8>>,
    extents: Vec<Extent>,
}

/// A read-only NTFS filesystem.
pub struct NtfsFs {
    r: SharedReader,
    cluster_size: u64,
    mft_cluster: u64,
    mft_record_size: u32,
    index_record_size: u32,
    mft: Mutex<Option<Arc<MftCache>>>,
}

impl NtfsFs {
    pub fn open(r: SharedReader) -> FsResult<Self> {
        let mut header = [0u8; 512];
        r.read_exact_at(&mut header, 0)?;

        if &header[3..11] != NTFS_MAGIC {
            return Err(FsError::Corrupt("missing NTFS signature".to_string()));
        }

        let bytes_per_sector = LittleEndian::read_u16(&header[0x0B..0x0D]);
        let sectors_per_cluster = header[0x0D];
        let mft_cluster = LittleEndian::read_u64(&header[0x30..0x38]);

        if bytes_per_sector == 0 || sectors_per_cluster == 0 {
            return Err(FsError::Corrupt("invalid NTFS geometry".to_string()));
        }
        let cluster_size = bytes_per_sector as u64 * sectors_per_cluster as u64;

        // Negative size bytes encode a power of two; positive ones count
        // clusters.
        let size_of = |raw: u8| -> u32 {
            let v = raw as i8;
            if v > 0 {
                v as u32 * cluster_size as u32
            } else {
                1 << (-v as u32)
            }
        };
        let mft_record_size = size_of(header[0x40]);
        let index_record_size = size_of(header[0x44]);

        Ok(Self {
            r,
            cluster_size,
            mft_cluster,
            mft_record_size,
            index_record_size,
            mft: Mutex::new(None),
        })
    }

    fn parse_record(&self, mut data: Vec<u8>) -> FsResult<MftRecord> {
        if data.len() < 42 {
            return Err(FsError::Corrupt("MFT record too small".to_string()));
        }
        if &data[0..4] != b"FILE" {
            return Err(FsError::Corrupt(format!(
                "invalid MFT record signature {:?}",
                &data[0..4]
            )));
        }

        let usa_offset = LittleEndian::read_u16(&data[4..6]);
        let usa_count = LittleEndian::read_u16(&data[6..8]);
        let attr_offset = LittleEndian::read_u16(&data[20..22]);
        let flags = LittleEndian::read_u16(&data[22..24]);

        apply_fixup(&mut data, usa_offset, usa_count)?;

        Ok(MftRecord {
            attr_offset,
            flags,
            data,
        })
    }

    fn read_record_raw(&self, record_num: u64) -> FsResult<MftRecord> {
        let offset =
            self.mft_cluster * self.cluster_size + record_num * self.mft_record_size as u64;
        let mut data = vec![0u8; self.mft_record_size as usize];
        self.r.read_exact_at(&mut data, offset)?;
        self.parse_record(data)
    }

    /// The cached MFT file: its raw bytes plus the extent map they came
    /// from, built once from record 0's unnamed $DATA runlist.
    fn mft(&self) -> FsResult<Arc<MftCache>> {
        let mut guard = self.mft.lock().unwrap();
        if let Some(cache) = guard.as_ref() {
            return Ok(cache.clone());
        }

        let rec = self.read_record_raw(0)?;
        let attrs = self.parse_attributes(&rec)?;
        let data_attr = attrs
            .iter()
            .find(|a| a.attr_type == ATTR_DATA && a.name.is_empty())
            .ok_or_else(|| FsError::Corrupt("MFT $DATA attribute not found".to_string()))?;

        let data = self.read_attr_data(data_attr)?;
        let extents = self.runs_to_extents(data_attr);
        log::debug!(
            "loaded MFT: {} bytes, {} extents",
            data.len(),
            extents.len()
        );

        let cache = Arc::new(MftCache {
            data: Arc::new(data),
            extents,
        });
        *guard = Some(cache.clone());
        Ok(cache)
    }

    fn read_record(&self, record_num: u64) -> FsResult<MftRecord> {
        let mft = self.mft()?;
        let rs = self.mft_record_size as usize;
        let off = record_num as usize * rs;
        if off + rs > mft.data.len() {
            return Err(FsError::Corrupt(format!(
                "MFT record {record_num} out of range"
            )));
        }
        self.parse_record(mft.data[off..off + rs].to_vec())
    }

    fn parse_attributes(&self, rec: &MftRecord) -> FsResult<Vec<Attr>> {
        let data = &rec.data;
        let mut attrs = Vec::new();
        let mut offset = rec.attr_offset as usize;

        while offset + 4 <= data.len() {
            let attr_type = LittleEndian::read_u32(&data[offset..offset + 4]);
            if attr_type == ATTR_END {
                break;
            }
            if offset + 16 > data.len() {
                break;
            }

            let length = LittleEndian::read_u32(&data[offset + 4..offset + 8]) as usize;
            if length == 0 || length > data.len() - offset {
                break;
            }

            let non_resident = data[offset + 8] != 0;
            let name_length = data[offset + 9] as usize;
            let name_offset = LittleEndian::read_u16(&data[offset + 10..offset + 12]) as usize;

            let mut attr = Attr {
                attr_type,
                non_resident,
                name: String::new(),
                value: Vec::new(),
                value_record_offset: 0,
                start_vcn: 0,
                runs: Vec::new(),
                real_size: 0,
            };

            if name_length > 0 {
                let start = offset + name_offset;
                let end = start + name_length * 2;
                if end <= data.len() {
                    attr.name = utf16le_string(&data[start..end]);
                }
            }

            if non_resident {
                if offset + 64 <= data.len() {
                    attr.start_vcn = LittleEndian::read_u64(&data[offset + 16..offset + 24]);
                    let runs_offset =
                        LittleEndian::read_u16(&data[offset + 32..offset + 34]) as usize;
                    attr.real_size = LittleEndian::read_u64(&data[offset + 48..offset + 56]);
                    if runs_offset <= length {
                        attr.runs = parse_data_runs(&data[offset + runs_offset..offset + length]);
                    }
                }
            } else if offset + 24 <= data.len() {
                let value_length =
                    LittleEndian::read_u32(&data[offset + 16..offset + 20]) as usize;
                let value_offset =
                    LittleEndian::read_u16(&data[offset + 20..offset + 22]) as usize;
                let start = offset + value_offset;
                let end = start + value_length;
                if end <= data.len() {
                    attr.value = data[start..end].to_vec();
                    attr.value_record_offset = start;
                    attr.real_size = value_length as u64;
                }
            }

            attrs.push(attr);
            offset += length;
        }

        Ok(attrs)
    }

    fn read_attr_data(&self, attr: &Attr) -> FsResult<Vec<u8>> {
        if !attr.non_resident {
            return Ok(attr.value.clone());
        }

        let cs = self.cluster_size as usize;
        let mut data = Vec::new();
        for run in &attr.runs {
            let run_len = run.length as usize * cs;
            if run.sparse {
                data.resize(data.len() + run_len, 0);
            } else {
                let mut buf = vec![0u8; run_len];
                self.r
                    .read_exact_at(&mut buf, run.lcn * self.cluster_size)?;
                data.extend_from_slice(&buf);
            }
        }

        if data.len() as u64 > attr.real_size {
            data.truncate(attr.real_size as usize);
        }
        Ok(data)
    }

    /// Convert a non-resident attribute's runlist into byte extents,
    /// sparse runs becoming holes, truncated to the real size.
    fn runs_to_extents(&self, attr: &Attr) -> Vec<Extent> {
        let cs = self.cluster_size;
        let mut extents = Vec::new();
        let mut logical = attr.start_vcn * cs;

        for run in &attr.runs {
            let run_bytes = run.length * cs;
            if !run.sparse && logical < attr.real_size {
                extents.push(Extent {
                    logical,
                    physical: run.lcn * cs,
                    length: run_bytes.min(attr.real_size - logical),
                });
            }
            logical += run_bytes;
        }

        extents
    }

    fn read_directory(&self, record_num: u64) -> FsResult<Vec<IndexEntry>> {
        let rec = self.read_record(record_num)?;
        let attrs = self.parse_attributes(&rec)?;
        let mut entries = Vec::new();

        for attr in &attrs {
            if attr.attr_type == ATTR_INDEX_ROOT && attr.name == "$I30" {
                entries.extend(parse_index_root(&attr.value)?);
            }
        }
        for attr in &attrs {
            if attr.attr_type == ATTR_INDEX_ALLOCATION && attr.name == "$I30" {
                let data = self.read_attr_data(attr)?;
                entries.extend(self.parse_index_allocation(&data)?);
            }
        }

        Ok(entries)
    }

    fn parse_index_allocation(&self, data: &[u8]) -> FsResult<Vec<IndexEntry>> {
        let block_size = self.index_record_size as usize;
        let mut entries = Vec::new();

        for block in data.chunks_exact(block_size) {
            if &block[0..4] != b"INDX" {
                continue;
            }
            let mut block = block.to_vec();
            let usa_offset = LittleEndian::read_u16(&block[4..6]);
            let usa_count = LittleEndian::read_u16(&block[6..8]);
            apply_fixup(&mut block, usa_offset, usa_count)?;

            // Index node header sits at offset 24 inside an INDX block.
            let entries_offset = LittleEndian::read_u32(&block[24..28]) as usize;
            if 24 + entries_offset < block.len() {
                entries.extend(parse_index_entries(&block[24 + entries_offset..]));
            }
        }

        Ok(entries)
    }

    fn lookup(&self, path: &str) -> FsResult<(u64, MftRecord, Option<FileNameAttr>)> {
        let mut current = MFT_RECORD_ROOT;
        let mut last_fn: Option<FileNameAttr> = None;

        for part in path.split('/') {
            let want = part.to_lowercase();
            let entries = self.read_directory(current)?;

            let hit = entries.iter().find(|e| {
                e.file_name.as_ref().is_some_and(|f| {
                    f.name_type != FILE_NAME_DOS && f.name.to_lowercase() == want
                })
            });

            match hit {
                Some(e) => {
                    current = e.mft_ref & MFT_REF_MASK;
                    last_fn = e.file_name.clone();
                }
                None => return Err(FsError::not_found(path)),
            }
        }

        let rec = self.read_record(current)?;
        Ok((current, rec, last_fn))
    }

    fn unnamed_data_attr(&self, rec: &MftRecord) -> FsResult<Option<Attr>> {
        let attrs = self.parse_attributes(rec)?;
        Ok(attrs
            .into_iter()
            .find(|a| a.attr_type == ATTR_DATA && a.name.is_empty()))
    }
}

impl Filesystem for NtfsFs {
    fn type_name(&self) -> &'static str {
        "NTFS"
    }

    fn open(&self, path: &str) -> FsResult<SharedReader> {
        let path = clean_path(path);
        if path == "." {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let (_, rec, _) = self.lookup(path)?;
        if rec.flags & MFT_FLAG_DIRECTORY != 0 {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let attr = self
            .unnamed_data_attr(&rec)?
            .ok_or_else(|| FsError::Corrupt(format!("{path}: no $DATA attribute")))?;
        let data = self.read_attr_data(&attr)?;
        Ok(Arc::new(MemBackend::new(data)))
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let path = clean_path(path);
        if path == "." {
            let ino = Some(MFT_RECORD_ROOT);
            let mut info = FileInfo::dir(".");
            info.inode = ino;
            return Ok(info);
        }

        let (num, rec, fnattr) = self.lookup(path)?;
        let is_dir = rec.flags & MFT_FLAG_DIRECTORY != 0;

        let mut size = fnattr.as_ref().map_or(0, |f| f.real_size);
        if let Some(attr) = self.unnamed_data_attr(&rec)? {
            size = attr.real_size;
        }

        let mut mode = 0o444;
        if is_dir {
            mode |= 0o111;
        }
        Ok(FileInfo {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            size,
            is_dir,
            mode,
            mtime: fnattr.and_then(|f| f.mtime),
            inode: Some(num),
        })
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let path = clean_path(path);
        let record_num = if path == "." {
            MFT_RECORD_ROOT
        } else {
            let (num, rec, _) = self.lookup(path)?;
            if rec.flags & MFT_FLAG_DIRECTORY == 0 {
                return Err(FsError::NotADirectory {
                    path: path.to_string(),
                });
            }
            num
        };

        // Deduplicate multi-name entries: a DOS 8.3 name never displaces
        // a Win32/POSIX name; among those, the first in index order wins.
        let mut seen: HashMap<String, IndexEntry> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for entry in self.read_directory(record_num)? {
            let Some(fnattr) = entry.file_name.as_ref() else {
                continue;
            };
            if fnattr.name == "." || fnattr.name == ".." {
                continue;
            }
            let key = fnattr.name.to_lowercase();
            let is_dos = fnattr.name_type == FILE_NAME_DOS;

            let replace = match seen.get(&key) {
                None => {
                    order.push(key.clone());
                    true
                }
                Some(existing) => {
                    let existing_dos = existing
                        .file_name
                        .as_ref()
                        .is_some_and(|f| f.name_type == FILE_NAME_DOS);
                    existing_dos && !is_dos
                }
            };
            if replace {
                seen.insert(key, entry);
            }
        }

        let mut out = Vec::new();
        for key in order {
            let Some(entry) = seen.remove(&key) else {
                continue;
            };
            let Some(f) = entry.file_name else {
                continue;
            };
            let is_dir = f.flags & FILE_ATTR_DIRECTORY != 0;
            let mut mode = 0o444;
            if is_dir {
                mode |= 0o111;
            }
            out.push(FileInfo {
                name: f.name,
                size: f.real_size,
                is_dir,
                mode,
                mtime: f.mtime,
                inode: Some(entry.mft_ref & MFT_REF_MASK),
            });
        }
        Ok(out)
    }

    fn file_extents(&self, path: &str) -> FsResult<Vec<Extent>> {
        let path = clean_path(path);
        if path == "." {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let (num, rec, _) = self.lookup(path)?;
        if rec.flags & MFT_FLAG_DIRECTORY != 0 {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let attr = self
            .unnamed_data_attr(&rec)?
            .ok_or_else(|| FsError::Corrupt(format!("{path}: no $DATA attribute")))?;

        if attr.non_resident {
            return Ok(self.runs_to_extents(&attr));
        }

        // Resident data lives inside the MFT record itself; map its
        // position through the MFT's own extent list.
        let mft = self.mft()?;
        let value_logical =
            num * self.mft_record_size as u64 + attr.value_record_offset as u64;
        let within_mft = [Extent {
            logical: 0,
            physical: value_logical,
            length: attr.value.len() as u64,
        }];
        Ok(compose(&within_mft, &mft.extents))
    }

    fn base_reader(&self) -> Option<SharedReader> {
        Some(self.r.clone())
    }
}

/// Verify and undo the update-sequence fixup of an MFT or INDX block.
fn apply_fixup(data: &mut [u8], usa_offset: u16, usa_count: u16) -> FsResult<()> {
    if usa_count < 2 {
        return Ok(());
    }
    let usa_offset = usa_offset as usize;
    let usa_end = usa_offset + usa_count as usize * 2;
    if usa_end > data.len() {
        return Err(FsError::Corrupt("fixup array out of bounds".to_string()));
    }

    let update_seq = LittleEndian::read_u16(&data[usa_offset..usa_offset + 2]);

    for i in 1..usa_count as usize {
        let offset = i * 512 - 2;
        if offset + 2 > data.len() {
            break;
        }
        let found = LittleEndian::read_u16(&data[offset..offset + 2]);
        if found != update_seq {
            return Err(FsError::Corrupt(format!(
                "fixup mismatch at offset {offset}: {found:#06x} != {update_seq:#06x}"
            )));
        }
        let slot = usa_offset + i * 2;
        let original = LittleEndian::read_u16(&data[slot..slot + 2]);
        LittleEndian::write_u16(&mut data[offset..offset + 2], original);
    }

    Ok(())
}

/// Decode a runlist: each run header packs the byte widths of the cluster
/// count and the signed LCN delta; a zero-width delta marks a sparse run.
fn parse_data_runs(data: &[u8]) -> Vec<DataRun> {
    let mut runs = Vec::new();
    let mut offset = 0usize;
    let mut lcn: i64 = 0;

    while offset < data.len() {
        let header = data[offset];
        if header == 0 {
            break;
        }
        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if offset + 1 + length_size + offset_size > data.len() {
            break;
        }

        let mut length = 0u64;
        for i in 0..length_size {
            length |= (data[offset + 1 + i] as u64) << (i * 8);
        }

        let sparse = offset_size == 0;
        if !sparse {
            let mut delta = 0i64;
            for i in 0..offset_size {
                delta |= (data[offset + 1 + length_size + i] as i64) << (i * 8);
            }
            // Sign-extend from the delta's top byte.
            if data[offset + length_size + offset_size] & 0x80 != 0 {
                for i in offset_size..8 {
                    delta |= 0xFFi64 << (i * 8);
                }
            }
            lcn += delta;
        }

        runs.push(DataRun {
            length,
            lcn: lcn as u64,
            sparse,
        });
        offset += 1 + length_size + offset_size;
    }

    runs
}

fn parse_index_root(value: &[u8]) -> FsResult<Vec<IndexEntry>> {
    if value.len() < 32 {
        return Err(FsError::Corrupt("$INDEX_ROOT too small".to_string()));
    }
    // The index node header starts at offset 16, after the root header.
    let entries_offset = LittleEndian::read_u32(&value[16..20]) as usize;
    let start = 16 + entries_offset;
    if start >= value.len() {
        return Ok(Vec::new());
    }
    Ok(parse_index_entries(&value[start..]))
}

fn parse_index_entries(data: &[u8]) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset + 16 <= data.len() {
        let mft_ref = LittleEndian::read_u64(&data[offset..offset + 8]);
        let entry_length = LittleEndian::read_u16(&data[offset + 8..offset + 10]) as usize;
        let content_length = LittleEndian::read_u16(&data[offset + 10..offset + 12]) as usize;
        let flags = LittleEndian::read_u32(&data[offset + 12..offset + 16]);

        if entry_length == 0 || flags & 2 != 0 {
            break;
        }

        let mut entry = IndexEntry {
            mft_ref,
            file_name: None,
        };
        if content_length > 0 && offset + 16 + content_length <= data.len() {
            entry.file_name =
                parse_file_name(&data[offset + 16..offset + 16 + content_length]).ok();
        }

        entries.push(entry);
        offset += entry_length;
    }

    entries
}

fn parse_file_name(data: &[u8]) -> FsResult<FileNameAttr> {
    if data.len() < 66 {
        return Err(FsError::Corrupt("$FILE_NAME too small".to_string()));
    }

    let name_len = data[64] as usize;
    if data.len() < 66 + name_len * 2 {
        return Err(FsError::Corrupt("$FILE_NAME name truncated".to_string()));
    }

    Ok(FileNameAttr {
        real_size: LittleEndian::read_u64(&data[48..56]),
        flags: LittleEndian::read_u32(&data[56..60]),
        name_type: data[65],
        name: utf16le_string(&data[66..66 + name_len * 2]),
        mtime: filetime(LittleEndian::read_u64(&data[16..24])),
    })
}

fn utf16le_string(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    String::from_utf16_lossy(&units)
}

fn filetime(ft: u64) -> Option<OffsetDateTime> {
    if ft < FILETIME_UNIX_DIFF {
        return None;
    }
    let nanos = (ft - FILETIME_UNIX_DIFF) as i128 * 100;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}
