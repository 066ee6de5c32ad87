//! Read-only filesystem facades over disk images
//!
//! Every parser exposes the same small surface: navigate a namespace of
//! forward-slash paths rooted at `.`, stat and read files, and optionally
//! report free space, file extents and the base reader for zero-copy
//! composition. Consumers probe for the optional capabilities instead of
//! downcasting.

pub mod apfs;
pub mod ext;
pub mod fat;
pub mod hfsplus;
pub mod ntfs;
pub mod part;

use std::io;

use thiserror::Error;
use time::OffsetDateTime;

use crate::block::SharedReader;
use crate::detect::{detect, FsKind};
use crate::extent::{Extent, Range};

/// Filesystem errors
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{path}: no such file or directory")]
    NotFound { path: String },

    #[error("{path}: not a directory")]
    NotADirectory { path: String },

    #[error("{path}: is a directory")]
    IsADirectory { path: String },

    #[error("corrupt filesystem: {0}")]
    Corrupt(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl FsError {
    pub fn not_found(path: &str) -> Self {
        FsError::NotFound {
            path: path.to_string(),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// Metadata for a file, directory or partition entry.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    /// Unix-style permission and type bits.
    pub mode: u32,
    pub mtime: Option<OffsetDateTime>,
    /// Inode or record number, for filesystems that have one.
    pub inode: Option<u64>,
}

impl FileInfo {
    pub fn dir(name: &str) -> Self {
        Self {
            name: name.to_string(),
            size: 0,
            is_dir: true,
            mode: 0o755,
            mtime: None,
            inode: None,
        }
    }
}

/// The uniform read-only view every parser provides.
pub trait Filesystem: Send + Sync {
    /// Filesystem type name, e.g. "FAT32", "NTFS", "ext4".
    fn type_name(&self) -> &'static str;

    /// Open a file and return a reader over its contents.
    fn open(&self, path: &str) -> FsResult<SharedReader>;

    /// Metadata for a path.
    fn stat(&self, path: &str) -> FsResult<FileInfo>;

    /// List a directory.
    fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>>;

    /// Free byte ranges of the image, ascending and non-overlapping.
    fn free_ranges(&self) -> FsResult<Vec<Range>> {
        Err(FsError::Unsupported(format!(
            "{}: free-space listing",
            self.type_name()
        )))
    }

    /// Physical extents of a file within this filesystem's image.
    fn file_extents(&self, path: &str) -> FsResult<Vec<Extent>> {
        let _ = path;
        Err(FsError::Unsupported(format!(
            "{}: extent mapping",
            self.type_name()
        )))
    }

    /// The reader this filesystem was parsed from, when extents returned
    /// by [`Filesystem::file_extents`] can be resolved against it.
    fn base_reader(&self) -> Option<SharedReader> {
        None
    }

    /// Human-readable volume or table summary, where the format has one.
    fn info(&self) -> Option<String> {
        None
    }
}

/// Open the filesystem of a known kind over a reader.
pub fn open_filesystem(r: SharedReader, kind: FsKind) -> FsResult<Box<dyn Filesystem>> {
    match kind {
        k if k.is_partition_table() => Ok(Box::new(part::PartFs::open(r, k)?)),
        k if k.is_fat() => Ok(Box::new(fat::FatFs::open(r)?)),
        k if k.is_ext() => Ok(Box::new(ext::ExtFs::open(r)?)),
        FsKind::Ntfs => Ok(Box::new(ntfs::NtfsFs::open(r)?)),
        FsKind::Apfs => Ok(Box::new(apfs::ApfsFs::open(r)?)),
        FsKind::HfsPlus => Ok(Box::new(hfsplus::HfsPlusFs::open(r)?)),
        FsKind::Unknown => Err(FsError::Unsupported(
            "unknown or unsupported filesystem".to_string(),
        )),
        k => Err(FsError::Unsupported(format!("filesystem type {k}"))),
    }
}

/// Detect the format of a reader and open the matching parser.
pub fn detect_and_open(r: SharedReader) -> FsResult<Box<dyn Filesystem>> {
    let kind = detect(r.as_ref())?;
    open_filesystem(r, kind)
}

/// Normalize a user path: strip leading slashes, collapse to `.` when
/// empty. The parsers treat `.` as the root directory.
pub fn clean_path(path: &str) -> &str {
    let p = path.trim_start_matches('/');
    if p.is_empty() {
        "."
    } else {
        p
    }
}
