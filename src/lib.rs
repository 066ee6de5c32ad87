//! rawimg reads files and metadata from raw disk images without mounting
//! them.
//!
//! The crate is a stack of random-access byte streams with a filesystem
//! facade at each level: a base image is classified by [`detect`], parsed
//! by one of the [`fsys`] parsers, and any file within it can be viewed as
//! a stream of its own through [`extent::ExtentReader`] (optionally
//! decrypted through [`xts::XtsReader`]). Any composed stream can be
//! exported as a Network Block Device over a Unix socket via [`nbd`].

pub mod block;
pub mod detect;
pub mod extent;
pub mod fsys;
pub mod nbd;
pub mod xts;

pub use block::{BlockRead, BlockWrite, FileBackend, MemBackend, SharedReader, SharedWriter};
pub use detect::FsKind;
pub use extent::{compose, Extent, ExtentReader, ExtentWriter, Range};
pub use fsys::{FileInfo, Filesystem, FsError};
pub use xts::{XtsCipher, XtsReader, XtsWriter};
