//! NBD wire protocol
//!
//! Constants and framing for the fixed-newstyle handshake and the
//! simple-reply transmission phase. All protocol fields are big-endian.
//!
//! Reference: https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Handshake magics
pub const NBD_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054; // "IHAVEOPT"
pub const NBD_OPT_REPLY_MAGIC: u64 = 0x3e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

/// Handshake flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

/// Options
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_GO: u32 = 7;

/// Option replies
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_ERR_UNSUP: u32 = 0x80000001;
pub const NBD_REP_ERR_UNKNOWN: u32 = 0x80000006;

/// Info types carried in NBD_REP_INFO
pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

/// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;

/// Commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;

/// Reply error codes (errno values on the wire)
pub const NBD_ERR_NONE: u32 = 0;
pub const NBD_ERR_PERM: u32 = libc::EPERM as u32;
pub const NBD_ERR_IO: u32 = libc::EIO as u32;
pub const NBD_ERR_INVAL: u32 = libc::EINVAL as u32;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const MAX_BLOCK_SIZE: u32 = 32 * 1024 * 1024;

/// A transmission-phase request header (28 bytes on the wire).
#[derive(Debug)]
pub struct Request {
    pub flags: u16,
    pub command: u16,
    pub handle: [u8; 8],
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let magic = reader.read_u32::<BigEndian>()?;
        if magic != NBD_REQUEST_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad request magic: {magic:#010x}"),
            ));
        }

        let flags = reader.read_u16::<BigEndian>()?;
        let command = reader.read_u16::<BigEndian>()?;
        let mut handle = [0u8; 8];
        reader.read_exact(&mut handle)?;
        let offset = reader.read_u64::<BigEndian>()?;
        let length = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }
}

/// An option header as read during negotiation.
#[derive(Debug)]
pub struct OptionHeader {
    pub option: u32,
    pub data: Vec<u8>,
}

impl OptionHeader {
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let magic = reader.read_u64::<BigEndian>()?;
        if magic != NBD_OPTS_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad option magic: {magic:#018x}"),
            ));
        }

        let option = reader.read_u32::<BigEndian>()?;
        let length = reader.read_u32::<BigEndian>()?;
        let mut data = vec![0u8; length as usize];
        reader.read_exact(&mut data)?;

        Ok(Self { option, data })
    }
}

/// Write the initial server greeting.
pub fn write_greeting<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_u64::<BigEndian>(NBD_MAGIC)?;
    writer.write_u64::<BigEndian>(NBD_OPTS_MAGIC)?;
    writer.write_u16::<BigEndian>(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES)?;
    writer.flush()
}

/// Write one option reply frame.
pub fn write_option_reply<W: Write>(
    writer: &mut W,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> io::Result<()> {
    writer.write_u64::<BigEndian>(NBD_OPT_REPLY_MAGIC)?;
    writer.write_u32::<BigEndian>(option)?;
    writer.write_u32::<BigEndian>(reply_type)?;
    writer.write_u32::<BigEndian>(data.len() as u32)?;
    writer.write_all(data)?;
    writer.flush()
}

/// Write a simple transmission-phase reply.
pub fn write_simple_reply<W: Write>(
    writer: &mut W,
    handle: [u8; 8],
    error: u32,
    data: &[u8],
) -> io::Result<()> {
    writer.write_u32::<BigEndian>(NBD_SIMPLE_REPLY_MAGIC)?;
    writer.write_u32::<BigEndian>(error)?;
    writer.write_all(&handle)?;
    writer.write_all(data)?;
    writer.flush()
}
