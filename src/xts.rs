//! Transparent XTS-AES encryption layer
//!
//! An [`XtsCipher`] wraps the XTS tweakable mode (IEEE 1619) over AES-128,
//! -192 or -256 depending on key length, with a configurable sector size
//! and a tweak offset added to every sector number. [`XtsReader`] and
//! [`XtsWriter`] interpose the cipher between any two layers of a reader
//! stack.

use std::io;
use std::sync::Arc;

use aes::cipher::KeyInit;
use aes::{Aes128, Aes192, Aes256};
use thiserror::Error;
use xts_mode::{get_tweak_default, Xts128};

use crate::block::{BlockRead, BlockWrite, SharedReader, SharedWriter};

/// AES block size; the XTS sector size must be a multiple of this.
pub const BLOCK_SIZE: usize = 16;

/// XTS layer errors
#[derive(Debug, Error)]
pub enum XtsError {
    #[error("invalid key length {0} (must be 32, 48, or 64 bytes)")]
    InvalidKeyLength(usize),

    #[error("sector size {0} must be a positive multiple of {BLOCK_SIZE}")]
    InvalidSectorSize(usize),

    #[error("data length {len} is not a multiple of the sector size {sector_size}")]
    UnalignedLength { len: usize, sector_size: usize },

    #[error("offset {0} is not sector-aligned")]
    UnalignedOffset(u64),
}

enum XtsMode {
    Aes128(Xts128<Aes128>),
    Aes192(Xts128<Aes192>),
    Aes256(Xts128<Aes256>),
}

/// An XTS-AES cipher: data and tweak keys, sector size, tweak offset.
///
/// The key is split in half; the first half encrypts data, the second
/// derives per-sector tweaks. The tweak offset is added to every sector
/// number, so a view that starts mid-device can decrypt with the device's
/// original sector numbering.
pub struct XtsCipher {
    mode: XtsMode,
    sector_size: usize,
    tweak_offset: u64,
}

impl XtsCipher {
    pub fn new(key: &[u8], sector_size: usize, tweak_offset: u64) -> Result<Self, XtsError> {
        if sector_size < BLOCK_SIZE || sector_size % BLOCK_SIZE != 0 {
            return Err(XtsError::InvalidSectorSize(sector_size));
        }

        let half = key.len() / 2;
        let bad_key = |_| XtsError::InvalidKeyLength(key.len());
        let mode = match key.len() {
            32 => XtsMode::Aes128(Xts128::new(
                Aes128::new_from_slice(&key[..half]).map_err(bad_key)?,
                Aes128::new_from_slice(&key[half..]).map_err(bad_key)?,
            )),
            48 => XtsMode::Aes192(Xts128::new(
                Aes192::new_from_slice(&key[..half]).map_err(bad_key)?,
                Aes192::new_from_slice(&key[half..]).map_err(bad_key)?,
            )),
            64 => XtsMode::Aes256(Xts128::new(
                Aes256::new_from_slice(&key[..half]).map_err(bad_key)?,
                Aes256::new_from_slice(&key[half..]).map_err(bad_key)?,
            )),
            n => return Err(XtsError::InvalidKeyLength(n)),
        };

        Ok(Self {
            mode,
            sector_size,
            tweak_offset,
        })
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Encrypt whole sectors in place, `first_sector` being the sector
    /// number of the first one (before the tweak offset is applied).
    pub fn encrypt_sectors(&self, data: &mut [u8], first_sector: u64) -> Result<(), XtsError> {
        if data.len() % self.sector_size != 0 {
            return Err(XtsError::UnalignedLength {
                len: data.len(),
                sector_size: self.sector_size,
            });
        }
        let first = (first_sector + self.tweak_offset) as u128;
        match &self.mode {
            XtsMode::Aes128(x) => x.encrypt_area(data, self.sector_size, first, get_tweak_default),
            XtsMode::Aes192(x) => x.encrypt_area(data, self.sector_size, first, get_tweak_default),
            XtsMode::Aes256(x) => x.encrypt_area(data, self.sector_size, first, get_tweak_default),
        }
        Ok(())
    }

    /// Decrypt whole sectors in place.
    pub fn decrypt_sectors(&self, data: &mut [u8], first_sector: u64) -> Result<(), XtsError> {
        if data.len() % self.sector_size != 0 {
            return Err(XtsError::UnalignedLength {
                len: data.len(),
                sector_size: self.sector_size,
            });
        }
        let first = (first_sector + self.tweak_offset) as u128;
        match &self.mode {
            XtsMode::Aes128(x) => x.decrypt_area(data, self.sector_size, first, get_tweak_default),
            XtsMode::Aes192(x) => x.decrypt_area(data, self.sector_size, first, get_tweak_default),
            XtsMode::Aes256(x) => x.decrypt_area(data, self.sector_size, first, get_tweak_default),
        }
        Ok(())
    }

    /// Encrypt a single sector in place.
    pub fn encrypt_sector(&self, sector: &mut [u8], sector_num: u64) -> Result<(), XtsError> {
        if sector.len() != self.sector_size {
            return Err(XtsError::UnalignedLength {
                len: sector.len(),
                sector_size: self.sector_size,
            });
        }
        self.encrypt_sectors(sector, sector_num)
    }

    /// Decrypt a single sector in place.
    pub fn decrypt_sector(&self, sector: &mut [u8], sector_num: u64) -> Result<(), XtsError> {
        if sector.len() != self.sector_size {
            return Err(XtsError::UnalignedLength {
                len: sector.len(),
                sector_size: self.sector_size,
            });
        }
        self.decrypt_sectors(sector, sector_num)
    }
}

fn to_io(err: XtsError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}

/// Decrypting view over an encrypted reader.
///
/// The logical size may be smaller than the backing stream. Reads round
/// out to sector boundaries, decrypt complete sectors and copy the
/// requested slice back out; a backing read that ends mid-sector is a
/// hard error because the trailing bytes cannot be decrypted.
pub struct XtsReader {
    inner: SharedReader,
    cipher: Arc<XtsCipher>,
    size: u64,
}

impl XtsReader {
    pub fn new(inner: SharedReader, cipher: Arc<XtsCipher>, size: u64) -> Self {
        Self {
            inner,
            cipher,
            size,
        }
    }

    pub fn cipher(&self) -> &Arc<XtsCipher> {
        &self.cipher
    }
}

impl BlockRead for XtsReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        if off >= self.size {
            return Ok(0);
        }
        let sector = self.cipher.sector_size() as u64;
        let want = (buf.len() as u64).min(self.size - off);

        let start_sector = off / sector;
        let aligned_start = start_sector * sector;
        let end = off + want;
        let aligned_len = ((end + sector - 1) / sector * sector - aligned_start) as usize;

        let mut aligned = vec![0u8; aligned_len];
        let mut got = 0;
        while got < aligned_len {
            let n = self
                .inner
                .read_at(&mut aligned[got..], aligned_start + got as u64)?;
            if n == 0 {
                break;
            }
            got += n;
        }

        if got == 0 {
            return Ok(0);
        }
        if got % sector as usize != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("partial sector read ({got} bytes, sector size {sector})"),
            ));
        }

        self.cipher
            .decrypt_sectors(&mut aligned[..got], start_sector)
            .map_err(to_io)?;

        let skip = (off - aligned_start) as usize;
        if skip >= got {
            return Ok(0);
        }
        let n = (want as usize).min(got - skip);
        buf[..n].copy_from_slice(&aligned[skip..skip + n]);
        Ok(n)
    }
}

/// Encrypting counterpart of [`XtsReader`].
///
/// Writes must be sector-aligned and a whole number of sectors; there is
/// no read-modify-write here, callers above this layer already work in
/// block-device granularity.
pub struct XtsWriter {
    inner: SharedWriter,
    cipher: Arc<XtsCipher>,
    size: u64,
}

impl XtsWriter {
    pub fn new(inner: SharedWriter, cipher: Arc<XtsCipher>, size: u64) -> Self {
        Self {
            inner,
            cipher,
            size,
        }
    }
}

impl BlockWrite for XtsWriter {
    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<usize> {
        let sector = self.cipher.sector_size() as u64;
        if off % sector != 0 {
            return Err(to_io(XtsError::UnalignedOffset(off)));
        }
        if buf.len() as u64 % sector != 0 {
            return Err(to_io(XtsError::UnalignedLength {
                len: buf.len(),
                sector_size: sector as usize,
            }));
        }
        if off + buf.len() as u64 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write past end of encrypted view at offset {off}"),
            ));
        }

        // Encrypt into a fresh buffer; the caller's plaintext stays intact.
        let mut encrypted = buf.to_vec();
        self.cipher
            .encrypt_sectors(&mut encrypted, off / sector)
            .map_err(to_io)?;
        self.inner.write_all_at(&encrypted, off)?;
        Ok(buf.len())
    }
}
