//! Executable images.
//!
//! Programs arrive either as a raw byte dump or wrapped in the small EF
//! container:
//!
//! ```text
//! +------+------+-----------+-----------+----------------+
//! | 0x45 | 0x46 | size (hi) | size (lo) | payload ...    |
//! +------+------+-----------+-----------+----------------+
//! ```
//!
//! `size` counts the whole file, header included.

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::ImageError;
use crate::memory::{Memory, MEMORY_SIZE};

pub const EF_MAGIC: [u8; 2] = [0x45, 0x46];
pub const EF_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Ef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    format: ImageFormat,
    payload: Vec<u8>,
}

impl Image {
    pub fn raw(bytes: Vec<u8>) -> Self {
        Image {
            format: ImageFormat::Raw,
            payload: bytes,
        }
    }

    /// Parse an EF container, rejecting anything that is not one.
    pub fn parse_ef(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < EF_HEADER_LEN {
            if bytes.len() >= 2 && bytes[..2] != EF_MAGIC {
                return Err(ImageError::BadMagic);
            }
            return Err(ImageError::Truncated(bytes.len()));
        }
        if bytes[..2] != EF_MAGIC {
            return Err(ImageError::BadMagic);
        }

        let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if declared != bytes.len() {
            return Err(ImageError::SizeMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        Ok(Image {
            format: ImageFormat::Ef,
            payload: bytes[EF_HEADER_LEN..].to_vec(),
        })
    }

    /// EF if the magic is present, raw bytes otherwise.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() >= 2 && bytes[..2] == EF_MAGIC {
            Self::parse_ef(bytes)
        } else {
            Ok(Self::raw(bytes.to_vec()))
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P, force_raw: bool) -> Result<Self, ImageError> {
        let bytes = fs::read(path.as_ref())?;
        debug!("read {} bytes from {}", bytes.len(), path.as_ref().display());
        if force_raw {
            Ok(Self::raw(bytes))
        } else {
            Self::from_bytes(&bytes)
        }
    }

    /// Wrap a payload in an EF header.
    pub fn encode_ef(payload: &[u8]) -> Result<Vec<u8>, ImageError> {
        let total = payload.len() + EF_HEADER_LEN;
        let size = u16::try_from(total).map_err(|_| ImageError::DoesNotFit {
            base: 0,
            len: payload.len(),
        })?;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&EF_MAGIC);
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Copy the payload to `base`. Nothing is written unless all of it fits.
    pub fn load_into(&self, memory: &mut Memory, base: u16) -> Result<usize, ImageError> {
        if base as usize + self.payload.len() > MEMORY_SIZE {
            return Err(ImageError::DoesNotFit {
                base,
                len: self.payload.len(),
            });
        }
        let stored = memory.load(base, &self.payload);
        debug!("loaded {:?} image: {} bytes at ${:04X}", self.format, stored, base);
        Ok(stored)
    }
}
