//! MCUboot image header inspection.

use crate::error::CodecError;

/// Images shorter than this are rejected before any field is read.
pub const IMAGE_HEADER_MIN_LEN: usize = 4096;

const VERSION_OFFSET: usize = 12;
const VERSION_LEN: usize = 4;
const HASH_OFFSET: usize = 20;
pub const IMAGE_HASH_LEN: usize = 32;

/// Version and hash extracted from a firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Bytes 12..16 joined with dots, e.g. `1.2.0.7`.
    pub version: String,
    pub hash: [u8; IMAGE_HASH_LEN],
}

impl ImageInfo {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

pub fn image_info(image: &[u8]) -> Result<ImageInfo, CodecError> {
    if image.len() < IMAGE_HEADER_MIN_LEN {
        return Err(CodecError::HeaderTooShort {
            len: image.len(),
            min: IMAGE_HEADER_MIN_LEN,
        });
    }
    let version = image[VERSION_OFFSET..VERSION_OFFSET + VERSION_LEN]
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".");
    let mut hash = [0u8; IMAGE_HASH_LEN];
    hash.copy_from_slice(&image[HASH_OFFSET..HASH_OFFSET + IMAGE_HASH_LEN]);
    Ok(ImageInfo { version, hash })
}
