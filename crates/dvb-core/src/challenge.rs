//! Registration challenge signature.
//!
//! The unit answers a 4-byte nonce with the first four bytes of
//! `SHA-256(key || serial[0..12] || nonce)`.

use std::fmt;

use crate::error::CoreError;
use crate::hash::sha256_32;

pub const MAC_KEY_LEN: usize = 16;
pub const SERIAL_FIELD_LEN: usize = 12;
pub const NONCE_LEN: usize = 4;
pub const SIGNATURE_LEN: usize = 4;
pub const PREIMAGE_LEN: usize = MAC_KEY_LEN + SERIAL_FIELD_LEN + NONCE_LEN;

pub type Nonce = [u8; NONCE_LEN];
pub type Signature = [u8; SIGNATURE_LEN];

/// Shared secret used to sign registration challenges.
#[derive(Clone, PartialEq, Eq)]
pub struct MacKey([u8; MAC_KEY_LEN]);

impl MacKey {
    /// Key provisioned on development units.
    pub const DEVELOPMENT: MacKey = MacKey([
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ]);

    pub const fn new(bytes: [u8; MAC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses a 32-character hex string.
    pub fn from_hex(input: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(input.trim()).map_err(|_| CoreError::Decode("mac key is not hex"))?;
        let bytes: [u8; MAC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidInput("mac key must be 16 bytes"))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; MAC_KEY_LEN] {
        &self.0
    }
}

impl Default for MacKey {
    fn default() -> Self {
        Self::DEVELOPMENT
    }
}

impl fmt::Debug for MacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MacKey(..)")
    }
}

/// Builds `key || serial || nonce`, with the serial's UTF-8 bytes truncated
/// or zero-padded to twelve bytes.
pub fn challenge_preimage(key: &MacKey, serial: &str, nonce: &Nonce) -> [u8; PREIMAGE_LEN] {
    let mut preimage = [0u8; PREIMAGE_LEN];
    preimage[..MAC_KEY_LEN].copy_from_slice(key.as_bytes());
    let serial = serial.as_bytes();
    let take = serial.len().min(SERIAL_FIELD_LEN);
    preimage[MAC_KEY_LEN..MAC_KEY_LEN + take].copy_from_slice(&serial[..take]);
    preimage[MAC_KEY_LEN + SERIAL_FIELD_LEN..].copy_from_slice(nonce);
    preimage
}

/// Computes the signature a genuine unit returns for `nonce`.
pub fn calculate_signature(key: &MacKey, serial: &str, nonce: &Nonce) -> Signature {
    let digest = sha256_32(&challenge_preimage(key, serial, nonce));
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&digest[..SIGNATURE_LEN]);
    signature
}

/// Responses of any length other than four never match.
pub fn signature_matches(expected: &Signature, response: &[u8]) -> bool {
    response.len() == SIGNATURE_LEN && response == expected.as_slice()
}
