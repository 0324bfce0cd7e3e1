use thiserror::Error;

/// Errors returned by frame and image codec operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// Header/body mismatch, undecodable CBOR or trailing bytes.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// Encoded body does not fit the 16-bit length field.
    #[error("frame body too large: {len} bytes")]
    BodyTooLarge { len: usize },
    /// Image is too short to carry an MCUboot header.
    #[error("image header too short: {len} bytes, need {min}")]
    HeaderTooShort { len: usize, min: usize },
}
