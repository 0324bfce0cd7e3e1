//! DVB wire codec primitives.
//!
//! Defines the 8-byte SMP frame header, CBOR body encode/decode helpers,
//! notification reassembly, and firmware image header inspection.

pub mod assembler;
pub mod error;
pub mod frame;
pub mod image;

pub use assembler::FrameAssembler;
pub use ciborium::Value;
pub use error::CodecError;
pub use frame::{decode_frame, encode_frame, Frame, FrameHeader, FRAME_HEADER_LEN};
