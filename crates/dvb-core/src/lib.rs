//! Core DVB device primitives shared across crates.
//!
//! Includes the GATT characteristic table, hash helpers, the registration
//! challenge signature, and base errors.

pub mod challenge;
pub mod error;
pub mod gatt;
pub mod hash;

pub use challenge::{calculate_signature, MacKey, Nonce, Signature};
pub use error::CoreError;
pub use gatt::{Characteristic, SensorCommand};
