//! DVB device session.
//!
//! Wires the SMP codec, firmware upload, file transfer, registration
//! verification and device info reads on top of a pluggable GATT
//! transport, with automatic reconnection after unexpected link loss.

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod files;
pub mod info;
pub mod session;
pub mod upload;
mod verify;

pub use command::Command;
pub use config::DeviceConfig;
pub use error::DeviceError;
pub use events::{DeviceEvent, InboundMessage, UploadOutcome};
pub use files::FileEntry;
pub use info::DeviceInfo;
pub use session::{DeviceSession, LinkState};
pub use upload::{UploadPhase, UploadStatus};
